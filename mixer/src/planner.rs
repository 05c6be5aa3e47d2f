use std::sync::Arc;

use log::{debug, info, warn};
use rand::{rngs::OsRng, Rng};
use umbra_common::{
    config::{MIN_PER_DESTINATION, PER_HOP_FEE, SAFETY_MARGIN},
    crypto::{Ed25519KeyPair, PublicKey},
};

use crate::{
    config::MixConfig,
    error::MixerError,
    executor::{Route, RouteHop, RouteState},
    pool::{PoolError, ReleaseOutcome, WalletPool},
};

// Outcome of planning one destination
//
// A destination whose intermediaries cannot be decrypted pre-fails its
// route without touching the rest of the request.
pub enum PlannedRoute {
    Ready(Route),
    Failed {
        id: usize,
        destination: PublicKey,
        error: String,
    },
}

/// Builds route plans from a mix request, drawing intermediaries from
/// the wallet pool.
pub struct RoutePlanner {
    pool: Arc<WalletPool>,
}

impl RoutePlanner {
    pub fn new(pool: Arc<WalletPool>) -> Self {
        Self { pool }
    }

    // Plan one route per destination
    //
    // Intermediary sets are disjoint across routes because every set
    // comes out of the pool's atomic acquire. When the pool cannot
    // supply a route even after one grow, everything acquired so far
    // is handed back and the request fails with InsufficientPool.
    pub async fn plan(
        &self,
        source: Arc<Ed25519KeyPair>,
        fee_source: Option<Arc<Ed25519KeyPair>>,
        destinations: &[(PublicKey, u64)],
        config: &MixConfig,
        request_id: &str,
    ) -> Result<Vec<PlannedRoute>, MixerError> {
        let hop_count = config.hop_count.max(1);
        let mut planned = Vec::with_capacity(destinations.len());

        for (id, (destination, amount)) in destinations.iter().enumerate() {
            let wallets = match self.acquire_with_growth(hop_count, request_id).await {
                Ok(wallets) => wallets,
                Err(PoolError::Exhausted {
                    requested,
                    available,
                }) => {
                    warn!(
                        "request {} ran out of intermediaries at route {}",
                        request_id, id
                    );
                    self.release_planned(&planned);
                    return Err(MixerError::InsufficientPool {
                        needed: requested,
                        available,
                    });
                }
                Err(e) => {
                    self.release_planned(&planned);
                    return Err(e.into());
                }
            };

            // snapshot the signing material now so the executor never
            // touches the cipher
            let mut hops = Vec::with_capacity(wallets.len());
            let mut decrypt_error = None;
            for wallet in &wallets {
                match self.pool.keypair_of(wallet) {
                    Ok(keypair) => hops.push(RouteHop {
                        public_key: wallet.public_key,
                        keypair,
                    }),
                    Err(e) => {
                        decrypt_error = Some((wallet.public_key, e));
                        break;
                    }
                }
            }

            if let Some((poisoned, e)) = decrypt_error {
                // the poisoned wallet is already parked as error, give
                // every other wallet of this route back untouched
                for wallet in &wallets {
                    if wallet.public_key == poisoned {
                        continue;
                    }
                    if let Err(release_err) =
                        self.pool.release(&wallet.public_key, ReleaseOutcome::Unused)
                    {
                        warn!(
                            "could not release wallet {}: {}",
                            wallet.public_key, release_err
                        );
                    }
                }
                planned.push(PlannedRoute::Failed {
                    id,
                    destination: *destination,
                    error: e.to_string(),
                });
                continue;
            }

            debug!(
                "route {} planned: {} -> {} hops -> {}",
                id,
                amount,
                hop_count,
                destination
            );
            planned.push(PlannedRoute::Ready(Route {
                id,
                request_id: request_id.to_owned(),
                source: Arc::clone(&source),
                fee_source: fee_source.clone(),
                intermediates: hops,
                destination: *destination,
                amount: *amount,
                fee_buffer: PER_HOP_FEE,
                safety_margin: SAFETY_MARGIN,
                state: RouteState::FundHead,
                signatures: Vec::new(),
                error: None,
                destination_balance_before: None,
                resubmit_pending: false,
            }));
        }

        Ok(planned)
    }

    // Acquire with a single ensure_health retry on exhaustion
    async fn acquire_with_growth(
        &self,
        count: usize,
        request_id: &str,
    ) -> Result<Vec<crate::pool::HopWallet>, PoolError> {
        match self.pool.acquire(count, request_id).await {
            Err(PoolError::Exhausted { .. }) => {
                let generated = self.pool.ensure_health(count)?;
                info!(
                    "pool was short, generated {} wallets before retrying",
                    generated
                );
                self.pool.acquire(count, request_id).await
            }
            other => other,
        }
    }

    fn release_planned(&self, planned: &[PlannedRoute]) {
        for route in planned {
            if let PlannedRoute::Ready(route) = route {
                for hop in &route.intermediates {
                    if let Err(e) = self.pool.release(&hop.public_key, ReleaseOutcome::Unused) {
                        warn!("could not release wallet {}: {}", hop.public_key, e);
                    }
                }
            }
        }
    }
}

// Spread `total` across `count` destinations
//
// Explicit amounts are used verbatim after validation. The generated
// distribution starts from an even split, perturbs every element but
// the last by a uniform +/-5% and lets the last element absorb the
// drift so the vector always sums to the input total.
pub fn distribute_amounts(
    total: u64,
    count: usize,
    custom: Option<&[u64]>,
    dust_threshold: u64,
) -> Result<Vec<u64>, MixerError> {
    if count == 0 {
        return Err(MixerError::bad_request("destinations must not be empty"));
    }

    if let Some(custom) = custom {
        if custom.len() != count {
            return Err(MixerError::bad_request(
                "custom amounts must match destinations",
            ));
        }
        if custom.iter().any(|&amount| amount <= dust_threshold) {
            return Err(MixerError::bad_request(
                "custom amounts must stay above the dust threshold",
            ));
        }
        let sum: u64 = custom.iter().sum();
        if sum > total {
            return Err(MixerError::bad_request(
                "custom amounts exceed the total amount",
            ));
        }
        return Ok(custom.to_vec());
    }

    let minimum = MIN_PER_DESTINATION;
    if total < count as u64 * minimum {
        return Err(MixerError::bad_request(format!(
            "total amount too small: {} destinations need at least {}",
            count,
            count as u64 * minimum
        )));
    }

    if count == 1 {
        return Ok(vec![total]);
    }

    let base = total / count as u64;
    let remainder = total % count as u64;
    let mut amounts: Vec<u64> = (0..count as u64)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect();

    let mut allocated = 0u64;
    for amount in amounts.iter_mut().take(count - 1) {
        let jitter: f64 = OsRng.gen_range(-0.05..=0.05);
        *amount = ((*amount as f64 * (1.0 + jitter)) as u64).max(minimum);
        allocated += *amount;
    }

    // claw back from the largest elements until the last one fits
    while allocated + minimum > total {
        let largest = amounts[..count - 1]
            .iter()
            .enumerate()
            .max_by_key(|(_, &amount)| amount)
            .map(|(i, _)| i)
            .expect("at least one perturbed element exists");
        let reducible = amounts[largest] - minimum;
        let deficit = (allocated + minimum) - total;
        let cut = deficit.min(reducible);
        amounts[largest] -= cut;
        allocated -= cut;
        if cut == 0 {
            break;
        }
    }

    amounts[count - 1] = total - allocated;
    Ok(amounts)
}
