use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::watch;
use umbra_common::{
    crypto::{Ed25519KeyPair, Ed25519Signature, PublicKey},
    time::get_current_time_in_millis,
    utils::format_native,
};

use crate::{
    config::MixConfig,
    error::MixerError,
    executor::{Executor, Route, RouteState, SignatureWatcher},
    gateway::{Commitment, RpcGateway},
    planner::{distribute_amounts, PlannedRoute, RoutePlanner},
    pool::{ReleaseOutcome, WalletPool},
};

// A mix submission as supplied by the caller
//
// Secrets are base58 encoded expanded ed25519 keys; they are parsed
// during validation and never logged.
#[derive(Clone, Deserialize)]
pub struct MixRequest {
    pub source_secret: String,
    #[serde(default)]
    pub fee_source_secret: Option<String>,
    pub total_amount: u64,
    pub destinations: Vec<String>,
    #[serde(default)]
    pub custom_amounts: Option<Vec<u64>>,
}

impl std::fmt::Debug for MixRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixRequest")
            .field("source_secret", &"[REDACTED]")
            .field("fee_source_secret", &"[REDACTED]")
            .field("total_amount", &self.total_amount)
            .field("destinations", &self.destinations)
            .field("custom_amounts", &self.custom_amounts)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RouteStatus {
    Complete,
    Failed,
}

// Per route outcome returned to the caller
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub destination: PublicKey,
    pub status: RouteStatus,
    pub signatures: Vec<Ed25519Signature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MixResult {
    pub aggregate_ok: bool,
    pub routes: Vec<RouteReport>,
    pub duration_ms: u64,
}

// Cancels a running mix; routes finish their in-flight hop and wind
// down through a salvage sweep
pub struct MixHandle {
    sender: watch::Sender<bool>,
}

impl MixHandle {
    pub fn cancel(&self) {
        let _ = self.sender.send(true);
    }
}

struct ValidatedRequest {
    source: Arc<Ed25519KeyPair>,
    fee_source: Option<Arc<Ed25519KeyPair>>,
    destinations: Vec<(PublicKey, u64)>,
}

/// The mixer core: plans routes, executes them, reports per route.
pub struct Mixer {
    pool: Arc<WalletPool>,
    gateway: Arc<RpcGateway>,
    salvage: Option<PublicKey>,
}

impl Mixer {
    pub fn new(
        pool: Arc<WalletPool>,
        gateway: Arc<RpcGateway>,
        salvage: Option<PublicKey>,
    ) -> Self {
        Self {
            pool,
            gateway,
            salvage,
        }
    }

    // Fresh cancellation pair for run_mix_cancellable
    pub fn cancellation() -> (MixHandle, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (MixHandle { sender }, receiver)
    }

    pub async fn run_mix(
        &self,
        request: MixRequest,
        config: MixConfig,
    ) -> Result<MixResult, MixerError> {
        let (_handle, receiver) = Self::cancellation();
        self.run_mix_cancellable(request, config, receiver).await
    }

    // Disperse the requested value through the pool towards every
    // destination; one failed route never aborts the others
    pub async fn run_mix_cancellable(
        &self,
        request: MixRequest,
        config: MixConfig,
        cancelled: watch::Receiver<bool>,
    ) -> Result<MixResult, MixerError> {
        let started = get_current_time_in_millis();

        if *cancelled.borrow() {
            return Err(MixerError::Cancelled);
        }

        let validated = validate_request(&request, &config)?;
        let request_id = format!(
            "mix-{:016x}",
            umbra_common::crypto::random::secure_random_u64()
        );
        info!(
            "request {}: {} to {} destinations over {} hops",
            request_id,
            format_native(request.total_amount),
            validated.destinations.len(),
            config.hop_count
        );

        let planner = RoutePlanner::new(Arc::clone(&self.pool));
        let planned = planner
            .plan(
                Arc::clone(&validated.source),
                validated.fee_source.clone(),
                &validated.destinations,
                &config,
                &request_id,
            )
            .await?;

        let mut ready = Vec::new();
        let mut prefailed = Vec::new();
        for route in planned {
            match route {
                PlannedRoute::Ready(route) => ready.push(route),
                PlannedRoute::Failed {
                    id,
                    destination,
                    error,
                } => prefailed.push((id, destination, error)),
            }
        }

        self.check_source_funds(&validated, &ready).await?;

        let watcher = SignatureWatcher::new(Arc::clone(&self.gateway));
        watcher.start().await;

        let executor = Arc::new(Executor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.gateway),
            Arc::clone(&watcher),
            config,
            self.salvage,
        ));
        let finished = executor.execute(ready, cancelled).await;
        watcher.stop().await;

        let mut reports: Vec<(usize, RouteReport)> = finished
            .into_iter()
            .map(|route| (route.id, route_report(route)))
            .chain(prefailed.into_iter().map(|(id, destination, error)| {
                (
                    id,
                    RouteReport {
                        destination,
                        status: RouteStatus::Failed,
                        signatures: Vec::new(),
                        error: Some(error),
                    },
                )
            }))
            .collect();
        reports.sort_by_key(|(id, _)| *id);

        let routes: Vec<RouteReport> = reports.into_iter().map(|(_, report)| report).collect();
        let aggregate_ok = routes.iter().all(|r| r.status == RouteStatus::Complete);
        let duration_ms = get_current_time_in_millis().saturating_sub(started);

        match self.pool.stats() {
            Ok(stats) => info!(
                "request {} finished in {} ms (ok: {}), pool now {}",
                request_id, duration_ms, aggregate_ok, stats
            ),
            Err(e) => warn!("could not read pool stats: {}", e),
        }

        Ok(MixResult {
            aggregate_ok,
            routes,
            duration_ms,
        })
    }

    // The source must cover every route's funding plus its own fees,
    // otherwise nothing is submitted at all
    async fn check_source_funds(
        &self,
        validated: &ValidatedRequest,
        ready: &[Route],
    ) -> Result<(), MixerError> {
        let required: u64 = ready
            .iter()
            .map(|route| route.head_funding() + route.fee_buffer)
            .sum();
        if required == 0 {
            return Ok(());
        }

        let source_key = validated.source.public_key();
        let have = match self.gateway.balance(&source_key, Commitment::Confirmed).await {
            Ok(balance) => balance,
            Err(e) => {
                self.release_ready(ready);
                return Err(e.into());
            }
        };

        if have < required {
            warn!(
                "source {} underfunded: has {}, needs {}",
                source_key,
                format_native(have),
                format_native(required)
            );
            self.release_ready(ready);
            return Err(MixerError::InsufficientFunds {
                need: required,
                have,
            });
        }

        Ok(())
    }

    fn release_ready(&self, ready: &[Route]) {
        for route in ready {
            for hop in &route.intermediates {
                if let Err(e) = self.pool.release(&hop.public_key, ReleaseOutcome::Unused) {
                    warn!("could not release wallet {}: {}", hop.public_key, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("salvage", &self.salvage)
            .finish()
    }
}

fn route_report(route: Route) -> RouteReport {
    let status = match route.state {
        RouteState::Complete => RouteStatus::Complete,
        _ => RouteStatus::Failed,
    };
    RouteReport {
        destination: route.destination,
        status,
        signatures: route.signatures,
        error: route.error,
    }
}

fn validate_request(
    request: &MixRequest,
    config: &MixConfig,
) -> Result<ValidatedRequest, MixerError> {
    if request.destinations.is_empty() {
        return Err(MixerError::bad_request("destinations must not be empty"));
    }
    if request.total_amount == 0 {
        return Err(MixerError::bad_request("total amount must be positive"));
    }

    // a fixed message keeps key material out of error chains
    let source = Ed25519KeyPair::from_full_base58(&request.source_secret).map_err(|_| {
        MixerError::bad_request("source secret is not a valid base58 ed25519 secret key")
    })?;

    let fee_source = match &request.fee_source_secret {
        Some(secret) => Some(Arc::new(Ed25519KeyPair::from_full_base58(secret).map_err(
            |_| MixerError::bad_request("fee source secret is not a valid base58 ed25519 secret key"),
        )?)),
        None => None,
    };

    let mut addresses = Vec::with_capacity(request.destinations.len());
    for destination in &request.destinations {
        let address = PublicKey::from_base58(destination).map_err(|_| {
            MixerError::bad_request(format!("invalid destination address: {}", destination))
        })?;
        addresses.push(address);
    }

    let amounts = distribute_amounts(
        request.total_amount,
        addresses.len(),
        request.custom_amounts.as_deref(),
        config.dust_threshold,
    )?;

    Ok(ValidatedRequest {
        source: Arc::new(source),
        fee_source,
        destinations: addresses.into_iter().zip(amounts).collect(),
    })
}
