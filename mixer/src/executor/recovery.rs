use log::{info, warn};
use umbra_common::crypto::PublicKey;

use crate::gateway::Commitment;

use super::{Executor, Route, RouteState, SendOutcome};

impl Executor {
    // Try to unstick a route, then tear it down if nothing helps
    //
    // A hop whose transfer was submitted but never confirmed gets a
    // bounded number of re-sign passes with a fresh blockhash and an
    // escalated priority fee. When the passes are exhausted (or were
    // never allowed, e.g. after a cancellation) the remaining value is
    // swept to the salvage address and the route fails.
    pub(super) async fn run_recovery(&self, route: &mut Route, hop: usize) {
        if route.resubmit_pending {
            route.resubmit_pending = false;
            if self.resubmit_pending_hop(route, hop).await {
                info!("route {} recovered hop {}", route.id, hop);
                route.error = None;
                return;
            }
        }

        self.sweep_and_teardown(route, hop).await;
        if route.error.is_none() {
            route.error = Some("recovery exhausted".to_owned());
        }
        route.state = RouteState::Failed;
    }

    // Returns true when the pending transfer out of `hop` settled and
    // the route may resume its normal progression
    async fn resubmit_pending_hop(&self, route: &mut Route, hop: usize) -> bool {
        let (target, amount) = route.transfer_from(hop);
        let passes = self.config.retry.recovery_passes();
        // continue the fee escalation where the hop attempts stopped
        let base_attempt = self.config.retry.max_attempts;

        for pass in 0..passes {
            // an earlier submission may have landed late
            if self.hop_target_settled(route, hop).await {
                route.state = Self::state_after_hop(route, hop);
                return true;
            }

            let signer = route.intermediates[hop].keypair.clone();
            match self
                .send_and_confirm(&signer, None, &target, amount, base_attempt + pass)
                .await
            {
                SendOutcome::Confirmed(signature) => {
                    route.signatures.push(signature);
                    route.state = Self::state_after_hop(route, hop);
                    return true;
                }
                SendOutcome::Rejected(signature, message) => {
                    route.signatures.push(signature);
                    warn!(
                        "route {} recovery pass {} rejected: {}",
                        route.id, pass, message
                    );
                }
                SendOutcome::TimedOut(signature) => {
                    route.signatures.push(signature);
                    warn!("route {} recovery pass {} timed out", route.id, pass);
                }
                SendOutcome::SubmitError(message) => {
                    warn!(
                        "route {} recovery pass {} submission failed: {}",
                        route.id, pass, message
                    );
                }
            }

            self.retry_pause().await;
        }

        false
    }

    fn state_after_hop(route: &Route, hop: usize) -> RouteState {
        if hop + 1 == route.hop_count() {
            RouteState::Delivered
        } else {
            RouteState::Hop(hop + 1)
        }
    }

    // Whether the value expected downstream of `hop` is already there
    async fn hop_target_settled(&self, route: &Route, hop: usize) -> bool {
        if hop + 1 == route.hop_count() {
            let Some(before) = route.destination_balance_before else {
                return false;
            };
            matches!(
                self.gateway
                    .balance(&route.destination, Commitment::Confirmed)
                    .await,
                Ok(balance) if balance >= before + route.amount
            )
        } else {
            let next = route.intermediates[hop + 1].public_key;
            matches!(
                self.gateway.balance(&next, Commitment::Confirmed).await,
                Ok(balance) if balance >= route.expected_at(hop + 1)
            )
        }
    }

    // Drain intermediates[from_hop..] back to the salvage address and
    // return every wallet to the pool, parking stuck ones as error
    async fn sweep_and_teardown(&self, route: &mut Route, from_hop: usize) {
        info!(
            "route {} sweeping intermediaries {}..{} to salvage",
            route.id,
            from_hop,
            route.hop_count()
        );

        // earlier intermediaries already forwarded their value
        for hop in 0..from_hop {
            self.retire_wallet(&route.intermediates[hop].public_key);
        }

        for hop in from_hop..route.hop_count() {
            let address = route.intermediates[hop].public_key;
            let balance = match self.gateway.balance(&address, Commitment::Confirmed).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!("sweep balance check of {} failed: {}", address, e);
                    self.park_wallet(&address);
                    continue;
                }
            };

            let remaining = if balance > self.config.dust_threshold {
                self.sweep_residual(route, hop, balance).await
            } else {
                balance
            };

            if remaining <= self.config.dust_threshold {
                self.retire_wallet(&address);
            } else {
                warn!("{} still stuck on intermediary {}", remaining, address);
                self.park_wallet(&address);
            }
        }
    }

    // One sweep attempt towards the salvage address, returns the
    // balance left on the intermediary afterwards
    pub(super) async fn sweep_residual(
        &self,
        route: &mut Route,
        hop: usize,
        balance: u64,
    ) -> u64 {
        let Some(salvage) = self.salvage else {
            warn!("no salvage address configured, leaving funds in place");
            return balance;
        };

        let amount = balance.saturating_sub(route.fee_buffer);
        if amount == 0 {
            return balance;
        }

        let address = route.intermediates[hop].public_key;
        let signer = route.intermediates[hop].keypair.clone();
        // sweep at the top of the fee ladder
        let attempt = self.config.retry.max_attempts + self.config.retry.recovery_passes();

        match self
            .send_and_confirm(&signer, None, &salvage, amount, attempt)
            .await
        {
            SendOutcome::Confirmed(signature) => {
                route.signatures.push(signature);
            }
            SendOutcome::Rejected(signature, message) => {
                route.signatures.push(signature);
                warn!("sweep of {} rejected: {}", address, message);
            }
            SendOutcome::TimedOut(signature) => {
                route.signatures.push(signature);
                warn!("sweep of {} did not confirm in time", address);
            }
            SendOutcome::SubmitError(message) => {
                warn!("sweep of {} failed to submit: {}", address, message);
            }
        }

        self.gateway
            .balance(&address, Commitment::Confirmed)
            .await
            .unwrap_or(balance)
    }

    fn park_wallet(&self, address: &PublicKey) {
        if let Err(e) = self.pool.mark_error(address) {
            warn!("could not park wallet {}: {}", address, e);
        }
    }
}
