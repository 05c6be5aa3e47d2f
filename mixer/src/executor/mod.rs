pub mod fees;

mod confirm;
mod recovery;
mod route;

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
    time::{sleep, Instant},
};
use umbra_common::crypto::{Ed25519KeyPair, Ed25519Signature, PublicKey};

use crate::{
    config::{
        MixConfig, BALANCE_POLL_CAP_MS, BALANCE_POLL_INITIAL_MS, BALANCE_POLL_MULTIPLIER,
    },
    entry::{TransferOutcome, TransferRecord},
    gateway::{Commitment, RpcGateway, SendOptions},
    pool::{ReleaseOutcome, WalletPool},
    transaction::build_transfer,
};

pub use confirm::{ConfirmOutcome, SharedSignatureWatcher, SignatureWatcher};
pub use route::{Route, RouteHop, RouteState};

// Result of one submit-and-confirm cycle
enum SendOutcome {
    Confirmed(Ed25519Signature),
    Rejected(Ed25519Signature, String),
    TimedOut(Ed25519Signature),
    SubmitError(String),
}

// Why a hop gave up after its retry budget
struct HopFailure {
    timed_out: bool,
    message: String,
}

// Everything submit_with_retries learned, including signatures of
// attempts that did not confirm
struct SubmitResult {
    signatures: Vec<Ed25519Signature>,
    outcome: Result<Ed25519Signature, HopFailure>,
}

/// Drives route state machines against the ledger.
///
/// Routes share nothing mutable except the wallet pool and the gateway
/// buckets; the executor itself only reads its configuration.
pub struct Executor {
    pool: Arc<WalletPool>,
    gateway: Arc<RpcGateway>,
    watcher: SharedSignatureWatcher,
    config: MixConfig,
    salvage: Option<PublicKey>,
}

impl Executor {
    pub fn new(
        pool: Arc<WalletPool>,
        gateway: Arc<RpcGateway>,
        watcher: SharedSignatureWatcher,
        config: MixConfig,
        salvage: Option<PublicKey>,
    ) -> Self {
        Self {
            pool,
            gateway,
            watcher,
            config,
            salvage,
        }
    }

    // Run every route to a terminal state on a bounded worker pool
    //
    // Workers are handed out by a FIFO semaphore sized by
    // max_concurrent_routes; a finished route frees its slot for the
    // next queued one. Results come back in route id order.
    pub async fn execute(
        self: &Arc<Self>,
        routes: Vec<Route>,
        cancelled: watch::Receiver<bool>,
    ) -> Vec<Route> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_routes.max(1)));
        let mut tasks = JoinSet::new();

        for route in routes {
            let zelf = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancelled = cancelled.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("route semaphore is never closed");
                zelf.drive_route(route, cancelled).await
            });
        }

        let mut finished = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(route) => finished.push(route),
                Err(e) => warn!("route task aborted: {}", e),
            }
        }

        finished.sort_by_key(|route| route.id);
        finished
    }

    // Advance one route until it reaches a terminal state
    async fn drive_route(&self, mut route: Route, cancelled: watch::Receiver<bool>) -> Route {
        debug!(
            "route {} starting: {} hops towards {}",
            route.id,
            route.hop_count(),
            route.destination
        );

        loop {
            // a cancellation lets the in-flight hop finish, then winds
            // the route down through a salvage sweep
            if *cancelled.borrow()
                && !route.state.is_terminal()
                && !matches!(route.state, RouteState::Recovery(_))
            {
                info!("route {} winding down after cancellation", route.id);
                if route.error.is_none() {
                    route.error = Some("mix cancelled".to_owned());
                }
                route.resubmit_pending = false;
                route.state = RouteState::Recovery(route.state.current_hop());
            }

            match route.state {
                RouteState::FundHead => self.run_fund_head(&mut route).await,
                RouteState::Hop(hop) => self.run_hop(&mut route, hop).await,
                RouteState::Delivered => self.run_delivered(&mut route).await,
                RouteState::Recovery(hop) => self.run_recovery(&mut route, hop).await,
                RouteState::Complete | RouteState::Failed => {
                    info!(
                        "route {} finished {:?} with {} signatures",
                        route.id,
                        route.state,
                        route.signatures.len()
                    );
                    return route;
                }
            }
        }
    }

    // Fund the head of the route from the source wallet
    async fn run_fund_head(&self, route: &mut Route) {
        // snapshot for the delivery post-check
        if route.destination_balance_before.is_none() {
            match self
                .gateway
                .balance(&route.destination, Commitment::Confirmed)
                .await
            {
                Ok(balance) => route.destination_balance_before = Some(balance),
                Err(e) => warn!(
                    "could not snapshot destination {} balance: {}",
                    route.destination, e
                ),
            }
        }

        let head = route.intermediates[0].public_key;
        let funding = route.head_funding();
        let source = Arc::clone(&route.source);
        let fee_source = route.fee_source.clone();

        let result = self
            .submit_with_retries(&source, fee_source.as_deref(), &head, funding, 0)
            .await;
        route.signatures.extend(result.signatures);

        match result.outcome {
            Ok(_) => route.state = RouteState::Hop(0),
            Err(failure) => {
                warn!("route {} funding failed: {}", route.id, failure.message);
                route.error = Some(failure.message);
                route.state = RouteState::Failed;
                // nothing reached the intermediaries, hand them back
                self.release_all_unused(route);
            }
        }
    }

    // Forward the value from intermediate `hop` to the next leg
    async fn run_hop(&self, route: &mut Route, hop: usize) {
        let address = route.intermediates[hop].public_key;
        let expected = route.expected_at(hop);

        if self.wait_for_balance(&address, expected).await.is_none() {
            route.error = Some(format!(
                "balance did not appear on hop {} within {} ms",
                hop, self.config.balance_check_timeout
            ));
            route.resubmit_pending = false;
            route.state = RouteState::Recovery(hop);
            return;
        }

        self.inter_hop_delay().await;

        let (target, amount) = route.transfer_from(hop);
        let signer = route.intermediates[hop].keypair.clone();

        let result = self.submit_with_retries(&signer, None, &target, amount, 0).await;
        route.signatures.extend(result.signatures);

        match result.outcome {
            Ok(_) => {
                route.state = if hop + 1 == route.hop_count() {
                    RouteState::Delivered
                } else {
                    RouteState::Hop(hop + 1)
                };
            }
            Err(failure) => {
                debug!(
                    "route {} hop {} entering recovery: {}",
                    route.id, hop, failure.message
                );
                route.error = Some(failure.message);
                // recovery may re-sign the stuck transfer before it
                // falls back to the salvage sweep
                route.resubmit_pending = true;
                route.state = RouteState::Recovery(hop);
            }
        }
    }

    // Verify the delivery and drain every intermediary
    async fn run_delivered(&self, route: &mut Route) {
        let last = route.hop_count() - 1;

        if let Some(before) = route.destination_balance_before {
            let expected = before + route.amount;
            if self
                .wait_for_balance(&route.destination, expected)
                .await
                .is_none()
            {
                route.error = Some(
                    "destination balance did not increase by the delivered amount".to_owned(),
                );
                route.resubmit_pending = false;
                route.state = RouteState::Recovery(last);
                return;
            }
        }

        for hop in 0..route.hop_count() {
            let address = route.intermediates[hop].public_key;
            let mut balance = match self.gateway.balance(&address, Commitment::Confirmed).await {
                Ok(balance) => balance,
                Err(e) => {
                    warn!("drain check of {} failed: {}", address, e);
                    route.error = Some(format!("drain check failed: {}", e));
                    route.resubmit_pending = false;
                    route.state = RouteState::Recovery(hop);
                    return;
                }
            };

            // the final intermediary keeps the route residual, sweep it
            // to the salvage address when it exceeds dust
            if hop == last && balance > self.config.dust_threshold {
                balance = self.sweep_residual(route, hop, balance).await;
            }

            if balance > self.config.dust_threshold {
                route.error = Some(format!(
                    "intermediary {} still holds {} after delivery",
                    address, balance
                ));
                route.resubmit_pending = false;
                // sweep from the first undrained intermediary onwards
                route.state = RouteState::Recovery(hop);
                return;
            }
        }

        // cooling first, then available once the drain is on record
        for hop in 0..route.hop_count() {
            self.retire_wallet(&route.intermediates[hop].public_key);
        }

        info!(
            "route {} delivered {} to {}",
            route.id, route.amount, route.destination
        );
        route.state = RouteState::Complete;
    }

    // Submit one transfer with retries and per-attempt fee bumps
    //
    // A rejected transfer is retried after a randomized pause; a
    // confirmation timeout ends the attempts immediately so recovery
    // can take over without double-spending the hop.
    async fn submit_with_retries(
        &self,
        signer: &Ed25519KeyPair,
        fee_payer: Option<&Ed25519KeyPair>,
        target: &PublicKey,
        amount: u64,
        first_attempt: u32,
    ) -> SubmitResult {
        let mut signatures = Vec::new();
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            match self
                .send_and_confirm(signer, fee_payer, target, amount, first_attempt + attempt)
                .await
            {
                SendOutcome::Confirmed(signature) => {
                    signatures.push(signature);
                    return SubmitResult {
                        signatures,
                        outcome: Ok(signature),
                    };
                }
                SendOutcome::Rejected(signature, message) => {
                    signatures.push(signature);
                    warn!(
                        "transfer to {} rejected (attempt {}): {}",
                        target,
                        attempt + 1,
                        message
                    );
                    last_error = message;
                }
                SendOutcome::TimedOut(signature) => {
                    signatures.push(signature);
                    return SubmitResult {
                        signatures,
                        outcome: Err(HopFailure {
                            timed_out: true,
                            message: format!("transfer to {} confirmation timed out", target),
                        }),
                    };
                }
                SendOutcome::SubmitError(message) => {
                    warn!(
                        "transfer to {} submission failed (attempt {}): {}",
                        target,
                        attempt + 1,
                        message
                    );
                    last_error = message;
                }
            }

            if attempt + 1 < max_attempts {
                self.retry_pause().await;
            }
        }

        SubmitResult {
            signatures,
            outcome: Err(HopFailure {
                timed_out: false,
                message: format!("transfer to {} failed after retries: {}", target, last_error),
            }),
        }
    }

    // One submission: fresh blockhash, attempt-scaled priority fee,
    // then wait for the watcher to resolve the signature
    async fn send_and_confirm(
        &self,
        signer: &Ed25519KeyPair,
        fee_payer: Option<&Ed25519KeyPair>,
        target: &PublicKey,
        amount: u64,
        attempt: u32,
    ) -> SendOutcome {
        let blockhash = match self.gateway.latest_blockhash(Commitment::Confirmed).await {
            Ok(blockhash) => blockhash,
            Err(e) => return SendOutcome::SubmitError(e.to_string()),
        };

        let priority_fee = self.config.priority_fee_policy.price_for_attempt(attempt);
        let transfer = build_transfer(signer, fee_payer, target, amount, priority_fee, &blockhash);

        let signature = match self
            .gateway
            .send_transaction(transfer.encoded(), &SendOptions::default())
            .await
        {
            Ok(signature) => signature,
            Err(e) => return SendOutcome::SubmitError(e.to_string()),
        };

        let record = TransferRecord::submitted(signer.public_key(), *target, amount, signature);
        let receiver = self.watcher.watch(signature).await;

        let confirmation = match receiver.await {
            Ok(outcome) => outcome,
            // the watcher went away, treat the signature as expired
            Err(_) => ConfirmOutcome::Timeout,
        };

        let (audit, outcome) = match confirmation {
            ConfirmOutcome::Confirmed => (
                TransferOutcome::Confirmed,
                SendOutcome::Confirmed(signature),
            ),
            ConfirmOutcome::Failed(message) => (
                TransferOutcome::Failed,
                SendOutcome::Rejected(signature, message),
            ),
            ConfirmOutcome::Timeout => (TransferOutcome::Timeout, SendOutcome::TimedOut(signature)),
        };

        if let Err(e) = self.pool.append_transfer(&record.with_outcome(audit)) {
            warn!("could not append transfer audit record: {}", e);
        }

        outcome
    }

    // Poll a balance with exponential back-off until it reaches
    // `expected` or the configured timeout elapses
    async fn wait_for_balance(&self, address: &PublicKey, expected: u64) -> Option<u64> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.balance_check_timeout.max(1));
        let mut interval = BALANCE_POLL_INITIAL_MS as f64;

        loop {
            match self.gateway.balance(address, Commitment::Confirmed).await {
                Ok(balance) if balance >= expected => return Some(balance),
                Ok(_) => {}
                Err(e) => warn!("balance poll of {} failed: {}", address, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wait = Duration::from_millis(interval as u64).min(deadline - now);
            sleep(wait).await;
            interval = (interval * BALANCE_POLL_MULTIPLIER).min(BALANCE_POLL_CAP_MS as f64);
        }
    }

    // Randomized pause between hops, disabled in parallel mode
    async fn inter_hop_delay(&self) {
        if self.config.is_parallel_mode() {
            return;
        }

        let delay = umbra_common::crypto::random::secure_random_range(
            self.config.min_delay,
            self.config.max_delay,
        );
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
    }

    // Randomized pause between attempts on the same hop
    async fn retry_pause(&self) {
        let retry = &self.config.retry;
        let upper = (retry.retry_delay as f64 * retry.backoff_factor.max(1.0)) as u64;
        let delay =
            umbra_common::crypto::random::secure_random_range(retry.retry_delay, upper);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
    }

    // Used release followed by the drained-balance confirmation
    fn retire_wallet(&self, address: &PublicKey) {
        if let Err(e) = self.pool.release(address, ReleaseOutcome::Used) {
            warn!("could not release wallet {}: {}", address, e);
            return;
        }
        if let Err(e) = self.pool.mark_cool_zero(address) {
            warn!("could not finish cooling of wallet {}: {}", address, e);
        }
    }

    fn release_all_unused(&self, route: &Route) {
        for hop in &route.intermediates {
            if let Err(e) = self.pool.release(&hop.public_key, ReleaseOutcome::Unused) {
                warn!("could not release wallet {}: {}", hop.public_key, e);
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("salvage", &self.salvage)
            .finish()
    }
}
