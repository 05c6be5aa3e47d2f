mod bucket;
mod ledger;

use std::{future::Future, sync::Arc, time::Duration};

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::time::sleep;
use umbra_common::{
    crypto::{Ed25519Signature, PublicKey},
    rpc::JsonRpcError,
};

use crate::config::{
    RpcLimitsConfig, RPC_BACKOFF_CAP_MS, RPC_BACKOFF_FACTOR, RPC_BACKOFF_INITIAL_MS,
    RPC_BACKOFF_JITTER, RPC_MAX_RETRIES,
};

pub use bucket::TokenBucket;
pub use ledger::{Commitment, HttpLedger, Ledger, SendOptions, SignatureStatus};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("RPC retries exhausted: {0}")]
    RpcExhausted(JsonRpcError),

    #[error("RPC protocol error: {0}")]
    RpcProtocol(JsonRpcError),

    #[error(transparent)]
    Rpc(JsonRpcError),
}

impl From<JsonRpcError> for GatewayError {
    fn from(e: JsonRpcError) -> Self {
        match e {
            JsonRpcError::ParseResponse(_)
            | JsonRpcError::InvalidValue(_)
            | JsonRpcError::InvalidVersion
            | JsonRpcError::MissingResult => Self::RpcProtocol(e),
            other => Self::Rpc(other),
        }
    }
}

// Process wide facade over the ledger endpoint
//
// Every outbound call consumes a token from one of two buckets before
// it is issued: transaction submissions go through the send bucket,
// everything else through the request bucket. Any number of callers
// may invoke the gateway concurrently, the buckets serialize token
// consumption while the I/O itself runs in parallel.
pub struct RpcGateway {
    ledger: Arc<dyn Ledger>,
    request_bucket: TokenBucket,
    transaction_bucket: TokenBucket,
}

impl RpcGateway {
    pub fn new(ledger: Arc<dyn Ledger>, limits: &RpcLimitsConfig) -> Self {
        Self {
            ledger,
            request_bucket: TokenBucket::new(limits.req_per_sec, limits.burst),
            // the send bucket bursts a subset of the request allowance
            transaction_bucket: TokenBucket::new(
                limits.tx_per_sec,
                limits.burst.min(limits.tx_per_sec).max(1),
            ),
        }
    }

    // Run one call with rate limit back-off
    //
    // Provider rate limits are retried with exponential back-off and
    // jitter before surfacing RpcExhausted; anything else is mapped
    // through GatewayError and returned to the caller.
    async fn with_backoff<T, F, Fut>(
        &self,
        bucket: &TokenBucket,
        name: &str,
        call: F,
    ) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, JsonRpcError>>,
    {
        let mut delay = RPC_BACKOFF_INITIAL_MS as f64;
        let mut attempt = 1u32;

        loop {
            bucket.acquire().await;

            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= RPC_MAX_RETRIES {
                        warn!("{} retries exhausted: {}", name, e);
                        return Err(GatewayError::RpcExhausted(e));
                    }

                    let capped = delay.min(RPC_BACKOFF_CAP_MS as f64);
                    let jitter = capped * RPC_BACKOFF_JITTER;
                    let wait = umbra_common::crypto::random::secure_random_range(
                        (capped - jitter) as u64,
                        (capped + jitter) as u64,
                    );
                    warn!(
                        "{} rate limited (attempt {}), backing off {} ms",
                        name, attempt, wait
                    );
                    sleep(Duration::from_millis(wait)).await;
                    delay *= RPC_BACKOFF_FACTOR;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("{} failed: {}", name, e);
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn latest_blockhash(&self, commitment: Commitment) -> Result<String, GatewayError> {
        self.with_backoff(&self.request_bucket, "latest_blockhash", || {
            self.ledger.latest_blockhash(commitment)
        })
        .await
    }

    pub async fn balance(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<u64, GatewayError> {
        self.with_backoff(&self.request_bucket, "balance", || {
            self.ledger.balance(address, commitment)
        })
        .await
    }

    pub async fn send_transaction(
        &self,
        transaction: &str,
        options: &SendOptions,
    ) -> Result<Ed25519Signature, GatewayError> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("send_transaction ({} bytes)", transaction.len());
        }
        self.with_backoff(&self.transaction_bucket, "send_transaction", || {
            self.ledger.send_transaction(transaction, options)
        })
        .await
    }

    pub async fn signature_status(
        &self,
        signature: &Ed25519Signature,
    ) -> Result<Option<SignatureStatus>, GatewayError> {
        let mut statuses = self.signature_statuses(std::slice::from_ref(signature)).await?;
        Ok(statuses.pop().flatten())
    }

    pub async fn signature_statuses(
        &self,
        signatures: &[Ed25519Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, GatewayError> {
        self.with_backoff(&self.request_bucket, "signature_statuses", || {
            self.ledger.signature_statuses(signatures)
        })
        .await
    }

    pub async fn account_data(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<Option<Vec<u8>>, GatewayError> {
        self.with_backoff(&self.request_bucket, "account_data", || {
            self.ledger.account_data(address, commitment)
        })
        .await
    }
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("request_bucket", &self.request_bucket)
            .field("transaction_bucket", &self.transaction_bucket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Ledger answering a scripted number of rate limits before success
    struct FlakyLedger {
        rate_limits: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyLedger {
        fn new(rate_limits: u32) -> Self {
            Self {
                rate_limits: AtomicU32::new(rate_limits),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Ledger for FlakyLedger {
        async fn latest_blockhash(&self, _: Commitment) -> Result<String, JsonRpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .rate_limits
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok()
            {
                return Err(JsonRpcError::RateLimited);
            }
            Ok("BLOCKHASH".to_owned())
        }

        async fn balance(&self, _: &PublicKey, _: Commitment) -> Result<u64, JsonRpcError> {
            Ok(0)
        }

        async fn send_transaction(
            &self,
            _: &str,
            _: &SendOptions,
        ) -> Result<Ed25519Signature, JsonRpcError> {
            Err(JsonRpcError::MissingResult)
        }

        async fn signature_statuses(
            &self,
            signatures: &[Ed25519Signature],
        ) -> Result<Vec<Option<SignatureStatus>>, JsonRpcError> {
            Ok(vec![None; signatures.len()])
        }

        async fn account_data(
            &self,
            _: &PublicKey,
            _: Commitment,
        ) -> Result<Option<Vec<u8>>, JsonRpcError> {
            Ok(None)
        }
    }

    fn gateway(ledger: FlakyLedger) -> RpcGateway {
        RpcGateway::new(Arc::new(ledger), &RpcLimitsConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_recovers_from_transient_rate_limits() {
        let gateway = gateway(FlakyLedger::new(4));
        let blockhash = gateway.latest_blockhash(Commitment::Confirmed).await.unwrap();
        assert_eq!(blockhash, "BLOCKHASH");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts_after_max_retries() {
        let ledger = FlakyLedger::new(u32::MAX);
        let gateway = gateway(ledger);

        let result = gateway.latest_blockhash(Commitment::Confirmed).await;
        assert!(matches!(result, Err(GatewayError::RpcExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_rate_limits_exhaust() {
        // five rejections in a row eat the full attempt budget
        let gateway = gateway(FlakyLedger::new(5));
        let result = gateway.latest_blockhash(Commitment::Confirmed).await;
        assert!(matches!(result, Err(GatewayError::RpcExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_errors_not_retried() {
        let ledger = FlakyLedger::new(0);
        let gateway = gateway(ledger);

        let result = gateway
            .send_transaction("payload", &SendOptions::default())
            .await;
        assert!(matches!(result, Err(GatewayError::RpcProtocol(_))));
    }
}
