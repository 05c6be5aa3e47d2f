use serde::{Deserialize, Serialize};

use crate::executor::fees::FeePolicy;

// Environment variables read by the core
pub const ENV_RPC_ENDPOINT: &str = "RPC_ENDPOINT";
pub const ENV_ENCRYPTION_SECRET: &str = "MIXER_ENCRYPTION_SECRET";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

// Balance polling between hops
pub const BALANCE_POLL_INITIAL_MS: u64 = 400;
pub const BALANCE_POLL_MULTIPLIER: f64 = 1.5;
pub const BALANCE_POLL_CAP_MS: u64 = 2_000;

// Signature confirmation polling
pub const CONFIRMATION_POLL_INTERVAL_MS: u64 = 2_000;
pub const CONFIRMATION_TIMEOUT_MS: u64 = 30_000;

// Gateway back-off on provider rate limits
pub const RPC_BACKOFF_INITIAL_MS: u64 = 500;
pub const RPC_BACKOFF_FACTOR: f64 = 2.0;
pub const RPC_BACKOFF_JITTER: f64 = 0.25;
pub const RPC_BACKOFF_CAP_MS: u64 = 8_000;
pub const RPC_MAX_RETRIES: u32 = 5;

// How many wallets ensure_health generates per pass
pub const DEFAULT_GROWTH_STEP: usize = 4;

// Functions Helpers
fn default_hop_count() -> usize {
    8
}

fn default_max_concurrent_routes() -> usize {
    2
}

fn default_balance_check_timeout() -> u64 {
    8_000
}

fn default_dust_threshold() -> u64 {
    umbra_common::config::DUST_THRESHOLD
}

// Provider side limits enforced by the gateway buckets
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RpcLimitsConfig {
    /// Request bucket refill rate, tokens per second
    pub req_per_sec: u32,
    /// Transaction bucket refill rate, tokens per second
    pub tx_per_sec: u32,
    /// Maximum tokens accumulated while idle
    pub burst: u32,
}

impl Default for RpcLimitsConfig {
    fn default() -> Self {
        Self {
            req_per_sec: 50,
            tx_per_sec: 5,
            burst: 10,
        }
    }
}

// Per hop retry behaviour before a route enters recovery
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Attempts per hop before recovery
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds
    pub retry_delay: u64,
    /// The delay is drawn uniformly from [retry_delay, retry_delay * backoff_factor]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: 1_000,
            backoff_factor: 1.5,
        }
    }
}

impl RetryConfig {
    // Recovery re-sign passes before the salvage sweep
    pub fn recovery_passes(&self) -> u32 {
        self.max_attempts.saturating_sub(1).max(1)
    }
}

/// Per-call configuration of a mix run.
///
/// This is the full option set recognized by the core; unknown keys are
/// rejected when deserializing a caller supplied configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MixConfig {
    /// Intermediaries per route
    pub hop_count: usize,
    /// Executor parallelism
    pub max_concurrent_routes: usize,
    /// Milliseconds to wait for a hop balance to appear
    pub balance_check_timeout: u64,
    /// Minimum inter-hop delay in milliseconds, 0 disables delays
    pub min_delay: u64,
    /// Maximum inter-hop delay in milliseconds, 0 disables delays
    pub max_delay: u64,
    /// Compute unit price policy for transfers
    pub priority_fee_policy: FeePolicy,
    /// Gateway token bucket limits
    pub rpc_limits: RpcLimitsConfig,
    /// Per hop retry behaviour
    pub retry: RetryConfig,
    /// Balance below which an intermediary is considered drained
    pub dust_threshold: u64,
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            hop_count: default_hop_count(),
            max_concurrent_routes: default_max_concurrent_routes(),
            balance_check_timeout: default_balance_check_timeout(),
            min_delay: 0,
            max_delay: 0,
            priority_fee_policy: FeePolicy::TRANSFER,
            rpc_limits: RpcLimitsConfig::default(),
            retry: RetryConfig::default(),
            dust_threshold: default_dust_threshold(),
        }
    }
}

impl MixConfig {
    // Delays disabled means all hops of a route run back to back and
    // routes overlap freely
    pub fn is_parallel_mode(&self) -> bool {
        self.min_delay == 0 && self.max_delay == 0
    }
}
