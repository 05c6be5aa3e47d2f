use serde::{Deserialize, Serialize};
use strum::Display;
use umbra_common::{
    crypto::PublicKey,
    time::{get_current_time_in_millis, TimestampMillis},
};

// Lifecycle of a hop wallet inside the pool
//
// available -> in_use on allocation
// in_use -> cooling on used release, in_use -> available on unused release
// cooling -> available once the on-chain balance is confirmed drained
// any -> error when decryption fails or funds are stuck after recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WalletStatus {
    Available,
    InUse,
    Cooling,
    Error,
}

// A pool managed wallet used transiently to break the direct
// source to destination link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopWallet {
    pub public_key: PublicKey,
    // hex(iv):hex(ciphertext) of the 32 byte secret key
    pub encrypted_secret: String,
    pub status: WalletStatus,
    // opaque id of the mix request currently holding the wallet
    pub allocated_to: Option<String>,
    pub allocated_at: Option<TimestampMillis>,
    pub usage_count: u64,
    pub last_used: Option<TimestampMillis>,
    pub created_at: TimestampMillis,
}

impl HopWallet {
    pub fn new(public_key: PublicKey, encrypted_secret: String) -> Self {
        Self {
            public_key,
            encrypted_secret,
            status: WalletStatus::Available,
            allocated_to: None,
            allocated_at: None,
            usage_count: 0,
            last_used: None,
            created_at: get_current_time_in_millis(),
        }
    }
}

// How a wallet leaves a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    // funds were forwarded through the wallet, it must cool down
    // until its balance is confirmed drained
    Used,
    // the route never funded the wallet, it can be reused directly
    Unused,
}

// Snapshot counts of the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub cooling: usize,
    pub error: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} wallets ({} available, {} in use, {} cooling, {} error)",
            self.total, self.available, self.in_use, self.cooling, self.error
        )
    }
}
