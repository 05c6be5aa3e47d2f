use serde::{Deserialize, Serialize};
use strum::Display;
use umbra_common::{
    crypto::{Ed25519Signature, PublicKey},
    time::{get_current_time_in_millis, TimestampMillis},
    utils::format_native,
};

// Final state of one submitted hop transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransferOutcome {
    Pending,
    Confirmed,
    Failed,
    Timeout,
}

// One row of the persisted transfer audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub from: PublicKey,
    pub to: PublicKey,
    pub amount: u64,
    pub signature: Option<Ed25519Signature>,
    pub submitted_at: TimestampMillis,
    pub confirmed_at: Option<TimestampMillis>,
    pub outcome: TransferOutcome,
}

impl TransferRecord {
    pub fn submitted(
        from: PublicKey,
        to: PublicKey,
        amount: u64,
        signature: Ed25519Signature,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            signature: Some(signature),
            submitted_at: get_current_time_in_millis(),
            confirmed_at: None,
            outcome: TransferOutcome::Pending,
        }
    }

    pub fn with_outcome(mut self, outcome: TransferOutcome) -> Self {
        if outcome == TransferOutcome::Confirmed {
            self.confirmed_at = Some(get_current_time_in_millis());
        }
        self.outcome = outcome;
        self
    }

    pub fn summary(&self) -> String {
        format!(
            "{} -> {} ({}): {}",
            self.from,
            self.to,
            format_native(self.amount),
            self.outcome
        )
    }
}
