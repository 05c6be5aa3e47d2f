use serde::{Deserialize, Serialize};

// Retry aware compute unit price policy
//
// The price starts at `base` and is multiplied at each attempt on the
// same hop, clamped into [min, max]. Presets exist per operation kind,
// the mixer itself always transfers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeePolicy {
    pub base: u64,
    pub multiplier: f64,
    pub min: u64,
    pub max: u64,
}

impl FeePolicy {
    pub const TRANSFER: Self = Self {
        base: 1_000_000,
        multiplier: 1.5,
        min: 100_000,
        max: 10_000_000,
    };

    pub const TOKEN_CREATION: Self = Self {
        base: 2_000_000,
        multiplier: 1.5,
        min: 500_000,
        max: 20_000_000,
    };

    pub const BUY: Self = Self {
        base: 1_500_000,
        multiplier: 1.5,
        min: 200_000,
        max: 15_000_000,
    };

    pub const SELL: Self = Self {
        base: 1_000_000,
        multiplier: 1.5,
        min: 200_000,
        max: 10_000_000,
    };

    pub const ULTRA_FAST_BUY: Self = Self {
        base: 5_000_000,
        multiplier: 2.0,
        min: 1_000_000,
        max: 50_000_000,
    };

    // Price for the k-th attempt on a hop, zero based
    pub fn price_for_attempt(&self, attempt: u32) -> u64 {
        let scaled = self.base as f64 * self.multiplier.powi(attempt as i32);
        (scaled as u64).clamp(self.min, self.max)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::TRANSFER
    }
}
