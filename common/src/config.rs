pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 9 decimals numbers
pub const COIN_DECIMALS: u8 = 9;
// 1 000 000 000 native units to represent 1 coin
pub const COIN_VALUE: u64 = 10u64.pow(COIN_DECIMALS as u32);

// Below this amount an account is considered empty
// Covers the rent floor plus rounding noise left by a sweep
pub const DUST_THRESHOLD: u64 = 1_000_000;

// Conservative upper bound charged by the ledger per transfer
// Signature fee plus the priority fee budget of one hop
pub const PER_HOP_FEE: u64 = 105_000;

// Extra funding added on top of the per-hop fee budget of a route
// Absorbs priority fee bumps during retries
pub const SAFETY_MARGIN: u64 = 200_000;

// Smallest amount worth delivering to a destination
pub const MIN_PER_DESTINATION: u64 = 10 * DUST_THRESHOLD;
