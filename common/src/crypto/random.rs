/// Cryptographically secure random number generation
///
/// All key material and scheduling jitter in the mixer comes from the
/// operating system CSPRNG through OsRng. Never use thread_rng() for
/// nonce or key generation.
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// Generate cryptographically secure random bytes
pub fn secure_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate cryptographically secure random u64
pub fn secure_random_u64() -> u64 {
    OsRng.next_u64()
}

/// Pick a uniform value in [min, max]
///
/// Used for inter-hop delays and retry jitter. Returns min when the
/// range is empty or inverted.
pub fn secure_random_range(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    OsRng.gen_range(min..=max)
}
