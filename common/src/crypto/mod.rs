mod ed25519;

pub mod random;

pub use ed25519::*;

/// Public Key type used in the system
pub type PublicKey = Ed25519PublicKey;

/// On-chain addresses are base58 encoded public keys
pub type Address = Ed25519PublicKey;
