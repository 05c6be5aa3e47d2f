use thiserror::Error;
use umbra_common::crypto::Ed25519Error;

use crate::{cipher::CipherError, gateway::GatewayError, pool::PoolError};

#[derive(Debug, Error)]
pub enum MixerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Wallet pool cannot supply {needed} intermediaries ({available} available)")]
    InsufficientPool { needed: usize, available: usize },

    #[error("Wallet {wallet} secret cannot be decrypted")]
    DecryptionFailed { wallet: String },

    #[error("Insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: u64, have: u64 },

    #[error("Balance did not appear within {0} ms")]
    HopTimeout(u64),

    #[error("Mix cancelled")]
    Cancelled,

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Crypto(#[from] Ed25519Error),

    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl MixerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}
