//! Ed25519 cryptographic primitives for wallet identities.
//!
//! This module provides the key types used to hold, sign with and
//! address the hop wallets and funding sources of the mixer.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of Ed25519 secret key in bytes.
pub const ED25519_SECRET_KEY_SIZE: usize = SECRET_KEY_LENGTH;

/// Size of Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 signature in bytes.
pub const ED25519_SIGNATURE_SIZE: usize = SIGNATURE_LENGTH;

/// Size of the expanded secret format (secret key followed by public key).
pub const ED25519_FULL_SECRET_SIZE: usize = ED25519_SECRET_KEY_SIZE + ED25519_PUBLIC_KEY_SIZE;

/// Error types for Ed25519 operations.
#[derive(Error, Debug, Clone)]
pub enum Ed25519Error {
    /// Invalid secret key length.
    #[error(
        "Invalid secret key length: expected {} or {}, got {}",
        ED25519_SECRET_KEY_SIZE,
        ED25519_FULL_SECRET_SIZE,
        _0
    )]
    InvalidSecretKeyLength(usize),

    /// Invalid public key length.
    #[error(
        "Invalid public key length: expected {}, got {}",
        ED25519_PUBLIC_KEY_SIZE,
        _0
    )]
    InvalidPublicKeyLength(usize),

    /// Invalid signature length.
    #[error(
        "Invalid signature length: expected {}, got {}",
        ED25519_SIGNATURE_SIZE,
        _0
    )]
    InvalidSignatureLength(usize),

    /// The public half of an expanded secret does not match its secret half.
    #[error("Expanded secret key halves do not match")]
    MismatchedKeyPair,

    /// Failed to parse public key bytes.
    #[error("Failed to parse public key")]
    InvalidPublicKey,

    /// Signature verification failed.
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Base58 decoding error.
    #[error("Invalid base58 string: {0}")]
    Base58Error(String),
}

/// Ed25519 secret key (32 bytes).
///
/// The secret key is zeroized on drop for security.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519SecretKey([u8; ED25519_SECRET_KEY_SIZE]);

impl Ed25519SecretKey {
    /// Create a secret key from raw bytes.
    pub fn from_bytes(bytes: [u8; ED25519_SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a secret key from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        if slice.len() != ED25519_SECRET_KEY_SIZE {
            return Err(Ed25519Error::InvalidSecretKeyLength(slice.len()));
        }
        let mut bytes = [0u8; ED25519_SECRET_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get the raw bytes of the secret key.
    pub fn as_bytes(&self) -> &[u8; ED25519_SECRET_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Ed25519SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Ed25519 public key (32 bytes).
///
/// Displayed and serialized as its base58 encoding, which is also the
/// on-chain address format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ed25519PublicKey([u8; ED25519_PUBLIC_KEY_SIZE]);

impl Ed25519PublicKey {
    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; ED25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a public key from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        if slice.len() != ED25519_PUBLIC_KEY_SIZE {
            return Err(Ed25519Error::InvalidPublicKeyLength(slice.len()));
        }
        let mut bytes = [0u8; ED25519_PUBLIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Create a public key from a base58 string.
    pub fn from_base58(encoded: &str) -> Result<Self, Ed25519Error> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| Ed25519Error::Base58Error(e.to_string()))?;
        let key = Self::from_slice(&bytes)?;
        // reject points that are not on the curve
        VerifyingKey::from_bytes(&key.0).map_err(|_| Ed25519Error::InvalidPublicKey)?;
        Ok(key)
    }

    /// Get the raw bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; ED25519_PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Convert to base58 string.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), Ed25519Error> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| Ed25519Error::InvalidPublicKey)?;
        let dalek_sig = DalekSignature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &dalek_sig)
            .map_err(|_| Ed25519Error::VerificationFailed)
    }
}

impl std::str::FromStr for Ed25519PublicKey {
    type Err = Ed25519Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", self.to_base58())
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl serde::Serialize for Ed25519PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> serde::Deserialize<'de> for Ed25519PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}

/// Ed25519 signature (64 bytes).
///
/// The base58 encoding of a signature is the on-chain transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519Signature([u8; ED25519_SIGNATURE_SIZE]);

impl serde::Serialize for Ed25519Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> serde::Deserialize<'de> for Ed25519Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}

impl Ed25519Signature {
    /// Create a signature from raw bytes.
    pub fn from_bytes(bytes: [u8; ED25519_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a signature from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        if slice.len() != ED25519_SIGNATURE_SIZE {
            return Err(Ed25519Error::InvalidSignatureLength(slice.len()));
        }
        let mut bytes = [0u8; ED25519_SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Create a signature from a base58 string.
    pub fn from_base58(encoded: &str) -> Result<Self, Ed25519Error> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| Ed25519Error::Base58Error(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Get the raw bytes of the signature.
    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_SIZE] {
        &self.0
    }

    /// Convert to base58 string.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({}...)", &self.to_base58()[..16])
    }
}

impl fmt::Display for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// Ed25519 key pair containing both secret and public keys.
///
/// The secret key is zeroized on drop for security.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a new random key pair using a cryptographically secure RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create a key pair from a secret key.
    pub fn from_secret(secret: &Ed25519SecretKey) -> Self {
        let signing_key = SigningKey::from_bytes(secret.as_bytes());
        Self { signing_key }
    }

    /// Create a key pair from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; ED25519_SECRET_KEY_SIZE]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Create a key pair from an expanded secret slice.
    ///
    /// Accepts either the 32-byte secret key alone or the 64-byte
    /// expanded format (secret key followed by public key). For the
    /// expanded format the embedded public key must match the secret.
    pub fn from_full_slice(slice: &[u8]) -> Result<Self, Ed25519Error> {
        match slice.len() {
            ED25519_SECRET_KEY_SIZE => {
                let secret = Ed25519SecretKey::from_slice(slice)?;
                Ok(Self::from_secret(&secret))
            }
            ED25519_FULL_SECRET_SIZE => {
                let secret = Ed25519SecretKey::from_slice(&slice[..ED25519_SECRET_KEY_SIZE])?;
                let keypair = Self::from_secret(&secret);
                let expected = &slice[ED25519_SECRET_KEY_SIZE..];
                if keypair.public_key().as_bytes() != expected {
                    return Err(Ed25519Error::MismatchedKeyPair);
                }
                Ok(keypair)
            }
            len => Err(Ed25519Error::InvalidSecretKeyLength(len)),
        }
    }

    /// Create a key pair from a base58 encoded expanded secret.
    pub fn from_full_base58(encoded: &str) -> Result<Self, Ed25519Error> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .map_err(|e| Ed25519Error::Base58Error(e.to_string()))?;
        Self::from_full_slice(&bytes)
    }

    /// Get the secret key.
    pub fn secret_key(&self) -> Ed25519SecretKey {
        Ed25519SecretKey::from_bytes(self.signing_key.to_bytes())
    }

    /// Get the public key.
    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message and return the signature.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let signature = self.signing_key.sign(message);
        Ed25519Signature::from_bytes(signature.to_bytes())
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &self.public_key())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}
