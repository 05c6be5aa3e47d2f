use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use lazy_static::lazy_static;
use thiserror::Error;
use umbra_common::crypto::random::secure_random_bytes;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

// Fixed application salt for the key derivation
// Wallet secrets are bound to one deployment through the configured
// encryption secret, not through a per-record salt
const KDF_SALT: &[u8] = b"umbra-hop-wallet-key";

lazy_static! {
    // scrypt, 16 MB memory cost
    static ref KDF_PARAMS: scrypt::Params =
        scrypt::Params::new(14, 8, 1, KEY_SIZE).expect("valid scrypt params");
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Ciphertext layout or encoding is invalid")]
    BadFormat,

    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    BadKey,

    #[error("Key derivation failed")]
    KeyDerivation,
}

// Encrypts and decrypts wallet secrets at rest
// The scrypt derived key is the only long lived secret held in memory
pub struct Cipher {
    key: [u8; KEY_SIZE],
}

impl Cipher {
    // Derive the AES key once from the configured secret
    pub fn new(secret: &[u8]) -> Result<Self, CipherError> {
        let mut key = [0u8; KEY_SIZE];
        scrypt::scrypt(secret, KDF_SALT, &KDF_PARAMS, &mut key)
            .map_err(|_| CipherError::KeyDerivation)?;

        Ok(Self { key })
    }

    // Encrypt a wallet secret, output format is hex(iv):hex(ciphertext)
    // A fresh IV is generated at each call
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let iv = secure_random_bytes::<IV_SIZE>();
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    // Decrypt a value produced by the function above
    pub fn decrypt(&self, encrypted: &str) -> Result<Vec<u8>, CipherError> {
        let (iv_part, data_part) = encrypted.split_once(':').ok_or(CipherError::BadFormat)?;

        let iv = hex::decode(iv_part).map_err(|_| CipherError::BadFormat)?;
        if iv.len() != IV_SIZE {
            return Err(CipherError::BadFormat);
        }

        let ciphertext = hex::decode(data_part).map_err(|_| CipherError::BadFormat)?;
        if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
            return Err(CipherError::BadFormat);
        }

        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(&iv);

        Aes256CbcDec::new(&self.key.into(), &iv_bytes.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CipherError::BadKey)
    }
}

impl Drop for Cipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"[REDACTED]").finish()
    }
}
