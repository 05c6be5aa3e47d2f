mod backend;
mod types;

use std::sync::Arc;

use anyhow::Context;
use log::{debug, info, trace, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use umbra_common::{
    crypto::{Ed25519KeyPair, PublicKey},
    time::get_current_time_in_millis,
};

use crate::{cipher::Cipher, entry::TransferRecord};

use backend::{Db, Tree};

pub use types::{HopWallet, PoolStats, ReleaseOutcome, WalletStatus};

// Tree holding one record per hop wallet, keyed by public key bytes
const WALLETS_TREE: &str = "wallets";
// Append only audit log of submitted transfers
const TRANSFERS_TREE: &str = "transfers";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool exhausted: requested {requested}, available {available}")]
    Exhausted { requested: usize, available: usize },

    #[error("Wallet {wallet} secret cannot be decrypted")]
    Decryption { wallet: String },

    #[error("Wallet {0} not found in store")]
    NotFound(String),

    #[error("Invalid status transition for wallet {wallet}: {from} -> {to}")]
    InvalidTransition {
        wallet: String,
        from: WalletStatus,
        to: WalletStatus,
    },

    #[error(transparent)]
    Storage(#[from] sled::Error),

    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

// Persisted pool of hop wallets with their allocation lifecycle
//
// The store is the authority on wallet state: every status flip goes
// through a compare and swap on the persisted record so that a crash
// leaves allocations visible (in_use) instead of silently lost.
// In-process callers additionally serialize multi-wallet allocation
// through the async mutex below.
pub struct WalletPool {
    db: Db,
    wallets: Tree,
    transfers: Tree,
    cipher: Arc<Cipher>,
    growth_step: usize,
    // serializes acquire so two routes cannot interleave their scans
    allocation: Mutex<()>,
}

impl WalletPool {
    pub fn open(path: &str, cipher: Arc<Cipher>, growth_step: usize) -> Result<Self, PoolError> {
        let db = backend::open(path)?;
        let wallets = db.open_tree(WALLETS_TREE)?;
        let transfers = db.open_tree(TRANSFERS_TREE)?;

        Ok(Self {
            db,
            wallets,
            transfers,
            cipher,
            growth_step,
            allocation: Mutex::new(()),
        })
    }

    // Flush on disk to make sure everything is saved
    pub async fn flush(&self) -> Result<(), PoolError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<HopWallet, PoolError> {
        Ok(serde_json::from_slice(bytes).context("Error while decoding wallet record")?)
    }

    fn encode(wallet: &HopWallet) -> Result<Vec<u8>, PoolError> {
        Ok(serde_json::to_vec(wallet).context("Error while encoding wallet record")?)
    }

    fn persist(&self, wallet: &HopWallet) -> Result<(), PoolError> {
        self.wallets
            .insert(wallet.public_key.as_bytes(), Self::encode(wallet)?)?;
        Ok(())
    }

    // Apply a transition through compare and swap, retrying when a
    // concurrent writer got there first
    fn update_wallet<F>(&self, public_key: &PublicKey, apply: F) -> Result<HopWallet, PoolError>
    where
        F: Fn(&HopWallet) -> Result<HopWallet, PoolError>,
    {
        loop {
            let current = self
                .wallets
                .get(public_key.as_bytes())?
                .ok_or_else(|| PoolError::NotFound(public_key.to_base58()))?;

            let wallet = Self::decode(&current)?;
            let updated = apply(&wallet)?;
            let encoded = Self::encode(&updated)?;

            match self.wallets.compare_and_swap(
                public_key.as_bytes(),
                Some(current),
                Some(encoded),
            )? {
                Ok(()) => return Ok(updated),
                Err(_) => {
                    trace!("lost an update race for wallet {}, retrying", public_key);
                    continue;
                }
            }
        }
    }

    pub fn get_wallet(&self, public_key: &PublicKey) -> Result<HopWallet, PoolError> {
        let bytes = self
            .wallets
            .get(public_key.as_bytes())?
            .ok_or_else(|| PoolError::NotFound(public_key.to_base58()))?;
        Self::decode(&bytes)
    }

    // Snapshot counts per status
    pub fn stats(&self) -> Result<PoolStats, PoolError> {
        let mut stats = PoolStats::default();
        for entry in self.wallets.iter() {
            let (_, value) = entry?;
            let wallet = Self::decode(&value)?;
            stats.total += 1;
            match wallet.status {
                WalletStatus::Available => stats.available += 1,
                WalletStatus::InUse => stats.in_use += 1,
                WalletStatus::Cooling => stats.cooling += 1,
                WalletStatus::Error => stats.error += 1,
            }
        }

        Ok(stats)
    }

    // Reserve exactly n available wallets for a request
    //
    // The wallets are flipped to in_use one compare and swap at a time
    // under the allocation lock, so concurrent requests see disjoint
    // sets. On a shortfall every wallet taken so far is rolled back.
    pub async fn acquire(&self, n: usize, request_id: &str) -> Result<Vec<HopWallet>, PoolError> {
        let _guard = self.allocation.lock().await;

        let mut acquired = Vec::with_capacity(n);
        for entry in self.wallets.iter() {
            if acquired.len() == n {
                break;
            }

            let (_, value) = entry?;
            let wallet = Self::decode(&value)?;
            if wallet.status != WalletStatus::Available {
                continue;
            }

            let result = self.update_wallet(&wallet.public_key, |current| {
                if current.status != WalletStatus::Available {
                    return Err(PoolError::InvalidTransition {
                        wallet: current.public_key.to_base58(),
                        from: current.status,
                        to: WalletStatus::InUse,
                    });
                }

                let mut updated = current.clone();
                updated.status = WalletStatus::InUse;
                updated.allocated_to = Some(request_id.to_owned());
                updated.allocated_at = Some(get_current_time_in_millis());
                Ok(updated)
            });

            match result {
                Ok(updated) => acquired.push(updated),
                // lost to a status change since the scan, skip it
                Err(PoolError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if acquired.len() < n {
            let available = acquired.len();
            warn!(
                "pool exhausted: requested {} wallets, only {} available",
                n, available
            );
            for wallet in &acquired {
                self.release(&wallet.public_key, ReleaseOutcome::Unused)?;
            }
            return Err(PoolError::Exhausted {
                requested: n,
                available,
            });
        }

        debug!("acquired {} wallets for request {}", n, request_id);
        Ok(acquired)
    }

    // Give a wallet back after a route is done with it
    pub fn release(
        &self,
        public_key: &PublicKey,
        outcome: ReleaseOutcome,
    ) -> Result<HopWallet, PoolError> {
        self.update_wallet(public_key, |current| {
            if current.status != WalletStatus::InUse {
                return Err(PoolError::InvalidTransition {
                    wallet: current.public_key.to_base58(),
                    from: current.status,
                    to: match outcome {
                        ReleaseOutcome::Used => WalletStatus::Cooling,
                        ReleaseOutcome::Unused => WalletStatus::Available,
                    },
                });
            }

            let mut updated = current.clone();
            updated.allocated_to = None;
            updated.allocated_at = None;
            match outcome {
                ReleaseOutcome::Used => {
                    updated.status = WalletStatus::Cooling;
                    updated.usage_count += 1;
                    updated.last_used = Some(get_current_time_in_millis());
                }
                ReleaseOutcome::Unused => {
                    updated.status = WalletStatus::Available;
                }
            }
            Ok(updated)
        })
    }

    // Called after the post-run balance check confirmed the wallet is
    // drained on chain
    pub fn mark_cool_zero(&self, public_key: &PublicKey) -> Result<HopWallet, PoolError> {
        self.update_wallet(public_key, |current| {
            if current.status != WalletStatus::Cooling {
                return Err(PoolError::InvalidTransition {
                    wallet: current.public_key.to_base58(),
                    from: current.status,
                    to: WalletStatus::Available,
                });
            }

            let mut updated = current.clone();
            updated.status = WalletStatus::Available;
            Ok(updated)
        })
    }

    // Park a wallet that cannot be trusted anymore, either because its
    // secret does not decrypt or because funds are stuck on it
    pub fn mark_error(&self, public_key: &PublicKey) -> Result<HopWallet, PoolError> {
        self.update_wallet(public_key, |current| {
            let mut updated = current.clone();
            updated.status = WalletStatus::Error;
            updated.allocated_to = None;
            updated.allocated_at = None;
            Ok(updated)
        })
    }

    // Grow the pool until `target` wallets are available
    //
    // Generation is batched by growth_step per call; callers retry the
    // allocation once after a grow and surface exhaustion if the pool
    // is still short.
    pub fn ensure_health(&self, target: usize) -> Result<usize, PoolError> {
        let stats = self.stats()?;
        if stats.available >= target {
            return Ok(0);
        }

        let missing = target - stats.available;
        let batch = missing.min(self.growth_step);
        info!(
            "growing pool: {} available, {} wanted, generating {} wallets",
            stats.available, target, batch
        );

        for _ in 0..batch {
            let keypair = Ed25519KeyPair::generate();
            let encrypted = self.cipher.encrypt(keypair.secret_key().as_bytes());
            let wallet = HopWallet::new(keypair.public_key(), encrypted);
            self.persist(&wallet)?;
        }

        Ok(batch)
    }

    // Recover signing material for an acquired wallet
    //
    // A wallet whose ciphertext does not decrypt is poisoned for every
    // future route as well, park it as error right away.
    pub fn keypair_of(&self, wallet: &HopWallet) -> Result<Ed25519KeyPair, PoolError> {
        let secret = match self.cipher.decrypt(&wallet.encrypted_secret) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(
                    "failed to decrypt secret of wallet {}: {}",
                    wallet.public_key, e
                );
                self.mark_error(&wallet.public_key)?;
                return Err(PoolError::Decryption {
                    wallet: wallet.public_key.to_base58(),
                });
            }
        };

        let keypair = match Ed25519KeyPair::from_full_slice(&secret) {
            Ok(keypair) => keypair,
            Err(_) => {
                self.mark_error(&wallet.public_key)?;
                return Err(PoolError::Decryption {
                    wallet: wallet.public_key.to_base58(),
                });
            }
        };

        // a ciphertext decrypted with the wrong key that still unpads
        // cleanly yields a foreign keypair, treat it as a bad key too
        if keypair.public_key() != wallet.public_key {
            self.mark_error(&wallet.public_key)?;
            return Err(PoolError::Decryption {
                wallet: wallet.public_key.to_base58(),
            });
        }

        Ok(keypair)
    }

    // Append a transfer to the audit log
    pub fn append_transfer(&self, record: &TransferRecord) -> Result<(), PoolError> {
        let id = self.db.generate_id()?;
        let encoded =
            serde_json::to_vec(record).context("Error while encoding transfer record")?;
        self.transfers.insert(id.to_be_bytes(), encoded)?;
        Ok(())
    }

    // Read the audit log in insertion order
    pub fn transfers(&self) -> Result<Vec<TransferRecord>, PoolError> {
        let mut records = Vec::new();
        for entry in self.transfers.iter() {
            let (_, value) = entry?;
            records
                .push(serde_json::from_slice(&value).context("Error while decoding transfer")?);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for WalletPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletPool")
            .field("growth_step", &self.growth_step)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(growth_step: usize) -> (WalletPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cipher = Arc::new(Cipher::new(b"pool test secret").unwrap());
        let pool = WalletPool::open(dir.path().to_str().unwrap(), cipher, growth_step).unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn test_ensure_health_generates_batched() {
        let (pool, _dir) = pool(4);

        assert_eq!(pool.ensure_health(6).unwrap(), 4);
        assert_eq!(pool.stats().unwrap().available, 4);

        assert_eq!(pool.ensure_health(6).unwrap(), 2);
        assert_eq!(pool.stats().unwrap().available, 6);

        // target already met
        assert_eq!(pool.ensure_health(6).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acquire_flips_to_in_use() {
        let (pool, _dir) = pool(8);
        pool.ensure_health(8).unwrap();

        let wallets = pool.acquire(3, "req-1").await.unwrap();
        assert_eq!(wallets.len(), 3);
        for wallet in &wallets {
            assert_eq!(wallet.status, WalletStatus::InUse);
            assert_eq!(wallet.allocated_to.as_deref(), Some("req-1"));
        }

        let stats = pool.stats().unwrap();
        assert_eq!(stats.available, 5);
        assert_eq!(stats.in_use, 3);
    }

    #[tokio::test]
    async fn test_acquire_exhausted_rolls_back() {
        let (pool, _dir) = pool(4);
        pool.ensure_health(2).unwrap();

        let result = pool.acquire(5, "req-1").await;
        assert!(matches!(
            result,
            Err(PoolError::Exhausted {
                requested: 5,
                available: 2
            })
        ));

        // nothing stays reserved after the failed allocation
        let stats = pool.stats().unwrap();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_disjoint() {
        let (pool, _dir) = pool(16);
        pool.ensure_health(16).unwrap();
        let pool = Arc::new(pool);

        let a = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(8, "req-a").await })
        };
        let b = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(8, "req-b").await })
        };

        let set_a = a.await.unwrap().unwrap();
        let set_b = b.await.unwrap().unwrap();

        for wallet in &set_a {
            assert!(!set_b.iter().any(|w| w.public_key == wallet.public_key));
        }
        assert_eq!(pool.stats().unwrap().in_use, 16);
    }

    #[tokio::test]
    async fn test_release_lifecycle() {
        let (pool, _dir) = pool(4);
        pool.ensure_health(1).unwrap();

        let wallet = pool.acquire(1, "req-1").await.unwrap().remove(0);

        let released = pool
            .release(&wallet.public_key, ReleaseOutcome::Used)
            .unwrap();
        assert_eq!(released.status, WalletStatus::Cooling);
        assert_eq!(released.usage_count, 1);
        assert!(released.last_used.is_some());
        assert!(released.allocated_to.is_none());

        let cooled = pool.mark_cool_zero(&wallet.public_key).unwrap();
        assert_eq!(cooled.status, WalletStatus::Available);
    }

    #[tokio::test]
    async fn test_unused_release_skips_cooling() {
        let (pool, _dir) = pool(4);
        pool.ensure_health(1).unwrap();

        let wallet = pool.acquire(1, "req-1").await.unwrap().remove(0);
        let released = pool
            .release(&wallet.public_key, ReleaseOutcome::Unused)
            .unwrap();
        assert_eq!(released.status, WalletStatus::Available);
        assert_eq!(released.usage_count, 0);
    }

    #[tokio::test]
    async fn test_keypair_roundtrip() {
        let (pool, _dir) = pool(4);
        pool.ensure_health(1).unwrap();

        let wallet = pool.acquire(1, "req-1").await.unwrap().remove(0);
        let keypair = pool.keypair_of(&wallet).unwrap();
        assert_eq!(keypair.public_key(), wallet.public_key);
    }

    #[tokio::test]
    async fn test_rotated_secret_marks_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();

        // seed with one key, reopen with another
        {
            let cipher = Arc::new(Cipher::new(b"old secret").unwrap());
            let pool = WalletPool::open(path, cipher, 4).unwrap();
            pool.ensure_health(1).unwrap();
        }

        let cipher = Arc::new(Cipher::new(b"new secret").unwrap());
        let pool = WalletPool::open(path, cipher, 4).unwrap();
        let wallet = pool.acquire(1, "req-1").await.unwrap().remove(0);

        let result = pool.keypair_of(&wallet);
        assert!(matches!(result, Err(PoolError::Decryption { .. })));
        assert_eq!(
            pool.get_wallet(&wallet.public_key).unwrap().status,
            WalletStatus::Error
        );
    }

    #[tokio::test]
    async fn test_pool_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let cipher = Arc::new(Cipher::new(b"persist secret").unwrap());

        let key = {
            let pool = WalletPool::open(path, Arc::clone(&cipher), 4).unwrap();
            pool.ensure_health(2).unwrap();
            let wallet = pool.acquire(1, "req-1").await.unwrap().remove(0);
            pool.flush().await.unwrap();
            wallet.public_key
        };

        let pool = WalletPool::open(path, cipher, 4).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.total, 2);
        // the in_use allocation is still visible after the restart
        assert_eq!(stats.in_use, 1);
        assert_eq!(pool.get_wallet(&key).unwrap().status, WalletStatus::InUse);
    }
}
