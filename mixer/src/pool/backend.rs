use anyhow::{Context, Result};

pub use sled::{Db, Tree};

// Open the backing store at the configured path
pub fn open(path: &str) -> Result<Db> {
    sled::Config::new()
        .path(path)
        .open()
        .with_context(|| format!("Error while opening wallet store at {}", path))
}
