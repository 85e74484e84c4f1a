//! On-disk key persistence: a single binary file per wallet holding the raw
//! Ed25519 secret key bytes. No other on-disk state; the wallet's UTXO
//! cache and header ledger live only in process memory.

use std::fs;
use std::path::Path;

use chainlet_crypto::{CryptoError, KeyPair};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet file error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Generates a fresh keypair and writes its secret bytes to `path`.
pub fn save_wallet_file(path: impl AsRef<Path>) -> Result<KeyPair, WalletError> {
    let keys = KeyPair::generate();
    fs::write(path, keys.to_bytes())?;
    Ok(keys)
}

/// Reads the secret key bytes at `path` and reconstructs the keypair.
pub fn load_wallet_file(path: impl AsRef<Path>) -> Result<KeyPair, WalletError> {
    let bytes = fs::read(path)?;
    Ok(KeyPair::from_bytes(&bytes)?)
}
