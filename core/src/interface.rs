//! Collaborator contracts the engine drives, and JSON helpers for
//! persisting escrow records between operator invocations.

use core::fmt;
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, LedgerError};
use crate::{Address, AssetRef, Lamports};

/// Reads a JSON-encoded file from the given `path` and deserializes into type `T`.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the file cannot be opened, read, or parsed.
pub fn load_escrow_data<P, T>(path: P) -> anyhow::Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("loading escrow data: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("parsing JSON from {:?}", path))
}

/// Writes `data` as pretty-printed JSON to the given `path`,
/// creating parent directories as needed.
///
/// # Errors
///
/// Returns an `anyhow::Error` if the file cannot be created or data cannot be serialized.
pub fn save_escrow_data<P, T>(path: P, data: &T) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?}", parent))?;
    }
    let file = File::create(path).with_context(|| format!("creating file {:?}", path))?;
    serde_json::to_writer_pretty(file, data)
        .with_context(|| format!("serializing to JSON to {:?}", path))
}

/// Reference to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId {
    /// Transaction signature as printed by the ledger.
    pub signature: String,
    /// Opaque token bounding how long an unconfirmed transaction may still
    /// land (the recent blockhash on Solana).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<String>,
}

impl TxId {
    pub fn new<S: Into<String>>(signature: S) -> Self {
        Self {
            signature: signature.into(),
            lifetime: None,
        }
    }

    pub fn with_lifetime<S: Into<String>>(mut self, lifetime: S) -> Self {
        self.lifetime = Some(lifetime.into());
        self
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.signature)
    }
}

/// What the ledger knows about a previously submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Executed successfully.
    Confirmed,
    /// Not yet observed, but may still land.
    Pending,
    /// Executed and failed; its effects were not applied.
    Failed(String),
    /// Never observed and can no longer land.
    Dropped,
}

/// Key-management handle the process signs with.
///
/// Signing material never leaves the implementor; callers only see the
/// address and the produced signatures.
pub trait KeyHandle: Send + Sync {
    /// Public address of this key.
    fn address(&self) -> Address;

    /// Signs `message`, returning the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError>;
}

/// Native-value side of the ledger.
///
/// Every submitting call blocks until the transfer is confirmed or a bounded
/// timeout elapses. A timeout is an unknown outcome, never a failure.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Moves `amount` from `from` (which must be the signing key) to `to`.
    async fn transfer_value(
        &self,
        from: &Address,
        to: &Address,
        amount: Lamports,
    ) -> Result<TxId, LedgerError>;

    /// Looks up the fate of a transaction submitted earlier.
    async fn transfer_status(&self, tx: &TxId) -> Result<TransferStatus, LedgerError>;

    /// Current native balance of `address`.
    async fn balance(&self, address: &Address) -> Result<Lamports, LedgerError>;
}

/// Ownership registry of the non-fungible asset.
#[async_trait::async_trait]
pub trait AssetRegistry: Send + Sync {
    /// Current owner of `asset`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NotFound`] when the asset does not exist.
    async fn owner_of(&self, asset: &AssetRef) -> Result<Address, LedgerError>;

    /// Transfers `asset` from `from` (which must be the signing key) to `to`.
    async fn transfer_asset(
        &self,
        asset: &AssetRef,
        from: &Address,
        to: &Address,
    ) -> Result<TxId, LedgerError>;
}
