use thiserror::Error;

use crate::identity::{Address, AssetRef};
use crate::interface::TxId;
use crate::outcome::LegFailure;
use crate::record::Phase;

/// Escrow-related errors.
#[derive(Debug, Error, PartialEq)]
pub enum EscrowError {
    /// Malformed or missing input; nothing was sent to the network.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `party` lacks the ownership the operation needs; `owner` holds it.
    #[error("{party} is not the owner ({owner} is)")]
    NotOwner { party: Address, owner: Address },

    /// The asset account does not exist on the registry.
    #[error("asset {0} not found")]
    AssetNotFound(AssetRef),

    /// The operation is not admitted from the record's current phase.
    #[error("cannot {operation} from phase {phase}")]
    InvalidTransition {
        phase: Phase,
        operation: &'static str,
    },

    /// A deposit transfer failed or its outcome is unknown.
    #[error("transfer failed: {0}")]
    Transfer(LegFailure),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

impl EscrowError {
    /// Shorthand for [`EscrowError::InvalidInput`].
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Errors that might occur while parsing an [`Address`].
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),

    #[error("cannot parse address from empty string")]
    Empty,

    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

/// Errors when parsing a native amount.
#[derive(Debug, Error, PartialEq)]
pub enum AmountError {
    #[error("amount must not be negative: {0}")]
    Negative(String),

    #[error("not a decimal number: {0}")]
    Malformed(String),

    #[error("more than 9 fractional digits: {0}")]
    Precision(String),

    #[error("amount does not fit in u64 lamports: {0}")]
    Overflow(String),
}

/// Failures raised by the key-management collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("key unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the ledger or the asset registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The queried account does not exist.
    #[error("account not found")]
    NotFound,

    /// The signing key is not allowed to move this asset or value.
    #[error("signer is not authorized for this transfer")]
    Unauthorized,

    /// The network refused the transaction (e.g. insufficient funds).
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("network failure: {0}")]
    Network(String),

    /// Confirmation was not observed in time; the transaction may still land.
    #[error("confirmation timed out")]
    Timeout { tx: Option<TxId> },

    #[error("key error: {0}")]
    Key(#[from] KeyError),
}
