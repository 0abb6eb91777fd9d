//! Per-leg outcomes and the settlement report composed from them.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::interface::TxId;
use crate::Phase;

/// Which way a settlement moves the escrowed legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Asset to buyer, value to seller.
    Release,
    /// Asset back to seller, value back to buyer.
    Refund,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => f.write_str("release"),
            Self::Refund => f.write_str("refund"),
        }
    }
}

/// Why a leg was not submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The deal has no asset leg.
    NoAsset,
    /// Zero amount requested; no value transfer attempted.
    NoValue,
    /// A prior attempt already settled this leg.
    AlreadySettled,
    /// A prior in-flight transfer turned out to be confirmed.
    AlreadyConfirmed(TxId),
    /// The asset already sits with the destination.
    AlreadyAtDestination,
    /// The asset no longer exists; treated as already gone.
    AssetNotFound,
    /// The asset was already in custody before this deposit.
    AlreadyInCustody,
}

impl SkipReason {
    /// Whether the skip means the leg's goal holds.
    pub fn completes_leg(&self) -> bool {
        !matches!(self, Self::NoAsset | Self::NoValue)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAsset => f.write_str("no asset in this deal"),
            Self::NoValue => f.write_str("zero amount requested"),
            Self::AlreadySettled => f.write_str("settled by an earlier attempt"),
            Self::AlreadyConfirmed(tx) => write!(f, "earlier transaction {} confirmed", tx),
            Self::AlreadyAtDestination => f.write_str("asset already at destination"),
            Self::AssetNotFound => f.write_str("asset not found"),
            Self::AlreadyInCustody => f.write_str("asset already held by custodian"),
        }
    }
}

/// Classification of a failed leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Ownership does not allow the transfer; retrying needs an ownership change.
    NotOwner,
    /// Outcome unknown; safe to retry after re-verification.
    Network,
    /// Outcome unknown; the transaction may still land.
    Timeout,
}

/// A failed leg with enough detail for the operator to decide on a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Transaction still possibly in flight.
    pub tx: Option<TxId>,
}

impl LegFailure {
    pub fn in_flight(tx: TxId) -> Self {
        Self {
            kind: FailureKind::Timeout,
            reason: "earlier transaction still pending".to_string(),
            tx: Some(tx),
        }
    }
}

impl From<LedgerError> for LegFailure {
    fn from(err: LedgerError) -> Self {
        let reason = err.to_string();
        match err {
            LedgerError::Unauthorized => Self {
                kind: FailureKind::NotOwner,
                reason,
                tx: None,
            },
            LedgerError::Timeout { tx } => Self {
                kind: FailureKind::Timeout,
                reason,
                tx,
            },
            LedgerError::NotFound
            | LedgerError::Rejected(_)
            | LedgerError::Network(_)
            | LedgerError::Key(_) => Self {
                kind: FailureKind::Network,
                reason,
                tx: None,
            },
        }
    }
}

impl fmt::Display for LegFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)?;
        if let Some(tx) = &self.tx {
            write!(f, " (tx {})", tx)?;
        }
        Ok(())
    }
}

/// Result of one leg of a deposit, release or refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegOutcome {
    Confirmed(TxId),
    Skipped(SkipReason),
    Failed(LegFailure),
}

impl LegOutcome {
    pub fn failure(&self) -> Option<&LegFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for LegOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(tx) => write!(f, "confirmed ({})", tx),
            Self::Skipped(reason) => write!(f, "skipped ({})", reason),
            Self::Failed(failure) => write!(f, "FAILED ({})", failure),
        }
    }
}

/// Composed outcome of a release or refund call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub direction: Direction,
    pub asset: LegOutcome,
    pub value: LegOutcome,
    /// Phase of the record after this call.
    pub phase: Phase,
}

impl Settlement {
    /// True only when every applicable leg reached its destination.
    pub fn is_complete(&self) -> bool {
        self.phase.is_settled()
    }

    /// Legs that reached their destination during this call.
    pub fn confirmed_legs(&self) -> Vec<&'static str> {
        let mut legs = Vec::new();
        if matches!(self.asset, LegOutcome::Confirmed(_)) {
            legs.push("asset");
        }
        if matches!(self.value, LegOutcome::Confirmed(_)) {
            legs.push("value");
        }
        legs
    }
}
