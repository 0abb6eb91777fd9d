/// Native amounts and their decimal (SOL) representation
pub mod amount;
/// Escrow engine driving deposits, release and refund
pub mod engine;
pub mod error;
/// Addresses of parties, custodians and assets
pub mod identity;
/// Collaborator contracts (ledger, asset registry, key management)
/// and JSON persistence helpers
pub mod interface;
/// In-memory ledger for tests and dry runs
pub mod mock;
/// Per-leg outcomes and settlement reports
pub mod outcome;
/// Escrow record and its phase state machine
pub mod record;

pub use amount::Lamports;
pub use engine::EscrowEngine;
pub use error::{EscrowError, LedgerError};
pub use identity::{Address, AssetRef};
pub use interface::{AssetRegistry, KeyHandle, Ledger, TransferStatus, TxId};
pub use outcome::{Direction, FailureKind, LegFailure, LegOutcome, Settlement, SkipReason};
pub use record::{EscrowInstance, LegProgress, Phase};

pub type Result<T> = std::result::Result<T, EscrowError>;
