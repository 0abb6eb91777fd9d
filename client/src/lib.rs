use std::path::Path;
use std::sync::Arc;

use custodian_core::interface::{load_escrow_data, save_escrow_data};
use custodian_core::{Address, EscrowEngine, EscrowInstance, KeyHandle, LegOutcome, Settlement};
use tracing::{debug, info};

use crate::agent::keypair::KeypairHandle;
use crate::agent::solana::SolanaAgent;
use crate::error::Result;
use crate::interface::ClusterConfig;

pub mod agent;
pub mod error;
pub mod interface;

/// Escrow engine wired to a Solana cluster.
pub struct CustodianClient {
    pub engine: EscrowEngine<SolanaAgent, SolanaAgent>,
    pub config: ClusterConfig,
}

impl CustodianClient {
    /// Loads the operator keypair named in `config` and connects to its RPC node.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let key: Arc<dyn KeyHandle> = Arc::new(KeypairHandle::from_file(&config.keypair_path)?);
        let agent = SolanaAgent::new(&config, Arc::clone(&key));
        Ok(Self {
            engine: EscrowEngine::new(agent.clone(), agent, key),
            config,
        })
    }

    /// Address of the loaded operator key.
    pub fn operator(&self) -> Address {
        self.engine.operator()
    }

    /// One line per leg, with an explorer link for submitted transactions.
    pub fn describe(&self, label: &str, outcome: &LegOutcome) -> String {
        match outcome {
            LegOutcome::Confirmed(tx) => {
                format!("{}: confirmed {}", label, self.config.explorer_url(tx))
            }
            LegOutcome::Failed(failure) => match &failure.tx {
                Some(tx) => format!(
                    "{}: {} (check {})",
                    label,
                    outcome,
                    self.config.explorer_url(tx)
                ),
                None => format!("{}: {}", label, outcome),
            },
            LegOutcome::Skipped(_) => format!("{}: {}", label, outcome),
        }
    }

    /// Human-readable report of a release or refund.
    pub fn report(&self, settlement: &Settlement) -> Vec<String> {
        let mut lines = vec![format!(
            "{} {}: phase {}",
            settlement.direction,
            if settlement.is_complete() {
                "complete"
            } else {
                "incomplete"
            },
            settlement.phase
        )];
        lines.push(self.describe("  asset leg", &settlement.asset));
        lines.push(self.describe("  value leg", &settlement.value));
        lines
    }
}

/// Opens the cached record at `path`, or builds a fresh one with `create`
/// when no file exists yet.
pub fn open_record<F>(path: &Path, create: F) -> anyhow::Result<EscrowInstance>
where
    F: FnOnce() -> custodian_core::Result<EscrowInstance>,
{
    if path.exists() {
        let record: EscrowInstance = load_escrow_data(path)?;
        debug!(id = record.id(), phase = %record.phase(), "Loaded escrow record");
        return Ok(record);
    }
    debug!(path = %path.display(), "No escrow record yet; starting a fresh one");
    Ok(create()?)
}

/// Writes `record` back to `path`.
pub fn store_record(path: &Path, record: &EscrowInstance) -> anyhow::Result<()> {
    save_escrow_data(path, record)?;
    info!(path = %path.display(), phase = %record.phase(), "Saved escrow record");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use custodian_core::{AssetRef, Lamports, Phase};

    use super::*;
    use crate::interface::record_path_in;

    fn fresh() -> custodian_core::Result<EscrowInstance> {
        EscrowInstance::new(
            "deal",
            Address::new([1; 32]),
            Some(AssetRef::from(Address::new([9; 32]))),
            Lamports(1_000_000_000),
        )
    }

    #[test]
    fn missing_record_file_builds_a_fresh_one() {
        let path = PathBuf::from("/nonexistent/escrow_record.json");
        let record = open_record(&path, fresh).unwrap();
        assert_eq!(record.phase(), Phase::Empty);
        assert_eq!(record.id(), "deal");
        assert_eq!(record.value(), Lamports(1_000_000_000));
    }

    #[test]
    fn record_survives_a_save() {
        let path = std::env::temp_dir().join(format!(
            "custodian-record-{}.json",
            std::process::id()
        ));
        let original = fresh().unwrap().with_seller(Address::new([2; 32])).unwrap();
        store_record(&path, &original).unwrap();

        let loaded = open_record(&path, || unreachable!()).unwrap();
        assert_eq!(loaded, original);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn second_run_without_record_flag_reuses_the_first_runs_record() {
        let dir = std::env::temp_dir().join(format!("custodian-escrows-{}", std::process::id()));
        let id = "custodian:asset";

        let first = open_record(&record_path_in(&dir, id), fresh).unwrap();
        let first = first.with_buyer(Address::new([3; 32])).unwrap();
        store_record(&record_path_in(&dir, id), &first).unwrap();

        let second = open_record(&record_path_in(&dir, id), || unreachable!()).unwrap();
        assert_eq!(second, first);
        assert_eq!(second.buyer(), Some(Address::new([3; 32])));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
