use core::str::FromStr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueHint};
use custodian_client::interface::{default_record_path, Cluster, ClusterConfig, Overrides};
use custodian_client::{open_record, store_record, CustodianClient};
use custodian_core::error::IdentityError;
use custodian_core::{
    Address, AssetRef, AssetRegistry, EscrowInstance, Lamports, Ledger, LedgerError, Settlement,
};
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClusterConfig::load(cli.config.as_deref())?.with_overrides(Overrides {
        rpc_url: cli.rpc_url.clone(),
        keypair_path: cli.keypair.clone(),
        cluster: cli.cluster,
    });
    let client = CustodianClient::new(config)?;
    let explicit_record = cli.record;

    match cli.command {
        Commands::DepositAsset { asset, custodian } => {
            let id = escrow_id(cli.id, &custodian, Some(&asset));
            let record_path = record_path(explicit_record, &id);
            let mut record = open_record(&record_path, || {
                EscrowInstance::new(id, custodian, Some(asset), Lamports::ZERO)
            })?;
            ensure_custodian(&record, &custodian)?;
            record.bind_terms(Some(asset), None)?;

            let result = client.engine.deposit_asset(&mut record).await;
            store_record(&record_path, &record)?;
            let outcome = result?;
            println!("{}", client.describe("asset deposit", &outcome));
        }
        Commands::DepositValue {
            custodian,
            amount,
            asset,
        } => {
            let id = escrow_id(cli.id, &custodian, asset.as_ref());
            let record_path = record_path(explicit_record, &id);
            let mut record = open_record(&record_path, || {
                EscrowInstance::new(id, custodian, asset, amount)
            })?;
            ensure_custodian(&record, &custodian)?;
            record.bind_terms(asset, Some(amount))?;

            let result = client.engine.deposit_value(&mut record).await;
            store_record(&record_path, &record)?;
            let outcome = result?;
            println!("{}", client.describe("value deposit", &outcome));
        }
        Commands::Release {
            asset,
            buyer,
            seller,
            amount,
        } => {
            let custodian = client.operator();
            let id = escrow_id(cli.id, &custodian, asset.0.as_ref());
            let record_path = record_path(explicit_record, &id);
            let mut record = open_record(&record_path, || {
                EscrowInstance::new(id, custodian, asset.0, amount)
            })?;
            ensure_asset(&record, &asset)?;
            record.bind_terms(asset.0, Some(amount))?;
            record.bind_buyer(buyer)?;
            record.bind_seller(seller)?;

            client.engine.reconcile(&mut record).await?;
            let result = client.engine.release(&mut record).await;
            store_record(&record_path, &record)?;
            finish(&client, &result?)?;
        }
        Commands::Refund {
            asset,
            recipient,
            amount,
            value_recipient,
        } => {
            let custodian = client.operator();
            let id = escrow_id(cli.id, &custodian, asset.0.as_ref());
            let record_path = record_path(explicit_record, &id);
            let mut record = open_record(&record_path, || {
                EscrowInstance::new(id, custodian, asset.0, amount)
            })?;
            ensure_asset(&record, &asset)?;
            record.bind_terms(asset.0, Some(amount))?;
            record.bind_seller(recipient)?;
            if !amount.is_zero() {
                record.bind_buyer(value_recipient.unwrap_or(recipient))?;
            } else if value_recipient.is_some() {
                warn!("Zero amount; ignoring --value-recipient");
            }

            client.engine.reconcile(&mut record).await?;
            let result = client.engine.refund(&mut record).await;
            store_record(&record_path, &record)?;
            finish(&client, &result?)?;
        }
        Commands::Inspect { asset, custodian } => {
            if let Some(asset) = asset.0 {
                match client.engine.registry().owner_of(&asset).await {
                    Ok(owner) if owner == custodian => {
                        println!("asset {}: held by custodian", asset)
                    }
                    Ok(owner) => println!("asset {}: owned by {}", asset, owner),
                    Err(LedgerError::NotFound) => println!("asset {}: not found", asset),
                    Err(e) => return Err(e.into()),
                }
            }
            let balance = client.engine.ledger().balance(&custodian).await?;
            println!("custodian {}: {} SOL", custodian, balance);
        }
        Commands::Abandon { reason } => {
            let path = match (explicit_record, cli.id) {
                (Some(path), _) => path,
                (None, Some(id)) => default_record_path(&id),
                (None, None) => anyhow::bail!("abandon needs --record or --id"),
            };
            let mut record = open_record(&path, || missing_record(&path))?;
            let phase = client.engine.abandon(&mut record, reason)?;
            store_record(&path, &record)?;
            println!("escrow {}: {}", record.id(), phase);
        }
    }

    Ok(())
}

/// Prints each leg and fails unless every applicable leg reached its destination.
fn finish(client: &CustodianClient, settlement: &Settlement) -> anyhow::Result<()> {
    for line in client.report(settlement) {
        println!("{}", line);
    }
    if !settlement.is_complete() {
        anyhow::bail!(
            "{} incomplete (phase {}); re-run once the failed leg is resolved",
            settlement.direction,
            settlement.phase
        );
    }
    Ok(())
}

/// `--record` when given, else the per-escrow file under the default directory.
fn record_path(explicit: Option<PathBuf>, id: &str) -> PathBuf {
    explicit.unwrap_or_else(|| default_record_path(id))
}

fn escrow_id(id: Option<String>, custodian: &Address, asset: Option<&AssetRef>) -> String {
    id.unwrap_or_else(|| match asset {
        Some(asset) => format!("{}:{}", custodian, asset),
        None => format!("{}:funds", custodian),
    })
}

fn ensure_custodian(record: &EscrowInstance, custodian: &Address) -> anyhow::Result<()> {
    if record.custodian() != *custodian {
        anyhow::bail!(
            "escrow {} is held by {}, not {}",
            record.id(),
            record.custodian(),
            custodian
        );
    }
    Ok(())
}

fn ensure_asset(record: &EscrowInstance, asset: &AssetArg) -> anyhow::Result<()> {
    if let (Some(held), None) = (record.asset(), asset.0) {
        anyhow::bail!(
            "escrow {} holds asset {}; pass it instead of '-'",
            record.id(),
            held
        );
    }
    Ok(())
}

fn missing_record(path: &Path) -> custodian_core::Result<EscrowInstance> {
    Err(custodian_core::EscrowError::invalid_input(format!(
        "no escrow record at {}",
        path.display()
    )))
}

/// Asset argument; `-` marks a funds-only deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AssetArg(Option<AssetRef>);

impl FromStr for AssetArg {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "-" => Ok(Self(None)),
            s => s.parse().map(|asset| Self(Some(asset))),
        }
    }
}

#[derive(Parser)]
#[command(name = "custodian-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// JSON-RPC endpoint, overriding the config file
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Operator keypair, overriding the config file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    keypair: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    cluster: Option<Cluster>,

    /// Escrow record cached between invocations
    /// [default: ./escrows/<escrow id>.json]
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    record: Option<PathBuf>,

    /// Escrow id; also names the default record file
    #[arg(long, global = true)]
    id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seller: move the asset into custody
    DepositAsset { asset: AssetRef, custodian: Address },
    /// Buyer: move funds (in SOL) into custody
    DepositValue {
        custodian: Address,
        amount: Lamports,
        /// Asset the funds pay for; keys the record like the seller's deposit
        #[arg(long)]
        asset: Option<AssetRef>,
    },
    /// Custodian: asset to buyer, funds to seller
    Release {
        /// Asset address, or `-` for a funds-only deal
        asset: AssetArg,
        buyer: Address,
        seller: Address,
        /// Price in SOL
        amount: Lamports,
    },
    /// Custodian: asset and funds back to the depositors
    Refund {
        /// Asset address, or `-` for a funds-only deal
        asset: AssetArg,
        /// Receives the asset, and the funds unless --value-recipient is given
        recipient: Address,
        /// Funds to return in SOL; 0 refunds the asset only
        amount: Lamports,
        #[arg(long)]
        value_recipient: Option<Address>,
    },
    /// Show the live asset owner and custodian balance
    Inspect { asset: AssetArg, custodian: Address },
    /// Custodian: mark a cached escrow as failed
    Abandon { reason: String },
}
