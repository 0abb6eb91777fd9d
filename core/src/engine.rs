//! Escrow engine: drives deposits and the two-leg release/refund protocol.
//!
//! A release or refund is two independent legs, each its own ledger
//! transaction: the asset leg (ownership transfer) runs first, the value leg
//! second, in both directions. Each leg is re-verified against live ledger
//! state before it is submitted, and its progress is recorded on the escrow
//! record so that re-invoking the same operation only retries what is
//! still outstanding. The engine never loops on failures; retries are the
//! caller's.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::LedgerError;
use crate::interface::{AssetRegistry, KeyHandle, Ledger, TransferStatus, TxId};
use crate::outcome::{Direction, FailureKind, LegFailure, LegOutcome, Settlement, SkipReason};
use crate::record::{Event, LegProgress};
use crate::{Address, AssetRef, EscrowError, EscrowInstance, Phase, Result};

/// Asset leg after the ownership check.
enum AssetStep {
    Done(LegOutcome),
    Move { asset: AssetRef, to: Address },
}

/// What a re-check of an earlier, unconfirmed transaction concluded.
enum Recheck {
    Landed,
    Pending,
    Resubmit,
}

/// Drives escrow records through deposit, release and refund.
///
/// The engine holds no lock: callers must serialize operations on the
/// same [`EscrowInstance`].
pub struct EscrowEngine<L, R> {
    ledger: L,
    registry: R,
    key: Arc<dyn KeyHandle>,
}

impl<L, R> EscrowEngine<L, R>
where
    L: Ledger,
    R: AssetRegistry,
{
    /// `key` is the operator identity for this process: the depositor for
    /// deposits, the custodian for release and refund.
    pub fn new(ledger: L, registry: R, key: Arc<dyn KeyHandle>) -> Self {
        Self {
            ledger,
            registry,
            key,
        }
    }

    /// Address of the key this engine acts with.
    pub fn operator(&self) -> Address {
        self.key.address()
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Moves the seller's asset into custody.
    ///
    /// The operator must currently own the asset. If the custodian already
    /// holds it (an earlier run's transfer landed), the deposit is recorded
    /// without a new transfer.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a funds-only deal, `InvalidTransition` if the asset
    /// is already deposited, `NotOwner` / `AssetNotFound` from the ownership
    /// check, `Transfer` when the transfer fails or times out.
    #[instrument(skip_all, fields(escrow = %record.id(), phase = %record.phase()))]
    pub async fn deposit_asset(&self, record: &mut EscrowInstance) -> Result<LegOutcome> {
        let asset = record
            .asset()
            .ok_or_else(|| EscrowError::invalid_input("escrow has no asset leg"))?;
        record.phase().next(Event::AssetDeposited)?;

        let operator = self.operator();
        let custodian = record.custodian();
        if operator == custodian {
            return Err(EscrowError::invalid_input(
                "custodian cannot deposit into its own custody",
            ));
        }

        let owner = match self.registry.owner_of(&asset).await {
            Ok(owner) => owner,
            Err(LedgerError::NotFound) => return Err(EscrowError::AssetNotFound(asset)),
            Err(e) => return Err(EscrowError::Transfer(e.into())),
        };
        debug!(%owner, "Fetched asset owner");

        let outcome = if owner == custodian {
            info!(%asset, "Asset already in custody; recording deposit");
            LegOutcome::Skipped(SkipReason::AlreadyInCustody)
        } else if owner != operator {
            return Err(EscrowError::NotOwner {
                party: operator,
                owner,
            });
        } else {
            record.bind_seller(operator)?;
            info!(%asset, %custodian, "Transferring asset into custody");
            match self
                .registry
                .transfer_asset(&asset, &operator, &custodian)
                .await
            {
                Ok(tx) => LegOutcome::Confirmed(tx),
                Err(e) => {
                    warn!(error = %e, "Asset deposit failed");
                    if let LedgerError::Timeout { tx: Some(tx) } = &e {
                        record.deposits_mut().asset = LegProgress::InFlight { tx: tx.clone() };
                    }
                    return Err(EscrowError::Transfer(e.into()));
                }
            }
        };

        record.deposits_mut().asset = settled(&outcome);
        let phase = record.apply(Event::AssetDeposited)?;
        info!(%phase, "Asset deposited");
        Ok(outcome)
    }

    /// Moves the buyer's funds into custody.
    ///
    /// A deposit left in flight by an earlier attempt is looked up first and
    /// only resubmitted once the ledger reports it can no longer land.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a zero-value deal, `InvalidTransition` if the value
    /// is already deposited, `Transfer` when the transfer fails or is still
    /// pending.
    #[instrument(skip_all, fields(escrow = %record.id(), phase = %record.phase(), amount = %record.value()))]
    pub async fn deposit_value(&self, record: &mut EscrowInstance) -> Result<LegOutcome> {
        let amount = record.value();
        if amount.is_zero() {
            return Err(EscrowError::invalid_input("escrow has no value leg"));
        }
        record.phase().next(Event::ValueDeposited)?;

        let operator = self.operator();
        let custodian = record.custodian();
        if operator == custodian {
            return Err(EscrowError::invalid_input(
                "custodian cannot deposit into its own custody",
            ));
        }
        record.bind_buyer(operator)?;

        let mut outcome = None;
        if let Some(tx) = record.deposits().value.in_flight().cloned() {
            match self.recheck(&tx).await {
                Ok(Recheck::Landed) => {
                    outcome = Some(LegOutcome::Skipped(SkipReason::AlreadyConfirmed(tx)))
                }
                Ok(Recheck::Pending) => {
                    return Err(EscrowError::Transfer(LegFailure::in_flight(tx)));
                }
                Ok(Recheck::Resubmit) => {}
                Err(e) => return Err(EscrowError::Transfer(keep_in_flight(e, tx))),
            }
        }

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => {
                info!(%custodian, "Transferring value into custody");
                match self.ledger.transfer_value(&operator, &custodian, amount).await {
                    Ok(tx) => LegOutcome::Confirmed(tx),
                    Err(e) => {
                        warn!(error = %e, "Value deposit failed");
                        let failure = LegFailure::from(e);
                        record.deposits_mut().value = unsettled(&failure);
                        return Err(EscrowError::Transfer(failure));
                    }
                }
            }
        };

        record.deposits_mut().value = settled(&outcome);
        let phase = record.apply(Event::ValueDeposited)?;
        info!(%phase, "Value deposited");
        Ok(outcome)
    }

    /// Advances an `Empty` record from what the ledger shows is in custody.
    ///
    /// Used when no cached record exists. Never moves a phase backward; a
    /// record past `Empty` is returned untouched.
    #[instrument(skip_all, fields(escrow = %record.id()))]
    pub async fn reconcile(&self, record: &mut EscrowInstance) -> Result<Phase> {
        if record.phase() != Phase::Empty {
            return Ok(record.phase());
        }
        let custodian = record.custodian();

        if let Some(asset) = record.asset() {
            match self.registry.owner_of(&asset).await {
                Ok(owner) if owner == custodian => {
                    record.deposits_mut().asset = LegProgress::Settled { tx: None };
                    record.apply(Event::AssetDeposited)?;
                }
                Ok(owner) => debug!(%owner, "Asset not in custody"),
                Err(LedgerError::NotFound) => debug!(%asset, "Asset not found"),
                Err(e) => return Err(EscrowError::Transfer(e.into())),
            }
        }

        let amount = record.value();
        if !amount.is_zero() {
            let balance = self
                .ledger
                .balance(&custodian)
                .await
                .map_err(|e| EscrowError::Transfer(e.into()))?;
            if balance >= amount {
                record.deposits_mut().value = LegProgress::Settled { tx: None };
                record.apply(Event::ValueDeposited)?;
            } else {
                debug!(%balance, %amount, "Custody balance below escrow value");
            }
        }

        info!(phase = %record.phase(), "Reconciled escrow");
        Ok(record.phase())
    }

    /// Releases the asset to the buyer, then forwards the value to the seller.
    pub async fn release(&self, record: &mut EscrowInstance) -> Result<Settlement> {
        self.settle(record, Direction::Release).await
    }

    /// Returns the asset to the seller, then the value to the buyer.
    pub async fn refund(&self, record: &mut EscrowInstance) -> Result<Settlement> {
        self.settle(record, Direction::Refund).await
    }

    /// Marks the escrow terminally failed after the operator gives up on it.
    pub fn abandon<S: Into<String>>(&self, record: &mut EscrowInstance, reason: S) -> Result<Phase> {
        let legs = record.settlement();
        if legs.asset.in_flight().is_some() || legs.value.in_flight().is_some() {
            warn!(escrow = %record.id(), "Abandoning escrow with a transfer still in flight");
        }
        let phase = record.abandon(reason.into())?;
        warn!(escrow = %record.id(), %phase, "Escrow abandoned");
        Ok(phase)
    }

    /// Runs both legs of a settlement.
    ///
    /// Pre-flight checks and the live asset ownership check run before any
    /// transfer. An asset held by anyone other than the custodian or its
    /// destination aborts the whole settlement. After that, a leg's failure
    /// is reported in its [`LegOutcome`] and never stops the other leg.
    #[instrument(skip(self, record), fields(escrow = %record.id(), phase = %record.phase()))]
    async fn settle(&self, record: &mut EscrowInstance, direction: Direction) -> Result<Settlement> {
        if !record.phase().admits(direction) {
            return Err(EscrowError::InvalidTransition {
                phase: record.phase(),
                operation: match direction {
                    Direction::Release => "release",
                    Direction::Refund => "refund",
                },
            });
        }
        let (asset_leg, value_to) = record.validate_settlement(direction)?;
        let custodian = record.custodian();
        let operator = self.operator();
        if operator != custodian {
            return Err(EscrowError::NotOwner {
                party: operator,
                owner: custodian,
            });
        }
        record.settlement_mut(direction)?;

        let step = match asset_leg {
            None => AssetStep::Done(LegOutcome::Skipped(SkipReason::NoAsset)),
            Some(_) if record.settlement().asset.is_settled() => {
                AssetStep::Done(LegOutcome::Skipped(SkipReason::AlreadySettled))
            }
            Some((asset, to)) => self.check_asset(asset, custodian, to).await?,
        };

        let asset = match step {
            AssetStep::Done(outcome) => outcome,
            AssetStep::Move { asset, to } => {
                info!(%asset, %to, "Transferring asset");
                match self.registry.transfer_asset(&asset, &custodian, &to).await {
                    Ok(tx) => LegOutcome::Confirmed(tx),
                    Err(e) => LegOutcome::Failed(e.into()),
                }
            }
        };
        let next = progress(&record.settlement().asset, &asset);
        record.settlement_mut(direction)?.asset = next;
        info!(leg = "asset", outcome = %asset, "Asset leg finished");

        let value = match value_to {
            None => LegOutcome::Skipped(SkipReason::NoValue),
            Some(to) => self.settle_value(record, to).await,
        };
        let next = progress(&record.settlement().value, &value);
        record.settlement_mut(direction)?.value = next;
        info!(leg = "value", outcome = %value, "Value leg finished");

        record.lock_direction(direction);

        let legs = record.settlement();
        let asset_done = record.asset().is_none() || legs.asset.is_settled();
        let value_done = record.value().is_zero() || legs.value.is_settled();
        let progressed = legs.asset.is_settled() || legs.value.is_settled();
        let complete = asset_done && value_done;

        let phase = if complete || progressed {
            record.apply(Event::Settled {
                direction,
                complete,
            })?
        } else {
            record.phase()
        };

        if complete {
            info!(%phase, "Settlement complete");
        } else {
            warn!(%phase, "Settlement incomplete; re-invoke to retry outstanding legs");
        }

        Ok(Settlement {
            direction,
            asset,
            value,
            phase,
        })
    }

    /// Reads the live owner of an unsettled asset and decides whether it moves.
    ///
    /// # Errors
    ///
    /// `NotOwner` when neither the custodian nor `to` holds the asset,
    /// `Transfer` when the owner cannot be read.
    async fn check_asset(
        &self,
        asset: AssetRef,
        custodian: Address,
        to: Address,
    ) -> Result<AssetStep> {
        let owner = match self.registry.owner_of(&asset).await {
            Ok(owner) => owner,
            Err(LedgerError::NotFound) => {
                warn!(%asset, "Asset not found; treating asset leg as done");
                return Ok(AssetStep::Done(LegOutcome::Skipped(SkipReason::AssetNotFound)));
            }
            Err(e) => return Err(EscrowError::Transfer(e.into())),
        };
        debug!(%owner, "Fetched asset owner");

        if owner == to {
            return Ok(AssetStep::Done(LegOutcome::Skipped(
                SkipReason::AlreadyAtDestination,
            )));
        }
        if owner != custodian {
            warn!(%owner, %custodian, "Custodian does not own the asset; nothing moved");
            return Err(EscrowError::NotOwner {
                party: custodian,
                owner,
            });
        }
        Ok(AssetStep::Move { asset, to })
    }

    async fn settle_value(&self, record: &EscrowInstance, to: Address) -> LegOutcome {
        let amount = record.value();
        if record.settlement().value.is_settled() {
            return LegOutcome::Skipped(SkipReason::AlreadySettled);
        }
        let custodian = record.custodian();

        if let Some(tx) = record.settlement().value.in_flight().cloned() {
            match self.recheck(&tx).await {
                Ok(Recheck::Landed) => {
                    return LegOutcome::Skipped(SkipReason::AlreadyConfirmed(tx));
                }
                Ok(Recheck::Pending) => return LegOutcome::Failed(LegFailure::in_flight(tx)),
                Ok(Recheck::Resubmit) => {}
                Err(e) => return LegOutcome::Failed(keep_in_flight(e, tx)),
            }
        }

        match self.ledger.balance(&custodian).await {
            Ok(balance) if balance < amount => {
                warn!(%balance, %amount, "Custody balance below escrow value");
                return LegOutcome::Failed(LegFailure {
                    kind: FailureKind::NotOwner,
                    reason: format!("custodian holds {} of {}", balance, amount),
                    tx: None,
                });
            }
            Ok(_) => {}
            Err(e) => return LegOutcome::Failed(e.into()),
        }

        info!(%amount, %to, "Transferring value");
        match self.ledger.transfer_value(&custodian, &to, amount).await {
            Ok(tx) => LegOutcome::Confirmed(tx),
            Err(e) => LegOutcome::Failed(e.into()),
        }
    }

    async fn recheck(&self, tx: &TxId) -> std::result::Result<Recheck, LedgerError> {
        let status = self.ledger.transfer_status(tx).await?;
        debug!(%tx, ?status, "Re-checked earlier transaction");
        Ok(match status {
            TransferStatus::Confirmed => Recheck::Landed,
            TransferStatus::Pending => Recheck::Pending,
            TransferStatus::Failed(reason) => {
                info!(%tx, %reason, "Earlier transaction failed; resubmitting");
                Recheck::Resubmit
            }
            TransferStatus::Dropped => {
                info!(%tx, "Earlier transaction expired; resubmitting");
                Recheck::Resubmit
            }
        })
    }
}

/// A status lookup failed: the earlier transaction stays the one to watch.
fn keep_in_flight(err: LedgerError, tx: TxId) -> LegFailure {
    LegFailure {
        tx: Some(tx),
        ..LegFailure::from(err)
    }
}

fn settled(outcome: &LegOutcome) -> LegProgress {
    match outcome {
        LegOutcome::Confirmed(tx) | LegOutcome::Skipped(SkipReason::AlreadyConfirmed(tx)) => {
            LegProgress::Settled {
                tx: Some(tx.clone()),
            }
        }
        _ => LegProgress::Settled { tx: None },
    }
}

fn unsettled(failure: &LegFailure) -> LegProgress {
    match &failure.tx {
        Some(tx) => LegProgress::InFlight { tx: tx.clone() },
        None => LegProgress::Outstanding,
    }
}

/// Leg bookkeeping after an attempt produced `outcome`.
fn progress(current: &LegProgress, outcome: &LegOutcome) -> LegProgress {
    match outcome {
        LegOutcome::Skipped(SkipReason::AlreadySettled) => current.clone(),
        LegOutcome::Skipped(reason) if !reason.completes_leg() => current.clone(),
        LegOutcome::Confirmed(_) | LegOutcome::Skipped(_) => settled(outcome),
        LegOutcome::Failed(failure) => unsettled(failure),
    }
}
