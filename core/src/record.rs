//! Escrow record: the observable state of one escrow instance and the
//! phase state machine it moves through.
//!
//! ```text
//!            DepositAsset               DepositValue
//!   Empty ───────────────► AssetDeposited ─────────┐
//!     │                                            ▼
//!     │ DepositValue                        FullyDeposited
//!     ▼                    DepositAsset            ▲
//!   ValueDeposited ────────────────────────────────┘
//!
//!   {Asset,Value,Fully}Deposited ── Release ──► Released | PartiallyReleased
//!   {Asset,Value,Fully}Deposited ── Refund  ──► Refunded | PartiallyRefunded
//!   PartiallyReleased ── Release ──► Released | PartiallyReleased
//!   PartiallyRefunded ── Refund  ──► Refunded | PartiallyRefunded
//!   any non-terminal ── Abandon ──► Failed
//! ```
//!
//! Fields are private; phase changes are made by the engine only.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::interface::TxId;
use crate::outcome::Direction;
use crate::{Address, AssetRef, EscrowError, Lamports, Result};

/// Position of an escrow in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Empty,
    AssetDeposited,
    ValueDeposited,
    FullyDeposited,
    Released,
    Refunded,
    PartiallyReleased,
    PartiallyRefunded,
    Failed,
}

/// Inputs to [`Phase::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    AssetDeposited,
    ValueDeposited,
    /// A release or refund made progress; `complete` when no leg is outstanding.
    Settled { direction: Direction, complete: bool },
    Abandoned,
}

impl Event {
    fn operation(&self) -> &'static str {
        match self {
            Self::AssetDeposited => "deposit asset",
            Self::ValueDeposited => "deposit value",
            Self::Settled {
                direction: Direction::Release,
                ..
            } => "release",
            Self::Settled {
                direction: Direction::Refund,
                ..
            } => "refund",
            Self::Abandoned => "abandon",
        }
    }
}

impl Phase {
    /// Applies `event`, returning the next phase.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidTransition`] when `event` is not admitted from `self`.
    pub fn next(self, event: Event) -> Result<Phase> {
        use Phase::*;

        let next = match (self, event) {
            (Empty, Event::AssetDeposited) => AssetDeposited,
            (ValueDeposited, Event::AssetDeposited) => FullyDeposited,
            (Empty, Event::ValueDeposited) => ValueDeposited,
            (AssetDeposited, Event::ValueDeposited) => FullyDeposited,
            (from, Event::Settled { direction, complete }) if from.admits(direction) => {
                match (direction, complete) {
                    (Direction::Release, true) => Released,
                    (Direction::Release, false) => PartiallyReleased,
                    (Direction::Refund, true) => Refunded,
                    (Direction::Refund, false) => PartiallyRefunded,
                }
            }
            (from, Event::Abandoned) if !from.is_terminal() => Failed,
            (phase, event) => {
                return Err(EscrowError::InvalidTransition {
                    phase,
                    operation: event.operation(),
                })
            }
        };
        Ok(next)
    }

    /// Whether a release or refund may be attempted from this phase.
    pub fn admits(self, direction: Direction) -> bool {
        match self {
            Self::AssetDeposited | Self::ValueDeposited | Self::FullyDeposited => true,
            Self::PartiallyReleased => direction == Direction::Release,
            Self::PartiallyRefunded => direction == Direction::Refund,
            _ => false,
        }
    }

    /// Released or refunded in full.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// No further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bookkeeping for a single leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LegProgress {
    #[default]
    Outstanding,
    /// Submitted; outcome not observed yet.
    InFlight { tx: TxId },
    /// At its destination. `tx` is absent when observed rather than performed.
    Settled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx: Option<TxId>,
    },
}

impl LegProgress {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }

    pub fn in_flight(&self) -> Option<&TxId> {
        match self {
            Self::InFlight { tx } => Some(tx),
            _ => None,
        }
    }
}

/// Progress of the two legs of a deposit or settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Legs {
    pub asset: LegProgress,
    pub value: LegProgress,
}

impl Legs {
    fn touched(&self) -> bool {
        self.asset != LegProgress::Outstanding || self.value != LegProgress::Outstanding
    }
}

/// One escrow instance: a custodian temporarily holding a seller's asset
/// and/or a buyer's funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowInstance {
    id: String,
    custodian: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    asset: Option<AssetRef>,
    value: Lamports,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seller: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buyer: Option<Address>,
    phase: Phase,
    #[serde(default)]
    deposits: Legs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settling: Option<Direction>,
    #[serde(default)]
    settlement: Legs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl EscrowInstance {
    /// Creates an empty escrow.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidInput`] for an empty id, or a deal with neither
    /// an asset nor a value leg.
    pub fn new<S: Into<String>>(
        id: S,
        custodian: Address,
        asset: Option<AssetRef>,
        value: Lamports,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EscrowError::invalid_input("escrow id must not be empty"));
        }
        if asset.is_none() && value.is_zero() {
            return Err(EscrowError::invalid_input(
                "escrow must hold an asset, a non-zero value, or both",
            ));
        }
        if asset.map(|a| a.address()) == Some(custodian) {
            return Err(EscrowError::invalid_input(
                "custodian address cannot be the asset itself",
            ));
        }
        Ok(Self {
            id,
            custodian,
            asset,
            value,
            seller: None,
            buyer: None,
            phase: Phase::Empty,
            deposits: Legs::default(),
            settling: None,
            settlement: Legs::default(),
            failure: None,
        })
    }

    pub fn with_seller(mut self, seller: Address) -> Result<Self> {
        self.bind_seller(seller)?;
        Ok(self)
    }

    pub fn with_buyer(mut self, buyer: Address) -> Result<Self> {
        self.bind_buyer(buyer)?;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn custodian(&self) -> Address {
        self.custodian
    }

    pub fn asset(&self) -> Option<AssetRef> {
        self.asset
    }

    pub fn value(&self) -> Lamports {
        self.value
    }

    pub fn seller(&self) -> Option<Address> {
        self.seller
    }

    pub fn buyer(&self) -> Option<Address> {
        self.buyer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deposits(&self) -> &Legs {
        &self.deposits
    }

    pub fn settlement(&self) -> &Legs {
        &self.settlement
    }

    /// Direction locked in by the first settlement submission.
    pub fn settling(&self) -> Option<Direction> {
        self.settling
    }

    /// Reason recorded when the escrow was abandoned.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Binds the seller. Counterparties are write-once: re-binding the same
    /// address is a no-op, a different one is rejected.
    pub fn bind_seller(&mut self, seller: Address) -> Result<()> {
        Self::bind(&mut self.seller, seller, "seller")
    }

    /// Binds the buyer. See [`Self::bind_seller`].
    pub fn bind_buyer(&mut self, buyer: Address) -> Result<()> {
        Self::bind(&mut self.buyer, buyer, "buyer")
    }

    fn bind(slot: &mut Option<Address>, address: Address, role: &str) -> Result<()> {
        match slot {
            Some(bound) if *bound != address => Err(EscrowError::invalid_input(format!(
                "{} already bound to {}, got {}",
                role, bound, address
            ))),
            Some(_) => Ok(()),
            None => {
                *slot = Some(address);
                Ok(())
            }
        }
    }

    /// Fills in deal terms learned after creation. Like counterparties,
    /// terms are write-once: a missing asset or a zero value may be set
    /// while its deposit leg is untouched and no settlement has begun, a
    /// conflicting one is rejected. `None` leaves a term as it is.
    pub fn bind_terms(&mut self, asset: Option<AssetRef>, value: Option<Lamports>) -> Result<()> {
        let open =
            self.settling.is_none() && !self.settlement.touched() && !self.phase.is_terminal();
        if let Some(asset) = asset {
            match self.asset {
                Some(bound) if bound != asset => {
                    return Err(EscrowError::invalid_input(format!(
                        "escrow {} holds asset {}, got {}",
                        self.id, bound, asset
                    )))
                }
                Some(_) => {}
                None if open && self.deposits.asset == LegProgress::Outstanding => {
                    if asset.address() == self.custodian {
                        return Err(EscrowError::invalid_input(
                            "custodian address cannot be the asset itself",
                        ));
                    }
                    self.asset = Some(asset);
                }
                None => {
                    return Err(EscrowError::invalid_input(format!(
                        "escrow {} has no asset leg and can no longer take one",
                        self.id
                    )))
                }
            }
        }
        if let Some(value) = value {
            if value != self.value {
                if !self.value.is_zero() || !open || self.deposits.value != LegProgress::Outstanding
                {
                    return Err(EscrowError::invalid_input(format!(
                        "escrow {} holds {} SOL, got {}",
                        self.id, self.value, value
                    )));
                }
                self.value = value;
            }
        }
        Ok(())
    }

    /// Destinations of the asset and value legs for `direction`.
    pub fn destinations(&self, direction: Direction) -> (Option<Address>, Option<Address>) {
        match direction {
            Direction::Release => (self.buyer, self.seller),
            Direction::Refund => (self.seller, self.buyer),
        }
    }

    /// Destinations of the legs this deal actually has, for `direction`.
    ///
    /// An absent leg (no asset, zero value) yields `None`.
    ///
    /// # Errors
    ///
    /// [`EscrowError::InvalidInput`] when an applicable leg lacks its destination.
    pub fn validate_settlement(
        &self,
        direction: Direction,
    ) -> Result<(Option<(AssetRef, Address)>, Option<Address>)> {
        let (asset_to, value_to) = self.destinations(direction);
        let (asset_role, value_role) = match direction {
            Direction::Release => ("buyer", "seller"),
            Direction::Refund => ("seller", "buyer"),
        };
        let asset_leg = match (self.asset, asset_to) {
            (None, _) => None,
            (Some(asset), Some(to)) => Some((asset, to)),
            (Some(_), None) => {
                return Err(EscrowError::invalid_input(format!(
                    "{} needs a {} address for the asset leg",
                    direction, asset_role
                )))
            }
        };
        let value_leg = match (self.value.is_zero(), value_to) {
            (true, _) => None,
            (false, Some(to)) => Some(to),
            (false, None) => {
                return Err(EscrowError::invalid_input(format!(
                    "{} needs a {} address for the value leg",
                    direction, value_role
                )))
            }
        };
        Ok((asset_leg, value_leg))
    }

    pub(crate) fn apply(&mut self, event: Event) -> Result<Phase> {
        self.phase = self.phase.next(event)?;
        Ok(self.phase)
    }

    pub(crate) fn deposits_mut(&mut self) -> &mut Legs {
        &mut self.deposits
    }

    /// Settlement legs for `direction`, locking the direction once any leg moves.
    pub(crate) fn settlement_mut(&mut self, direction: Direction) -> Result<&mut Legs> {
        match self.settling {
            Some(locked) if locked != direction => Err(EscrowError::InvalidTransition {
                phase: self.phase,
                operation: match direction {
                    Direction::Release => "release",
                    Direction::Refund => "refund",
                },
            }),
            _ => Ok(&mut self.settlement),
        }
    }

    pub(crate) fn lock_direction(&mut self, direction: Direction) {
        if self.settling.is_none() && self.settlement.touched() {
            self.settling = Some(direction);
        }
    }

    pub(crate) fn abandon(&mut self, reason: String) -> Result<Phase> {
        let phase = self.apply(Event::Abandoned)?;
        self.failure = Some(reason);
        Ok(phase)
    }
}
