//! In-memory ledger and key handle for exercising escrow flows without a
//! network. NOT FOR PRODUCTION USE.
//!
//! [`MockLedger`] implements both [`Ledger`] and [`AssetRegistry`] over
//! shared state, so clones handed to several engines observe the same
//! balances and owners. Faults can be queued per transfer kind to simulate
//! rejected transfers, network errors and timeouts that did or did not land.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{KeyError, LedgerError};
use crate::interface::{AssetRegistry, KeyHandle, Ledger, TransferStatus, TxId};
use crate::{Address, AssetRef, Lamports};

/// Injected behavior for the next transfer of a given kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Return this error without applying the transfer.
    Fail(LedgerError),
    /// Apply the transfer, then report a timeout.
    TimeoutLanded,
    /// Report a timeout; the transaction never lands.
    TimeoutDropped,
    /// Report a timeout; the transaction stays pending until
    /// [`MockLedger::settle_pending`].
    TimeoutPending,
}

/// Calls observed by the mock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub owner_queries: usize,
    pub asset_transfers: usize,
    pub value_transfers: usize,
    pub status_queries: usize,
    pub balance_queries: usize,
}

#[derive(Debug, Clone)]
enum Pending {
    Asset {
        asset: AssetRef,
        from: Address,
        to: Address,
    },
    Value {
        from: Address,
        to: Address,
        amount: Lamports,
    },
}

#[derive(Debug, Default)]
struct State {
    owners: HashMap<AssetRef, Address>,
    balances: HashMap<Address, u64>,
    statuses: HashMap<String, TransferStatus>,
    pending: HashMap<String, Pending>,
    asset_faults: VecDeque<Fault>,
    value_faults: VecDeque<Fault>,
    calls: CallCounts,
    next_tx: u64,
}

impl State {
    fn next_tx(&mut self) -> TxId {
        self.next_tx += 1;
        TxId::new(format!("mocktx{}", self.next_tx)).with_lifetime(format!("slot{}", self.next_tx))
    }

    fn move_asset(
        &mut self,
        asset: &AssetRef,
        from: &Address,
        to: &Address,
    ) -> Result<(), LedgerError> {
        match self.owners.get(asset) {
            None => Err(LedgerError::NotFound),
            Some(owner) if owner != from => Err(LedgerError::Unauthorized),
            Some(_) => {
                self.owners.insert(*asset, *to);
                Ok(())
            }
        }
    }

    fn move_value(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Lamports,
    ) -> Result<(), LedgerError> {
        let available = self.balances.get(from).copied().unwrap_or_default();
        if available < amount.0 {
            return Err(LedgerError::Rejected(format!(
                "insufficient funds: {} < {}",
                available, amount.0
            )));
        }
        self.balances.insert(*from, available - amount.0);
        *self.balances.entry(*to).or_default() += amount.0;
        Ok(())
    }

    fn apply(&mut self, pending: &Pending) -> Result<(), LedgerError> {
        match pending {
            Pending::Asset { asset, from, to } => self.move_asset(asset, from, to),
            Pending::Value { from, to, amount } => self.move_value(from, to, *amount),
        }
    }

    /// Runs a transfer through the fault queue.
    fn submit(&mut self, fault: Option<Fault>, transfer: Pending) -> Result<TxId, LedgerError> {
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::TimeoutLanded) => {
                self.apply(&transfer)?;
                let tx = self.next_tx();
                self.statuses
                    .insert(tx.signature.clone(), TransferStatus::Confirmed);
                Err(LedgerError::Timeout { tx: Some(tx) })
            }
            Some(Fault::TimeoutDropped) => {
                let tx = self.next_tx();
                self.statuses
                    .insert(tx.signature.clone(), TransferStatus::Dropped);
                Err(LedgerError::Timeout { tx: Some(tx) })
            }
            Some(Fault::TimeoutPending) => {
                let tx = self.next_tx();
                self.statuses
                    .insert(tx.signature.clone(), TransferStatus::Pending);
                self.pending.insert(tx.signature.clone(), transfer);
                Err(LedgerError::Timeout { tx: Some(tx) })
            }
            None => {
                self.apply(&transfer)?;
                let tx = self.next_tx();
                self.statuses
                    .insert(tx.signature.clone(), TransferStatus::Confirmed);
                Ok(tx)
            }
        }
    }
}

/// Shared in-memory ledger.
#[derive(Debug, Clone, Default)]
pub struct MockLedger {
    state: Arc<Mutex<State>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mint(&self, asset: AssetRef, owner: Address) {
        self.state().owners.insert(asset, owner);
    }

    pub fn burn(&self, asset: &AssetRef) {
        self.state().owners.remove(asset);
    }

    pub fn fund(&self, address: Address, amount: Lamports) {
        *self.state().balances.entry(address).or_default() += amount.0;
    }

    pub fn owner(&self, asset: &AssetRef) -> Option<Address> {
        self.state().owners.get(asset).copied()
    }

    pub fn balance_of(&self, address: &Address) -> Lamports {
        Lamports(self.state().balances.get(address).copied().unwrap_or_default())
    }

    pub fn fail_next_asset_transfer(&self, fault: Fault) {
        self.state().asset_faults.push_back(fault);
    }

    pub fn fail_next_value_transfer(&self, fault: Fault) {
        self.state().value_faults.push_back(fault);
    }

    /// Lands every transaction left pending by [`Fault::TimeoutPending`].
    pub fn settle_pending(&self) {
        let mut state = self.state();
        let pending: Vec<(String, Pending)> = state.pending.drain().collect();
        for (signature, transfer) in pending {
            let status = match state.apply(&transfer) {
                Ok(()) => TransferStatus::Confirmed,
                Err(e) => TransferStatus::Failed(e.to_string()),
            };
            state.statuses.insert(signature, status);
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }
}

#[async_trait::async_trait]
impl Ledger for MockLedger {
    async fn transfer_value(
        &self,
        from: &Address,
        to: &Address,
        amount: Lamports,
    ) -> Result<TxId, LedgerError> {
        let mut state = self.state();
        state.calls.value_transfers += 1;
        let fault = state.value_faults.pop_front();
        state.submit(
            fault,
            Pending::Value {
                from: *from,
                to: *to,
                amount,
            },
        )
    }

    async fn transfer_status(&self, tx: &TxId) -> Result<TransferStatus, LedgerError> {
        let mut state = self.state();
        state.calls.status_queries += 1;
        Ok(state
            .statuses
            .get(&tx.signature)
            .cloned()
            .unwrap_or(TransferStatus::Dropped))
    }

    async fn balance(&self, address: &Address) -> Result<Lamports, LedgerError> {
        let mut state = self.state();
        state.calls.balance_queries += 1;
        Ok(Lamports(state.balances.get(address).copied().unwrap_or_default()))
    }
}

#[async_trait::async_trait]
impl AssetRegistry for MockLedger {
    async fn owner_of(&self, asset: &AssetRef) -> Result<Address, LedgerError> {
        let mut state = self.state();
        state.calls.owner_queries += 1;
        state.owners.get(asset).copied().ok_or(LedgerError::NotFound)
    }

    async fn transfer_asset(
        &self,
        asset: &AssetRef,
        from: &Address,
        to: &Address,
    ) -> Result<TxId, LedgerError> {
        let mut state = self.state();
        state.calls.asset_transfers += 1;
        let fault = state.asset_faults.pop_front();
        state.submit(
            fault,
            Pending::Asset {
                asset: *asset,
                from: *from,
                to: *to,
            },
        )
    }
}

/// Key handle with a fixed address and a deterministic fake signature.
#[derive(Debug, Clone, Copy)]
pub struct MockKey(pub Address);

impl KeyHandle for MockKey {
    fn address(&self) -> Address {
        self.0
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let mut sig = vec![0u8; 64];
        for (i, byte) in message.iter().enumerate() {
            sig[i % 64] ^= byte;
        }
        sig[..32].copy_from_slice(self.0.as_ref());
        Ok(sig)
    }
}
