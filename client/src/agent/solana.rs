use core::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use custodian_core::error::KeyError;
use custodian_core::{
    Address, AssetRef, AssetRegistry, KeyHandle, Lamports, Ledger, LedgerError, TransferStatus,
    TxId,
};
use solana_client::client_error::{ClientError as RpcClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::{RpcError, RpcResponseErrorData};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::Message;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, instrument, warn};

use super::mpl_core::{self, AssetAccount, MPL_CORE_PROGRAM_ID};
use super::to_pubkey;
use crate::interface::ClusterConfig;

/// Ledger and asset registry backed by a Solana JSON-RPC node.
///
/// Every transaction is paid for and signed by the operator key; the agent
/// refuses to move anything out of an account that key does not control.
#[derive(Clone)]
pub struct SolanaAgent {
    // JSON-RPC client of a remote Solana node
    client: Arc<RpcClient>,
    // Operator key; fee payer and sole signer
    key: Arc<dyn KeyHandle>,
    confirm_timeout: Duration,
    poll_interval: Duration,
}

impl SolanaAgent {
    #[instrument(skip_all, fields(rpc_url = %config.rpc_url))]
    pub fn new(config: &ClusterConfig, key: Arc<dyn KeyHandle>) -> Self {
        let client = RpcClient::new_with_commitment(
            config.rpc_url.clone(),
            CommitmentConfig::confirmed(),
        );
        info!(operator = %key.address(), "Connected Solana agent");
        Self {
            client: Arc::new(client),
            key,
            confirm_timeout: config.confirm_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    fn ensure_signer(&self, from: &Address) -> Result<(), LedgerError> {
        if *from != self.key.address() {
            warn!(%from, "Transfer source is not the operator key");
            return Err(LedgerError::Unauthorized);
        }
        Ok(())
    }

    async fn fetch_asset(&self, asset: &AssetRef) -> Result<AssetAccount, LedgerError> {
        let response = self
            .client
            .get_account_with_commitment(&to_pubkey(&asset.address()), self.client.commitment())
            .await
            .map_err(classify)?;
        let account = response.value.ok_or(LedgerError::NotFound)?;
        if account.owner != MPL_CORE_PROGRAM_ID {
            return Err(LedgerError::Rejected(format!(
                "{} is not a Metaplex Core asset (program {})",
                asset, account.owner
            )));
        }
        mpl_core::decode_asset(&account.data).map_err(|e| LedgerError::Rejected(e.to_string()))
    }

    /// Signs `instruction` with the operator key, sends it and waits for confirmation.
    async fn submit(&self, instruction: Instruction) -> Result<TxId, LedgerError> {
        let payer = to_pubkey(&self.key.address());
        let blockhash = self.client.get_latest_blockhash().await.map_err(classify)?;
        debug!(%blockhash, "Fetched recent blockhash");

        let message = Message::new_with_blockhash(&[instruction], Some(&payer), &blockhash);
        let mut tx = Transaction::new_unsigned(message);
        let bytes = self.key.sign(&tx.message_data())?;
        let signature = Signature::try_from(bytes.as_slice())
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        tx.signatures = vec![signature];

        let tx_id = TxId::new(signature.to_string()).with_lifetime(blockhash.to_string());
        match self.client.send_transaction(&tx).await {
            Ok(_) => debug!(%signature, "Sent transaction"),
            Err(e) => match classify(e) {
                // The node may have accepted it before the connection dropped.
                LedgerError::Network(reason) => {
                    warn!(%signature, %reason, "Send outcome unknown");
                    return Err(LedgerError::Timeout { tx: Some(tx_id) });
                }
                err => return Err(err),
            },
        }

        match tokio::time::timeout(self.confirm_timeout, self.await_confirmation(&signature)).await
        {
            Ok(Ok(())) => {
                info!(%signature, "Transaction confirmed");
                Ok(tx_id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(%signature, timeout = ?self.confirm_timeout, "Confirmation timed out");
                Err(LedgerError::Timeout { tx: Some(tx_id) })
            }
        }
    }

    async fn await_confirmation(&self, signature: &Signature) -> Result<(), LedgerError> {
        loop {
            match self.client.get_signature_status(signature).await {
                Ok(Some(Ok(()))) => return Ok(()),
                Ok(Some(Err(e))) => return Err(LedgerError::Rejected(e.to_string())),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Status poll failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait::async_trait]
impl Ledger for SolanaAgent {
    #[instrument(skip_all, fields(%from, %to, %amount))]
    async fn transfer_value(
        &self,
        from: &Address,
        to: &Address,
        amount: Lamports,
    ) -> Result<TxId, LedgerError> {
        self.ensure_signer(from)?;
        let ix = system_instruction::transfer(&to_pubkey(from), &to_pubkey(to), amount.0);
        self.submit(ix).await
    }

    #[instrument(skip_all, fields(signature = %tx.signature))]
    async fn transfer_status(&self, tx: &TxId) -> Result<TransferStatus, LedgerError> {
        let signature = Signature::from_str(&tx.signature)
            .map_err(|e| LedgerError::Rejected(format!("bad signature {}: {}", tx, e)))?;
        let status = self
            .client
            .get_signature_status_with_commitment_and_history(
                &signature,
                self.client.commitment(),
                true,
            )
            .await
            .map_err(classify)?;
        let status = match status {
            Some(Ok(())) => TransferStatus::Confirmed,
            Some(Err(e)) => TransferStatus::Failed(e.to_string()),
            None => match &tx.lifetime {
                Some(lifetime) => {
                    let blockhash = Hash::from_str(lifetime).map_err(|e| {
                        LedgerError::Rejected(format!("bad blockhash {}: {}", lifetime, e))
                    })?;
                    let valid = self
                        .client
                        .is_blockhash_valid(&blockhash, CommitmentConfig::processed())
                        .await
                        .map_err(classify)?;
                    if valid {
                        TransferStatus::Pending
                    } else {
                        TransferStatus::Dropped
                    }
                }
                // Without a lifetime the transaction can never be ruled out.
                None => TransferStatus::Pending,
            },
        };
        debug!(?status, "Checked transfer status");
        Ok(status)
    }

    async fn balance(&self, address: &Address) -> Result<Lamports, LedgerError> {
        self.client
            .get_balance(&to_pubkey(address))
            .await
            .map(Lamports)
            .map_err(classify)
    }
}

#[async_trait::async_trait]
impl AssetRegistry for SolanaAgent {
    async fn owner_of(&self, asset: &AssetRef) -> Result<Address, LedgerError> {
        let account = self.fetch_asset(asset).await?;
        Ok(super::to_address(&account.owner))
    }

    #[instrument(skip_all, fields(%asset, %from, %to))]
    async fn transfer_asset(
        &self,
        asset: &AssetRef,
        from: &Address,
        to: &Address,
    ) -> Result<TxId, LedgerError> {
        self.ensure_signer(from)?;
        let account = self.fetch_asset(asset).await?;
        if account.owner != to_pubkey(from) {
            return Err(LedgerError::Unauthorized);
        }
        let ix = mpl_core::transfer_v1(
            to_pubkey(&asset.address()),
            account.collection,
            to_pubkey(from),
            to_pubkey(to),
        );
        self.submit(ix).await
    }
}

/// Sorts RPC failures into definitive rejections and unknown outcomes.
fn classify(err: RpcClientError) -> LedgerError {
    match err.kind() {
        ClientErrorKind::TransactionError(e) => LedgerError::Rejected(e.to_string()),
        ClientErrorKind::RpcError(RpcError::RpcResponseError {
            message,
            data: RpcResponseErrorData::SendTransactionPreflightFailure(_),
            ..
        }) => LedgerError::Rejected(message.clone()),
        _ => LedgerError::Network(err.to_string()),
    }
}
