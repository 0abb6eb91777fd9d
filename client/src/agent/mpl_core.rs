//! Minimal Metaplex Core encoding: reading an `AssetV1` account header and
//! building a `TransferV1` instruction.
//!
//! Account layout (Borsh):
//!
//! ```text
//! [0]      key                 1 = AssetV1
//! [1..33]  owner               Pubkey
//! [33]     update authority    0 = None, 1 = Address, 2 = Collection
//! [34..66] authority address   present for tags 1 and 2
//! ...      name, uri, plugins  ignored
//! ```

use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;

use crate::error::{ClientError, Result};

/// Metaplex Core program.
pub const MPL_CORE_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("CoREENxT6tW1HoK8ypY1SxRMZTcVPm7R94rH4PZNhX7d");

const ASSET_V1_KEY: u8 = 1;
const TRANSFER_V1_DISCRIMINATOR: u8 = 14;
const HEADER_LEN: usize = 34;

/// Fields of an asset account needed to move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetAccount {
    pub owner: Pubkey,
    /// Collection the asset belongs to; must be passed to transfers.
    pub collection: Option<Pubkey>,
}

/// Decodes the owner and collection of an `AssetV1` account.
///
/// # Errors
///
/// [`ClientError::AssetAccount`] for truncated data, a different account
/// kind, or an unknown update authority tag.
pub fn decode_asset(data: &[u8]) -> Result<AssetAccount> {
    if data.len() < HEADER_LEN {
        return Err(ClientError::AssetAccount(format!(
            "account data too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != ASSET_V1_KEY {
        return Err(ClientError::AssetAccount(format!(
            "not an AssetV1 account (key {})",
            data[0]
        )));
    }
    let owner = read_pubkey(data, 1)?;
    let collection = match data[33] {
        0 | 1 => None,
        2 => Some(read_pubkey(data, HEADER_LEN)?),
        tag => {
            return Err(ClientError::AssetAccount(format!(
                "unknown update authority tag {}",
                tag
            )))
        }
    };
    Ok(AssetAccount { owner, collection })
}

fn read_pubkey(data: &[u8], offset: usize) -> Result<Pubkey> {
    let bytes: [u8; 32] = data
        .get(offset..offset + 32)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| ClientError::AssetAccount(format!("no pubkey at offset {}", offset)))?;
    Ok(Pubkey::new_from_array(bytes))
}

/// `TransferV1` moving `asset` from `payer`, its current owner, to `new_owner`.
///
/// Optional accounts that are absent are passed as the program id.
pub fn transfer_v1(
    asset: Pubkey,
    collection: Option<Pubkey>,
    payer: Pubkey,
    new_owner: Pubkey,
) -> Instruction {
    let absent = AccountMeta::new_readonly(MPL_CORE_PROGRAM_ID, false);
    Instruction {
        program_id: MPL_CORE_PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(asset, false),
            collection
                .map(|c| AccountMeta::new_readonly(c, false))
                .unwrap_or_else(|| absent.clone()),
            AccountMeta::new(payer, true),
            // authority: defaults to the payer
            absent.clone(),
            AccountMeta::new_readonly(new_owner, false),
            // system program, log wrapper
            absent.clone(),
            absent,
        ],
        // discriminator, then `compression_proof: None`
        data: vec![TRANSFER_V1_DISCRIMINATOR, 0],
    }
}
