//! Solana bindings for the escrow engine's collaborators.

use custodian_core::Address;
use solana_sdk::pubkey::Pubkey;

pub mod keypair;
pub mod mpl_core;
pub mod solana;

pub(crate) fn to_pubkey(address: &Address) -> Pubkey {
    Pubkey::new_from_array(address.to_bytes())
}

pub(crate) fn to_address(pubkey: &Pubkey) -> Address {
    Address::new(pubkey.to_bytes())
}
