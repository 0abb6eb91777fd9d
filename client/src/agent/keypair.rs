use std::path::Path;

use custodian_core::error::KeyError;
use custodian_core::{Address, KeyHandle};
use solana_sdk::signature::{read_keypair_file, Keypair};
use solana_sdk::signer::Signer;
use tracing::debug;

use super::to_address;
use crate::error::{ClientError, Result};

/// Custodian key backed by a Solana keypair file.
pub struct KeypairHandle {
    keypair: Keypair,
}

impl KeypairHandle {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let keypair = read_keypair_file(path)
            .map_err(|e| ClientError::Keypair(format!("{}: {}", path.display(), e)))?;
        debug!(operator = %keypair.pubkey(), "Loaded operator keypair");
        Ok(Self::new(keypair))
    }
}

impl KeyHandle for KeypairHandle {
    fn address(&self) -> Address {
        to_address(&self.keypair.pubkey())
    }

    fn sign(&self, message: &[u8]) -> std::result::Result<Vec<u8>, KeyError> {
        self.keypair
            .try_sign_message(message)
            .map(|signature| signature.as_ref().to_vec())
            .map_err(|e| KeyError::Signing(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use solana_sdk::signature::Signature;

    use super::*;

    #[test]
    fn signs_as_the_keypair() {
        let keypair = Keypair::new();
        let pubkey = keypair.pubkey();
        let handle = KeypairHandle::new(keypair);
        assert_eq!(handle.address().to_bytes(), pubkey.to_bytes());

        let bytes = handle.sign(b"transfer").unwrap();
        let signature = Signature::try_from(bytes.as_slice()).unwrap();
        assert!(signature.verify(pubkey.as_ref(), b"transfer"));
    }

    #[test]
    fn missing_file_is_a_keypair_error() {
        assert!(matches!(
            KeypairHandle::from_file("/nonexistent/wallet.json"),
            Err(ClientError::Keypair(_))
        ));
    }
}
