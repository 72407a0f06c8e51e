//! Identity file: the registered name, server-assigned id and RSA private key.
//!
//! Stored with `bincode`. The public key is re-derived from the private key on load.

use std::path::PathBuf;

use msgu_core::crypto::Keypair;
use msgu_core::{ClientId, IdentityStore, LocalIdentity, StoreError};
use serde::{Deserialize, Serialize};

/// Serialization wrapper matching the file format.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    name: String,
    client_id: ClientId,
    private_key_der: Vec<u8>,
}

/// Identity persisted to a single file on disk.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<LocalIdentity>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let file: IdentityFile =
            bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        msgu_core::identity::validate_name(&file.name)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let keypair = Keypair::from_private_der(&file.private_key_der)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(LocalIdentity {
            name: file.name,
            client_id: file.client_id,
            keypair,
        }))
    }

    fn save(&self, identity: &LocalIdentity) -> Result<(), StoreError> {
        let file = IdentityFile {
            name: identity.name.clone(),
            client_id: identity.client_id,
            private_key_der: identity
                .keypair
                .private_der()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        };
        let bytes = bincode::serialize(&file).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}
