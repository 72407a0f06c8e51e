//! Client identity: server-assigned token, local identity record, name rules, identity store seam.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::crypto::Keypair;
use crate::protocol::{CLIENT_ID_LEN, NAME_FIELD_LEN};

/// 16-byte identity token assigned by the server at registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

impl ClientId {
    /// All-zero token: sent in the header before registration.
    pub const UNREGISTERED: ClientId = ClientId([0; CLIENT_ID_LEN]);

    pub fn from_bytes(bytes: [u8; CLIENT_ID_LEN]) -> Self {
        ClientId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    pub fn is_unregistered(&self) -> bool {
        *self == Self::UNREGISTERED
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).simple())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

/// Local identity: who we registered as, plus our keypair.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub name: String,
    pub client_id: ClientId,
    pub keypair: Keypair,
}

/// Input rejected before any request is built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("name is empty")]
    EmptyName,
    #[error("name is {0} bytes, limit is 255")]
    NameTooLong(usize),
    #[error("name contains a NUL byte")]
    NameContainsNul,
    #[error("not registered")]
    NotRegistered,
    #[error("already registered as {0}")]
    AlreadyRegistered(String),
    #[error("message is empty")]
    EmptyMessage,
}

/// Display names: 1..=255 bytes, no NUL (the wire field is NUL-padded).
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.len() > NAME_FIELD_LEN {
        return Err(ValidationError::NameTooLong(name.len()));
    }
    if name.as_bytes().contains(&0) {
        return Err(ValidationError::NameContainsNul);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("identity store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity store is corrupt: {0}")]
    Corrupt(String),
}

/// Persistence of the local identity. Loaded once at startup, saved once after registering.
pub trait IdentityStore {
    fn load(&self) -> Result<Option<LocalIdentity>, StoreError>;
    fn save(&self, identity: &LocalIdentity) -> Result<(), StoreError>;
}

impl<T: IdentityStore + ?Sized> IdentityStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<LocalIdentity>, StoreError> {
        (**self).load()
    }

    fn save(&self, identity: &LocalIdentity) -> Result<(), StoreError> {
        (**self).save(identity)
    }
}

/// In-process store; nothing survives the process.
#[derive(Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<LocalIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: LocalIdentity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<LocalIdentity>, StoreError> {
        Ok(self
            .slot
            .lock()
            .map_err(|_| StoreError::Corrupt("lock poisoned".into()))?
            .clone())
    }

    fn save(&self, identity: &LocalIdentity) -> Result<(), StoreError> {
        *self
            .slot
            .lock()
            .map_err(|_| StoreError::Corrupt("lock poisoned".into()))? = Some(identity.clone());
        Ok(())
    }
}
