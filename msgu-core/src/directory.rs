//! Peer directory: display name <-> identity token, with cached public and session keys.

use std::collections::HashMap;

use tracing::debug;

use crate::crypto::{PublicKey, SymmetricKey};
use crate::identity::ClientId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown peer '{0}', list peers first")]
    UnknownPeer(String),
    #[error("no public key cached for '{0}', fetch it first")]
    MissingPublicKey(String),
    #[error("no session key with '{0}', exchange keys first")]
    MissingSessionKey(String),
}

/// One known peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub name: String,
    pub id: ClientId,
    pub public_key: Option<PublicKey>,
    pub symmetric_key: Option<SymmetricKey>,
}

impl PeerEntry {
    fn new(name: String, id: ClientId) -> Self {
        Self {
            name,
            id,
            public_key: None,
            symmetric_key: None,
        }
    }
}

/// Names are unique; each name maps to exactly one identity and vice versa.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_name: HashMap<String, PeerEntry>,
    name_by_id: HashMap<ClientId, String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Record (name, id). A known pair keeps its cached keys, and so does an
    /// id listed under a new name. A name rebound to another id drops the
    /// stale entry and its keys.
    pub fn upsert(&mut self, name: &str, id: ClientId) {
        if self.by_name.get(name).is_some_and(|e| e.id == id) {
            return;
        }
        let mut entry = PeerEntry::new(name.to_owned(), id);
        if let Some(old) = self.by_name.remove(name) {
            debug!(name, old = %old.id, new = %id, "peer name rebound");
            self.name_by_id.remove(&old.id);
        }
        if let Some(old_name) = self.name_by_id.remove(&id) {
            if let Some(prev) = self.by_name.remove(&old_name) {
                debug!(old = %old_name, new = name, id = %id, "peer renamed");
                entry.public_key = prev.public_key;
                entry.symmetric_key = prev.symmetric_key;
            }
        }
        self.by_name.insert(name.to_owned(), entry);
        self.name_by_id.insert(id, name.to_owned());
    }

    pub fn get(&self, name: &str) -> Option<&PeerEntry> {
        self.by_name.get(name)
    }

    pub fn get_by_id(&self, id: &ClientId) -> Option<&PeerEntry> {
        self.name_by_id.get(id).and_then(|n| self.by_name.get(n))
    }

    pub fn name_of(&self, id: &ClientId) -> Option<&str> {
        self.name_by_id.get(id).map(String::as_str)
    }

    /// Entry for `name`, or `UnknownPeer`.
    pub fn resolve(&self, name: &str) -> Result<&PeerEntry, DirectoryError> {
        self.get(name)
            .ok_or_else(|| DirectoryError::UnknownPeer(name.to_owned()))
    }

    pub fn public_key(&self, name: &str) -> Result<&PublicKey, DirectoryError> {
        self.resolve(name)?
            .public_key
            .as_ref()
            .ok_or_else(|| DirectoryError::MissingPublicKey(name.to_owned()))
    }

    pub fn symmetric_key(&self, name: &str) -> Result<&SymmetricKey, DirectoryError> {
        self.resolve(name)?
            .symmetric_key
            .as_ref()
            .ok_or_else(|| DirectoryError::MissingSessionKey(name.to_owned()))
    }

    /// Cache a peer's public key. Returns false if the id is not in the directory.
    pub fn set_public_key(&mut self, id: &ClientId, key: PublicKey) -> bool {
        match self.entry_by_id_mut(id) {
            Some(entry) => {
                entry.public_key = Some(key);
                true
            }
            None => false,
        }
    }

    /// Cache (or replace) the session key shared with a peer.
    pub fn set_symmetric_key(&mut self, id: &ClientId, key: SymmetricKey) -> bool {
        match self.entry_by_id_mut(id) {
            Some(entry) => {
                entry.symmetric_key = Some(key);
                true
            }
            None => false,
        }
    }

    fn entry_by_id_mut(&mut self, id: &ClientId) -> Option<&mut PeerEntry> {
        let name = self.name_by_id.get(id)?;
        self.by_name.get_mut(name)
    }
}
