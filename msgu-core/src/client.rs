//! Session orchestrator: one method per user-facing action.
//!
//! Each request blocks for its response before the next one is sent. The peer
//! directory is only touched after a response has been fully validated and
//! decoded.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError, Keypair, SymmetricKey};
use crate::directory::{DirectoryError, PeerDirectory};
use crate::identity::{validate_name, ClientId, IdentityStore, LocalIdentity, StoreError, ValidationError};
use crate::payload::{OutgoingMessage, PeerRecord, PendingMessage, RequestPayload, ResponsePayload};
use crate::protocol::{MessageKind, ProtocolViolation, RequestCode};
use crate::transport::{Transport, TransportError};
use crate::wire::Request;

/// Attempts at finding a free file name for one received file.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("server answered {0:?} with a generic error")]
    ServerRejected(RequestCode),
    #[error("cannot read {path}: {source}")]
    File { path: PathBuf, source: io::Error },
}

impl From<ProtocolViolation> for ClientError {
    fn from(v: ProtocolViolation) -> Self {
        ClientError::Transport(v.into())
    }
}

impl ClientError {
    /// True when the caller can fix the input or fetch a prerequisite and retry.
    /// Codec, protocol, connection and crypto failures are not recoverable.
    /// A store failure is: the session keeps its identity and can carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ClientError::Directory(_)
                | ClientError::Validation(_)
                | ClientError::ServerRejected(_)
                | ClientError::File { .. }
                | ClientError::Store(_)
        )
    }
}

/// Server acknowledgement of a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReceipt {
    pub target: ClientId,
    pub message_id: u32,
}

/// Why a pending message could not be turned into content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UndecryptableReason {
    #[error("sender is not in the peer directory")]
    UnknownSender,
    #[error("no session key with sender")]
    MissingSessionKey,
    #[error("content failed to decrypt")]
    Cipher,
    #[error("symmetric key could not be unwrapped")]
    KeyUnwrap,
    #[error("file could not be saved: {0}")]
    FileNotSaved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Sender asks us for a session key.
    KeyRequest,
    /// Sender's session key was unwrapped and cached.
    KeyInstalled,
    Text(String),
    File { path: PathBuf, size: usize },
    Undecryptable {
        kind: MessageKind,
        reason: UndecryptableReason,
    },
}

/// One processed entry from a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: u32,
    pub sender: ClientId,
    pub sender_name: Option<String>,
    pub content: MessageContent,
}

/// The client. Owns the transport, the local identity and the peer directory.
pub struct Client<S> {
    transport: Transport<S>,
    store: Box<dyn IdentityStore>,
    identity: Option<LocalIdentity>,
    directory: PeerDirectory,
    download_dir: PathBuf,
}

impl<S: Read + Write> Client<S> {
    /// Build a client, loading any saved identity from `store`.
    pub fn new(transport: Transport<S>, store: Box<dyn IdentityStore>) -> Result<Self, ClientError> {
        let identity = store.load()?;
        if let Some(id) = &identity {
            info!(name = %id.name, id = %id.client_id, "loaded identity");
        }
        Ok(Self {
            transport,
            store,
            identity,
            directory: PeerDirectory::new(),
            download_dir: std::env::temp_dir().join("msgu"),
        })
    }

    /// Directory received files are written to.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn identity(&self) -> Option<&LocalIdentity> {
        self.identity.as_ref()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    /// Register `name` with the server. Generates the identity keypair first.
    ///
    /// Once the server has assigned an id the identity is kept for this
    /// session even if saving it fails; that failure is returned as a
    /// recoverable `Store` error.
    pub fn register(&mut self, name: &str) -> Result<ClientId, ClientError> {
        validate_name(name)?;
        if let Some(existing) = &self.identity {
            return Err(ValidationError::AlreadyRegistered(existing.name.clone()).into());
        }
        let (public_key, keypair) = crypto::generate_identity_keypair()?;
        let payload = RequestPayload::Register {
            name: name.to_owned(),
            public_key,
        };
        match self.call_as(ClientId::UNREGISTERED, payload)? {
            ResponsePayload::RegisterOk { id } => {
                info!(name, id = %id, "registered");
                let identity = LocalIdentity {
                    name: name.to_owned(),
                    client_id: id,
                    keypair,
                };
                let saved = self.store.save(&identity);
                self.identity = Some(identity);
                if let Err(e) = saved {
                    warn!(error = %e, "registered but identity was not saved");
                    return Err(e.into());
                }
                Ok(id)
            }
            other => Err(unexpected(RequestCode::Register, &other)),
        }
    }

    /// Fetch the peer list and record every peer in the directory.
    pub fn list_peers(&mut self) -> Result<Vec<PeerRecord>, ClientError> {
        let own = self.registered()?.client_id;
        match self.call(RequestPayload::ListPeers)? {
            ResponsePayload::PeerList(peers) => {
                for peer in peers.iter().filter(|p| p.id != own) {
                    self.directory.upsert(&peer.name, peer.id);
                }
                debug!(count = peers.len(), "peer list");
                Ok(peers)
            }
            other => Err(unexpected(RequestCode::ListPeers, &other)),
        }
    }

    /// Fetch and cache a known peer's public key.
    pub fn get_public_key(&mut self, name: &str) -> Result<crypto::PublicKey, ClientError> {
        self.registered()?;
        let target = self.directory.resolve(name)?.id;
        match self.call(RequestPayload::GetPublicKey { target })? {
            ResponsePayload::PublicKey { id, public_key } => {
                if id != target {
                    return Err(ProtocolViolation::MismatchedIdentity {
                        expected: target.to_string(),
                        got: id.to_string(),
                    }
                    .into());
                }
                self.directory.set_public_key(&id, public_key.clone());
                debug!(peer = name, "cached public key");
                Ok(public_key)
            }
            other => Err(unexpected(RequestCode::GetPublicKey, &other)),
        }
    }

    /// Ask a peer to send us a session key.
    pub fn request_symmetric_key(&mut self, name: &str) -> Result<MessageReceipt, ClientError> {
        self.registered()?;
        let target = self.directory.resolve(name)?.id;
        self.send_message(target, MessageKind::RequestSymmetricKey, Vec::new())
    }

    /// Send a peer our session key, wrapped under its public key. Fetches the
    /// public key first if it is not cached, and generates the session key if
    /// none exists; the key is cached only once the server accepts it.
    pub fn send_symmetric_key(&mut self, name: &str) -> Result<MessageReceipt, ClientError> {
        self.registered()?;
        let entry = self.directory.resolve(name)?;
        let target = entry.id;
        let key = entry
            .symmetric_key
            .clone()
            .unwrap_or_else(SymmetricKey::generate);
        let public_key = match entry.public_key.clone() {
            Some(pk) => pk,
            None => self.get_public_key(name)?,
        };
        let wrapped = crypto::wrap_symmetric_key(&public_key, &key)?;
        let receipt = self.send_message(target, MessageKind::DeliverSymmetricKey, wrapped)?;
        self.directory.set_symmetric_key(&target, key);
        info!(peer = name, "session key sent");
        Ok(receipt)
    }

    /// Encrypt and send a text message.
    pub fn send_text(&mut self, name: &str, text: &str) -> Result<MessageReceipt, ClientError> {
        self.registered()?;
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let key = self.directory.symmetric_key(name)?;
        let target = self.directory.resolve(name)?.id;
        let sealed = crypto::encrypt(key, text.as_bytes())?;
        self.send_message(target, MessageKind::DeliverText, sealed)
    }

    /// Read a whole file, encrypt it and send it as one message.
    pub fn send_file(&mut self, path: &Path, name: &str) -> Result<MessageReceipt, ClientError> {
        self.registered()?;
        let key = self.directory.symmetric_key(name)?;
        let target = self.directory.resolve(name)?.id;
        let plain = fs::read(path).map_err(|source| ClientError::File {
            path: path.to_owned(),
            source,
        })?;
        let sealed = crypto::encrypt(key, &plain)?;
        debug!(peer = name, size = plain.len(), "sending file");
        self.send_message(target, MessageKind::DeliverFile, sealed)
    }

    /// Fetch pending messages. Key deliveries update the directory; text and
    /// files are decrypted with the sender's cached key, in arrival order.
    pub fn poll_messages(&mut self) -> Result<Vec<ReceivedMessage>, ClientError> {
        self.registered()?;
        let pending = match self.call(RequestPayload::PollMessages)? {
            ResponsePayload::PendingMessages(msgs) => msgs,
            other => return Err(unexpected(RequestCode::PollMessages, &other)),
        };
        let keypair = match &self.identity {
            Some(identity) => &identity.keypair,
            None => return Err(ValidationError::NotRegistered.into()),
        };
        Ok(pending
            .into_iter()
            .map(|m| process_pending(keypair, &mut self.directory, &self.download_dir, m))
            .collect())
    }

    fn send_message(
        &mut self,
        target: ClientId,
        kind: MessageKind,
        content: Vec<u8>,
    ) -> Result<MessageReceipt, ClientError> {
        let payload = RequestPayload::SendMessage(OutgoingMessage {
            target,
            kind,
            content,
        });
        match self.call(payload)? {
            ResponsePayload::MessageAccepted {
                target: acked,
                message_id,
            } => {
                if acked != target {
                    return Err(ProtocolViolation::MismatchedIdentity {
                        expected: target.to_string(),
                        got: acked.to_string(),
                    }
                    .into());
                }
                debug!(?kind, message_id, "message accepted");
                Ok(MessageReceipt { target, message_id })
            }
            other => Err(unexpected(RequestCode::SendMessage, &other)),
        }
    }

    fn registered(&self) -> Result<&LocalIdentity, ValidationError> {
        self.identity.as_ref().ok_or(ValidationError::NotRegistered)
    }

    fn call(&mut self, payload: RequestPayload) -> Result<ResponsePayload, ClientError> {
        let id = self.registered()?.client_id;
        self.call_as(id, payload)
    }

    fn call_as(&mut self, id: ClientId, payload: RequestPayload) -> Result<ResponsePayload, ClientError> {
        let code = payload.code();
        let response = self.transport.exchange(&Request::new(id, payload))?;
        match response.payload {
            ResponsePayload::GenericError => {
                warn!(request = ?code, "server returned generic error");
                Err(ClientError::ServerRejected(code))
            }
            payload => Ok(payload),
        }
    }
}

/// A validated response of the wrong variant; unreachable unless the contract table and decoder disagree.
fn unexpected(request: RequestCode, payload: &ResponsePayload) -> ClientError {
    ProtocolViolation::UnexpectedResponseKind {
        request,
        got: payload.code().code(),
    }
    .into()
}

fn process_pending(
    keypair: &Keypair,
    directory: &mut PeerDirectory,
    download_dir: &Path,
    m: PendingMessage,
) -> ReceivedMessage {
    let sender_name = directory.name_of(&m.sender).map(str::to_owned);
    let undecryptable = |reason| MessageContent::Undecryptable {
        kind: m.kind,
        reason,
    };
    let content = match (m.kind, &sender_name) {
        (MessageKind::RequestSymmetricKey, _) => MessageContent::KeyRequest,
        (_, None) => undecryptable(UndecryptableReason::UnknownSender),
        (MessageKind::DeliverSymmetricKey, Some(name)) => {
            match crypto::unwrap_symmetric_key(keypair, &m.content) {
                Ok(key) => {
                    directory.set_symmetric_key(&m.sender, key);
                    info!(peer = %name, "session key installed");
                    MessageContent::KeyInstalled
                }
                Err(e) => {
                    warn!(peer = %name, error = %e, "could not unwrap session key");
                    undecryptable(UndecryptableReason::KeyUnwrap)
                }
            }
        }
        (MessageKind::DeliverText | MessageKind::DeliverFile, Some(name)) => {
            match open_content(directory, name, &m.content) {
                Err(reason) => {
                    warn!(peer = %name, message_id = m.message_id, %reason, "undecryptable message");
                    undecryptable(reason)
                }
                Ok(plain) if m.kind == MessageKind::DeliverText => {
                    MessageContent::Text(String::from_utf8_lossy(&plain).into_owned())
                }
                Ok(plain) => match save_file(download_dir, m.message_id, &plain) {
                    Ok(path) => {
                        info!(peer = %name, path = %path.display(), "file saved");
                        MessageContent::File {
                            path,
                            size: plain.len(),
                        }
                    }
                    Err(e) => undecryptable(UndecryptableReason::FileNotSaved(e.to_string())),
                },
            }
        }
    };
    ReceivedMessage {
        message_id: m.message_id,
        sender: m.sender,
        sender_name,
        content,
    }
}

fn open_content(directory: &PeerDirectory, name: &str, sealed: &[u8]) -> Result<Vec<u8>, UndecryptableReason> {
    let key = directory
        .symmetric_key(name)
        .map_err(|_| UndecryptableReason::MissingSessionKey)?;
    crypto::decrypt(key, sealed).map_err(|_| UndecryptableReason::Cipher)
}

/// Write to `dir/msg-<id>-<UTC timestamp>`, never overwriting an existing file.
fn save_file(dir: &Path, message_id: u32, bytes: &[u8]) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let base = format!("msg-{message_id}-{stamp}");
    let mut attempt = 0u32;
    loop {
        let path = match attempt {
            0 => dir.join(&base),
            n => dir.join(format!("{base}-{n}")),
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::test_keypair;
    use crate::crypto::PublicKey;
    use crate::identity::MemoryIdentityStore;
    use crate::transport::tests::MockStream;
    use std::sync::Arc;

    const A: [u8; 16] = [0xa0; 16];
    const B: [u8; 16] = [0xb0; 16];
    const C: [u8; 16] = [0xc0; 16];

    fn a_id() -> ClientId {
        ClientId::from_bytes(A)
    }

    fn b_id() -> ClientId {
        ClientId::from_bytes(B)
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("msgu-test-{}", uuid::Uuid::new_v4()))
    }

    /// Client A, already registered, with keypair slot 0.
    fn client_a() -> Client<MockStream> {
        let store = MemoryIdentityStore::with_identity(LocalIdentity {
            name: "A".into(),
            client_id: a_id(),
            keypair: test_keypair(0).clone(),
        });
        Client::new(Transport::new(MockStream::default()), Box::new(store))
            .unwrap()
            .with_download_dir(temp_dir())
    }

    fn unregistered() -> (Client<MockStream>, Arc<MemoryIdentityStore>) {
        let store = Arc::new(MemoryIdentityStore::new());
        let client = Client::new(Transport::new(MockStream::default()), Box::new(store.clone())).unwrap();
        (client, store)
    }

    fn queue(client: &mut Client<MockStream>, payload: ResponsePayload) {
        client.transport.get_mut().queue_payload(payload);
    }

    fn sent(client: &Client<MockStream>) -> Vec<Request> {
        client.transport().get_ref().sent_requests()
    }

    fn last_message(client: &Client<MockStream>) -> OutgoingMessage {
        match sent(client).pop().map(|r| r.payload) {
            Some(RequestPayload::SendMessage(m)) => m,
            other => panic!("expected SendMessage, got {other:?}"),
        }
    }

    fn accepted(target: ClientId, message_id: u32) -> ResponsePayload {
        ResponsePayload::MessageAccepted { target, message_id }
    }

    /// A knows B (and C) from a peer list.
    fn with_peers(client: &mut Client<MockStream>) {
        queue(
            client,
            ResponsePayload::PeerList(vec![
                PeerRecord {
                    id: b_id(),
                    name: "B".into(),
                },
                PeerRecord {
                    id: ClientId::from_bytes(C),
                    name: "C".into(),
                },
            ]),
        );
        client.list_peers().unwrap();
    }

    #[test]
    fn register_stores_identity_and_accepts_255_byte_name() {
        let (mut client, store) = unregistered();
        let name = "n".repeat(255);
        queue(&mut client, ResponsePayload::RegisterOk { id: a_id() });
        assert_eq!(client.register(&name).unwrap(), a_id());

        let reqs = sent(&client);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].client_id, ClientId::UNREGISTERED);
        let identity = client.identity().unwrap();
        match &reqs[0].payload {
            RequestPayload::Register { name: n, public_key } => {
                assert_eq!(n, &name);
                assert_eq!(public_key, identity.keypair.public_key());
            }
            other => panic!("expected Register, got {other:?}"),
        }
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.client_id, a_id());
        assert_eq!(saved.name, name);

        assert!(matches!(
            client.register("again"),
            Err(ClientError::Validation(ValidationError::AlreadyRegistered(_)))
        ));
    }

    #[test]
    fn register_rejects_256_byte_name_before_sending() {
        let (mut client, _) = unregistered();
        let err = client.register(&"n".repeat(256)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Validation(ValidationError::NameTooLong(256))
        ));
        assert!(err.is_recoverable());
        assert!(client.transport().get_ref().output.is_empty());
    }

    #[test]
    fn register_generic_error_leaves_unregistered() {
        let (mut client, store) = unregistered();
        queue(&mut client, ResponsePayload::GenericError);
        let err = client.register("bob").unwrap_err();
        assert!(matches!(err, ClientError::ServerRejected(RequestCode::Register)));
        assert!(client.identity().is_none());
        assert!(store.load().unwrap().is_none());
    }

    struct ReadOnlyStore;

    impl IdentityStore for ReadOnlyStore {
        fn load(&self) -> Result<Option<LocalIdentity>, StoreError> {
            Ok(None)
        }

        fn save(&self, _: &LocalIdentity) -> Result<(), StoreError> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
        }
    }

    #[test]
    fn failed_save_keeps_session_identity() {
        let mut client = Client::new(Transport::new(MockStream::default()), Box::new(ReadOnlyStore))
            .unwrap()
            .with_download_dir(temp_dir());
        queue(&mut client, ResponsePayload::RegisterOk { id: a_id() });
        let err = client.register("alice").unwrap_err();
        assert!(matches!(err, ClientError::Store(StoreError::Io(_))));
        assert!(err.is_recoverable());
        assert_eq!(client.identity().map(|i| i.client_id), Some(a_id()));

        // The registered identity is usable for the rest of the session.
        queue(&mut client, ResponsePayload::PeerList(vec![]));
        client.list_peers().unwrap();
        assert_eq!(sent(&client)[1].client_id, a_id());
    }

    #[test]
    fn operations_require_registration() {
        let (mut client, _) = unregistered();
        assert!(matches!(
            client.list_peers(),
            Err(ClientError::Validation(ValidationError::NotRegistered))
        ));
        assert!(matches!(
            client.poll_messages(),
            Err(ClientError::Validation(ValidationError::NotRegistered))
        ));
        assert!(client.transport().get_ref().output.is_empty());
    }

    #[test]
    fn list_then_public_key_populates_directory() {
        let mut client = client_a();
        queue(
            &mut client,
            ResponsePayload::PeerList(vec![
                PeerRecord {
                    id: ClientId::from_bytes([1; 16]),
                    name: "alice".into(),
                },
                PeerRecord {
                    id: ClientId::from_bytes([2; 16]),
                    name: "bob".into(),
                },
            ]),
        );
        client.list_peers().unwrap();
        let x = PublicKey::from_bytes([0x5a; 160]);
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: ClientId::from_bytes([1; 16]),
                public_key: x.clone(),
            },
        );
        assert_eq!(client.get_public_key("alice").unwrap(), x);

        let dir = client.directory();
        assert_eq!(dir.len(), 2);
        let alice = dir.get("alice").unwrap();
        assert_eq!(alice.id, ClientId::from_bytes([1; 16]));
        assert_eq!(alice.public_key.as_ref(), Some(&x));
        let bob = dir.get("bob").unwrap();
        assert_eq!(bob.id, ClientId::from_bytes([2; 16]));
        assert!(bob.public_key.is_none());

        let reqs = sent(&client);
        assert_eq!(reqs[0].client_id, a_id());
        assert_eq!(
            reqs[1].payload,
            RequestPayload::GetPublicKey {
                target: ClientId::from_bytes([1; 16])
            }
        );
    }

    #[test]
    fn own_entry_is_not_added_to_directory() {
        let mut client = client_a();
        queue(
            &mut client,
            ResponsePayload::PeerList(vec![PeerRecord {
                id: a_id(),
                name: "A".into(),
            }]),
        );
        assert_eq!(client.list_peers().unwrap().len(), 1);
        assert!(client.directory().is_empty());
    }

    #[test]
    fn public_key_for_unknown_peer_fails_locally() {
        let mut client = client_a();
        assert!(matches!(
            client.get_public_key("zed"),
            Err(ClientError::Directory(DirectoryError::UnknownPeer(_)))
        ));
        assert!(client.transport().get_ref().output.is_empty());
    }

    #[test]
    fn public_key_for_other_identity_is_violation() {
        let mut client = client_a();
        with_peers(&mut client);
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: ClientId::from_bytes(C),
                public_key: PublicKey::from_bytes([1; 160]),
            },
        );
        let err = client.get_public_key("B").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Protocol(
                ProtocolViolation::MismatchedIdentity { .. }
            ))
        ));
        assert!(!err.is_recoverable());
        assert!(client.directory().get("C").unwrap().public_key.is_none());
    }

    #[test]
    fn send_text_without_session_key_sends_nothing() {
        let mut client = client_a();
        with_peers(&mut client);
        let before = client.transport().get_ref().output.len();
        let err = client.send_text("B", "hi").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Directory(DirectoryError::MissingSessionKey(ref n)) if n == "B"
        ));
        assert!(err.is_recoverable());
        assert_eq!(client.transport().get_ref().output.len(), before);
    }

    #[test]
    fn key_exchange_then_text() {
        let mut client = client_a();
        with_peers(&mut client);

        queue(&mut client, accepted(b_id(), 1));
        client.request_symmetric_key("B").unwrap();
        let m = last_message(&client);
        assert_eq!(m.kind, MessageKind::RequestSymmetricKey);
        assert_eq!(m.target, b_id());
        assert!(m.content.is_empty());

        let k = SymmetricKey::from_bytes([0x4b; 32]);
        let wrapped = crypto::wrap_symmetric_key(test_keypair(0).public_key(), &k).unwrap();
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![PendingMessage {
                sender: b_id(),
                message_id: 7,
                kind: MessageKind::DeliverSymmetricKey,
                content: wrapped,
            }]),
        );
        let polled = client.poll_messages().unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].content, MessageContent::KeyInstalled);
        assert_eq!(polled[0].sender_name.as_deref(), Some("B"));
        assert_eq!(
            client.directory().get("B").unwrap().symmetric_key.as_ref(),
            Some(&k)
        );

        queue(&mut client, accepted(b_id(), 8));
        let receipt = client.send_text("B", "hi").unwrap();
        assert_eq!(receipt, MessageReceipt { target: b_id(), message_id: 8 });
        let m = last_message(&client);
        assert_eq!(m.kind, MessageKind::DeliverText);
        assert_eq!(crypto::decrypt(&k, &m.content).unwrap(), b"hi");
    }

    #[test]
    fn send_symmetric_key_fetches_missing_public_key() {
        let mut client = client_a();
        with_peers(&mut client);
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: b_id(),
                public_key: test_keypair(1).public_key().clone(),
            },
        );
        queue(&mut client, accepted(b_id(), 2));
        client.send_symmetric_key("B").unwrap();

        let reqs = sent(&client);
        let n = reqs.len();
        assert_eq!(reqs[n - 2].payload, RequestPayload::GetPublicKey { target: b_id() });
        let m = last_message(&client);
        let delivered = crypto::unwrap_symmetric_key(test_keypair(1), &m.content).unwrap();
        let entry = client.directory().get("B").unwrap();
        assert_eq!(entry.symmetric_key.as_ref(), Some(&delivered));
        assert!(entry.public_key.is_some());
    }

    #[test]
    fn send_symmetric_key_to_unknown_peer_sends_nothing() {
        let mut client = client_a();
        assert!(matches!(
            client.send_symmetric_key("B"),
            Err(ClientError::Directory(DirectoryError::UnknownPeer(_)))
        ));
        assert!(client.transport().get_ref().output.is_empty());
    }

    #[test]
    fn send_symmetric_key_wraps_for_peer_and_caches() {
        let mut client = client_a();
        with_peers(&mut client);
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: b_id(),
                public_key: test_keypair(1).public_key().clone(),
            },
        );
        client.get_public_key("B").unwrap();
        queue(&mut client, accepted(b_id(), 3));
        client.send_symmetric_key("B").unwrap();

        let m = last_message(&client);
        assert_eq!(m.kind, MessageKind::DeliverSymmetricKey);
        let delivered = crypto::unwrap_symmetric_key(test_keypair(1), &m.content).unwrap();
        let cached = client.directory().get("B").unwrap().symmetric_key.clone();
        assert_eq!(cached, Some(delivered.clone()));

        // A second send reuses the cached key.
        queue(&mut client, accepted(b_id(), 4));
        client.send_symmetric_key("B").unwrap();
        let again = crypto::unwrap_symmetric_key(test_keypair(1), &last_message(&client).content).unwrap();
        assert_eq!(again, delivered);
    }

    #[test]
    fn rejected_key_delivery_is_not_cached() {
        let mut client = client_a();
        with_peers(&mut client);
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: b_id(),
                public_key: test_keypair(1).public_key().clone(),
            },
        );
        client.get_public_key("B").unwrap();
        queue(&mut client, ResponsePayload::GenericError);
        assert!(matches!(
            client.send_symmetric_key("B"),
            Err(ClientError::ServerRejected(RequestCode::SendMessage))
        ));
        assert!(client.directory().get("B").unwrap().symmetric_key.is_none());
    }

    #[test]
    fn poll_processes_entries_in_order() {
        let mut client = client_a();
        with_peers(&mut client);
        let k = SymmetricKey::generate();
        let wrapped = crypto::wrap_symmetric_key(test_keypair(0).public_key(), &k).unwrap();
        let stranger = ClientId::from_bytes([0xee; 16]);
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![
                PendingMessage {
                    sender: ClientId::from_bytes(C),
                    message_id: 1,
                    kind: MessageKind::DeliverText,
                    content: crypto::encrypt(&k, b"too early").unwrap(),
                },
                PendingMessage {
                    sender: b_id(),
                    message_id: 2,
                    kind: MessageKind::DeliverSymmetricKey,
                    content: wrapped,
                },
                PendingMessage {
                    sender: b_id(),
                    message_id: 3,
                    kind: MessageKind::DeliverText,
                    content: crypto::encrypt(&k, "héllo".as_bytes()).unwrap(),
                },
                PendingMessage {
                    sender: b_id(),
                    message_id: 4,
                    kind: MessageKind::RequestSymmetricKey,
                    content: vec![],
                },
                PendingMessage {
                    sender: stranger,
                    message_id: 5,
                    kind: MessageKind::DeliverText,
                    content: vec![1, 2, 3],
                },
                PendingMessage {
                    sender: b_id(),
                    message_id: 6,
                    kind: MessageKind::DeliverText,
                    content: vec![0; 40],
                },
            ]),
        );
        let got = client.poll_messages().unwrap();
        let contents: Vec<_> = got.iter().map(|m| m.content.clone()).collect();
        assert_eq!(
            contents,
            vec![
                MessageContent::Undecryptable {
                    kind: MessageKind::DeliverText,
                    reason: UndecryptableReason::MissingSessionKey
                },
                MessageContent::KeyInstalled,
                MessageContent::Text("héllo".into()),
                MessageContent::KeyRequest,
                MessageContent::Undecryptable {
                    kind: MessageKind::DeliverText,
                    reason: UndecryptableReason::UnknownSender
                },
                MessageContent::Undecryptable {
                    kind: MessageKind::DeliverText,
                    reason: UndecryptableReason::Cipher
                },
            ]
        );
        assert_eq!(got[4].sender, stranger);
        assert_eq!(got[4].sender_name, None);
    }

    #[test]
    fn bad_wrapped_key_is_reported_not_fatal() {
        let mut client = client_a();
        with_peers(&mut client);
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![PendingMessage {
                sender: b_id(),
                message_id: 1,
                kind: MessageKind::DeliverSymmetricKey,
                content: vec![0; 128],
            }]),
        );
        let got = client.poll_messages().unwrap();
        assert_eq!(
            got[0].content,
            MessageContent::Undecryptable {
                kind: MessageKind::DeliverSymmetricKey,
                reason: UndecryptableReason::KeyUnwrap
            }
        );
        assert!(client.directory().get("B").unwrap().symmetric_key.is_none());
    }

    #[test]
    fn file_roundtrip_through_poll() {
        let mut client = client_a();
        with_peers(&mut client);
        let k = SymmetricKey::generate();
        let wrapped = crypto::wrap_symmetric_key(test_keypair(0).public_key(), &k).unwrap();
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![PendingMessage {
                sender: b_id(),
                message_id: 1,
                kind: MessageKind::DeliverSymmetricKey,
                content: wrapped,
            }]),
        );
        client.poll_messages().unwrap();

        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        let src = dir.join("report.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        fs::write(&src, &data).unwrap();

        queue(&mut client, accepted(b_id(), 2));
        client.send_file(&src, "B").unwrap();
        let m = last_message(&client);
        assert_eq!(m.kind, MessageKind::DeliverFile);

        // Echo the same sealed content back as if B had sent it, twice with the same id.
        let echoed = PendingMessage {
            sender: b_id(),
            message_id: 9,
            kind: MessageKind::DeliverFile,
            content: m.content,
        };
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![echoed.clone(), echoed]),
        );
        let got = client.poll_messages().unwrap();
        let paths: Vec<PathBuf> = got
            .iter()
            .map(|r| match &r.content {
                MessageContent::File { path, size } => {
                    assert_eq!(*size, data.len());
                    path.clone()
                }
                other => panic!("expected File, got {other:?}"),
            })
            .collect();
        assert_ne!(paths[0], paths[1]);
        for p in &paths {
            assert_eq!(fs::read(p).unwrap(), data);
            assert!(p
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("msg-9-")));
        }
        let _ = fs::remove_dir_all(&dir);
        let _ = fs::remove_dir_all(&client.download_dir);
    }

    #[test]
    fn send_file_missing_path_is_recoverable() {
        let mut client = client_a();
        with_peers(&mut client);
        let k = SymmetricKey::generate();
        let wrapped = crypto::wrap_symmetric_key(test_keypair(0).public_key(), &k).unwrap();
        queue(
            &mut client,
            ResponsePayload::PendingMessages(vec![PendingMessage {
                sender: b_id(),
                message_id: 1,
                kind: MessageKind::DeliverSymmetricKey,
                content: wrapped,
            }]),
        );
        client.poll_messages().unwrap();
        let before = client.transport().get_ref().output.len();
        let err = client
            .send_file(&temp_dir().join("nope"), "B")
            .unwrap_err();
        assert!(matches!(err, ClientError::File { .. }));
        assert!(err.is_recoverable());
        assert_eq!(client.transport().get_ref().output.len(), before);
    }

    #[test]
    fn protocol_violation_leaves_directory_untouched() {
        let mut client = client_a();
        // PublicKey response to a ListPeers request.
        queue(
            &mut client,
            ResponsePayload::PublicKey {
                id: b_id(),
                public_key: PublicKey::from_bytes([0; 160]),
            },
        );
        let err = client.list_peers().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Protocol(
                ProtocolViolation::UnexpectedResponseKind { .. }
            ))
        ));
        assert!(!err.is_recoverable());
        assert!(client.directory().is_empty());
        assert!(matches!(
            client.list_peers(),
            Err(ClientError::Transport(TransportError::Desynchronized))
        ));
    }

    #[test]
    fn poll_again_after_undecodable_poll() {
        let mut client = client_a();
        let mut bad = crate::wire::Response::new(ResponsePayload::PendingMessages(vec![PendingMessage {
            sender: b_id(),
            message_id: 1,
            kind: MessageKind::DeliverText,
            content: vec![1, 2, 3],
        }]))
        .unwrap()
        .encode()
        .unwrap();
        bad[crate::protocol::RESPONSE_HEADER_LEN + 20] = 9;
        client.transport.get_mut().input.extend(bad);
        queue(&mut client, ResponsePayload::PendingMessages(vec![]));

        let err = client.poll_messages().unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Payload(_))));
        assert!(!client.transport().is_desynchronized());
        assert_eq!(client.poll_messages().unwrap(), vec![]);
    }

    #[test]
    fn empty_text_rejected() {
        let mut client = client_a();
        with_peers(&mut client);
        assert!(matches!(
            client.send_text("B", ""),
            Err(ClientError::Validation(ValidationError::EmptyMessage))
        ));
    }
}
