//! MessageU client core.
//! Blocking, single-connection: one request in flight, response validated before its body is read.

pub mod client;
pub mod codec;
pub mod crypto;
pub mod directory;
pub mod identity;
pub mod payload;
pub mod protocol;
pub mod transport;
pub mod wire;

pub use client::{Client, ClientError, MessageContent, MessageReceipt, ReceivedMessage, UndecryptableReason};
pub use crypto::{Keypair, PublicKey, SymmetricKey};
pub use directory::{DirectoryError, PeerDirectory, PeerEntry};
pub use identity::{ClientId, IdentityStore, LocalIdentity, MemoryIdentityStore, StoreError, ValidationError};
pub use payload::PeerRecord;
pub use protocol::{MessageKind, RequestCode, ResponseCode, PROTOCOL_VERSION};
pub use transport::{connect, Transport, TransportError};
