//! Payload registry: typed request/response bodies keyed by their wire code.

use crate::codec::{self, CodecError};
use crate::crypto::PublicKey;
use crate::identity::ClientId;
use crate::protocol::{
    MessageKind, RequestCode, ResponseCode, CLIENT_ID_LEN, NAME_FIELD_LEN, PUBLIC_KEY_LEN,
};

/// sender(16) + message id(4) + kind(1) + content length(4).
const PENDING_ENTRY_HEADER_LEN: usize = CLIENT_ID_LEN + 4 + 1 + 4;
/// target(16) + kind(1) + content length(4).
const SEND_MESSAGE_HEADER_LEN: usize = CLIENT_ID_LEN + 1 + 4;
const PEER_ENTRY_LEN: usize = CLIENT_ID_LEN + NAME_FIELD_LEN;

/// What was wrong with a body that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Malformed {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown response kind {0}")]
    UnknownResponseKind(u16),
    #[error("unknown request kind {0}")]
    UnknownRequestKind(u16),
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed response: {0}")]
    MalformedResponse(Malformed),
    #[error("malformed request: {0}")]
    MalformedRequest(Malformed),
}

/// Message carried by a SendMessage request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub target: ClientId,
    pub kind: MessageKind,
    pub content: Vec<u8>,
}

/// Request bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    Register { name: String, public_key: PublicKey },
    ListPeers,
    GetPublicKey { target: ClientId },
    SendMessage(OutgoingMessage),
    PollMessages,
}

impl RequestPayload {
    pub fn code(&self) -> RequestCode {
        match self {
            RequestPayload::Register { .. } => RequestCode::Register,
            RequestPayload::ListPeers => RequestCode::ListPeers,
            RequestPayload::GetPublicKey { .. } => RequestCode::GetPublicKey,
            RequestPayload::SendMessage(_) => RequestCode::SendMessage,
            RequestPayload::PollMessages => RequestCode::PollMessages,
        }
    }

    /// Exact number of bytes `encode` produces.
    pub fn encoded_len(&self) -> usize {
        match self {
            RequestPayload::Register { .. } => NAME_FIELD_LEN + PUBLIC_KEY_LEN,
            RequestPayload::ListPeers | RequestPayload::PollMessages => 0,
            RequestPayload::GetPublicKey { .. } => CLIENT_ID_LEN,
            RequestPayload::SendMessage(m) => SEND_MESSAGE_HEADER_LEN + m.content.len(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let end = match self {
            RequestPayload::Register { name, public_key } => {
                let off = codec::write_padded(&mut buf, 0, name.as_bytes(), NAME_FIELD_LEN)?;
                codec::write_bytes(&mut buf, off, public_key.as_bytes())?
            }
            RequestPayload::ListPeers | RequestPayload::PollMessages => 0,
            RequestPayload::GetPublicKey { target } => {
                codec::write_bytes(&mut buf, 0, target.as_bytes())?
            }
            RequestPayload::SendMessage(m) => {
                let len = u32::try_from(m.content.len())
                    .map_err(|_| CodecError::LengthOverflow(m.content.len()))?;
                let off = codec::write_bytes(&mut buf, 0, m.target.as_bytes())?;
                let off = codec::write_u8(&mut buf, off, m.kind.code())?;
                let off = codec::write_u32(&mut buf, off, len)?;
                codec::write_bytes(&mut buf, off, &m.content)?
            }
        };
        debug_assert_eq!(end, buf.len());
        Ok(buf)
    }

    /// Server-side view of a request body.
    pub fn decode(code: u16, body: &[u8]) -> Result<Self, PayloadError> {
        Self::decode_body(code, body).map_err(PayloadError::MalformedRequest)
    }

    fn decode_body(code: u16, body: &[u8]) -> Result<Self, Malformed> {
        let code = RequestCode::from_code(code).ok_or(Malformed::UnknownRequestKind(code))?;
        let payload = match code {
            RequestCode::Register => {
                let (name, off) = codec::read_padded(body, 0, NAME_FIELD_LEN)?;
                let (key, _) = codec::read_array::<PUBLIC_KEY_LEN>(body, off)?;
                RequestPayload::Register {
                    name: String::from_utf8_lossy(name).into_owned(),
                    public_key: PublicKey::from_bytes(key),
                }
            }
            RequestCode::ListPeers => RequestPayload::ListPeers,
            RequestCode::GetPublicKey => {
                let (id, _) = codec::read_array::<CLIENT_ID_LEN>(body, 0)?;
                RequestPayload::GetPublicKey {
                    target: ClientId::from_bytes(id),
                }
            }
            RequestCode::SendMessage => {
                let (id, off) = codec::read_array::<CLIENT_ID_LEN>(body, 0)?;
                let (kind, off) = codec::read_u8(body, off)?;
                let (len, off) = codec::read_u32(body, off)?;
                let (content, _) = codec::read_bytes(body, off, len as usize)?;
                RequestPayload::SendMessage(OutgoingMessage {
                    target: ClientId::from_bytes(id),
                    kind: MessageKind::from_code(kind)
                        .ok_or(Malformed::UnknownMessageKind(kind))?,
                    content: content.to_vec(),
                })
            }
            RequestCode::PollMessages => RequestPayload::PollMessages,
        };
        Ok(payload)
    }
}

/// One row of a PeerList response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: ClientId,
    pub name: String,
}

/// One queued message in a PendingMessages response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub sender: ClientId,
    pub message_id: u32,
    pub kind: MessageKind,
    pub content: Vec<u8>,
}

/// Response bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    RegisterOk { id: ClientId },
    PeerList(Vec<PeerRecord>),
    PublicKey { id: ClientId, public_key: PublicKey },
    MessageAccepted { target: ClientId, message_id: u32 },
    PendingMessages(Vec<PendingMessage>),
    GenericError,
}

impl ResponsePayload {
    pub fn code(&self) -> ResponseCode {
        match self {
            ResponsePayload::RegisterOk { .. } => ResponseCode::RegisterOk,
            ResponsePayload::PeerList(_) => ResponseCode::PeerList,
            ResponsePayload::PublicKey { .. } => ResponseCode::PublicKey,
            ResponsePayload::MessageAccepted { .. } => ResponseCode::MessageAccepted,
            ResponsePayload::PendingMessages(_) => ResponseCode::PendingMessages,
            ResponsePayload::GenericError => ResponseCode::GenericError,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ResponsePayload::RegisterOk { .. } => CLIENT_ID_LEN,
            ResponsePayload::PeerList(peers) => peers.len() * PEER_ENTRY_LEN,
            ResponsePayload::PublicKey { .. } => CLIENT_ID_LEN + PUBLIC_KEY_LEN,
            ResponsePayload::MessageAccepted { .. } => CLIENT_ID_LEN + 4,
            ResponsePayload::PendingMessages(msgs) => msgs
                .iter()
                .map(|m| PENDING_ENTRY_HEADER_LEN + m.content.len())
                .sum(),
            ResponsePayload::GenericError => 0,
        }
    }

    /// Server-side encoding; the client only decodes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; self.encoded_len()];
        let mut off = 0;
        match self {
            ResponsePayload::RegisterOk { id } => {
                off = codec::write_bytes(&mut buf, off, id.as_bytes())?;
            }
            ResponsePayload::PeerList(peers) => {
                for p in peers {
                    off = codec::write_bytes(&mut buf, off, p.id.as_bytes())?;
                    off = codec::write_padded(&mut buf, off, p.name.as_bytes(), NAME_FIELD_LEN)?;
                }
            }
            ResponsePayload::PublicKey { id, public_key } => {
                off = codec::write_bytes(&mut buf, off, id.as_bytes())?;
                off = codec::write_bytes(&mut buf, off, public_key.as_bytes())?;
            }
            ResponsePayload::MessageAccepted { target, message_id } => {
                off = codec::write_bytes(&mut buf, off, target.as_bytes())?;
                off = codec::write_u32(&mut buf, off, *message_id)?;
            }
            ResponsePayload::PendingMessages(msgs) => {
                for m in msgs {
                    let len = u32::try_from(m.content.len())
                        .map_err(|_| CodecError::LengthOverflow(m.content.len()))?;
                    off = codec::write_bytes(&mut buf, off, m.sender.as_bytes())?;
                    off = codec::write_u32(&mut buf, off, m.message_id)?;
                    off = codec::write_u8(&mut buf, off, m.kind.code())?;
                    off = codec::write_u32(&mut buf, off, len)?;
                    off = codec::write_bytes(&mut buf, off, &m.content)?;
                }
            }
            ResponsePayload::GenericError => {}
        }
        debug_assert_eq!(off, buf.len());
        Ok(buf)
    }

    /// Decode a response body given its (already contract-checked) kind.
    pub fn decode(code: u16, body: &[u8]) -> Result<Self, PayloadError> {
        Self::decode_body(code, body).map_err(PayloadError::MalformedResponse)
    }

    fn decode_body(code: u16, body: &[u8]) -> Result<Self, Malformed> {
        let code = ResponseCode::from_code(code).ok_or(Malformed::UnknownResponseKind(code))?;
        let payload = match code {
            ResponseCode::RegisterOk => {
                let (id, _) = codec::read_array::<CLIENT_ID_LEN>(body, 0)?;
                ResponsePayload::RegisterOk {
                    id: ClientId::from_bytes(id),
                }
            }
            ResponseCode::PeerList => {
                let mut peers = Vec::with_capacity(body.len() / PEER_ENTRY_LEN);
                let mut off = 0;
                while off < body.len() {
                    let (id, next) = codec::read_array::<CLIENT_ID_LEN>(body, off)?;
                    let (name, next) = codec::read_padded(body, next, NAME_FIELD_LEN)?;
                    peers.push(PeerRecord {
                        id: ClientId::from_bytes(id),
                        name: String::from_utf8_lossy(name).into_owned(),
                    });
                    off = next;
                }
                ResponsePayload::PeerList(peers)
            }
            ResponseCode::PublicKey => {
                let (id, off) = codec::read_array::<CLIENT_ID_LEN>(body, 0)?;
                let (key, _) = codec::read_array::<PUBLIC_KEY_LEN>(body, off)?;
                ResponsePayload::PublicKey {
                    id: ClientId::from_bytes(id),
                    public_key: PublicKey::from_bytes(key),
                }
            }
            ResponseCode::MessageAccepted => {
                let (id, off) = codec::read_array::<CLIENT_ID_LEN>(body, 0)?;
                let (message_id, _) = codec::read_u32(body, off)?;
                ResponsePayload::MessageAccepted {
                    target: ClientId::from_bytes(id),
                    message_id,
                }
            }
            ResponseCode::PendingMessages => {
                let mut msgs = Vec::new();
                let mut off = 0;
                while off < body.len() {
                    let (sender, next) = codec::read_array::<CLIENT_ID_LEN>(body, off)?;
                    let (message_id, next) = codec::read_u32(body, next)?;
                    let (kind, next) = codec::read_u8(body, next)?;
                    let (len, next) = codec::read_u32(body, next)?;
                    let (content, next) = codec::read_bytes(body, next, len as usize)?;
                    msgs.push(PendingMessage {
                        sender: ClientId::from_bytes(sender),
                        message_id,
                        kind: MessageKind::from_code(kind)
                            .ok_or(Malformed::UnknownMessageKind(kind))?,
                        content: content.to_vec(),
                    });
                    off = next;
                }
                ResponsePayload::PendingMessages(msgs)
            }
            ResponseCode::GenericError => ResponsePayload::GenericError,
        };
        Ok(payload)
    }
}
