//! MessageU wire protocol: codes, field sizes and the request/response contract.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version byte carried in every request and response header.
pub const PROTOCOL_VERSION: u8 = 1;

pub const CLIENT_ID_LEN: usize = 16;
pub const NAME_FIELD_LEN: usize = 255;
pub const PUBLIC_KEY_LEN: usize = 160;

/// identity(16) + version(1) + code(2) + body length(4).
pub const REQUEST_HEADER_LEN: usize = CLIENT_ID_LEN + 1 + 2 + 4;
/// version(1) + code(2) + body length(4).
pub const RESPONSE_HEADER_LEN: usize = 1 + 2 + 4;

/// Request kinds sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum RequestCode {
    Register = 600,
    ListPeers = 601,
    GetPublicKey = 602,
    SendMessage = 603,
    PollMessages = 604,
}

impl RequestCode {
    pub const ALL: [RequestCode; 5] = [
        RequestCode::Register,
        RequestCode::ListPeers,
        RequestCode::GetPublicKey,
        RequestCode::SendMessage,
        RequestCode::PollMessages,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

/// Response kinds sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResponseCode {
    RegisterOk = 2100,
    PeerList = 2101,
    PublicKey = 2102,
    MessageAccepted = 2103,
    PendingMessages = 2104,
    GenericError = 9000,
}

impl ResponseCode {
    pub const ALL: [ResponseCode; 6] = [
        ResponseCode::RegisterOk,
        ResponseCode::PeerList,
        ResponseCode::PublicKey,
        ResponseCode::MessageAccepted,
        ResponseCode::PendingMessages,
        ResponseCode::GenericError,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

/// Sub-kind carried inside SendMessage and PendingMessages bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    RequestSymmetricKey = 1,
    DeliverSymmetricKey = 2,
    DeliverText = 3,
    DeliverFile = 4,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageKind::RequestSymmetricKey),
            2 => Some(MessageKind::DeliverSymmetricKey),
            3 => Some(MessageKind::DeliverText),
            4 => Some(MessageKind::DeliverFile),
            _ => None,
        }
    }
}

/// Expected body length for an acceptable response kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLen {
    Exact(u32),
    Variable,
}

impl fmt::Display for BodyLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyLen::Exact(n) => write!(f, "{n}"),
            BodyLen::Variable => f.write_str("variable"),
        }
    }
}

const ID: u32 = CLIENT_ID_LEN as u32;
const PUB: u32 = PUBLIC_KEY_LEN as u32;

/// Response kinds (and body lengths) the server may legally answer `request` with.
pub fn acceptable_responses(request: RequestCode) -> &'static [(ResponseCode, BodyLen)] {
    match request {
        RequestCode::Register => &[
            (ResponseCode::RegisterOk, BodyLen::Exact(ID)),
            (ResponseCode::GenericError, BodyLen::Exact(0)),
        ],
        RequestCode::ListPeers => &[
            (ResponseCode::PeerList, BodyLen::Variable),
            (ResponseCode::GenericError, BodyLen::Exact(0)),
        ],
        RequestCode::GetPublicKey => &[
            (ResponseCode::PublicKey, BodyLen::Exact(ID + PUB)),
            (ResponseCode::GenericError, BodyLen::Exact(0)),
        ],
        RequestCode::SendMessage => &[
            (ResponseCode::MessageAccepted, BodyLen::Exact(ID + 4)),
            (ResponseCode::GenericError, BodyLen::Exact(0)),
        ],
        RequestCode::PollMessages => &[
            (ResponseCode::PendingMessages, BodyLen::Variable),
            (ResponseCode::GenericError, BodyLen::Exact(0)),
        ],
    }
}

/// A response that does not fit the contract of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("received a response with no request in flight")]
    UnexpectedRequestContext,
    #[error("response kind {got} is not a valid answer to {request:?}")]
    UnexpectedResponseKind { request: RequestCode, got: u16 },
    #[error("{response:?} body is {got} bytes, expected {expected}")]
    UnexpectedResponseSize {
        response: ResponseCode,
        expected: u32,
        got: u32,
    },
    #[error("{response:?} body of {got} bytes exceeds limit of {limit}")]
    ResponseTooLarge {
        response: ResponseCode,
        limit: u32,
        got: u32,
    },
    #[error("public key response for {got}, requested {expected}")]
    MismatchedIdentity { expected: String, got: String },
}

/// Check a received header against the request that was just sent.
/// Runs before any body byte is read: the declared length decides how much to read.
pub fn validate_response(
    last_sent: Option<RequestCode>,
    response_code: u16,
    body_len: u32,
) -> Result<ResponseCode, ProtocolViolation> {
    let request = last_sent.ok_or(ProtocolViolation::UnexpectedRequestContext)?;
    let (response, expected) = acceptable_responses(request)
        .iter()
        .find(|(r, _)| r.code() == response_code)
        .copied()
        .ok_or(ProtocolViolation::UnexpectedResponseKind {
            request,
            got: response_code,
        })?;
    if let BodyLen::Exact(expected) = expected {
        if expected != body_len {
            return Err(ProtocolViolation::UnexpectedResponseSize {
                response,
                expected,
                got: body_len,
            });
        }
    }
    Ok(response)
}
