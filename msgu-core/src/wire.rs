//! Framing: fixed-layout request header (23 bytes) and response header (7 bytes) around a body.

use crate::codec::{self, CodecError};
use crate::identity::ClientId;
use crate::payload::{PayloadError, RequestPayload, ResponsePayload};
use crate::protocol::{CLIENT_ID_LEN, PROTOCOL_VERSION, REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: ClientId,
    pub version: u8,
    pub code: u16,
    pub body_len: u32,
}

impl RequestHeader {
    pub fn encode(&self) -> Result<[u8; REQUEST_HEADER_LEN], CodecError> {
        let mut out = [0u8; REQUEST_HEADER_LEN];
        let off = codec::write_bytes(&mut out, 0, self.client_id.as_bytes())?;
        let off = codec::write_u8(&mut out, off, self.version)?;
        let off = codec::write_u16(&mut out, off, self.code)?;
        codec::write_u32(&mut out, off, self.body_len)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (id, off) = codec::read_array::<CLIENT_ID_LEN>(bytes, 0)?;
        let (version, off) = codec::read_u8(bytes, off)?;
        let (code, off) = codec::read_u16(bytes, off)?;
        let (body_len, _) = codec::read_u32(bytes, off)?;
        Ok(Self {
            client_id: ClientId::from_bytes(id),
            version,
            code,
            body_len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub body_len: u32,
}

impl ResponseHeader {
    pub fn encode(&self) -> Result<[u8; RESPONSE_HEADER_LEN], CodecError> {
        let mut out = [0u8; RESPONSE_HEADER_LEN];
        let off = codec::write_u8(&mut out, 0, self.version)?;
        let off = codec::write_u16(&mut out, off, self.code)?;
        codec::write_u32(&mut out, off, self.body_len)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (version, off) = codec::read_u8(bytes, 0)?;
        let (code, off) = codec::read_u16(bytes, off)?;
        let (body_len, _) = codec::read_u32(bytes, off)?;
        Ok(Self {
            version,
            code,
            body_len,
        })
    }
}

/// An outgoing request: sender identity plus typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub client_id: ClientId,
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(client_id: ClientId, payload: RequestPayload) -> Self {
        Self { client_id, payload }
    }

    pub fn header(&self) -> Result<RequestHeader, CodecError> {
        let len = self.payload.encoded_len();
        Ok(RequestHeader {
            client_id: self.client_id,
            version: PROTOCOL_VERSION,
            code: self.payload.code().code(),
            body_len: u32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?,
        })
    }

    /// Header and body in one buffer; the header length always equals the body length.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let header = self.header()?.encode()?;
        let body = self.payload.encode()?;
        let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode one full request frame (server side / tests).
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let malformed = |e: CodecError| PayloadError::MalformedRequest(e.into());
        let header = RequestHeader::decode(bytes).map_err(malformed)?;
        let (body, _) = codec::read_bytes(bytes, REQUEST_HEADER_LEN, header.body_len as usize)
            .map_err(malformed)?;
        Ok(Self {
            client_id: header.client_id,
            payload: RequestPayload::decode(header.code, body)?,
        })
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub payload: ResponsePayload,
}

impl Response {
    /// Build a response with a header consistent with its body (server side / tests).
    pub fn new(payload: ResponsePayload) -> Result<Self, CodecError> {
        let len = payload.encoded_len();
        Ok(Self {
            header: ResponseHeader {
                version: PROTOCOL_VERSION,
                code: payload.code().code(),
                body_len: u32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?,
            },
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let header = self.header.encode()?;
        let body = self.payload.encode()?;
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(out)
    }
}
