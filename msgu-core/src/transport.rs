//! Transport session: one blocking stream, strictly one request in flight.
//!
//! `receive_response` reads the 7-byte header, checks it against the contract
//! of the last request sent, and only then reads exactly the declared body.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use tracing::{debug, warn};

use crate::codec::CodecError;
use crate::payload::{PayloadError, ResponsePayload};
use crate::protocol::{self, ProtocolViolation, RequestCode, PROTOCOL_VERSION, RESPONSE_HEADER_LEN};
use crate::wire::{Request, Response, ResponseHeader};

/// Default cap on a variable-length response body (64 MiB).
pub const DEFAULT_MAX_RESPONSE_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Payload(#[from] PayloadError),
    #[error("connection is out of sync after an earlier failure")]
    Desynchronized,
}

/// Owns the byte stream. No other component reads or writes it.
pub struct Transport<S> {
    stream: S,
    last_sent: Option<RequestCode>,
    max_response_len: u32,
    desynced: bool,
}

/// Connect to the directory server over TCP.
pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Transport<TcpStream>, TransportError> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "connected");
    Ok(Transport::new(stream))
}

impl<S: Read + Write> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            last_sent: None,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            desynced: false,
        }
    }

    /// Cap on variable-length response bodies; larger ones are rejected before reading.
    pub fn with_max_response_len(mut self, limit: u32) -> Self {
        self.max_response_len = limit;
        self
    }

    /// Request kind awaiting its response, if any.
    pub fn in_flight(&self) -> Option<RequestCode> {
        self.last_sent
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desynced
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Frame and write the whole request.
    pub fn send(&mut self, request: &Request) -> Result<(), TransportError> {
        if self.desynced {
            return Err(TransportError::Desynchronized);
        }
        let bytes = request.encode()?;
        let code = request.payload.code();
        debug!(kind = ?code, body_len = bytes.len() - protocol::REQUEST_HEADER_LEN, "sending request");
        let written = self
            .stream
            .write_all(&bytes)
            .and_then(|_| self.stream.flush());
        if let Err(e) = written {
            self.desynced = true;
            return Err(e.into());
        }
        self.last_sent = Some(code);
        Ok(())
    }

    /// Read and decode the response to the last request sent.
    ///
    /// A body that fails to decode has still been read in full, so only that
    /// request fails. I/O errors and contract violations leave the stream at an
    /// unknown position and make the session unusable.
    pub fn receive_response(&mut self) -> Result<Response, TransportError> {
        if self.desynced {
            return Err(TransportError::Desynchronized);
        }
        let result = self.read_response();
        match &result {
            Ok(_) => self.last_sent = None,
            Err(e @ TransportError::Payload(_)) => {
                warn!(error = %e, "response body rejected");
                self.last_sent = None;
            }
            Err(e) => {
                warn!(error = %e, "response rejected, connection unusable");
                self.desynced = true;
            }
        }
        result
    }

    /// `send` followed by `receive_response`.
    pub fn exchange(&mut self, request: &Request) -> Result<Response, TransportError> {
        self.send(request)?;
        self.receive_response()
    }

    fn read_response(&mut self) -> Result<Response, TransportError> {
        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        self.stream.read_exact(&mut raw)?;
        let header = ResponseHeader::decode(&raw)?;
        debug!(code = header.code, body_len = header.body_len, "response header");
        if header.version != PROTOCOL_VERSION {
            warn!(version = header.version, "response carries unexpected protocol version");
        }
        let kind = protocol::validate_response(self.last_sent, header.code, header.body_len)?;
        if header.body_len > self.max_response_len {
            return Err(ProtocolViolation::ResponseTooLarge {
                response: kind,
                limit: self.max_response_len,
                got: header.body_len,
            }
            .into());
        }
        let mut body = vec![0u8; header.body_len as usize];
        self.stream.read_exact(&mut body)?;
        let payload = ResponsePayload::decode(header.code, &body)?;
        Ok(Response { header, payload })
    }
}
