//! Channel encryption handshake.
//!
//! The server opens with `ChannelEncryptRequest`; the client answers with a
//! freshly generated session key wrapped under the backend's RSA key and
//! switches to encrypted framing once `ChannelEncryptResult` reports OK.

use rand_core::CryptoRngCore;

use crate::crypt::{KeyExchange, SessionKey};
use crate::emsg::{EMsg, EResult};
use crate::error::ProtocolError;
use crate::header::Reader;
use crate::session::Session;

/// Channel protocol version sent in the response.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unencrypted,
    AwaitingEncryptResult,
    Encrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptRequest {
    pub protocol_version: u32,
    pub universe: u32,
}

impl EncryptRequest {
    /// Parses the request body. Trailing challenge bytes are ignored.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload, "encrypt request");
        Ok(Self { protocol_version: reader.u32()?, universe: reader.u32()? })
    }
}

/// Builds the `ChannelEncryptResponse` body for a wrapped key.
pub fn encode_response(wrapped_key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + wrapped_key.len());
    out.extend_from_slice(&CHANNEL_PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&(wrapped_key.len() as u32).to_le_bytes());
    out.extend_from_slice(wrapped_key);
    out.extend_from_slice(&crc32fast::hash(wrapped_key).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

pub fn parse_result(payload: &[u8]) -> Result<EResult, ProtocolError> {
    let mut reader = Reader::new(payload, "encrypt result");
    Ok(EResult::from(reader.u32()?))
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    pending: Option<SessionKey>,
    exchange: KeyExchange,
}

impl Handshake {
    pub fn new(exchange: KeyExchange) -> Self {
        Self { state: HandshakeState::Unencrypted, pending: None, exchange }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Encrypted
    }

    pub fn reset(&mut self) {
        self.state = HandshakeState::Unencrypted;
        self.pending = None;
    }

    /// Handles `ChannelEncryptRequest` and returns the response body.
    pub fn on_request<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        if self.state != HandshakeState::Unencrypted {
            return Err(ProtocolError::UnexpectedHandshake(EMsg::CHANNEL_ENCRYPT_REQUEST));
        }

        let request = EncryptRequest::parse(payload)?;
        log::debug!(
            "channel encrypt request: protocol {} universe {}",
            request.protocol_version,
            request.universe
        );

        let (key, wrapped) = self.exchange.generate(rng)?;
        self.pending = Some(key);
        self.state = HandshakeState::AwaitingEncryptResult;
        Ok(encode_response(&wrapped))
    }

    /// Handles `ChannelEncryptResult`, moving the key into `session` on OK.
    pub fn on_result(
        &mut self,
        payload: &[u8],
        session: &mut Session,
    ) -> Result<(), ProtocolError> {
        if self.state != HandshakeState::AwaitingEncryptResult {
            return Err(ProtocolError::UnexpectedHandshake(EMsg::CHANNEL_ENCRYPT_RESULT));
        }

        let result = parse_result(payload)?;
        if !result.is_ok() {
            log::warn!("channel encryption rejected: {result:?}");
            self.reset();
            return Err(ProtocolError::HandshakeRejected(result));
        }

        let key = self.pending.take().ok_or(ProtocolError::Cipher("no pending session key"))?;
        session.key = Some(key);
        session.encrypted = true;
        self.state = HandshakeState::Encrypted;
        Ok(())
    }
}
