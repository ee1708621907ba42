//! Per-connection message engine.
//!
//! The dispatcher owns the [`Session`] and the handshake state. The host
//! drives it with [`SessionDispatcher::connected`] and
//! [`SessionDispatcher::readable`], and it writes complete frames to the
//! injected [`FrameSink`]. Nothing in here blocks or spawns.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use prost::Message;
use rand_core::OsRng;

use crate::crypt::KeyExchange;
use crate::emsg::{EMsg, EResult};
use crate::error::ProtocolError;
use crate::frame::{self, FRAME_HEADER_LEN};
use crate::handshake::{Handshake, HandshakeState};
use crate::header::MessageHeader;
use crate::ids::AccountId;
use crate::multi::{self, MAX_MULTI_DEPTH};
use crate::proto::{
    CMsgClientHeartBeat, CMsgClientLoggedOff, CMsgClientLogon, CMsgClientLogonResponse,
};
use crate::session::Session;

pub const PROTOCOL_VERSION: u32 = 65575;

/// Destination for encoded frames.
pub trait FrameSink {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ProtocolError>;
}

/// Starts the periodic heartbeat once a logon succeeds.
///
/// The host calls [`SessionDispatcher::heartbeat`] on every tick.
pub trait HeartbeatScheduler {
    fn schedule_heartbeat(&mut self, interval: Duration);
}

impl FrameSink for Vec<Vec<u8>> {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.push(frame);
        Ok(())
    }
}

/// A decoded inbound message handed to handlers.
#[derive(Debug)]
pub struct IncomingMessage<'a> {
    pub emsg: EMsg,
    pub header: &'a MessageHeader,
    /// Source job of the sender; pass it back as the job id of a reply.
    pub job_id: u64,
    pub payload: &'a [u8],
}

impl IncomingMessage<'_> {
    pub fn is_protobuf(&self) -> bool {
        self.header.is_protobuf()
    }

    pub fn decode<M: Message + Default>(&self) -> Result<M, ProtocolError> {
        Ok(M::decode(self.payload)?)
    }
}

/// An outbound message body waiting for its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub emsg: EMsg,
    pub protobuf: bool,
    pub job_id: u64,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn protobuf<M: Message>(emsg: EMsg, message: &M, job_id: u64) -> Self {
        Self { emsg, protobuf: true, job_id, body: message.encode_to_vec() }
    }

    pub fn legacy(emsg: EMsg, body: impl Into<Vec<u8>>, job_id: u64) -> Self {
        Self { emsg, protobuf: false, job_id, body: body.into() }
    }
}

/// Replies queued by a handler, sent once the handler returns.
#[derive(Debug, Default)]
pub struct Replies {
    queue: Vec<OutgoingMessage>,
}

impl Replies {
    pub fn send<M: Message>(&mut self, emsg: EMsg, message: &M, job_id: u64) {
        self.queue.push(OutgoingMessage::protobuf(emsg, message, job_id));
    }

    pub fn send_legacy(&mut self, emsg: EMsg, body: impl Into<Vec<u8>>, job_id: u64) {
        self.queue.push(OutgoingMessage::legacy(emsg, body, job_id));
    }

    pub fn push(&mut self, message: OutgoingMessage) {
        self.queue.push(message);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    HandshakeComplete,
    LoggedOn { result: EResult, identity: AccountId, heartbeat: Option<Duration> },
    LoggedOff { result: EResult },
    Unhandled { emsg: EMsg },
}

#[derive(Clone, Default)]
pub struct LogOnDetails {
    pub account_name: String,
    pub password: String,
    pub auth_code: Option<String>,
    /// SHA-1 of the sentry file from a previous machine-auth exchange.
    pub sentry_hash: Option<Vec<u8>>,
    pub cell_id: Option<u32>,
    /// Identity to present instead of the default individual account.
    pub identity: Option<AccountId>,
}

impl fmt::Debug for LogOnDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogOnDetails")
            .field("account_name", &self.account_name)
            .field("password", &"<redacted>")
            .field("auth_code", &self.auth_code.as_ref().map(|_| "<redacted>"))
            .field("sentry_hash", &self.sentry_hash.is_some())
            .field("cell_id", &self.cell_id)
            .field("identity", &self.identity)
            .finish()
    }
}

pub type Handler = Box<dyn FnMut(&IncomingMessage<'_>, &mut Replies) + Send>;

pub struct SessionDispatcher<S, T> {
    session: Session,
    handshake: Handshake,
    sink: S,
    scheduler: T,
    handlers: HashMap<EMsg, Handler>,
    events: VecDeque<SessionEvent>,
    protocol_version: u32,
}

impl<S: FrameSink, T: HeartbeatScheduler> SessionDispatcher<S, T> {
    pub fn new(exchange: KeyExchange, sink: S, scheduler: T) -> Self {
        Self {
            session: Session::new(),
            handshake: Handshake::new(exchange),
            sink,
            scheduler,
            handlers: HashMap::new(),
            events: VecDeque::new(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn with_protocol_version(mut self, protocol_version: u32) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn scheduler(&self) -> &T {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut T {
        &mut self.scheduler
    }

    /// Resets per-connection state for a fresh socket and returns the number
    /// of bytes to read next.
    pub fn connected(&mut self) -> usize {
        log::info!("cm connection established, awaiting channel encryption");
        self.session.reset();
        self.handshake.reset();
        FRAME_HEADER_LEN
    }

    /// Feeds the bytes the previous call asked for. Alternates between the
    /// 8-byte frame header and the frame body; returns the next read size.
    pub fn readable(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let Some(len) = self.session.pending_len.take() else {
            let len = frame::decode_header(data)?;
            self.session.pending_len = Some(len);
            return Ok(len);
        };

        if data.len() < len {
            return Err(ProtocolError::Truncated {
                what: "frame body",
                needed: len,
                available: data.len(),
            });
        }
        let message = frame::decode_body(&data[..len], &self.session, self.session.encrypted)?;
        self.read_message(&message, 0)?;
        Ok(FRAME_HEADER_LEN)
    }

    pub fn register<F>(&mut self, emsg: EMsg, handler: F)
    where
        F: FnMut(&IncomingMessage<'_>, &mut Replies) + Send + 'static,
    {
        self.handlers.insert(emsg, Box::new(handler));
    }

    pub fn unregister(&mut self, emsg: EMsg) -> bool {
        self.handlers.remove(&emsg).is_some()
    }

    pub fn take_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Sends a protobuf message with a protobuf-prefixed header.
    pub fn send<M: Message>(
        &mut self,
        emsg: EMsg,
        message: &M,
        job_id: u64,
    ) -> Result<(), ProtocolError> {
        self.send_message(OutgoingMessage::protobuf(emsg, message, job_id))
    }

    /// Sends a raw body with the extended header.
    pub fn send_legacy(
        &mut self,
        emsg: EMsg,
        body: &[u8],
        job_id: u64,
    ) -> Result<(), ProtocolError> {
        self.send_message(OutgoingMessage::legacy(emsg, body, job_id))
    }

    pub fn heartbeat(&mut self) -> Result<(), ProtocolError> {
        self.send(EMsg::CLIENT_HEART_BEAT, &CMsgClientHeartBeat {}, 0)
    }

    pub fn log_on(&mut self, details: &LogOnDetails) -> Result<(), ProtocolError> {
        if let Some(identity) = details.identity {
            self.session.identity = identity;
        }

        let logon = CMsgClientLogon {
            protocol_version: Some(self.protocol_version),
            cell_id: details.cell_id,
            account_name: Some(details.account_name.clone()),
            password: Some(details.password.clone()),
            sha_sentryfile: details.sentry_hash.clone(),
            auth_code: details.auth_code.clone(),
            ..Default::default()
        };
        log::info!("logging on as {}", details.account_name);
        self.send(EMsg::CLIENT_LOGON, &logon, 0)
    }

    pub fn send_message(&mut self, message: OutgoingMessage) -> Result<(), ProtocolError> {
        if !message.emsg.is_handshake() && !self.handshake.is_complete() {
            return Err(ProtocolError::NotEncrypted(message.emsg));
        }
        let header =
            MessageHeader::outgoing(message.emsg, &self.session, message.job_id, message.protobuf);
        self.write(message.emsg, &header.build(&message.body))
    }

    fn write(&mut self, emsg: EMsg, message: &[u8]) -> Result<(), ProtocolError> {
        let encrypt = self.session.encrypted && !emsg.is_handshake();
        let frame = frame::encode(message, &self.session, encrypt)?;
        log::trace!("-> {emsg:?} ({} bytes, encrypted: {encrypt})", message.len());
        self.sink.send_frame(frame)
    }

    fn read_message(&mut self, data: &[u8], depth: usize) -> Result<(), ProtocolError> {
        let (header, payload) = MessageHeader::parse(data)?;
        let emsg = header.emsg();
        log::trace!("<- {emsg:?} ({} byte payload)", payload.len());

        if let MessageHeader::Protobuf(proto) = &header {
            if proto.header_len > 0 && self.session.session_id == 0 {
                let session_id = proto.header.client_sessionid.unwrap_or(0);
                let identity = AccountId::from_raw(proto.header.steamid.unwrap_or(0));
                if self.session.latch(session_id, identity) {
                    log::debug!("session latched: id {session_id}, identity {identity}");
                }
            }
        }

        if !emsg.is_handshake() && !self.handshake.is_complete() {
            return Err(ProtocolError::NotEncrypted(emsg));
        }

        let incoming =
            IncomingMessage { emsg, header: &header, job_id: header.source_job(), payload };
        match emsg {
            EMsg::CHANNEL_ENCRYPT_REQUEST => {
                let response = self.handshake.on_request(&mut OsRng, payload)?;
                let message =
                    MessageHeader::minimal(EMsg::CHANNEL_ENCRYPT_RESPONSE).build(&response);
                self.write(EMsg::CHANNEL_ENCRYPT_RESPONSE, &message)
            }
            EMsg::CHANNEL_ENCRYPT_RESULT => {
                self.handshake.on_result(payload, &mut self.session)?;
                log::info!("channel encryption established");
                self.events.push_back(SessionEvent::HandshakeComplete);
                Ok(())
            }
            EMsg::CHANNEL_ENCRYPT_RESPONSE => Err(ProtocolError::UnexpectedHandshake(emsg)),
            EMsg::MULTI => {
                if depth >= MAX_MULTI_DEPTH {
                    return Err(ProtocolError::NestingTooDeep(MAX_MULTI_DEPTH));
                }
                for message in multi::expand(payload)? {
                    self.read_message(&message, depth + 1)?;
                }
                Ok(())
            }
            EMsg::CLIENT_LOG_ON_RESPONSE => {
                self.on_log_on_response(&incoming)?;
                self.dispatch(&incoming)?;
                Ok(())
            }
            EMsg::CLIENT_LOGGED_OFF => {
                let logged_off: CMsgClientLoggedOff = incoming.decode()?;
                let result = EResult(logged_off.eresult.unwrap_or(EResult::INVALID.0));
                log::info!("logged off: {result:?}");
                self.events.push_back(SessionEvent::LoggedOff { result });
                self.dispatch(&incoming)?;
                Ok(())
            }
            _ => {
                if !self.dispatch(&incoming)? {
                    log::debug!("no handler for {emsg:?}");
                    self.events.push_back(SessionEvent::Unhandled { emsg });
                }
                Ok(())
            }
        }
    }

    fn on_log_on_response(&mut self, incoming: &IncomingMessage<'_>) -> Result<(), ProtocolError> {
        let response: CMsgClientLogonResponse = incoming.decode()?;
        let result = EResult(response.eresult.unwrap_or(EResult::INVALID.0));
        let heartbeat = response
            .out_of_game_heartbeat_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64));

        if result.is_ok() {
            log::info!("logged on as {}", self.session.identity);
            if let Some(interval) = heartbeat {
                self.scheduler.schedule_heartbeat(interval);
            }
        } else {
            log::warn!("logon failed: {result:?}");
        }

        let identity = self.session.identity;
        self.events.push_back(SessionEvent::LoggedOn { result, identity, heartbeat });
        Ok(())
    }

    /// Runs the registered handler, if any, and sends what it queued.
    fn dispatch(&mut self, incoming: &IncomingMessage<'_>) -> Result<bool, ProtocolError> {
        let Some(handler) = self.handlers.get_mut(&incoming.emsg) else {
            return Ok(false);
        };
        let mut replies = Replies::default();
        handler(incoming, &mut replies);
        for reply in replies.queue {
            self.send_message(reply)?;
        }
        Ok(true)
    }
}

impl<S, T> fmt::Debug for SessionDispatcher<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDispatcher")
            .field("session", &self.session)
            .field("handshake", &self.handshake.state())
            .field("handlers", &self.handlers.len())
            .field("events", &self.events.len())
            .finish()
    }
}
