//! Message headers.
//!
//! The raw type field is read first and selects one of three shapes:
//! - minimal (20 bytes) for the channel encryption messages,
//! - protobuf-prefixed when the high bit of the type field is set,
//! - extended (36 bytes) for every other legacy message.

use prost::Message as _;

use crate::emsg::EMsg;
use crate::error::ProtocolError;
use crate::ids::AccountId;
use crate::proto::CMsgProtoBufHeader;
use crate::session::Session;

pub const JOB_ID_NONE: u64 = u64::MAX;

pub const MINIMAL_HEADER_LEN: usize = 20;
pub const EXTENDED_HEADER_LEN: usize = 36;
pub const PROTOBUF_PREFIX_LEN: usize = 8;

pub const EXTENDED_HEADER_VERSION: u16 = 2;
pub const EXTENDED_HEADER_CANARY: u8 = 239;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimalHeader {
    pub emsg: EMsg,
    pub target_job: u64,
    pub source_job: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub emsg: EMsg,
    pub header_size: u8,
    pub header_version: u16,
    pub target_job: u64,
    pub source_job: u64,
    pub canary: u8,
    pub sender: AccountId,
    pub session_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtobufHeader {
    pub emsg: EMsg,
    /// Length of the embedded header as declared on the wire.
    pub header_len: usize,
    pub header: CMsgProtoBufHeader,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageHeader {
    Minimal(MinimalHeader),
    Extended(ExtendedHeader),
    Protobuf(ProtobufHeader),
}

impl MinimalHeader {
    pub fn new(emsg: EMsg) -> Self {
        Self { emsg, target_job: JOB_ID_NONE, source_job: JOB_ID_NONE }
    }
}

impl ExtendedHeader {
    pub fn new(emsg: EMsg, session: &Session, job_id: u64) -> Self {
        Self {
            emsg,
            header_size: EXTENDED_HEADER_LEN as u8,
            header_version: EXTENDED_HEADER_VERSION,
            target_job: if job_id != 0 { job_id } else { JOB_ID_NONE },
            source_job: JOB_ID_NONE,
            canary: EXTENDED_HEADER_CANARY,
            sender: session.identity,
            session_id: session.session_id,
        }
    }
}

impl ProtobufHeader {
    pub fn new(emsg: EMsg, session: &Session, job_id: u64) -> Self {
        let header = CMsgProtoBufHeader {
            steamid: Some(session.identity.raw()),
            client_sessionid: Some(session.session_id),
            jobid_target: (job_id != 0).then_some(job_id),
            ..Default::default()
        };
        Self { emsg, header_len: header.encoded_len(), header }
    }
}

impl MessageHeader {
    pub fn minimal(emsg: EMsg) -> Self {
        Self::Minimal(MinimalHeader::new(emsg))
    }

    pub fn extended(emsg: EMsg, session: &Session, job_id: u64) -> Self {
        if emsg.is_handshake() {
            return Self::minimal(emsg);
        }
        Self::Extended(ExtendedHeader::new(emsg, session, job_id))
    }

    pub fn protobuf(emsg: EMsg, session: &Session, job_id: u64) -> Self {
        if emsg.is_handshake() {
            return Self::minimal(emsg);
        }
        Self::Protobuf(ProtobufHeader::new(emsg, session, job_id))
    }

    /// Header for an outgoing message. Handshake messages always get the
    /// minimal shape.
    pub fn outgoing(emsg: EMsg, session: &Session, job_id: u64, protobuf: bool) -> Self {
        if protobuf {
            Self::protobuf(emsg, session, job_id)
        } else {
            Self::extended(emsg, session, job_id)
        }
    }

    pub fn emsg(&self) -> EMsg {
        match self {
            Self::Minimal(h) => h.emsg,
            Self::Extended(h) => h.emsg,
            Self::Protobuf(h) => h.emsg,
        }
    }

    pub fn is_protobuf(&self) -> bool {
        matches!(self, Self::Protobuf(_))
    }

    /// Correlation id of the sender's job, used when replying.
    pub fn source_job(&self) -> u64 {
        match self {
            Self::Minimal(h) => h.source_job,
            Self::Extended(h) => h.source_job,
            Self::Protobuf(h) => h.header.jobid_source.unwrap_or(JOB_ID_NONE),
        }
    }

    pub fn target_job(&self) -> u64 {
        match self {
            Self::Minimal(h) => h.target_job,
            Self::Extended(h) => h.target_job,
            Self::Protobuf(h) => h.header.jobid_target.unwrap_or(JOB_ID_NONE),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Minimal(_) => MINIMAL_HEADER_LEN,
            Self::Extended(_) => EXTENDED_HEADER_LEN,
            Self::Protobuf(h) => PROTOBUF_PREFIX_LEN + h.header.encoded_len(),
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Minimal(h) => {
                out.extend_from_slice(&h.emsg.to_raw(false).to_le_bytes());
                out.extend_from_slice(&h.target_job.to_le_bytes());
                out.extend_from_slice(&h.source_job.to_le_bytes());
            }
            Self::Extended(h) => {
                out.extend_from_slice(&h.emsg.to_raw(false).to_le_bytes());
                out.push(h.header_size);
                out.extend_from_slice(&h.header_version.to_le_bytes());
                out.extend_from_slice(&h.target_job.to_le_bytes());
                out.extend_from_slice(&h.source_job.to_le_bytes());
                out.push(h.canary);
                out.extend_from_slice(&h.sender.raw().to_le_bytes());
                out.extend_from_slice(&h.session_id.to_le_bytes());
            }
            Self::Protobuf(h) => {
                let embedded = h.header.encode_to_vec();
                out.extend_from_slice(&h.emsg.to_raw(true).to_le_bytes());
                out.extend_from_slice(&(embedded.len() as i32).to_le_bytes());
                out.extend_from_slice(&embedded);
            }
        }
    }

    /// Header bytes followed by `payload`.
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() + payload.len());
        self.encode_into(&mut out);
        out.extend_from_slice(payload);
        out
    }

    /// Parses the header at the start of `data` and returns it with the
    /// remaining payload.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let mut reader = Reader::new(data, "message header");
        let (emsg, protobuf) = EMsg::from_raw(reader.u32()?);

        if emsg.is_handshake() {
            let target_job = reader.u64()?;
            let source_job = reader.u64()?;
            let header = MinimalHeader { emsg, target_job, source_job };
            return Ok((Self::Minimal(header), reader.rest()));
        }

        if protobuf {
            let declared = reader.i32()?;
            let header_len = usize::try_from(declared)
                .map_err(|_| ProtocolError::NegativeHeaderLength(declared))?;
            let embedded = reader.take(header_len)?;
            let header = CMsgProtoBufHeader::decode(embedded)?;
            let header = ProtobufHeader { emsg, header_len, header };
            return Ok((Self::Protobuf(header), reader.rest()));
        }

        let header = ExtendedHeader {
            emsg,
            header_size: reader.u8()?,
            header_version: reader.u16()?,
            target_job: reader.u64()?,
            source_job: reader.u64()?,
            canary: reader.u8()?,
            sender: AccountId::from_raw(reader.u64()?),
            session_id: reader.i32()?,
        };
        Ok((Self::Extended(header), reader.rest()))
    }
}

/// Little-endian cursor over a borrowed buffer.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.data.len() - self.pos;
        if len > available {
            return Err(ProtocolError::Truncated { what: self.what, needed: len, available });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emsg::PROTO_MASK;

    fn session() -> Session {
        let mut session = Session::new();
        session.latch(-1234, AccountId::individual(22202));
        session
    }

    #[test]
    fn protobuf_roundtrip_preserves_routing() {
        let session = session();
        let header = MessageHeader::outgoing(EMsg::CLIENT_LOGON, &session, 77, true);
        let bytes = header.build(b"body");

        let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(raw, EMsg::CLIENT_LOGON.0 | PROTO_MASK);

        let (parsed, payload) = MessageHeader::parse(&bytes).expect("parse");
        assert_eq!(payload, b"body");
        let MessageHeader::Protobuf(parsed) = parsed else {
            panic!("expected protobuf header");
        };
        assert_eq!(parsed.emsg, EMsg::CLIENT_LOGON);
        assert_eq!(parsed.header.client_sessionid, Some(-1234));
        assert_eq!(parsed.header.steamid, Some(AccountId::individual(22202).raw()));
        assert_eq!(parsed.header.jobid_target, Some(77));
    }

    #[test]
    fn zero_job_id_is_omitted() {
        let header = ProtobufHeader::new(EMsg::CLIENT_HEART_BEAT, &session(), 0);
        assert_eq!(header.header.jobid_target, None);
        assert_eq!(MessageHeader::Protobuf(header).target_job(), JOB_ID_NONE);
    }

    #[test]
    fn handshake_types_never_get_protobuf_bit() {
        let header = MessageHeader::outgoing(EMsg::CHANNEL_ENCRYPT_RESPONSE, &session(), 5, true);
        assert!(matches!(header, MessageHeader::Minimal(_)));
        let bytes = header.build(&[]);
        assert_eq!(bytes.len(), MINIMAL_HEADER_LEN);
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 1304);
    }

    #[test]
    fn handshake_parse_ignores_protobuf_bit() {
        let mut bytes = MessageHeader::minimal(EMsg::CHANNEL_ENCRYPT_RESULT).build(&[1, 0, 0, 0]);
        bytes[3] |= 0x80;
        let (header, payload) = MessageHeader::parse(&bytes).expect("parse");
        assert!(
            matches!(header, MessageHeader::Minimal(h) if h.emsg == EMsg::CHANNEL_ENCRYPT_RESULT)
        );
        assert_eq!(payload, &[1, 0, 0, 0]);
    }

    #[test]
    fn extended_layout() {
        let header = MessageHeader::outgoing(EMsg::CLIENT_JOIN_CHAT, &session(), 0, false);
        let bytes = header.build(&[9]);
        assert_eq!(bytes.len(), EXTENDED_HEADER_LEN + 1);
        assert_eq!(bytes[4], 36);
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 2);
        assert_eq!(bytes[23], 239);

        let (parsed, payload) = MessageHeader::parse(&bytes).expect("parse");
        assert_eq!(payload, &[9]);
        let MessageHeader::Extended(parsed) = parsed else {
            panic!("expected extended header");
        };
        assert_eq!(parsed.sender, AccountId::individual(22202));
        assert_eq!(parsed.session_id, -1234);
        assert_eq!(parsed.target_job, JOB_ID_NONE);
    }

    #[test]
    fn rejects_negative_header_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(EMsg::CLIENT_LOGON.0 | PROTO_MASK).to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        let err = MessageHeader::parse(&bytes).expect_err("negative length");
        assert!(matches!(err, ProtocolError::NegativeHeaderLength(-1)));
    }

    #[test]
    fn rejects_overrunning_header_length() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(EMsg::CLIENT_LOGON.0 | PROTO_MASK).to_le_bytes());
        bytes.extend_from_slice(&50i32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        assert!(matches!(MessageHeader::parse(&bytes), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn rejects_truncated_extended() {
        let bytes =
            MessageHeader::outgoing(EMsg::CLIENT_JOIN_CHAT, &session(), 0, false).build(&[]);
        assert!(MessageHeader::parse(&bytes[..20]).is_err());
    }
}
