//! # steam-cm
//!
//! Client side of the CM wire protocol: the persistent, encrypted TCP
//! channel between a client and the connection-manager backend.
//!
//! ## Frame Format
//!
//! ```text
//! [length:4 LE]["VT01"][body:length]
//! body = IV encrypted with AES-256-ECB (16) || AES-256-CBC/PKCS7(message)
//! ```
//!
//! The body is plaintext until the channel encryption handshake completes.
//! Handshake messages are never encrypted.
//!
//! ## Example
//!
//! ```rust
//! use steam_cm::{frame, Session};
//!
//! let session = Session::new();
//! let framed = frame::encode(b"hello", &session, false).unwrap();
//! assert_eq!(&framed[4..8], b"VT01");
//! assert_eq!(frame::decode(&framed, &session, false).unwrap(), b"hello");
//! ```
//!
//! [`SessionDispatcher`] is the synchronous engine; [`transport::CmConnection`]
//! hosts it on a tokio `TcpStream`.

pub mod config;
pub mod crypt;
pub mod dispatcher;
pub mod emsg;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod ids;
pub mod multi;
pub mod proto;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, CmEndpoint};
pub use crypt::{crypted_len, KeyExchange, SessionKey};
pub use dispatcher::{
    FrameSink, HeartbeatScheduler, IncomingMessage, LogOnDetails, OutgoingMessage, Replies,
    SessionDispatcher, SessionEvent, PROTOCOL_VERSION,
};
pub use emsg::{EMsg, EResult, PROTO_MASK};
pub use error::ProtocolError;
pub use handshake::HandshakeState;
pub use header::{MessageHeader, JOB_ID_NONE};
pub use ids::{AccountId, AccountType, Universe};
pub use multi::MAX_MULTI_DEPTH;
pub use session::Session;
pub use transport::{CmConnection, CmHandle};
