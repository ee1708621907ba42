//! Message type and result code vocabularies.
//!
//! Both are open sets on the wire, so they are newtypes over the raw integer
//! with named constants for the values this crate acts on.

use core::fmt;

/// High bit of the raw type field marking a protobuf-prefixed header.
pub const PROTO_MASK: u32 = 0x8000_0000;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EMsg(pub u32);

impl EMsg {
    pub const INVALID: Self = Self(0);
    pub const MULTI: Self = Self(1);
    pub const CLIENT_HEART_BEAT: Self = Self(703);
    pub const CLIENT_CHANGE_STATUS: Self = Self(716);
    pub const CLIENT_LOG_ON_RESPONSE: Self = Self(751);
    pub const CLIENT_LOGGED_OFF: Self = Self(757);
    pub const CLIENT_PERSONA_STATE: Self = Self(766);
    pub const CLIENT_FRIENDS_LIST: Self = Self(767);
    pub const CLIENT_CHAT_MSG: Self = Self(799);
    pub const CLIENT_JOIN_CHAT: Self = Self(801);
    pub const CLIENT_CHAT_ENTER: Self = Self(807);
    pub const CLIENT_CHAT_MEMBER_INFO: Self = Self(810);
    pub const CLIENT_GET_APP_OWNERSHIP_TICKET: Self = Self(857);
    pub const CLIENT_GET_APP_OWNERSHIP_TICKET_RESPONSE: Self = Self(858);
    pub const CHANNEL_ENCRYPT_REQUEST: Self = Self(1303);
    pub const CHANNEL_ENCRYPT_RESPONSE: Self = Self(1304);
    pub const CHANNEL_ENCRYPT_RESULT: Self = Self(1305);
    pub const CLIENT_GET_DEPOT_DECRYPTION_KEY: Self = Self(5438);
    pub const CLIENT_GET_DEPOT_DECRYPTION_KEY_RESPONSE: Self = Self(5439);
    pub const CLIENT_FRIEND_MSG: Self = Self(5450);
    pub const CLIENT_FRIEND_MSG_INCOMING: Self = Self(5427);
    pub const CLIENT_LOGON: Self = Self(5514);
    pub const CLIENT_UPDATE_MACHINE_AUTH: Self = Self(5537);
    pub const CLIENT_UPDATE_MACHINE_AUTH_RESPONSE: Self = Self(5538);
    pub const CLIENT_REQUEST_FRIEND_DATA: Self = Self(815);
    pub const CLIENT_PICS_PRODUCT_INFO_REQUEST: Self = Self(8903);
    pub const CLIENT_PICS_PRODUCT_INFO_RESPONSE: Self = Self(8904);

    /// Splits a raw type field into the logical type and the protobuf bit.
    pub fn from_raw(raw: u32) -> (Self, bool) {
        (Self(raw & !PROTO_MASK), raw & PROTO_MASK != 0)
    }

    /// The raw type field for this message, optionally with the protobuf bit.
    pub fn to_raw(self, protobuf: bool) -> u32 {
        if protobuf {
            self.0 | PROTO_MASK
        } else {
            self.0
        }
    }

    /// The channel encryption messages always use the minimal header and
    /// always travel unencrypted.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::CHANNEL_ENCRYPT_REQUEST
                | Self::CHANNEL_ENCRYPT_RESPONSE
                | Self::CHANNEL_ENCRYPT_RESULT
        )
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::INVALID => "Invalid",
            Self::MULTI => "Multi",
            Self::CLIENT_HEART_BEAT => "ClientHeartBeat",
            Self::CLIENT_CHANGE_STATUS => "ClientChangeStatus",
            Self::CLIENT_LOG_ON_RESPONSE => "ClientLogOnResponse",
            Self::CLIENT_LOGGED_OFF => "ClientLoggedOff",
            Self::CLIENT_PERSONA_STATE => "ClientPersonaState",
            Self::CLIENT_FRIENDS_LIST => "ClientFriendsList",
            Self::CLIENT_CHAT_MSG => "ClientChatMsg",
            Self::CLIENT_JOIN_CHAT => "ClientJoinChat",
            Self::CLIENT_CHAT_ENTER => "ClientChatEnter",
            Self::CLIENT_CHAT_MEMBER_INFO => "ClientChatMemberInfo",
            Self::CLIENT_GET_APP_OWNERSHIP_TICKET => "ClientGetAppOwnershipTicket",
            Self::CLIENT_GET_APP_OWNERSHIP_TICKET_RESPONSE => "ClientGetAppOwnershipTicketResponse",
            Self::CHANNEL_ENCRYPT_REQUEST => "ChannelEncryptRequest",
            Self::CHANNEL_ENCRYPT_RESPONSE => "ChannelEncryptResponse",
            Self::CHANNEL_ENCRYPT_RESULT => "ChannelEncryptResult",
            Self::CLIENT_GET_DEPOT_DECRYPTION_KEY => "ClientGetDepotDecryptionKey",
            Self::CLIENT_GET_DEPOT_DECRYPTION_KEY_RESPONSE => "ClientGetDepotDecryptionKeyResponse",
            Self::CLIENT_FRIEND_MSG => "ClientFriendMsg",
            Self::CLIENT_FRIEND_MSG_INCOMING => "ClientFriendMsgIncoming",
            Self::CLIENT_LOGON => "ClientLogon",
            Self::CLIENT_UPDATE_MACHINE_AUTH => "ClientUpdateMachineAuth",
            Self::CLIENT_UPDATE_MACHINE_AUTH_RESPONSE => "ClientUpdateMachineAuthResponse",
            Self::CLIENT_REQUEST_FRIEND_DATA => "ClientRequestFriendData",
            Self::CLIENT_PICS_PRODUCT_INFO_REQUEST => "ClientPICSProductInfoRequest",
            Self::CLIENT_PICS_PRODUCT_INFO_RESPONSE => "ClientPICSProductInfoResponse",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for EMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "EMsg({})", self.0),
        }
    }
}

impl From<u32> for EMsg {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw).0
    }
}

/// Result code carried inside handshake and application payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EResult(pub i32);

impl EResult {
    pub const INVALID: Self = Self(0);
    pub const OK: Self = Self(1);
    pub const FAIL: Self = Self(2);
    pub const NO_CONNECTION: Self = Self(3);
    pub const INVALID_PASSWORD: Self = Self(5);
    pub const LOGGED_IN_ELSEWHERE: Self = Self(6);
    pub const INVALID_PROTOCOL_VER: Self = Self(7);
    pub const ACCESS_DENIED: Self = Self(15);
    pub const TIMEOUT: Self = Self(16);
    pub const SERVICE_UNAVAILABLE: Self = Self(20);
    pub const ACCOUNT_LOGON_DENIED: Self = Self(63);
    pub const INVALID_LOGIN_AUTH_CODE: Self = Self(65);
    pub const TRY_ANOTHER_CM: Self = Self(48);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl From<u32> for EResult {
    fn from(raw: u32) -> Self {
        Self(raw as i32)
    }
}
