use crate::crypt::SessionKey;
use crate::ids::AccountId;

/// Per-connection protocol state.
///
/// Owned by the dispatcher and lent to the frame and header codecs.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: Option<SessionKey>,
    pub encrypted: bool,
    pub session_id: i32,
    pub identity: AccountId,
    pub(crate) pending_len: Option<usize>,
    latched: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            key: None,
            encrypted: false,
            session_id: 0,
            identity: AccountId::individual(0),
            pending_len: None,
            latched: false,
        }
    }

    /// Back to the state of a freshly opened socket. The identity keeps its
    /// instance, type and universe so a preset account survives reconnects.
    pub fn reset(&mut self) {
        self.key = None;
        self.encrypted = false;
        self.session_id = 0;
        self.identity = self.identity.with_account_number(0);
        self.pending_len = None;
        self.latched = false;
    }

    /// Latches the server-assigned session id and identity the first time a
    /// protobuf header carries them. Returns `true` when it latched.
    pub fn latch(&mut self, session_id: i32, identity: AccountId) -> bool {
        if self.latched {
            return false;
        }
        self.latched = true;
        self.session_id = session_id;
        self.identity = identity;
        true
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
