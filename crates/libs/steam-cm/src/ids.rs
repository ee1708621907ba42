use core::fmt;

const ACCOUNT_NUMBER_MASK: u64 = 0xFFFF_FFFF;
const INSTANCE_SHIFT: u32 = 32;
const INSTANCE_MASK: u64 = 0xF_FFFF;
const TYPE_SHIFT: u32 = 52;
const TYPE_MASK: u64 = 0xF;
const UNIVERSE_SHIFT: u32 = 56;
const UNIVERSE_MASK: u64 = 0xFF;

/// Instance used by individual desktop accounts.
pub const DESKTOP_INSTANCE: u32 = 1;

/// Instance flag marking a chat room derived from a clan.
pub const CLAN_CHAT_INSTANCE: u32 = 0x10_0000 >> 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccountType {
    Invalid = 0,
    Individual = 1,
    Multiseat = 2,
    GameServer = 3,
    AnonGameServer = 4,
    Pending = 5,
    ContentServer = 6,
    Clan = 7,
    Chat = 8,
    ConsoleUser = 9,
    AnonUser = 10,
}

impl AccountType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Individual,
            2 => Self::Multiseat,
            3 => Self::GameServer,
            4 => Self::AnonGameServer,
            5 => Self::Pending,
            6 => Self::ContentServer,
            7 => Self::Clan,
            8 => Self::Chat,
            9 => Self::ConsoleUser,
            10 => Self::AnonUser,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Universe {
    Invalid = 0,
    Public = 1,
    Beta = 2,
    Internal = 3,
    Dev = 4,
}

impl Universe {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Public,
            2 => Self::Beta,
            3 => Self::Internal,
            4 => Self::Dev,
            _ => Self::Invalid,
        }
    }
}

/// 64-bit account identifier.
///
/// Layout, low bit first: 32-bit account number, 20-bit instance, 4-bit
/// account type, 8-bit universe. Equality and ordering are over the raw value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AccountId(u64);

impl AccountId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(
        account_number: u32,
        instance: u32,
        account_type: AccountType,
        universe: Universe,
    ) -> Self {
        Self(0)
            .with_account_number(account_number)
            .with_instance(instance)
            .with_account_type(account_type)
            .with_universe(universe)
    }

    /// An individual desktop account in the public universe.
    pub fn individual(account_number: u32) -> Self {
        Self::new(account_number, DESKTOP_INSTANCE, AccountType::Individual, Universe::Public)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn account_number(self) -> u32 {
        (self.0 & ACCOUNT_NUMBER_MASK) as u32
    }

    pub fn instance(self) -> u32 {
        ((self.0 >> INSTANCE_SHIFT) & INSTANCE_MASK) as u32
    }

    pub fn account_type(self) -> AccountType {
        AccountType::from_raw(((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    pub fn universe(self) -> Universe {
        Universe::from_raw(((self.0 >> UNIVERSE_SHIFT) & UNIVERSE_MASK) as u8)
    }

    pub fn with_account_number(self, account_number: u32) -> Self {
        Self((self.0 & !ACCOUNT_NUMBER_MASK) | u64::from(account_number))
    }

    pub fn with_instance(self, instance: u32) -> Self {
        let field = (u64::from(instance) & INSTANCE_MASK) << INSTANCE_SHIFT;
        Self((self.0 & !(INSTANCE_MASK << INSTANCE_SHIFT)) | field)
    }

    pub fn with_account_type(self, account_type: AccountType) -> Self {
        let field = (account_type as u64 & TYPE_MASK) << TYPE_SHIFT;
        Self((self.0 & !(TYPE_MASK << TYPE_SHIFT)) | field)
    }

    pub fn with_universe(self, universe: Universe) -> Self {
        let field = (universe as u64 & UNIVERSE_MASK) << UNIVERSE_SHIFT;
        Self((self.0 & !(UNIVERSE_MASK << UNIVERSE_SHIFT)) | field)
    }

    /// Clan ids have to be rewritten into their chat room id before they can
    /// address a chat. Other ids pass through unchanged.
    pub fn to_chat_room(self) -> Self {
        if self.account_type() == AccountType::Clan {
            self.with_instance(CLAN_CHAT_INSTANCE).with_account_type(AccountType::Chat)
        } else {
            self
        }
    }
}

impl From<u64> for AccountId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<AccountId> for u64 {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountId")
            .field("raw", &self.0)
            .field("account_number", &self.account_number())
            .field("instance", &self.instance())
            .field("type", &self.account_type())
            .field("universe", &self.universe())
            .finish()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_fields() {
        let id = AccountId::individual(22202);
        assert_eq!(id.raw(), 76561197960287930);
        assert_eq!(id.account_number(), 22202);
        assert_eq!(id.instance(), 1);
        assert_eq!(id.account_type(), AccountType::Individual);
        assert_eq!(id.universe(), Universe::Public);
    }

    #[test]
    fn setters_leave_other_fields() {
        let id = AccountId::individual(7).with_account_number(0);
        assert_eq!(id.account_number(), 0);
        assert_eq!(id.instance(), DESKTOP_INSTANCE);
        assert_eq!(id.universe(), Universe::Public);
    }

    #[test]
    fn clan_maps_to_chat_room() {
        let clan = AccountId::new(4, 0, AccountType::Clan, Universe::Public);
        let room = clan.to_chat_room();
        assert_eq!(room.account_type(), AccountType::Chat);
        assert_eq!(room.instance(), 0x80000);
        assert_eq!(room.account_number(), 4);

        let user = AccountId::individual(4);
        assert_eq!(user.to_chat_room(), user);
    }

    #[test]
    fn ordering_is_raw() {
        assert!(AccountId::from_raw(1) < AccountId::from_raw(2));
        assert_eq!(u64::from(AccountId::from_raw(9)), 9);
    }
}
