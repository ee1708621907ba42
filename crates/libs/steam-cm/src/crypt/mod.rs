pub mod key_exchange;
pub mod symmetric;

pub use key_exchange::{KeyExchange, BACKEND_PUBLIC_KEY_PEM};
pub use symmetric::{crypted_len, SessionKey, AES_BLOCK_SIZE, SESSION_KEY_SIZE};
