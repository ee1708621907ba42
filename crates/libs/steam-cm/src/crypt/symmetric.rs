use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::cipher::{BlockSizeUser, Key, Unsigned};
use aes::{Aes256, Block};
use crypto_common::KeySizeUser;
use rand_core::{CryptoRngCore, OsRng};
use zeroize::Zeroize;

use crate::error::ProtocolError;

type AesCbcEnc = cbc::Encryptor<Aes256>;
type AesCbcDec = cbc::Decryptor<Aes256>;

pub const SESSION_KEY_SIZE: usize = <<Aes256 as KeySizeUser>::KeySize as Unsigned>::USIZE;
pub const AES_BLOCK_SIZE: usize = <<Aes256 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;
const IV_SIZE: usize = AES_BLOCK_SIZE;

/// Size of the encrypted form of a `len`-byte plaintext: the obfuscated IV
/// followed by the CBC ciphertext, which always carries a padding block.
pub const fn crypted_len(len: usize) -> usize {
    IV_SIZE + (len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE
}

/// 32-byte AES-256 key used both for the CM channel and for content-server
/// and depot payloads.
///
/// Encrypted form: `ECB(key, iv) ‖ CBC(key, iv, PKCS#7(plaintext))`. The IV is
/// recovered by the receiver by ECB-decrypting the first block.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn new(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let key: [u8; SESSION_KEY_SIZE] =
            bytes.try_into().map_err(|_| ProtocolError::Cipher("key must be 32 bytes"))?;
        Ok(Self(key))
    }

    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let mut key = [0u8; SESSION_KEY_SIZE];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.encrypt_with_rng(&mut OsRng, plaintext)
    }

    pub fn encrypt_with_rng<R: CryptoRngCore>(&self, rng: &mut R, plaintext: &[u8]) -> Vec<u8> {
        let key = Key::<Aes256>::from_slice(&self.0);

        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);

        let mut iv_block = Block::clone_from_slice(&iv);
        <Aes256 as KeyInit>::new(key).encrypt_block(&mut iv_block);

        let ciphertext = <AesCbcEnc as KeyIvInit>::new(key, &Block::clone_from_slice(&iv))
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        iv.zeroize();

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
        out.extend_from_slice(iv_block.as_slice());
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if data.len() < IV_SIZE + AES_BLOCK_SIZE {
            return Err(ProtocolError::Cipher("ciphertext shorter than two blocks"));
        }
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(ProtocolError::Cipher("ciphertext not block aligned"));
        }

        let key = Key::<Aes256>::from_slice(&self.0);

        let mut iv = Block::clone_from_slice(&data[..IV_SIZE]);
        <Aes256 as KeyInit>::new(key).decrypt_block(&mut iv);

        let ciphertext = &data[IV_SIZE..];
        let mut out = vec![0u8; ciphertext.len()];
        let plain_len = <AesCbcDec as KeyIvInit>::new(key, &iv)
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, &mut out)
            .map_err(|_| ProtocolError::Cipher("bad padding"))?
            .len();
        out.truncate(plain_len);

        Ok(out)
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl core::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        SessionKey::new(bytes)
    }

    #[test]
    fn encrypt_then_decrypt() {
        let key = key();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let token = key.encrypt(&plaintext);
            assert_eq!(token.len(), crypted_len(len));
            assert_eq!(key.decrypt(&token).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn trailing_zero_bytes_survive() {
        let key = key();
        let plaintext = b"name.txt\0\0\0";
        assert_eq!(key.decrypt(&key.encrypt(plaintext)).expect("decrypt"), plaintext);
    }

    #[test]
    fn iv_is_fresh_per_message() {
        let key = key();
        assert_ne!(key.encrypt(b"same"), key.encrypt(b"same"));
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let token = key().encrypt(b"#SESSION_TEST_MESSAGE#");
        let other = SessionKey::new([0xAA; SESSION_KEY_SIZE]);
        match other.decrypt(&token) {
            Ok(plain) => assert_ne!(plain, b"#SESSION_TEST_MESSAGE#"),
            Err(err) => assert!(matches!(err, ProtocolError::Cipher(_))),
        }
    }

    #[test]
    fn rejects_short_or_unaligned_input() {
        let key = key();
        assert!(key.decrypt(&[0u8; 16]).is_err());
        assert!(key.decrypt(&[0u8; 33]).is_err());
    }

    #[test]
    fn crypted_len_formula() {
        assert_eq!(crypted_len(0), 32);
        assert_eq!(crypted_len(15), 32);
        assert_eq!(crypted_len(16), 48);
        assert_eq!(crypted_len(4096), 16 + 4112);
    }
}
