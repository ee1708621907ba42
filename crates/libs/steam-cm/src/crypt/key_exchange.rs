use rand_core::CryptoRngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;

use super::symmetric::SessionKey;
use crate::error::ProtocolError;

/// Public key of the public-universe backend. Session keys for both the CM
/// channel and content servers are wrapped with it.
pub const BACKEND_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIGdMA0GCSqGSIb3DQEBAQUAA4GLADCBhwKBgQDf7BrWLBBmLBc1OhSwfFkRf53T
2Ct64+AVzRkeRuh7h3SiGEYxqQMUeYKO6UWiSRKpI2hzic9pobFhRr3Bvr/WARvY
gdTckPv+T1JzZsuVcNfFjrocejN1oWI0Rrtgt4Bo+hOneoo3S57G9F1fOpn5nsQ6
6WOiu4gZKODnFMBCiQIBEQ==
-----END PUBLIC KEY-----
";

/// RSA-OAEP (SHA-1) wrapping of freshly generated session keys.
#[derive(Debug, Clone)]
pub struct KeyExchange {
    public_key: RsaPublicKey,
}

impl KeyExchange {
    pub fn new(public_key: RsaPublicKey) -> Self {
        Self { public_key }
    }

    pub fn backend() -> Result<Self, ProtocolError> {
        let public_key = RsaPublicKey::from_public_key_pem(BACKEND_PUBLIC_KEY_PEM)
            .map_err(|err| ProtocolError::Config(format!("backend public key: {err}")))?;
        Ok(Self::new(public_key))
    }

    /// Length in bytes of a wrapped key (the modulus size).
    pub fn wrapped_len(&self) -> usize {
        self.public_key.size()
    }

    pub fn wrap<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        key: &SessionKey,
    ) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.public_key.encrypt(rng, Oaep::new::<Sha1>(), key.as_bytes())?)
    }

    /// Generates a new session key and returns it with its wrapped form.
    pub fn generate<R: CryptoRngCore>(
        &self,
        rng: &mut R,
    ) -> Result<(SessionKey, Vec<u8>), ProtocolError> {
        let key = SessionKey::generate(rng);
        let wrapped = self.wrap(rng, &key)?;
        Ok((key, wrapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use rsa::RsaPrivateKey;

    #[test]
    fn backend_key_parses() {
        let exchange = KeyExchange::backend().expect("backend key");
        assert_eq!(exchange.wrapped_len(), 128);

        let key = SessionKey::generate(&mut OsRng);
        assert_eq!(exchange.wrap(&mut OsRng, &key).expect("wrap").len(), 128);
    }

    #[test]
    fn wrapped_key_unwraps_with_private_key() {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen");
        let exchange = KeyExchange::new(RsaPublicKey::from(&private));

        let (key, wrapped) = exchange.generate(&mut OsRng).expect("wrap");
        assert_eq!(wrapped.len(), 128);

        let unwrapped = private.decrypt(Oaep::new::<Sha1>(), &wrapped).expect("unwrap");
        assert_eq!(unwrapped.as_slice(), key.as_bytes());
    }
}
