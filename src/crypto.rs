//! OpenPGP primitives used by the encryption selector.

use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::PublicKeyTrait;
use pgp::{ArmorOptions, Deserializable, Message, SignedPublicKey, SignedSecretKey};
use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

/// Produces armored OpenPGP messages.
pub trait PgpEngine: Send + Sync {
    /// Encrypt `body` to an armored public key.
    fn encrypt(&self, public_key: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Sign `body` with an armored private key, then encrypt to `public_key`.
    fn encrypt_and_sign(
        &self,
        public_key: &[u8],
        private_key: &[u8],
        passphrase: &SecretString,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// `PgpEngine` on top of rpgp. SEIPDv1 with AES-256, SHA-256 signatures.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpgpEngine;

impl RpgpEngine {
    pub fn new() -> Self {
        Self
    }
}

impl PgpEngine for RpgpEngine {
    fn encrypt(&self, public_key: &[u8], body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = parse_public_key(public_key)?;
        let literal = Message::new_literal_bytes("", body);
        encrypt_to(&key, &literal)
    }

    fn encrypt_and_sign(
        &self,
        public_key: &[u8],
        private_key: &[u8],
        passphrase: &SecretString,
        body: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = parse_public_key(public_key)?;
        let signer = parse_private_key(private_key)?;
        let passphrase = passphrase.expose_secret().to_string();

        let mut rng = rand::thread_rng();
        let signed = Message::new_literal_bytes("", body)
            .sign(&mut rng, &signer, || passphrase, HashAlgorithm::SHA2_256)
            .map_err(|e| CryptoError::Sign(e.to_string()))?;
        encrypt_to(&key, &signed)
    }
}

fn encrypt_to(key: &SignedPublicKey, message: &Message) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();

    // Prefer a dedicated encryption subkey; fall back to the primary key.
    let encrypted = match key.public_subkeys.iter().find(|k| k.is_encryption_key()) {
        Some(subkey) => message.encrypt_to_keys_seipdv1(
            &mut rng,
            SymmetricKeyAlgorithm::AES256,
            &[subkey],
        ),
        None if key.is_encryption_key() => message.encrypt_to_keys_seipdv1(
            &mut rng,
            SymmetricKeyAlgorithm::AES256,
            &[key],
        ),
        None => return Err(CryptoError::NoEncryptionKey),
    }
    .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

    let armored = encrypted
        .to_armored_string(ArmorOptions::default())
        .map_err(|e| CryptoError::Armor(e.to_string()))?;
    Ok(armored.into_bytes())
}

/// Parse an armored public key.
pub fn parse_public_key(armored: &[u8]) -> Result<SignedPublicKey, CryptoError> {
    let text =
        std::str::from_utf8(armored).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let (key, _headers) = SignedPublicKey::from_string(text)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    key.verify()
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    Ok(key)
}

/// Parse an armored private key.
pub fn parse_private_key(armored: &[u8]) -> Result<SignedSecretKey, CryptoError> {
    let text =
        std::str::from_utf8(armored).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let (key, _headers) = SignedSecretKey::from_string(text)
        .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_public_key_is_rejected() {
        let err = RpgpEngine::new().encrypt(b"not a key", b"hello").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPublicKey(_)));
    }

    #[test]
    fn non_utf8_private_key_is_rejected() {
        let err = parse_private_key(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPrivateKey(_)));
    }
}
