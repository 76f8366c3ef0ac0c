// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Symmetric encryption for stored tenant credentials.
//!
//! Credentials live encrypted in the directory; the key is derived once at
//! startup from the configured passphrase. Without a passphrase a random
//! key is used, which restricts decryption to the current process lifetime.

use std::fmt::Display;

use async_trait::async_trait;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use generic_array::typenum::U32;
use generic_array::GenericArray;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const KEY_ROUNDS: u32 = 8000;

#[derive(Clone, Debug)]
pub struct Key(GenericArray<u8, U32>);

impl Default for Key {
    fn default() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Key(key.into())
    }
}

impl From<&str> for Key {
    fn from(passphrase: &str) -> Self {
        let mut key = [0u8; 32];
        // one process-wide key, a static salt is sufficient
        let salt = [0u8; 8];
        pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &salt, KEY_ROUNDS, &mut key);
        Key(key.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing nonce")]
    MissingNonce,
    #[error("missing data")]
    MissingData,
    #[error("invalid nonce")]
    InvalidNonce,
    #[error("invalid data")]
    InvalidData,
    #[error("invalid utf-8 payload")]
    InvalidPayload,
}

/// Encrypt/decrypt primitive used by the directory, router and gateway.
#[async_trait]
pub trait Crypt: Send + Sync {
    async fn encrypt(&self, data: Vec<u8>) -> Encrypted;
    fn encrypt_sync(&self, data: Vec<u8>) -> Encrypted;
    async fn decrypt(&self, encrypted: Encrypted) -> Vec<u8>;
    fn decrypt_sync(&self, encrypted: &Encrypted) -> Vec<u8>;

    /// Decrypts the string form into a utf-8 string.
    fn decrypt_str(&self, raw: &str) -> Result<String, ParseError> {
        let encrypted = Encrypted::try_from(raw)?;
        String::from_utf8(self.decrypt_sync(&encrypted)).map_err(|_| ParseError::InvalidPayload)
    }
}

/// ChaCha20 backed [`Crypt`] implementation.
#[derive(Clone, Debug, Default)]
pub struct CredentialCrypt {
    key: Key,
}

impl CredentialCrypt {
    pub fn new(key: Key) -> Self {
        Self { key }
    }

    fn run_cipher(key: &Key, nonce: &[u8; 12], mut data: Vec<u8>) -> Vec<u8> {
        let Key(key) = key;
        let mut cipher = ChaCha20::new(key, nonce.into());
        cipher.apply_keystream(&mut data);
        data
    }
}

#[async_trait]
impl Crypt for CredentialCrypt {
    async fn encrypt(&self, data: Vec<u8>) -> Encrypted {
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || {
            let mut nonce = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut nonce);
            let data = CredentialCrypt::run_cipher(&key, &nonce, data);
            Encrypted { nonce, data }
        })
        .await
        .expect("encryption task must not be cancelled")
    }

    fn encrypt_sync(&self, data: Vec<u8>) -> Encrypted {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let data = Self::run_cipher(&self.key, &nonce, data);
        Encrypted { nonce, data }
    }

    async fn decrypt(&self, encrypted: Encrypted) -> Vec<u8> {
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || {
            CredentialCrypt::run_cipher(&key, &encrypted.nonce, encrypted.data)
        })
        .await
        .expect("decryption task must not be cancelled")
    }

    fn decrypt_sync(&self, encrypted: &Encrypted) -> Vec<u8> {
        Self::run_cipher(&self.key, &encrypted.nonce, encrypted.data.clone())
    }
}

/// Nonce + ciphertext pair, stored as `"<nonce-b64> <data-b64>"`.
#[derive(Clone, Debug)]
pub struct Encrypted {
    nonce: [u8; 12],
    data: Vec<u8>,
}

impl Display for Encrypted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use base64::{display::Base64Display, engine::general_purpose::STANDARD};

        let nonce = Base64Display::new(&self.nonce, &STANDARD);
        let data = Base64Display::new(&self.data, &STANDARD);
        write!(f, "{} {}", nonce, data)
    }
}

impl TryFrom<&str> for Encrypted {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let mut parts = s.split_whitespace();
        let nonce = parts.next().ok_or(ParseError::MissingNonce)?;
        let nonce = STANDARD
            .decode(nonce.as_bytes())
            .map_err(|_| ParseError::InvalidNonce)?;
        let data = parts.next().ok_or(ParseError::MissingData)?;
        let data = STANDARD
            .decode(data.as_bytes())
            .map_err(|_| ParseError::InvalidData)?;
        Ok(Encrypted {
            nonce: nonce.try_into().map_err(|_| ParseError::InvalidNonce)?,
            data,
        })
    }
}

impl TryFrom<String> for Encrypted {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Encrypted::try_from(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let data = b"s3cret-password".to_vec();
        let crypter = CredentialCrypt::default();
        let encrypted = crypter.encrypt(data.clone()).await;
        let decrypted = crypter.decrypt(encrypted).await;
        assert_eq!(data, decrypted.as_slice());
    }

    #[test]
    fn same_passphrase_same_key() {
        let a = CredentialCrypt::new(Key::from("hunter2"));
        let b = CredentialCrypt::new(Key::from("hunter2"));
        let encrypted = a.encrypt_sync(b"payload".to_vec()).to_string();
        assert_eq!(b.decrypt_str(&encrypted).unwrap(), "payload");
    }

    #[test]
    fn string_form_round_trip() {
        let crypter = CredentialCrypt::default();
        let encrypted = crypter.encrypt_sync(b"hello".to_vec()).to_string();
        assert_eq!(crypter.decrypt_str(&encrypted).unwrap(), "hello");
    }

    #[test]
    fn string_form_rejects_garbage() {
        assert!(matches!(
            Encrypted::try_from(""),
            Err(ParseError::MissingNonce)
        ));
        assert!(matches!(
            Encrypted::try_from("AAAAAAAAAAAAAAAA"),
            Err(ParseError::MissingData)
        ));
        assert!(matches!(
            Encrypted::try_from("not-base64! AAAA"),
            Err(ParseError::InvalidNonce)
        ));
    }
}
