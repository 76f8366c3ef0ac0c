// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Bearer identities.
//!
//! Tokens are issued by the account service; this daemon only verifies the
//! signature and enforces organisation scope. Token form:
//! `base64(payload).base64(hmac-sha256(payload))`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    InvalidSignature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Customer,
    Staff,
    Admin,
}

impl UserType {
    /// Staff and admin accounts review customer submitted changes.
    pub fn is_reviewer(&self) -> bool {
        matches!(self, UserType::Staff | UserType::Admin)
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub user_type: UserType,
    pub organizations: Vec<i64>,
}

impl Identity {
    /// Organisation scope check; staff and admin accounts see every
    /// organisation.
    pub fn can_access(&self, organisation_id: i64) -> bool {
        self.user_type.is_reviewer() || self.organizations.contains(&organisation_id)
    }

    /// User reference stored in locks, notes and history entries.
    pub fn reference(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Issues a token; used by tests and local tooling.
    pub fn sign(&self, identity: &Identity) -> String {
        let payload = serde_json::to_vec(identity).expect("identity always serializes");
        let signature = self.mac(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        if self.mac(&payload) != signature {
            return Err(AuthError::InvalidSignature);
        }
        serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)
    }

    /// Extracts and verifies the identity of an `Authorization: Bearer`
    /// header value.
    pub fn identity_from_header(&self, header: Option<&str>) -> Result<Identity, AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::Malformed)?;
        self.verify(token.trim())
    }
}
