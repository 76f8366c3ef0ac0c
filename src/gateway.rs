// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Gateway to the external scanning service.
//!
//! Authenticates per tenant (plus one administrative account), caches the
//! bearer tokens with the server advertised session timeout and exposes one
//! uniform request primitive used by all synchronization jobs.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    config::ExternalService,
    crypt::Crypt,
    directory::{Directory, DirectoryError},
};

/// Error code the service uses for an invalid or expired token.
const CODE_INVALID_TOKEN: i64 = 12;
/// Vendor specific code signalling "no data for this query"; terminal
/// success, not a failure.
const CODE_EMPTY_RESULT: i64 = 143;

/// Safety margin on the advertised session timeout, avoids racing expiry.
const TOKEN_EXPIRY_MARGIN_PERCENT: u64 = 5;

/// Structured `{error_code, error_msg}` failure payload of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub status: u16,
    pub error_code: i64,
    pub error_msg: String,
}

impl ApiFailure {
    pub fn is_empty_result(&self) -> bool {
        self.error_code == CODE_EMPTY_RESULT
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "status {} code {}: {}",
            self.status, self.error_code, self.error_msg
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("authentication expired")]
    AuthExpired,
    #[error("external service failure: {0}")]
    Service(ApiFailure),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Cache key of a bearer token; the administrative account is cached
/// separately from all tenant accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKey {
    Admin,
    Tenant(i64),
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    cookie: Option<String>,
    expires_at: Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    response: Value,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Value,
    #[serde(default, rename = "sessionTimeout")]
    session_timeout: Value,
}

/// Uniform request surface of the external service, implemented by the
/// [`Gateway`] and by test stand-ins.
#[async_trait]
pub trait ExternalApi: Send + Sync {
    /// Performs one call with the tenant's credentials, retrying once after
    /// an expired token was evicted.
    async fn call(
        &self,
        tenant: i64,
        endpoint: &str,
        query: &[(String, String)],
        method: hyper::Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError>;

    /// Performs one call with the administrative credential set.
    async fn call_as_admin(
        &self,
        endpoint: &str,
        query: &[(String, String)],
        method: hyper::Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError>;
}

pub struct Gateway {
    client: reqwest::Client,
    base_url: String,
    admin: (String, String),
    directory: Arc<dyn Directory>,
    crypter: Arc<dyn Crypt>,
    tokens: RwLock<HashMap<TokenKey, CachedToken>>,
}

impl Gateway {
    pub fn new(
        config: &ExternalService,
        directory: Arc<dyn Directory>,
        crypter: Arc<dyn Crypt>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            admin: (config.admin_username.clone(), config.admin_password.clone()),
            directory,
            crypter,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    async fn credentials_for(&self, key: TokenKey) -> Result<(String, String), GatewayError> {
        match key {
            TokenKey::Admin => {
                if self.admin.0.is_empty() {
                    return Err(GatewayError::Configuration(
                        "no administrative credentials configured".to_string(),
                    ));
                }
                Ok(self.admin.clone())
            }
            TokenKey::Tenant(id) => {
                let tenant = self.directory.tenant(id).await?.ok_or_else(|| {
                    GatewayError::Configuration(format!("unknown tenant {id}"))
                })?;
                let credentials = tenant.decrypt_credentials(self.crypter.as_ref())?;
                Ok((credentials.username, credentials.password))
            }
        }
    }

    async fn authenticate(&self, key: TokenKey) -> Result<CachedToken, GatewayError> {
        let (username, password) = self.credentials_for(key).await?;
        let response = self
            .client
            .post(format!("{}/token", self.base_url))
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await?;
        let status = response.status();
        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(str::to_string);
        let envelope: Envelope = response.json().await?;
        if !status.is_success() || envelope.error_code != 0 {
            return Err(GatewayError::Service(ApiFailure {
                status: status.as_u16(),
                error_code: envelope.error_code,
                error_msg: envelope.error_msg,
            }));
        }
        let token_response: TokenResponse = serde_json::from_value(envelope.response)
            .map_err(|e| {
                GatewayError::Configuration(format!("unexpected token payload: {e}"))
            })?;
        let token = match &token_response.token {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(GatewayError::Configuration(format!(
                    "unexpected token value: {other}"
                )))
            }
        };
        let timeout_secs = match &token_response.session_timeout {
            Value::String(s) => s.trim().parse::<u64>().unwrap_or(3600),
            Value::Number(n) => n.as_u64().unwrap_or(3600),
            _ => 3600,
        };
        let usable = timeout_secs * (100 - TOKEN_EXPIRY_MARGIN_PERCENT) / 100;
        let cached = CachedToken {
            token,
            cookie,
            expires_at: Instant::now() + Duration::from_secs(usable),
        };
        tracing::debug!(?key, usable_secs = usable, "cached new session token");
        Ok(cached)
    }

    async fn token_for(&self, key: TokenKey) -> Result<CachedToken, GatewayError> {
        if let Some(cached) = self.tokens.read().await.get(&key) {
            if !cached.is_expired() {
                return Ok(cached.clone());
            }
        }
        let fresh = self.authenticate(key).await?;
        self.tokens.write().await.insert(key, fresh.clone());
        Ok(fresh)
    }

    async fn evict(&self, key: TokenKey) {
        self.tokens.write().await.remove(&key);
    }

    /// One authenticated request without the retry wrapper. An invalid
    /// token evicts the cache entry and surfaces [`GatewayError::AuthExpired`].
    async fn call_once(
        &self,
        key: TokenKey,
        endpoint: &str,
        query: &[(String, String)],
        method: &hyper::Method,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let token = self.token_for(key).await?;
        let url = format!("{}{}", self.base_url, endpoint);
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|_| GatewayError::Configuration(format!("unsupported method {method}")))?;
        let mut request = self
            .client
            .request(method, url)
            .query(query)
            .header("X-SecurityCenter", &token.token);
        if let Some(cookie) = &token.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let envelope: Envelope = response.json().await?;
        if envelope.error_code == CODE_INVALID_TOKEN {
            self.evict(key).await;
            return Err(GatewayError::AuthExpired);
        }
        if !status.is_success() || envelope.error_code != 0 {
            return Err(GatewayError::Service(ApiFailure {
                status: status.as_u16(),
                error_code: envelope.error_code,
                error_msg: envelope.error_msg,
            }));
        }
        Ok(envelope.response)
    }

    async fn call_with_retry(
        &self,
        key: TokenKey,
        endpoint: &str,
        query: &[(String, String)],
        method: hyper::Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        match self
            .call_once(key, endpoint, query, &method, body.as_ref())
            .await
        {
            Err(GatewayError::AuthExpired) => {
                tracing::debug!(?key, endpoint, "token expired, retrying once");
                self.call_once(key, endpoint, query, &method, body.as_ref())
                    .await
            }
            other => other,
        }
    }
}

#[async_trait]
impl ExternalApi for Gateway {
    async fn call(
        &self,
        tenant: i64,
        endpoint: &str,
        query: &[(String, String)],
        method: hyper::Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        self.call_with_retry(TokenKey::Tenant(tenant), endpoint, query, method, body)
            .await
    }

    async fn call_as_admin(
        &self,
        endpoint: &str,
        query: &[(String, String)],
        method: hyper::Method,
        body: Option<Value>,
    ) -> Result<Value, GatewayError> {
        self.call_with_retry(TokenKey::Admin, endpoint, query, method, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CredentialCrypt;
    use crate::directory::fake::{subscribed_tenant, MemoryDirectory};
    use hyper::Method;

    fn gateway(server: &mockito::ServerGuard) -> Gateway {
        let crypter = Arc::new(CredentialCrypt::default());
        let directory = Arc::new(MemoryDirectory::with_tenants(vec![subscribed_tenant(
            crypter.as_ref(),
            1,
        )]));
        let config = ExternalService {
            base_url: server.url(),
            admin_username: "admin".to_string(),
            admin_password: "admin-pw".to_string(),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
        };
        Gateway::new(&config, directory, crypter).unwrap()
    }

    fn token_mock(server: &mut mockito::ServerGuard, token: &str, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("Content-Type", "application/json")
            .with_header("Set-Cookie", "TNS_SESSIONID=abc; HttpOnly")
            .with_body(format!(
                r#"{{"response": {{"token": "{token}", "sessionTimeout": "3600"}}, "error_code": 0, "error_msg": ""}}"#
            ))
            .expect(hits)
            .create()
    }

    #[tokio::test]
    async fn authenticates_and_reuses_token() {
        let mut server = mockito::Server::new_async().await;
        let token = token_mock(&mut server, "t-1", 1);
        let scans = server
            .mock("GET", "/scan")
            .match_header("X-SecurityCenter", "t-1")
            .match_header("Cookie", "TNS_SESSIONID=abc")
            .with_status(200)
            .with_body(r#"{"response": {"usable": []}, "error_code": 0, "error_msg": ""}"#)
            .expect(2)
            .create();

        let gateway = gateway(&server);
        for _ in 0..2 {
            let response = gateway
                .call(1, "/scan", &[], Method::GET, None)
                .await
                .unwrap();
            assert_eq!(response["usable"], serde_json::json!([]));
        }
        token.assert();
        scans.assert();
    }

    #[tokio::test]
    async fn invalid_token_reauthenticates_and_retries_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        // the service keeps rejecting the token; the gateway must evict,
        // authenticate again, retry once and then give up
        let token = token_mock(&mut server, "t-2", 2);
        let scans = server
            .mock("GET", "/scan")
            .with_status(403)
            .with_body(r#"{"error_code": 12, "error_msg": "Invalid token"}"#)
            .expect(2)
            .create();
        let gateway = gateway(&server);
        let result = gateway.call(1, "/scan", &[], Method::GET, None).await;
        assert!(matches!(result, Err(GatewayError::AuthExpired)));
        token.assert();
        scans.assert();
    }

    #[tokio::test]
    async fn code_143_surfaces_as_empty_result() {
        let mut server = mockito::Server::new_async().await;
        token_mock(&mut server, "t-3", 1);
        server
            .mock("POST", "/analysis")
            .with_status(403)
            .with_body(r#"{"error_code": 143, "error_msg": "no data"}"#)
            .create();
        let gateway = gateway(&server);
        match gateway
            .call(1, "/analysis", &[], Method::POST, Some(serde_json::json!({})))
            .await
        {
            Err(GatewayError::Service(failure)) => assert!(failure.is_empty_result()),
            other => panic!("expected service failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn admin_calls_use_the_admin_credential_set() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"username": "admin"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(
                r#"{"response": {"token": "admin-token", "sessionTimeout": 3600}, "error_code": 0, "error_msg": ""}"#,
            )
            .create();
        server
            .mock("GET", "/organization")
            .match_header("X-SecurityCenter", "admin-token")
            .with_status(200)
            .with_body(r#"{"response": [], "error_code": 0, "error_msg": ""}"#)
            .create();
        let gateway = gateway(&server);
        gateway
            .call_as_admin("/organization", &[], Method::GET, None)
            .await
            .unwrap();
        token.assert();
    }

    #[tokio::test]
    async fn network_errors_propagate() {
        let crypter = Arc::new(CredentialCrypt::default());
        let directory = Arc::new(MemoryDirectory::with_tenants(vec![subscribed_tenant(
            crypter.as_ref(),
            1,
        )]));
        let config = ExternalService {
            base_url: "http://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(100),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let gateway = Gateway::new(&config, directory, crypter).unwrap();
        assert!(matches!(
            gateway.call(1, "/scan", &[], Method::GET, None).await,
            Err(GatewayError::Network(_))
        ));
    }
}
