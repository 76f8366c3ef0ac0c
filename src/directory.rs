// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Lookup surface over the relational organisation/service store.
//!
//! The admin workflows creating organisations live elsewhere; this daemon
//! only reads tenants and their encrypted scanning-service credentials.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::crypt::Crypt;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("credential blob is unreadable: {0}")]
    Credentials(String),
}

/// Connection data for the tenant's document database, part of the
/// encrypted credential blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseAssignment {
    pub scheme: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub replica_set: Option<String>,
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Decrypted per-service credentials of a tenant: the external scanning
/// service account plus the tenant database assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub database: Option<DatabaseAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub active: bool,
    /// Encrypted [`ServiceCredentials`] blob; `None` when the tenant is not
    /// subscribed to the scanning service.
    pub credentials: Option<String>,
}

impl Tenant {
    /// Decrypts the stored credential blob.
    pub fn decrypt_credentials<C>(&self, crypter: &C) -> Result<ServiceCredentials, DirectoryError>
    where
        C: Crypt + ?Sized,
    {
        let raw = self
            .credentials
            .as_deref()
            .ok_or_else(|| DirectoryError::Credentials("no credentials stored".to_string()))?;
        let decrypted = crypter
            .decrypt_str(raw)
            .map_err(|e| DirectoryError::Credentials(e.to_string()))?;
        serde_json::from_str(&decrypted)
            .map_err(|e| DirectoryError::Credentials(e.to_string()))
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn tenant(&self, id: i64) -> Result<Option<Tenant>, DirectoryError>;
    /// Active tenants subscribed to the scanning service.
    async fn active_tenants(&self) -> Result<Vec<Tenant>, DirectoryError>;
}

/// sqlite backed directory.
#[derive(Debug, Clone)]
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub async fn init(pool: SqlitePool) -> Result<Self, DirectoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS organisations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                slug TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                credentials TEXT
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Stores a tenant row; test and provisioning helper.
    pub async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO organisations (id, name, slug, active, credentials)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                slug = excluded.slug,
                active = excluded.active,
                credentials = excluded.credentials",
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.slug)
        .bind(tenant.active)
        .bind(&tenant.credentials)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_tenant(row: &sqlx::sqlite::SqliteRow) -> Result<Tenant, sqlx::Error> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        active: row.try_get("active")?,
        credentials: row.try_get("credentials")?,
    })
}

#[async_trait]
impl Directory for SqliteDirectory {
    async fn tenant(&self, id: i64) -> Result<Option<Tenant>, DirectoryError> {
        let row = sqlx::query(
            "SELECT id, name, slug, active, credentials FROM organisations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_tenant).transpose().map_err(Into::into)
    }

    async fn active_tenants(&self) -> Result<Vec<Tenant>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT id, name, slug, active, credentials FROM organisations
             WHERE active = 1 AND credentials IS NOT NULL
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| row_to_tenant(r).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;

    use super::*;

    /// In-memory directory for tests.
    #[derive(Debug, Default)]
    pub struct MemoryDirectory {
        tenants: std::sync::RwLock<HashMap<i64, Tenant>>,
    }

    impl MemoryDirectory {
        pub fn with_tenants(tenants: Vec<Tenant>) -> Self {
            Self {
                tenants: std::sync::RwLock::new(
                    tenants.into_iter().map(|t| (t.id, t)).collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl Directory for MemoryDirectory {
        async fn tenant(&self, id: i64) -> Result<Option<Tenant>, DirectoryError> {
            Ok(self.tenants.read().unwrap().get(&id).cloned())
        }

        async fn active_tenants(&self) -> Result<Vec<Tenant>, DirectoryError> {
            let tenants = self.tenants.read().unwrap();
            let mut active: Vec<_> = tenants
                .values()
                .filter(|t| t.active && t.credentials.is_some())
                .cloned()
                .collect();
            active.sort_by_key(|t| t.id);
            Ok(active)
        }
    }

    pub fn encrypt_credentials<C: Crypt>(
        crypter: &C,
        credentials: &ServiceCredentials,
    ) -> String {
        let raw = serde_json::to_vec(credentials).unwrap();
        crypter.encrypt_sync(raw).to_string()
    }

    /// A tenant subscribed to the scanning service with an in-memory
    /// database assignment, ready for router/gateway tests.
    pub fn subscribed_tenant<C: Crypt>(crypter: &C, id: i64) -> Tenant {
        let credentials = ServiceCredentials {
            username: format!("sc-user-{id}"),
            password: format!("sc-pass-{id}"),
            database: Some(DatabaseAssignment {
                scheme: "mem".to_string(),
                hosts: vec!["localhost".to_string()],
                replica_set: None,
                database: format!("tenant_{id}"),
                username: "db-user".to_string(),
                password: "db-pass".to_string(),
            }),
        };
        Tenant {
            id,
            name: format!("tenant-{id}"),
            slug: format!("tenant-{id}"),
            active: true,
            credentials: Some(encrypt_credentials(crypter, &credentials)),
        }
    }
}
