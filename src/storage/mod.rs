// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Tenant document storage.
//!
//! Each organisation has an isolated store holding its scans,
//! vulnerabilities and reports. Components never open stores directly;
//! handles come from the [`crate::router::Router`].

pub mod inmemory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Report, Scan, Severity, Vulnerability};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("serialization error")]
    Serialization,
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("index creation failed: {0}")]
    Index(String),
    #[error("storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Self::Serialization
    }
}

/// Query over the vulnerability collection. `None` on a dimension means no
/// filter on that dimension.
#[derive(Debug, Clone, Default)]
pub struct VulnerabilityFilter {
    pub ports: Option<Vec<u16>>,
    pub protocol: Option<String>,
    pub plugin_ids: Option<Vec<i64>>,
    pub targets: Option<Vec<String>>,
    pub severities: Option<Vec<Severity>>,
    pub include_deleted: bool,
}

impl VulnerabilityFilter {
    pub fn matches(&self, v: &Vulnerability) -> bool {
        if !self.include_deleted && v.soft_deleted_at.is_some() {
            return false;
        }
        if let Some(ports) = &self.ports {
            if !ports.contains(&v.port) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if !protocol.eq_ignore_ascii_case(&v.protocol) {
                return false;
            }
        }
        if let Some(plugins) = &self.plugin_ids {
            if !plugins.contains(&v.plugin_id) {
                return false;
            }
        }
        if let Some(targets) = &self.targets {
            if !targets.iter().any(|t| t.trim() == v.target) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.contains(&v.severity) {
                return false;
            }
        }
        true
    }
}

/// Result of merging one fetched vulnerability into the collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upserted {
    pub id: String,
    pub created: bool,
}

/// Scan collection of one tenant.
#[async_trait]
pub trait ScanStorer {
    /// Ensures the unique index on the external scan id exists.
    ///
    /// Called before every insert; when it fails inserts must be skipped
    /// to avoid duplicate external ids racing in.
    async fn ensure_scan_index(&self) -> Result<(), Error>;
    /// Inserts a scan; fails with [`Error::DuplicateKey`] when the external
    /// id is already present.
    async fn insert_scan(&self, scan: Scan) -> Result<(), Error>;
    /// Replaces a scan document by its internal id.
    async fn update_scan(&self, scan: Scan) -> Result<(), Error>;
    async fn get_scans(&self) -> Result<Vec<Scan>, Error>;
    async fn get_scan(&self, id: &str) -> Result<Scan, Error>;
    async fn scan_by_external_id(&self, tenable_scan_id: i64) -> Result<Option<Scan>, Error>;
    /// Flags the given external ids as deleted upstream. Returns how many
    /// documents were flagged.
    async fn mark_scans_deleted(&self, external_ids: &[i64]) -> Result<usize, Error>;
}

/// Vulnerability collection of one tenant.
#[async_trait]
pub trait VulnerabilityStorer {
    /// Inserts the document or merges it into an existing finding with the
    /// same identity (plugin, target, port, protocol, scan linkage).
    async fn upsert_vulnerability(&self, v: Vulnerability) -> Result<Upserted, Error>;
    async fn get_vulnerability(&self, id: &str) -> Result<Vulnerability, Error>;
    async fn find_vulnerabilities(
        &self,
        filter: &VulnerabilityFilter,
    ) -> Result<Vec<Vulnerability>, Error>;
    /// Replaces a document by id; the document must exist.
    async fn replace_vulnerability(&self, v: Vulnerability) -> Result<(), Error>;
    /// Compare-and-set lock: each id is locked only when currently unlocked
    /// or already locked by `user`. Returns how many documents matched.
    async fn lock_vulnerabilities(
        &self,
        ids: &[String],
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, Error>;
    /// Releases locks held by `user`. Returns how many documents matched.
    async fn unlock_vulnerabilities(&self, ids: &[String], user: &str) -> Result<usize, Error>;
    /// Inventory risk score for a target ip, when the asset is known.
    async fn asset_risk_score(&self, ip: &str) -> Result<Option<f64>, Error>;
    async fn put_asset(&self, ip: &str, risk_score: f64) -> Result<(), Error>;
}

/// Report collection of one tenant.
#[async_trait]
pub trait ReportStorer {
    /// Inserts the report unless one with the same
    /// `(tenable_scan_id, last_modification_date)` already exists; returns
    /// the id of the stored document either way.
    async fn insert_report(&self, report: Report) -> Result<Upserted, Error>;
    /// Replaces a report document by id; the document must exist.
    async fn update_report(&self, report: Report) -> Result<(), Error>;
    async fn get_reports(&self) -> Result<Vec<Report>, Error>;
    async fn get_report(&self, id: &str) -> Result<Report, Error>;
    /// The `last_modification_date` values of all stored reports. Used by
    /// the enqueue job to skip already processed scan runs.
    async fn report_modification_dates(&self) -> Result<Vec<i64>, Error>;
}

/// Combines the per-collection traits into one tenant store handle.
pub trait TenantStorage: ScanStorer + VulnerabilityStorer + ReportStorer + Send + Sync {}

impl<T> TenantStorage for T where
    T: ScanStorer + VulnerabilityStorer + ReportStorer + Send + Sync
{
}
