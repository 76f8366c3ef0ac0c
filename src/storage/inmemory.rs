// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Error, ReportStorer, ScanStorer, Upserted, VulnerabilityFilter, VulnerabilityStorer};
use crate::models::{LockInfo, Report, Scan, Vulnerability};

/// In-memory tenant store.
///
/// One instance per resolved tenant connection; all maps are keyed by the
/// internal document id, secondary lookups go through index maps the same
/// way the backing document database would use indexes.
#[derive(Debug, Default)]
pub struct Storage {
    scans: RwLock<HashMap<String, Scan>>,
    /// tenable_scan_id -> document id, doubles as the unique index.
    scan_index: RwLock<Option<HashMap<i64, String>>>,
    vulnerabilities: RwLock<HashMap<String, Vulnerability>>,
    reports: RwLock<HashMap<String, Report>>,
    assets: RwLock<HashMap<String, f64>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStorer for Storage {
    async fn ensure_scan_index(&self) -> Result<(), Error> {
        let mut index = self.scan_index.write().await;
        if index.is_none() {
            let scans = self.scans.read().await;
            let mut built = HashMap::with_capacity(scans.len());
            for scan in scans.values() {
                if built.insert(scan.tenable_scan_id, scan.id.clone()).is_some() {
                    return Err(Error::Index(format!(
                        "duplicate external scan id {}",
                        scan.tenable_scan_id
                    )));
                }
            }
            *index = Some(built);
        }
        Ok(())
    }

    async fn insert_scan(&self, scan: Scan) -> Result<(), Error> {
        let mut index = self.scan_index.write().await;
        let index = index.as_mut().ok_or_else(|| {
            Error::Index("unique index on external scan id is missing".to_string())
        })?;
        if index.contains_key(&scan.tenable_scan_id) {
            return Err(Error::DuplicateKey(scan.tenable_scan_id.to_string()));
        }
        index.insert(scan.tenable_scan_id, scan.id.clone());
        self.scans.write().await.insert(scan.id.clone(), scan);
        Ok(())
    }

    async fn update_scan(&self, scan: Scan) -> Result<(), Error> {
        let mut scans = self.scans.write().await;
        if !scans.contains_key(&scan.id) {
            return Err(Error::NotFound);
        }
        scans.insert(scan.id.clone(), scan);
        Ok(())
    }

    async fn get_scans(&self) -> Result<Vec<Scan>, Error> {
        Ok(self.scans.read().await.values().cloned().collect())
    }

    async fn get_scan(&self, id: &str) -> Result<Scan, Error> {
        self.scans
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn scan_by_external_id(&self, tenable_scan_id: i64) -> Result<Option<Scan>, Error> {
        let scans = self.scans.read().await;
        Ok(scans
            .values()
            .find(|s| s.tenable_scan_id == tenable_scan_id)
            .cloned())
    }

    async fn mark_scans_deleted(&self, external_ids: &[i64]) -> Result<usize, Error> {
        let mut scans = self.scans.write().await;
        let mut flagged = 0;
        for scan in scans.values_mut() {
            if external_ids.contains(&scan.tenable_scan_id) && !scan.is_tenable_deleted {
                scan.is_tenable_deleted = true;
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}

#[async_trait]
impl VulnerabilityStorer for Storage {
    async fn upsert_vulnerability(&self, v: Vulnerability) -> Result<Upserted, Error> {
        let mut vulnerabilities = self.vulnerabilities.write().await;
        let key = v.merge_key();
        if let Some(existing) = vulnerabilities
            .values_mut()
            .find(|candidate| candidate.merge_key() == key)
        {
            existing.severity = v.severity;
            existing.count = v.count;
            existing.last_seen = v.last_seen.or(existing.last_seen);
            existing.cve = v.cve;
            existing.see_also = v.see_also;
            existing.risk_score = v.risk_score.or(existing.risk_score);
            existing.soft_deleted_at = None;
            return Ok(Upserted {
                id: existing.id.clone(),
                created: false,
            });
        }
        let id = v.id.clone();
        vulnerabilities.insert(id.clone(), v);
        Ok(Upserted { id, created: true })
    }

    async fn get_vulnerability(&self, id: &str) -> Result<Vulnerability, Error> {
        self.vulnerabilities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn find_vulnerabilities(
        &self,
        filter: &VulnerabilityFilter,
    ) -> Result<Vec<Vulnerability>, Error> {
        let vulnerabilities = self.vulnerabilities.read().await;
        let mut matched: Vec<_> = vulnerabilities
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn replace_vulnerability(&self, v: Vulnerability) -> Result<(), Error> {
        let mut vulnerabilities = self.vulnerabilities.write().await;
        if !vulnerabilities.contains_key(&v.id) {
            return Err(Error::NotFound);
        }
        vulnerabilities.insert(v.id.clone(), v);
        Ok(())
    }

    async fn lock_vulnerabilities(
        &self,
        ids: &[String],
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, Error> {
        let mut vulnerabilities = self.vulnerabilities.write().await;
        let mut matched = 0;
        for id in ids {
            if let Some(v) = vulnerabilities.get_mut(id) {
                match &v.locked {
                    Some(lock) if lock.user != user => {}
                    _ => {
                        v.locked = Some(LockInfo {
                            user: user.to_string(),
                            at,
                        });
                        matched += 1;
                    }
                }
            }
        }
        Ok(matched)
    }

    async fn unlock_vulnerabilities(&self, ids: &[String], user: &str) -> Result<usize, Error> {
        let mut vulnerabilities = self.vulnerabilities.write().await;
        let mut matched = 0;
        for id in ids {
            if let Some(v) = vulnerabilities.get_mut(id) {
                if v.locked.as_ref().map(|l| l.user == user).unwrap_or(false) {
                    v.locked = None;
                    matched += 1;
                }
            }
        }
        Ok(matched)
    }

    async fn asset_risk_score(&self, ip: &str) -> Result<Option<f64>, Error> {
        Ok(self.assets.read().await.get(ip).copied())
    }

    async fn put_asset(&self, ip: &str, risk_score: f64) -> Result<(), Error> {
        self.assets
            .write()
            .await
            .insert(ip.to_string(), risk_score);
        Ok(())
    }
}

#[async_trait]
impl ReportStorer for Storage {
    async fn insert_report(&self, report: Report) -> Result<Upserted, Error> {
        let mut reports = self.reports.write().await;
        if let Some(existing) = reports.values().find(|r| {
            r.tenable_scan_id == report.tenable_scan_id
                && r.last_modification_date == report.last_modification_date
        }) {
            return Ok(Upserted {
                id: existing.id.clone(),
                created: false,
            });
        }
        let id = report.id.clone();
        reports.insert(id.clone(), report);
        Ok(Upserted { id, created: true })
    }

    async fn update_report(&self, report: Report) -> Result<(), Error> {
        let mut reports = self.reports.write().await;
        if !reports.contains_key(&report.id) {
            return Err(Error::NotFound);
        }
        reports.insert(report.id.clone(), report);
        Ok(())
    }

    async fn get_reports(&self) -> Result<Vec<Report>, Error> {
        Ok(self.reports.read().await.values().cloned().collect())
    }

    async fn get_report(&self, id: &str) -> Result<Report, Error> {
        self.reports
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn report_modification_dates(&self) -> Result<Vec<i64>, Error> {
        Ok(self
            .reports
            .read()
            .await
            .values()
            .map(|r| r.last_modification_date)
            .collect())
    }
}
