// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Scan reconciliation.
//!
//! Pulls the external scan list per tenant, inserts new definitions,
//! applies updates and flags everything the external system no longer
//! lists. One tenant failing never stops the others.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hyper::Method;

use super::{is_backup_repository, JobError};
use crate::{
    directory::Directory,
    gateway::ExternalApi,
    models::{ExternalScan, Scan},
    router::Router,
};

const SCAN_FIELDS: &str =
    "id,name,type,repository,schedule,ipList,createdTime,modifiedTime,enabled";

pub struct ScanSync<G> {
    directory: Arc<dyn Directory>,
    router: Arc<Router>,
    gateway: Arc<G>,
    backup_markers: Vec<String>,
}

impl<G> ScanSync<G>
where
    G: ExternalApi,
{
    pub fn new(
        directory: Arc<dyn Directory>,
        router: Arc<Router>,
        gateway: Arc<G>,
        backup_markers: Vec<String>,
    ) -> Self {
        Self {
            directory,
            router,
            gateway,
            backup_markers,
        }
    }

    /// One reconciliation pass over all subscribed tenants.
    pub async fn run_once(&self) -> Result<(), JobError> {
        for tenant in self.directory.active_tenants().await? {
            if let Err(e) = self.sync_tenant(tenant.id).await {
                tracing::warn!(tenant = tenant.id, %e, "scan reconciliation failed");
            }
        }
        Ok(())
    }

    async fn fetch_usable_scans(&self, tenant: i64) -> Result<Vec<ExternalScan>, JobError> {
        let response = self
            .gateway
            .call(
                tenant,
                "/scan",
                &[
                    ("filter".to_string(), "usable".to_string()),
                    ("fields".to_string(), SCAN_FIELDS.to_string()),
                ],
                Method::GET,
                None,
            )
            .await?;
        let usable = response.get("usable").cloned().unwrap_or_default();
        serde_json::from_value(usable)
            .map_err(|e| JobError::Payload(format!("unexpected scan listing: {e}")))
    }

    pub async fn sync_tenant(&self, tenant: i64) -> Result<(), JobError> {
        let storage = self.router.resolve(tenant).await?;
        let fetched = self.fetch_usable_scans(tenant).await?;
        let fetched: Vec<_> = fetched
            .into_iter()
            .filter(|s| !is_backup_repository(&s.repository.name, &self.backup_markers))
            .collect();

        let local = storage.get_scans().await?;
        let local_by_external: HashMap<i64, &Scan> =
            local.iter().map(|s| (s.tenable_scan_id, s)).collect();
        let fetched_ids: HashSet<i64> =
            fetched.iter().filter_map(|s| s.external_id()).collect();

        let mut index_ready = true;
        for external in &fetched {
            let Some(external_id) = external.external_id() else {
                tracing::debug!(tenant, id = %external.id, "skipping scan with unparsable id");
                continue;
            };
            match local_by_external.get(&external_id) {
                None => {
                    if !index_ready {
                        continue;
                    }
                    // the unique index guards against a concurrent run
                    // inserting the same external id; without it inserts
                    // are skipped entirely
                    if let Err(e) = storage.ensure_scan_index().await {
                        tracing::warn!(tenant, %e, "index creation failed, skipping inserts");
                        index_ready = false;
                        continue;
                    }
                    match storage.insert_scan(Scan::from_external(external)).await {
                        Ok(()) => tracing::debug!(tenant, external_id, "inserted new scan"),
                        Err(e) => tracing::warn!(tenant, external_id, %e, "insert failed"),
                    }
                }
                Some(existing) => {
                    let modified = external
                        .modified_time
                        .trim()
                        .parse::<i64>()
                        .unwrap_or_default();
                    let newer = existing
                        .scan_end
                        .map(|end| modified > end.timestamp())
                        .unwrap_or(true);
                    if newer {
                        let mut updated = (*existing).clone();
                        updated.apply_external(external);
                        storage.update_scan(updated).await?;
                        tracing::debug!(tenant, external_id, "updated scan");
                    }
                }
            }
        }

        // everything stored locally the external system no longer lists is
        // flagged, never removed; an empty fetch flags all of them
        let missing: Vec<i64> = local
            .iter()
            .map(|s| s.tenable_scan_id)
            .filter(|id| !fetched_ids.contains(id))
            .collect();
        if !missing.is_empty() {
            let flagged = storage.mark_scans_deleted(&missing).await?;
            tracing::debug!(tenant, flagged, "flagged scans deleted upstream");
        }
        Ok(())
    }
}
