// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Scan result polling.
//!
//! Detects scan runs completed within the trailing window and enqueues one
//! durable vulnerability fetch unit per run. The queue probe is what keeps
//! a run from being fetched twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hyper::Method;

use super::{is_backup_repository, JobError};
use crate::{
    directory::Directory,
    gateway::ExternalApi,
    models::ExternalScanResult,
    queue::{JobQueue, VulnFetchParams},
    router::Router,
};

const RESULT_FIELDS: &str = "id,name,status,scanID,repository,startTime,finishTime";

pub struct ResultPoll<G> {
    directory: Arc<dyn Directory>,
    router: Arc<Router>,
    gateway: Arc<G>,
    queue: Arc<JobQueue>,
    backup_markers: Vec<String>,
    lookback: Duration,
}

impl<G> ResultPoll<G>
where
    G: ExternalApi,
{
    pub fn new(
        directory: Arc<dyn Directory>,
        router: Arc<Router>,
        gateway: Arc<G>,
        queue: Arc<JobQueue>,
        backup_markers: Vec<String>,
        lookback: Duration,
    ) -> Self {
        Self {
            directory,
            router,
            gateway,
            queue,
            backup_markers,
            lookback,
        }
    }

    pub async fn run_once(&self) -> Result<(), JobError> {
        for tenant in self.directory.active_tenants().await? {
            if let Err(e) = self.poll_tenant(tenant.id).await {
                tracing::warn!(tenant = tenant.id, %e, "scan result polling failed");
            }
        }
        Ok(())
    }

    async fn fetch_results(
        &self,
        tenant: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<ExternalScanResult>, JobError> {
        let response = self
            .gateway
            .call(
                tenant,
                "/scanResult",
                &[
                    ("fields".to_string(), RESULT_FIELDS.to_string()),
                    ("startTime".to_string(), start.to_string()),
                    ("endTime".to_string(), end.to_string()),
                ],
                Method::GET,
                None,
            )
            .await?;
        let usable = response.get("usable").cloned().unwrap_or_default();
        serde_json::from_value(usable)
            .map_err(|e| JobError::Payload(format!("unexpected result listing: {e}")))
    }

    pub async fn poll_tenant(&self, tenant: i64) -> Result<(), JobError> {
        let storage = self.router.resolve(tenant).await?;
        let end = Utc::now().timestamp();
        let start = end - self.lookback.as_secs() as i64;
        let results = self.fetch_results(tenant, start, end).await?;
        // runs already captured in a stored report are never re-enqueued
        let known_runs = storage.report_modification_dates().await?;

        for result in results {
            if is_backup_repository(&result.repository.name, &self.backup_markers) {
                continue;
            }
            if result.status != "Completed" {
                continue;
            }
            let (Some(result_id), Some(scan_id), Some(finished)) = (
                result.result_id(),
                result.parent_scan_id(),
                result.finished_at(),
            ) else {
                tracing::debug!(tenant, id = %result.id, "skipping result with unparsable fields");
                continue;
            };
            if known_runs.contains(&finished) {
                continue;
            }
            // only runs of scans we track locally produce work
            if storage.scan_by_external_id(scan_id).await?.is_none() {
                tracing::debug!(tenant, scan_id, "parent scan unknown, skipping result");
                continue;
            }
            let params = VulnFetchParams {
                scan_id,
                scan_result_id: result_id,
                last_modification_date: finished,
                start_time: start,
                end_time: end,
            };
            if self.queue.enqueue_vuln_fetch(tenant, &params).await? {
                tracing::debug!(tenant, scan_id, result_id, "enqueued vulnerability fetch");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CredentialCrypt;
    use crate::directory::fake::{subscribed_tenant, MemoryDirectory};
    use crate::gateway::GatewayError;
    use crate::models::{Report, Scan};
    use crate::storage::{ReportStorer as _, ScanStorer as _};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sqlx::SqlitePool;
    use std::sync::Mutex;

    struct FakeApi {
        listing: Mutex<Value>,
    }

    #[async_trait]
    impl ExternalApi for FakeApi {
        async fn call(
            &self,
            _tenant: i64,
            _endpoint: &str,
            _query: &[(String, String)],
            _method: Method,
            _body: Option<Value>,
        ) -> Result<Value, GatewayError> {
            Ok(self.listing.lock().unwrap().clone())
        }

        async fn call_as_admin(
            &self,
            _endpoint: &str,
            _query: &[(String, String)],
            _method: Method,
            _body: Option<Value>,
        ) -> Result<Value, GatewayError> {
            Err(GatewayError::Configuration("not used".to_string()))
        }
    }

    fn result_json(id: i64, scan: i64, status: &str, finished: i64, repository: &str) -> Value {
        json!({
            "id": id.to_string(),
            "name": format!("run-{id}"),
            "status": status,
            "scanID": scan.to_string(),
            "repository": {"name": repository},
            "startTime": (finished - 3600).to_string(),
            "finishTime": finished.to_string(),
        })
    }

    async fn harness(listing: Value) -> (ResultPoll<FakeApi>, Arc<Router>, Arc<JobQueue>) {
        let crypter = Arc::new(CredentialCrypt::default());
        let directory = Arc::new(MemoryDirectory::with_tenants(vec![subscribed_tenant(
            crypter.as_ref(),
            1,
        )]));
        let router = Arc::new(Router::new(directory.clone(), crypter));
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let queue = Arc::new(JobQueue::init(pool, 5).await.unwrap());
        let gateway = Arc::new(FakeApi {
            listing: Mutex::new(listing),
        });
        let job = ResultPoll::new(
            directory,
            router.clone(),
            gateway,
            queue.clone(),
            vec!["backup".to_string()],
            Duration::from_secs(2 * 60 * 60),
        );
        (job, router, queue)
    }

    async fn seed_scan(router: &Router, tenant: i64, external_id: i64) {
        let storage = router.resolve(tenant).await.unwrap();
        storage.ensure_scan_index().await.unwrap();
        storage
            .insert_scan(Scan {
                id: uuid::Uuid::new_v4().to_string(),
                tenable_scan_id: external_id,
                name: format!("scan-{external_id}"),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enqueues_completed_runs_of_known_scans() {
        let listing = json!({"usable": [
            result_json(204, 7, "Completed", 1700003600, "primary"),
            result_json(205, 7, "Running", 1700003600, "primary"),
            result_json(206, 99, "Completed", 1700003600, "primary"),
            result_json(207, 7, "Completed", 1700003700, "backup-eu"),
        ]});
        let (job, router, queue) = harness(listing).await;
        seed_scan(&router, 1, 7).await;
        job.poll_tenant(1).await.unwrap();

        // only the completed run of the known scan in a primary repository
        let row = queue.claim_next_pending().await.unwrap().unwrap();
        let params = row.vuln_fetch_params().unwrap();
        assert_eq!(params.scan_result_id, 204);
        assert_eq!(params.scan_id, 7);
        assert_eq!(params.last_modification_date, 1700003600);
        assert!(queue.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn polling_twice_enqueues_once() {
        let listing = json!({"usable": [
            result_json(204, 7, "Completed", 1700003600, "primary"),
        ]});
        let (job, router, queue) = harness(listing).await;
        seed_scan(&router, 1, 7).await;
        job.poll_tenant(1).await.unwrap();
        job.poll_tenant(1).await.unwrap();
        assert!(queue.claim_next_pending().await.unwrap().is_some());
        assert!(queue.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runs_with_a_stored_report_are_skipped() {
        let listing = json!({"usable": [
            result_json(204, 7, "Completed", 1700003600, "primary"),
        ]});
        let (job, router, queue) = harness(listing).await;
        seed_scan(&router, 1, 7).await;
        let storage = router.resolve(1).await.unwrap();
        storage
            .insert_report(Report {
                id: uuid::Uuid::new_v4().to_string(),
                tenable_scan_id: 7,
                scan_result_id: 204,
                last_modification_date: 1700003600,
                ..Default::default()
            })
            .await
            .unwrap();
        job.poll_tenant(1).await.unwrap();
        assert!(queue.claim_next_pending().await.unwrap().is_none());
    }
}
