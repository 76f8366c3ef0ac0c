// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Vulnerability synchronization.
//!
//! Processes one queue row per invocation. The row is claimed before the
//! external fetch starts; the fetched findings are enriched and merged
//! into the tenant store together with an idempotently created report.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use hyper::Method;

use super::JobError;
use crate::{
    gateway::{ExternalApi, GatewayError},
    models::{ExternalVulnerability, Report, ReportType, Vulnerability},
    queue::{JobQueue, JobRow, VulnFetchParams},
    router::Router,
    storage::TenantStorage,
};

pub struct VulnFetch<G> {
    router: Arc<Router>,
    gateway: Arc<G>,
    queue: Arc<JobQueue>,
}

impl<G> VulnFetch<G>
where
    G: ExternalApi,
{
    pub fn new(router: Arc<Router>, gateway: Arc<G>, queue: Arc<JobQueue>) -> Self {
        Self {
            router,
            gateway,
            queue,
        }
    }

    /// Claims and processes at most one pending row.
    pub async fn run_once(&self) -> Result<(), JobError> {
        let Some(row) = self.queue.claim_next_pending().await? else {
            return Ok(());
        };
        tracing::debug!(
            job = row.id,
            tenant = row.organisation_id,
            attempt = row.attempts,
            "processing vulnerability fetch"
        );
        self.process(&row).await
    }

    async fn process(&self, row: &JobRow) -> Result<(), JobError> {
        let params = match row.vuln_fetch_params() {
            Ok(params) => params,
            Err(e) => {
                // unreadable params never become readable, drop the row
                tracing::warn!(job = row.id, %e, "dropping row with unreadable params");
                self.queue.complete(row.id).await?;
                return Ok(());
            }
        };

        match self.fetch_vulnerabilities(row.organisation_id, &params).await {
            Ok(findings) if findings.is_empty() => {
                tracing::debug!(job = row.id, "scan run carried no vulnerabilities");
                self.queue.complete(row.id).await?;
                Ok(())
            }
            Ok(findings) => {
                let storage = match self.router.resolve(row.organisation_id).await {
                    Ok(storage) => storage,
                    Err(e) => {
                        tracing::warn!(job = row.id, %e, "tenant store unavailable");
                        self.queue.release(row.id).await?;
                        return Ok(());
                    }
                };
                match self.store(storage.as_ref(), &params, findings).await {
                    Ok(stored) => {
                        tracing::debug!(job = row.id, stored, "vulnerabilities synchronized");
                        self.queue.complete(row.id).await?;
                    }
                    Err(e) => {
                        tracing::warn!(job = row.id, %e, "storing failed, leaving row for retry");
                        self.queue.release(row.id).await?;
                    }
                }
                Ok(())
            }
            // the vendor uses a dedicated code for "no data here": done,
            // not an error
            Err(GatewayError::Service(failure)) if failure.is_empty_result() => {
                tracing::debug!(job = row.id, "external system reports no data");
                self.queue.complete(row.id).await?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job = row.id, %e, "fetch failed, leaving row for retry");
                self.queue.release(row.id).await?;
                Ok(())
            }
        }
    }

    async fn fetch_vulnerabilities(
        &self,
        tenant: i64,
        params: &VulnFetchParams,
    ) -> Result<Vec<ExternalVulnerability>, GatewayError> {
        let body = serde_json::json!({
            "type": "vuln",
            "sourceType": "individual",
            "scanID": params.scan_result_id.to_string(),
            "query": {
                "type": "vuln",
                "tool": "vulndetails",
                "startOffset": 0,
                "endOffset": i32::MAX,
            },
        });
        let response = self
            .gateway
            .call(tenant, "/analysis", &[], Method::POST, Some(body))
            .await?;
        let results = response.get("results").cloned().unwrap_or_default();
        serde_json::from_value(results).map_err(|e| {
            GatewayError::Configuration(format!("unexpected analysis payload: {e}"))
        })
    }

    /// Enriches and merges the findings and threads them into the report
    /// of this scan run.
    async fn store(
        &self,
        storage: &dyn TenantStorage,
        params: &VulnFetchParams,
        findings: Vec<ExternalVulnerability>,
    ) -> Result<usize, JobError> {
        let scan = storage
            .scan_by_external_id(params.scan_id)
            .await?
            .ok_or_else(|| {
                JobError::Payload(format!("scan {} is not tracked locally", params.scan_id))
            })?;

        let mut ids = Vec::with_capacity(findings.len());
        for finding in &findings {
            let mut vulnerability = Vulnerability::from_external(finding, params.scan_id);
            vulnerability.risk_score = storage.asset_risk_score(&vulnerability.target).await?;
            let upserted = storage.upsert_vulnerability(vulnerability).await?;
            ids.push(upserted.id);
        }

        let report = Report {
            id: uuid::Uuid::new_v4().to_string(),
            scan_id: scan.id,
            tenable_scan_id: params.scan_id,
            scan_result_id: params.scan_result_id,
            report_type: ReportType::Preliminary,
            last_modification_date: params.last_modification_date,
            utc_time: Utc
                .timestamp_opt(params.last_modification_date, 0)
                .single(),
            vulnerability_ids: ids.clone(),
        };
        let stored = storage.insert_report(report).await?;
        if !stored.created {
            tracing::debug!(report = %stored.id, "report for this scan run already exists");
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::CredentialCrypt;
    use crate::directory::fake::{subscribed_tenant, MemoryDirectory};
    use crate::models::{Scan, Severity};
    use crate::storage::{
        ReportStorer as _, ScanStorer as _, VulnerabilityFilter, VulnerabilityStorer as _,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sqlx::SqlitePool;
    use std::sync::Mutex;

    enum Canned {
        Results(Value),
        Failure(i64),
        NetworkDown,
    }

    struct FakeApi {
        canned: Mutex<Canned>,
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
            match &*self.canned.lock().unwrap() {
                Canned::Results(value) => Ok(value.clone()),
                Canned::Failure(code) => Err(GatewayError::Service(crate::gateway::ApiFailure {
                    status: 403,
                    error_code: *code,
                    error_msg: "canned".to_string(),
                })),
                Canned::NetworkDown => {
                    Err(GatewayError::Configuration("connection refused".to_string()))
                }
            }
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

    fn finding(plugin: i64, ip: &str) -> Value {
        json!({
            "pluginID": plugin.to_string(),
            "pluginName": format!("plugin-{plugin}"),
            "severity": {"id": "4", "name": "Critical"},
            "ip": ip,
            "port": "22",
            "protocol": "tcp",
            "cve": "CVE-2024-1, CVE-2024-2",
            "firstSeen": "1690000000",
            "lastSeen": "1700000000",
            "count": "2",
        })
    }

    async fn harness(canned: Canned) -> (VulnFetch<FakeApi>, Arc<Router>, Arc<JobQueue>) {
        let crypter = Arc::new(CredentialCrypt::default());
        let directory = Arc::new(MemoryDirectory::with_tenants(vec![subscribed_tenant(
            crypter.as_ref(),
            1,
        )]));
        let router = Arc::new(Router::new(directory, crypter));
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let queue = Arc::new(JobQueue::init(pool, 5).await.unwrap());
        let gateway = Arc::new(FakeApi {
            canned: Mutex::new(canned),
        });
        let job = VulnFetch::new(router.clone(), gateway, queue.clone());
        (job, router, queue)
    }

    async fn seed(router: &Router, queue: &JobQueue) {
        let storage = router.resolve(1).await.unwrap();
        storage.ensure_scan_index().await.unwrap();
        storage
            .insert_scan(Scan {
                id: "scan-doc-1".to_string(),
                tenable_scan_id: 7,
                name: "weekly".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        queue
            .enqueue_vuln_fetch(
                1,
                &VulnFetchParams {
                    scan_id: 7,
                    scan_result_id: 204,
                    last_modification_date: 1700003600,
                    start_time: 1699996400,
                    end_time: 1700003600,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_fetch_stores_and_retires_the_row() {
        let canned = Canned::Results(json!({"results": [
            finding(19506, "10.0.0.1"),
            finding(10180, "10.0.0.2"),
        ]}));
        let (job, router, queue) = harness(canned).await;
        seed(&router, &queue).await;
        let storage = router.resolve(1).await.unwrap();
        storage.put_asset("10.0.0.1", 8.4).await.unwrap();

        job.run_once().await.unwrap();

        let vulnerabilities = storage
            .find_vulnerabilities(&VulnerabilityFilter::default())
            .await
            .unwrap();
        assert_eq!(vulnerabilities.len(), 2);
        let enriched = vulnerabilities
            .iter()
            .find(|v| v.target == "10.0.0.1")
            .unwrap();
        assert_eq!(enriched.severity, Severity::Critical);
        assert_eq!(enriched.port_protocol.as_deref(), Some("22/TCP"));
        assert_eq!(enriched.cve.len(), 2);
        assert_eq!(enriched.risk_score, Some(8.4));
        // the other target has no inventory entry
        let other = vulnerabilities
            .iter()
            .find(|v| v.target == "10.0.0.2")
            .unwrap();
        assert_eq!(other.risk_score, None);

        let reports = storage.get_reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].scan_id, "scan-doc-1");
        assert_eq!(reports[0].last_modification_date, 1700003600);
        assert_eq!(reports[0].vulnerability_ids.len(), 2);
        assert_eq!(reports[0].report_type, ReportType::Preliminary);

        // row is gone
        assert!(queue.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_fetch_retires_the_row() {
        let (job, router, queue) = harness(Canned::Results(json!({"results": []}))).await;
        seed(&router, &queue).await;
        job.run_once().await.unwrap();
        assert!(queue.claim_next_pending().await.unwrap().is_none());
        let storage = router.resolve(1).await.unwrap();
        assert!(storage.get_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vendor_no_data_code_is_terminal_success() {
        let (job, router, queue) = harness(Canned::Failure(143)).await;
        seed(&router, &queue).await;
        job.run_once().await.unwrap();
        assert!(queue.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_failures_leave_the_row_pending() {
        let (job, router, queue) = harness(Canned::NetworkDown).await;
        seed(&router, &queue).await;
        job.run_once().await.unwrap();
        // the row is pending again with its attempt recorded
        let row = queue.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
    }

    #[tokio::test]
    async fn reprocessing_the_same_run_creates_no_second_report() {
        let canned = Canned::Results(json!({"results": [finding(19506, "10.0.0.1")]}));
        let (job, router, queue) = harness(canned).await;
        seed(&router, &queue).await;
        job.run_once().await.unwrap();
        // force a second unit for the same run past the enqueue safeguard
        queue
            .enqueue_vuln_fetch(
                1,
                &VulnFetchParams {
                    scan_id: 7,
                    scan_result_id: 204,
                    last_modification_date: 1700003600,
                    start_time: 1699996400,
                    end_time: 1700003600,
                },
            )
            .await
            .unwrap();
        job.run_once().await.unwrap();
        let storage = router.resolve(1).await.unwrap();
        assert_eq!(storage.get_reports().await.unwrap().len(), 1);
        // the finding was merged, not duplicated
        let vulnerabilities = storage
            .find_vulnerabilities(&VulnerabilityFilter::default())
            .await
            .unwrap();
        assert_eq!(vulnerabilities.len(), 1);
    }

    #[tokio::test]
    async fn no_pending_row_is_a_no_op() {
        let (job, _, _) = harness(Canned::Results(json!({"results": []}))).await;
        job.run_once().await.unwrap();
    }
}
