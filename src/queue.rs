// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Durable queue of background work units.
//!
//! One row is one unit of work. Consumers claim a row by flipping its
//! status and incrementing the attempts counter in a single statement
//! before any external call is made; the claim is the only mutual
//! exclusion mechanism between overlapping job runs.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

pub const JOB_FETCH_VULNERABILITIES: &str = "fetch_vulnerabilities";

const STATUS_RUNNING: &str = "running";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("params are unreadable: {0}")]
    Params(#[from] serde_json::Error),
}

/// Parameters of one vulnerability fetch unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnFetchParams {
    pub scan_id: i64,
    pub scan_result_id: i64,
    pub last_modification_date: i64,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: i64,
    pub job_type: String,
    pub params: String,
    pub organisation_id: i64,
    pub status: Option<String>,
    pub attempts: i64,
}

impl JobRow {
    pub fn vuln_fetch_params(&self) -> Result<VulnFetchParams, QueueError> {
        Ok(serde_json::from_str(&self.params)?)
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    max_attempts: i64,
}

impl JobQueue {
    pub async fn init(pool: SqlitePool, max_attempts: u32) -> Result<Self, QueueError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS vuln_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                params TEXT NOT NULL,
                organisation_id INTEGER NOT NULL,
                status TEXT,
                attempts INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self {
            pool,
            max_attempts: i64::from(max_attempts),
        })
    }

    /// Inserts a vulnerability fetch unit unless an equivalent one already
    /// exists. Returns whether a row was inserted.
    ///
    /// Equivalence is probed the way the original system did it: pattern
    /// matches on the serialized params for the scan id, scan result id and
    /// modification date, scoped by organisation and job type.
    pub async fn enqueue_vuln_fetch(
        &self,
        organisation_id: i64,
        params: &VulnFetchParams,
    ) -> Result<bool, QueueError> {
        if self.vuln_fetch_exists(organisation_id, params).await? {
            return Ok(false);
        }
        let serialized = serde_json::to_string(params)?;
        sqlx::query(
            "INSERT INTO vuln_jobs (job_type, params, organisation_id, status, attempts)
             VALUES (?, ?, ?, NULL, 0)",
        )
        .bind(JOB_FETCH_VULNERABILITIES)
        .bind(serialized)
        .bind(organisation_id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn vuln_fetch_exists(
        &self,
        organisation_id: i64,
        params: &VulnFetchParams,
    ) -> Result<bool, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vuln_jobs
             WHERE organisation_id = ?
               AND job_type = ?
               AND params LIKE ?
               AND params LIKE ?
               AND params LIKE ?",
        )
        .bind(organisation_id)
        .bind(JOB_FETCH_VULNERABILITIES)
        .bind(format!("%\"scan_id\":{}%", params.scan_id))
        .bind(format!("%\"scan_result_id\":{}%", params.scan_result_id))
        .bind(format!(
            "%\"last_modification_date\":{}%",
            params.last_modification_date
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Claims the oldest pending row below the retry ceiling.
    ///
    /// Status flip, attempts increment and row fetch happen in one
    /// statement; two overlapping runs can never claim the same row.
    pub async fn claim_next_pending(&self) -> Result<Option<JobRow>, QueueError> {
        let row = sqlx::query(
            "UPDATE vuln_jobs
             SET status = ?, attempts = attempts + 1
             WHERE id = (
                 SELECT id FROM vuln_jobs
                 WHERE status IS NULL AND attempts < ?
                 ORDER BY id
                 LIMIT 1
             )
             RETURNING id, job_type, params, organisation_id, status, attempts",
        )
        .bind(STATUS_RUNNING)
        .bind(self.max_attempts)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(JobRow {
                id: r.try_get("id")?,
                job_type: r.try_get("job_type")?,
                params: r.try_get("params")?,
                organisation_id: r.try_get("organisation_id")?,
                status: r.try_get("status")?,
                attempts: r.try_get("attempts")?,
            })
        })
        .transpose()
        .map_err(|e: sqlx::Error| e.into())
    }

    /// Removes a finished row.
    pub async fn complete(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM vuln_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts a claimed row back to pending, keeping its attempts counter.
    pub async fn release(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE vuln_jobs SET status = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rows that hit the retry ceiling; left in place for manual
    /// inspection, never claimed again.
    pub async fn abandoned(&self) -> Result<Vec<JobRow>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, job_type, params, organisation_id, status, attempts
             FROM vuln_jobs WHERE attempts >= ? AND status IS NULL ORDER BY id",
        )
        .bind(self.max_attempts)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(JobRow {
                    id: r.try_get("id")?,
                    job_type: r.try_get("job_type")?,
                    params: r.try_get("params")?,
                    organisation_id: r.try_get("organisation_id")?,
                    status: r.try_get("status")?,
                    attempts: r.try_get("attempts")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}
