// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    #[default]
    Preliminary,
    Finalised,
}

/// Snapshot grouping of the vulnerabilities produced by one scan run.
///
/// Created exactly once per `(scan_id, last_modification_date)` pair; a
/// second synchronization of the same run reuses the stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub scan_id: String,
    pub tenable_scan_id: i64,
    pub scan_result_id: i64,
    pub report_type: ReportType,
    pub last_modification_date: i64,
    pub utc_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vulnerability_ids: Vec<String>,
}
