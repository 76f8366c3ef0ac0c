// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::external::ExternalScan;

/// Schedule information of a scan as advertised by the external system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSchedule {
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub start_time_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub interval: u32,
    #[serde(default)]
    pub week_day: Option<String>,
}

/// A scan definition mirrored from the external scanning service.
///
/// Scans are never removed locally; when the external listing no longer
/// contains them they are flagged via `is_tenable_deleted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub tenable_scan_id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub scan_type: String,
    #[serde(default)]
    pub repeat_rule: String,
    #[serde(default)]
    pub schedule: ScanSchedule,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub scan_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scan_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_tenable_deleted: bool,
    #[serde(default)]
    pub is_fetch_vm_required: bool,
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

impl Scan {
    /// Builds a new local document from an external scan definition.
    pub fn from_external(external: &ExternalScan) -> Self {
        let modified = parse_epoch(&external.modified_time);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenable_scan_id: external.external_id().unwrap_or_default(),
            name: external.name.clone(),
            scan_type: external.scan_type.clone(),
            repeat_rule: external.schedule.repeat_rule.clone(),
            schedule: ScanSchedule {
                timezone: external.schedule.timezone.clone(),
                start_time: external.schedule.start.clone(),
                start_time_utc: parse_epoch(&external.schedule.next_run),
                frequency: external.schedule.schedule_type.clone(),
                interval: 0,
                week_day: None,
            },
            targets: external.targets(),
            enabled: external.enabled == "true",
            scan_start: parse_epoch(&external.created_time),
            scan_end: modified,
            is_tenable_deleted: false,
            is_fetch_vm_required: false,
        }
    }

    /// Applies a newer external definition onto this document.
    ///
    /// `scan_end` only moves forward; an older `modifiedTime` never rewinds
    /// the locally stored timestamp.
    pub fn apply_external(&mut self, external: &ExternalScan) {
        self.name = external.name.clone();
        self.scan_type = external.scan_type.clone();
        self.repeat_rule = external.schedule.repeat_rule.clone();
        self.schedule.timezone = external.schedule.timezone.clone();
        self.schedule.start_time = external.schedule.start.clone();
        self.schedule.start_time_utc = parse_epoch(&external.schedule.next_run);
        self.targets = external.targets();
        self.enabled = external.enabled == "true";
        if let Some(modified) = parse_epoch(&external.modified_time) {
            if self.scan_end.map(|end| modified > end).unwrap_or(true) {
                self.scan_end = Some(modified);
                // a newer run may carry vulnerabilities we have not seen
                self.is_fetch_vm_required = true;
            }
        }
        self.is_tenable_deleted = false;
    }
}
