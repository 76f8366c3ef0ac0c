// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Wire types of the external scanning service.
//!
//! The service serializes nearly everything as strings, including numeric
//! ids and epoch timestamps; parsing into proper types happens when the
//! values are turned into local documents.

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalSchedule {
    #[serde(default, rename = "repeatRule")]
    pub repeat_rule: String,
    #[serde(default)]
    pub start: String,
    #[serde(default, rename = "type")]
    pub schedule_type: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default, rename = "nextRun")]
    pub next_run: String,
}

/// A scan definition as returned by `GET /scan`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalScan {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub scan_type: String,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default)]
    pub schedule: ExternalSchedule,
    #[serde(default, rename = "ipList")]
    pub ip_list: String,
    #[serde(default, rename = "createdTime")]
    pub created_time: String,
    #[serde(default, rename = "modifiedTime")]
    pub modified_time: String,
    #[serde(default)]
    pub enabled: String,
}

impl ExternalScan {
    pub fn external_id(&self) -> Option<i64> {
        self.id.trim().parse().ok()
    }

    /// Comma separated target list, trimmed and without empty entries.
    pub fn targets(&self) -> Vec<String> {
        self.ip_list
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One completed (or running) execution instance of a scan, `GET /scanResult`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalScanResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "scanID")]
    pub scan_id: String,
    #[serde(default)]
    pub repository: Repository,
    #[serde(default, rename = "startTime")]
    pub start_time: String,
    #[serde(default, rename = "finishTime")]
    pub finish_time: String,
}

impl ExternalScanResult {
    pub fn result_id(&self) -> Option<i64> {
        self.id.trim().parse().ok()
    }

    pub fn parent_scan_id(&self) -> Option<i64> {
        self.scan_id.trim().parse().ok()
    }

    pub fn finished_at(&self) -> Option<i64> {
        self.finish_time.trim().parse().ok()
    }
}

/// Severity as advertised by the external system, e.g. `{"id":"4","name":"Critical"}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalSeverity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A single finding row of a `POST /analysis` vulnerability detail query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalVulnerability {
    #[serde(default, rename = "pluginID")]
    pub plugin_id: String,
    #[serde(default, rename = "pluginName")]
    pub plugin_name: String,
    #[serde(default)]
    pub severity: ExternalSeverity,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub protocol: String,
    /// Either a single string or an array of strings.
    #[serde(default, rename = "seeAlso")]
    pub see_also: serde_json::Value,
    /// Either a single string or an array of strings.
    #[serde(default)]
    pub cve: serde_json::Value,
    #[serde(default, rename = "firstSeen")]
    pub first_seen: String,
    #[serde(default, rename = "lastSeen")]
    pub last_seen: String,
    #[serde(default)]
    pub count: String,
}

/// Normalizes a value that may be a bare string, a comma separated string or
/// an array of strings into a vector.
pub(crate) fn string_list(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect(),
        serde_json::Value::Array(entries) => entries
            .iter()
            .filter_map(|e| e.as_str())
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_list_wraps_scalars_and_keeps_arrays() {
        assert_eq!(
            string_list(&serde_json::json!("CVE-2024-1, CVE-2024-2")),
            vec!["CVE-2024-1", "CVE-2024-2"]
        );
        assert_eq!(
            string_list(&serde_json::json!(["a", " b "])),
            vec!["a", "b"]
        );
        assert!(string_list(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn scan_result_parses_numeric_strings() {
        let result: ExternalScanResult = serde_json::from_value(serde_json::json!({
            "id": "204",
            "scanID": "7",
            "status": "Completed",
            "finishTime": "1700003600",
        }))
        .unwrap();
        assert_eq!(result.result_id(), Some(204));
        assert_eq!(result.parent_scan_id(), Some(7));
        assert_eq!(result.finished_at(), Some(1700003600));
    }
}
