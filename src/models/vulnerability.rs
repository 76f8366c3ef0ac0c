// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::external::{string_list, ExternalSeverity, ExternalVulnerability};

/// Severity of a finding, ordered from informational to critical.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl From<Severity> for u8 {
    fn from(value: Severity) -> Self {
        match value {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Severity::Info),
            1 => Ok(Severity::Low),
            2 => Ok(Severity::Medium),
            3 => Ok(Severity::High),
            4 => Ok(Severity::Critical),
            other => Err(format!("severity out of range: {other}")),
        }
    }
}

impl Severity {
    /// Normalizes the external representation; the numeric id wins, the
    /// name is the fallback for older payloads that only carry it.
    pub fn from_external(external: &ExternalSeverity) -> Self {
        if let Ok(id) = external.id.trim().parse::<u8>() {
            if let Ok(severity) = Severity::try_from(id) {
                return severity;
            }
        }
        match external.name.to_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub user: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FalsePositive {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityException {
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedCloseDate {
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The mutually exclusive lifecycle actions a user can set on a
/// vulnerability. Setting one clears the other two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VulnerabilityAction {
    FalsePositive(FalsePositive),
    SecurityException(SecurityException),
    ProposedCloseDate(ProposedCloseDate),
}

impl VulnerabilityAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            VulnerabilityAction::FalsePositive(_) => ActionKind::FalsePositive,
            VulnerabilityAction::SecurityException(_) => ActionKind::SecurityException,
            VulnerabilityAction::ProposedCloseDate(_) => ActionKind::ProposedCloseDate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FalsePositive,
    SecurityException,
    ProposedCloseDate,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::FalsePositive => write!(f, "false_positive"),
            ActionKind::SecurityException => write!(f, "security_exception"),
            ActionKind::ProposedCloseDate => write!(f, "proposed_close_date"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Pending,
    Proposed,
    Approved,
    Rejected,
}

impl HistoryStatus {
    /// Whether this entry still awaits a reviewer decision.
    pub fn is_open(&self) -> bool {
        matches!(self, HistoryStatus::Pending | HistoryStatus::Proposed)
    }
}

/// Reviewer decision targeting one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HistoryDecision {
    Approve,
    Reject {
        #[serde(default)]
        reject_reason: String,
    },
}

/// Auditable record of a proposed or applied action change.
///
/// Entries are append only; after creation only the status transition
/// fields (`status`, `updated_by`, `updated_at`, `reject_reason`) change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub action: ActionKind,
    pub status: HistoryStatus,
    pub previous_values: serde_json::Value,
    pub new_values: serde_json::Value,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub note: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A single detected finding in a tenant store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub plugin_id: i64,
    #[serde(default)]
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port_protocol: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub count: u32,
    pub tenable_scan_id: i64,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cve: Vec<String>,
    #[serde(default)]
    pub see_also: Vec<String>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub false_positive: Option<FalsePositive>,
    #[serde(default)]
    pub security_exception: Option<SecurityException>,
    #[serde(default)]
    pub proposed_close_date: Option<ProposedCloseDate>,
    #[serde(default)]
    pub locked: Option<LockInfo>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub ticket: Option<Ticket>,
    #[serde(default)]
    pub soft_deleted_at: Option<DateTime<Utc>>,
}

fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

impl Vulnerability {
    /// Enriches one raw external finding into a local document.
    pub fn from_external(external: &ExternalVulnerability, tenable_scan_id: i64) -> Self {
        let port = external.port.trim().parse::<u16>().unwrap_or_default();
        let protocol = external.protocol.trim().to_uppercase();
        let port_protocol = if protocol.is_empty() {
            None
        } else {
            Some(format!("{port}/{protocol}"))
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: external.plugin_id.trim().parse().unwrap_or_default(),
            name: external.plugin_name.clone(),
            target: external.ip.trim().to_string(),
            port,
            protocol,
            port_protocol,
            severity: Severity::from_external(&external.severity),
            count: external.count.trim().parse().unwrap_or(1),
            tenable_scan_id,
            first_seen: parse_epoch(&external.first_seen),
            last_seen: parse_epoch(&external.last_seen),
            cve: string_list(&external.cve),
            see_also: string_list(&external.see_also),
            ..Default::default()
        }
    }

    /// Key identifying the same finding across scan runs.
    pub fn merge_key(&self) -> (i64, String, u16, String, i64) {
        (
            self.plugin_id,
            self.target.clone(),
            self.port,
            self.protocol.clone(),
            self.tenable_scan_id,
        )
    }

    /// Sets one lifecycle action and clears the other two.
    ///
    /// This is the only place the single-active-action invariant is
    /// enforced; callers never touch the three fields directly.
    pub fn set_action(&mut self, action: &VulnerabilityAction) {
        self.false_positive = None;
        self.security_exception = None;
        self.proposed_close_date = None;
        match action {
            VulnerabilityAction::FalsePositive(fp) => self.false_positive = Some(fp.clone()),
            VulnerabilityAction::SecurityException(se) => {
                self.security_exception = Some(se.clone())
            }
            VulnerabilityAction::ProposedCloseDate(pcd) => {
                self.proposed_close_date = Some(pcd.clone())
            }
        }
    }

    pub fn active_action(&self) -> Option<ActionKind> {
        if self.false_positive.is_some() {
            Some(ActionKind::FalsePositive)
        } else if self.security_exception.is_some() {
            Some(ActionKind::SecurityException)
        } else if self.proposed_close_date.is_some() {
            Some(ActionKind::ProposedCloseDate)
        } else {
            None
        }
    }

    /// Snapshot of the history tracked action fields, used as
    /// `previous_values`/comparison basis for history entries.
    pub fn action_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "false_positive": self.false_positive,
            "security_exception": self.security_exception,
            "proposed_close_date": self.proposed_close_date,
        })
    }
}
