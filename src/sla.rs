// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Severity dependent remediation deadlines.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{config, models::Severity};

/// Day budgets per severity.
#[derive(Debug, Clone)]
pub struct SlaPolicy {
    critical: i64,
    high: i64,
    medium: i64,
    low: i64,
    info: i64,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self::from(&config::Sla::default())
    }
}

impl From<&config::Sla> for SlaPolicy {
    fn from(value: &config::Sla) -> Self {
        Self {
            critical: value.critical,
            high: value.high,
            medium: value.medium,
            low: value.low,
            info: value.info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlaStatus {
    pub compliant: bool,
    pub days_remaining: i64,
    pub due: DateTime<Utc>,
}

impl SlaPolicy {
    pub fn days(&self, severity: Severity) -> i64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    /// Classifies a finding against its deadline at `now`. Findings without
    /// a first-seen timestamp are measured from `now` and therefore always
    /// compliant.
    pub fn classify(
        &self,
        first_seen: Option<DateTime<Utc>>,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> SlaStatus {
        let start = first_seen.unwrap_or(now);
        let due = start + Duration::days(self.days(severity));
        let days_remaining = (due - now).num_days();
        SlaStatus {
            compliant: now <= due,
            days_remaining,
            due,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn critical_is_out_of_compliance_after_three_days() {
        let policy = SlaPolicy::default();
        let seen = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let inside = policy.classify(Some(seen), Severity::Critical, seen + Duration::days(2));
        assert!(inside.compliant);
        assert_eq!(inside.days_remaining, 1);
        let outside = policy.classify(Some(seen), Severity::Critical, seen + Duration::days(4));
        assert!(!outside.compliant);
    }

    #[test]
    fn boundary_is_still_compliant() {
        let policy = SlaPolicy::default();
        let seen = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let status = policy.classify(Some(seen), Severity::High, seen + Duration::days(7));
        assert!(status.compliant);
        assert_eq!(status.days_remaining, 0);
    }

    #[test]
    fn unseen_findings_are_compliant() {
        let policy = SlaPolicy::default();
        let now = Utc::now();
        let status = policy.classify(None, Severity::Low, now);
        assert!(status.compliant);
        assert_eq!(status.days_remaining, policy.days(Severity::Low));
    }
}
