// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Guards around scheduled scan runs.
//!
//! Scans may not be edited while a run is imminent and two scans covering
//! the same targets may not be scheduled into the same time window.

use chrono::{DateTime, Utc};

/// Whether two schedule times fall within `buffer` minutes of each other.
/// Symmetric in its arguments.
pub fn schedule_overlaps(a: DateTime<Utc>, b: DateTime<Utc>, buffer_minutes: i64) -> bool {
    (a - b).num_seconds().abs() <= buffer_minutes * 60
}

/// Whether any target appears in both groups. Surrounding whitespace is
/// ignored.
pub fn targets_overlap(group1: &[String], group2: &[String]) -> bool {
    group1
        .iter()
        .any(|a| group2.iter().any(|b| a.trim() == b.trim()))
}

/// Whether a scan is editable at `now`: false while `now` is within
/// `buffer` minutes of the scheduled run. A scan without a scheduled run
/// is always editable.
pub fn can_edit_scan_at(
    scan_time: Option<DateTime<Utc>>,
    buffer_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    match scan_time {
        Some(at) => !schedule_overlaps(now, at, buffer_minutes),
        None => true,
    }
}

pub fn can_edit_scan(scan_time: Option<DateTime<Utc>>, buffer_minutes: i64) -> bool {
    can_edit_scan_at(scan_time, buffer_minutes, Utc::now())
}
