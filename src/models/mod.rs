// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Domain documents stored per tenant and the wire types of the external
//! scanning service.

mod external;
mod report;
mod scan;
mod vulnerability;

pub use external::{
    ExternalScan, ExternalScanResult, ExternalSchedule, ExternalSeverity, ExternalVulnerability,
    Repository,
};
pub use report::{Report, ReportType};
pub use scan::{Scan, ScanSchedule};
pub use vulnerability::{
    ActionKind, FalsePositive, HistoryDecision, HistoryEntry, HistoryStatus, LockInfo, Note,
    ProposedCloseDate, SecurityException, Severity, Ticket, Vulnerability, VulnerabilityAction,
};
