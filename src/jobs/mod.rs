// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Background synchronization jobs.
//!
//! Each job runs on its own timer trigger; the jobs coordinate through the
//! data they share (queue rows, scan documents) only. They should be run
//! as background tasks.

pub mod result_poll;
pub mod scan_sync;
pub mod vuln_fetch;

use std::sync::{Arc, RwLock};

use crate::{
    config::JobSchedule, directory::DirectoryError, gateway::GatewayError, queue::QueueError,
    router::RouterError, storage,
};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Storage(#[from] storage::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

/// Repository names matching a configured backup marker as prefix or
/// suffix identify secondary repositories whose data is skipped.
pub fn is_backup_repository(name: &str, markers: &[String]) -> bool {
    let name = name.trim().to_lowercase();
    markers.iter().any(|marker| {
        let marker = marker.trim().to_lowercase();
        !marker.is_empty() && (name.starts_with(&marker) || name.ends_with(&marker))
    })
}

/// Drives one job on its interval until the abort flag is set.
///
/// Failures are logged once until the job recovers, then logging is armed
/// again; a failing tick never ends the loop.
pub async fn run<F, Fut>(name: &'static str, schedule: JobSchedule, abort: Arc<RwLock<bool>>, f: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<(), JobError>>,
{
    if !schedule.enabled {
        tracing::info!(job = name, "disabled, not scheduling");
        return;
    }
    let mut interval = tokio::time::interval(schedule.interval);
    tracing::debug!(job = name, "starting job loop");
    let mut warn = true;
    loop {
        interval.tick().await;
        if *abort.read().unwrap() {
            tracing::trace!(job = name, "aborting");
            break;
        }
        match f().await {
            Ok(_) => {
                if !warn {
                    tracing::info!(job = name, "recovered");
                    warn = true;
                }
            }
            Err(e) => {
                if warn {
                    warn = false;
                    tracing::warn!(job = name, %e, "job run failed");
                }
            }
        }
    }
}
