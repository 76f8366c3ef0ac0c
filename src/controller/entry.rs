// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Defines the entry point for the controller.
//!
//! All known paths must be handled in the entrypoint function.

use std::fmt::Display;
use std::sync::Arc;

use hyper::{Body, Method, Request, Response};
use serde::{Deserialize, Serialize};

use super::context::Context;
use crate::{
    auth::Identity,
    lifecycle::{self, LifecycleError, LockOutcome, MarkActionFilter},
    models::{HistoryDecision, ScanSchedule, Severity, Vulnerability, VulnerabilityAction},
    request::json_request,
    router::RouterError,
    schedule,
    sla::SlaStatus,
    storage::{TenantStorage, VulnerabilityFilter},
};

enum HealthOpts {
    Ready,
    Started,
    Alive,
}

/// The supported paths of vulnd.
enum KnownPaths {
    /// /health/{alive|ready|started}
    Health(HealthOpts),
    /// /organisations/{id}/scans/{id}
    Scans(i64, Option<String>),
    /// /organisations/{id}/vulnerabilities/{id}
    Vulnerabilities(i64, Option<String>),
    /// /organisations/{id}/vulnerabilities/{id}/lock
    VulnerabilityLock(i64, String),
    /// /organisations/{id}/vulnerabilities/{id}/action, bulk without id
    VulnerabilityAction(i64, Option<String>),
    /// /organisations/{id}/vulnerabilities/{id}/history/{id}
    VulnerabilityHistory(i64, String, String),
    /// /organisations/{id}/vulnerabilities/{id}/notes/{id}
    Notes(i64, String, Option<String>),
    /// /organisations/{id}/reports/{id}
    Reports(i64, Option<String>),
    /// Not supported
    Unknown,
}

impl KnownPaths {
    #[tracing::instrument]
    fn from_path(path: &str) -> Self {
        let mut parts = path.split('/').filter(|s| !s.is_empty());
        match parts.next() {
            Some("health") => match parts.next() {
                Some("ready") => KnownPaths::Health(HealthOpts::Ready),
                Some("alive") => KnownPaths::Health(HealthOpts::Alive),
                Some("started") => KnownPaths::Health(HealthOpts::Started),
                _ => KnownPaths::Unknown,
            },
            Some("organisations") => {
                let Some(org) = parts.next().and_then(|id| id.parse::<i64>().ok()) else {
                    return KnownPaths::Unknown;
                };
                match parts.next() {
                    Some("scans") => KnownPaths::Scans(org, parts.next().map(str::to_string)),
                    Some("vulnerabilities") => match parts.next() {
                        None => KnownPaths::Vulnerabilities(org, None),
                        Some("action") => KnownPaths::VulnerabilityAction(org, None),
                        Some(vid) => match parts.next() {
                            None => KnownPaths::Vulnerabilities(org, Some(vid.to_string())),
                            Some("action") => {
                                KnownPaths::VulnerabilityAction(org, Some(vid.to_string()))
                            }
                            Some("lock") => KnownPaths::VulnerabilityLock(org, vid.to_string()),
                            Some("history") => match parts.next() {
                                Some(hid) => KnownPaths::VulnerabilityHistory(
                                    org,
                                    vid.to_string(),
                                    hid.to_string(),
                                ),
                                None => KnownPaths::Unknown,
                            },
                            Some("notes") => KnownPaths::Notes(
                                org,
                                vid.to_string(),
                                parts.next().map(str::to_string),
                            ),
                            Some(_) => KnownPaths::Unknown,
                        },
                    },
                    Some("reports") => KnownPaths::Reports(org, parts.next().map(str::to_string)),
                    _ => KnownPaths::Unknown,
                }
            }
            _ => {
                tracing::trace!("Unknown path: {path}");
                KnownPaths::Unknown
            }
        }
    }

    fn organisation(&self) -> Option<i64> {
        match self {
            Self::Scans(org, _)
            | Self::Vulnerabilities(org, _)
            | Self::VulnerabilityLock(org, _)
            | Self::VulnerabilityAction(org, _)
            | Self::VulnerabilityHistory(org, _, _)
            | Self::Notes(org, _, _)
            | Self::Reports(org, _) => Some(*org),
            Self::Health(_) | Self::Unknown => None,
        }
    }
}

impl std::fmt::Debug for KnownPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for KnownPaths {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KnownPaths::Health(HealthOpts::Alive) => write!(f, "/health/alive"),
            KnownPaths::Health(HealthOpts::Ready) => write!(f, "/health/ready"),
            KnownPaths::Health(HealthOpts::Started) => write!(f, "/health/started"),
            KnownPaths::Scans(org, Some(id)) => write!(f, "/organisations/{org}/scans/{id}"),
            KnownPaths::Scans(org, None) => write!(f, "/organisations/{org}/scans"),
            KnownPaths::Vulnerabilities(org, Some(id)) => {
                write!(f, "/organisations/{org}/vulnerabilities/{id}")
            }
            KnownPaths::Vulnerabilities(org, None) => {
                write!(f, "/organisations/{org}/vulnerabilities")
            }
            KnownPaths::VulnerabilityLock(org, id) => {
                write!(f, "/organisations/{org}/vulnerabilities/{id}/lock")
            }
            KnownPaths::VulnerabilityAction(org, Some(id)) => {
                write!(f, "/organisations/{org}/vulnerabilities/{id}/action")
            }
            KnownPaths::VulnerabilityAction(org, None) => {
                write!(f, "/organisations/{org}/vulnerabilities/action")
            }
            KnownPaths::VulnerabilityHistory(org, vid, hid) => {
                write!(f, "/organisations/{org}/vulnerabilities/{vid}/history/{hid}")
            }
            KnownPaths::Notes(org, vid, Some(nid)) => {
                write!(f, "/organisations/{org}/vulnerabilities/{vid}/notes/{nid}")
            }
            KnownPaths::Notes(org, vid, None) => {
                write!(f, "/organisations/{org}/vulnerabilities/{vid}/notes")
            }
            KnownPaths::Reports(org, Some(id)) => {
                write!(f, "/organisations/{org}/reports/{id}")
            }
            KnownPaths::Reports(org, None) => write!(f, "/organisations/{org}/reports"),
            KnownPaths::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Deserialize, Debug)]
struct ScanPatch {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    targets: Option<Vec<String>>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    schedule: Option<ScanSchedule>,
}

#[derive(Deserialize, Debug)]
struct BulkActionRequest {
    filter: MarkActionFilter,
    #[serde(flatten)]
    action: VulnerabilityAction,
}

#[derive(Deserialize, Debug)]
struct NoteRequest {
    note: String,
}

#[derive(Deserialize, Debug)]
struct ReportPatch {
    report_type: crate::models::ReportType,
}

#[derive(Serialize, Debug)]
struct VulnerabilityView {
    #[serde(flatten)]
    vulnerability: Vulnerability,
    sla: SlaStatus,
}

fn lifecycle_failure(ctx: &Context, error: LifecycleError) -> Response<Body> {
    match error {
        LifecycleError::NotFound => ctx.response.not_found("vulnerabilities", "requested"),
        LifecycleError::Locked => ctx.response.conflict("locked by another user"),
        LifecycleError::Validation(messages) => ctx
            .response
            .failure(hyper::StatusCode::BAD_REQUEST, &messages),
        LifecycleError::Forbidden => ctx.response.forbidden("not allowed for this user"),
        LifecycleError::Conflict(message) => ctx.response.conflict(&message),
        LifecycleError::Storage(e) => ctx.response.internal_server_error(&e),
    }
}

/// Parses the vulnerability listing filter from the query string, e.g.
/// `severity=3,4&plugin_id=19506&target=10.0.0.1&include_deleted=true`.
fn listing_filter(query: &str) -> VulnerabilityFilter {
    let mut filter = VulnerabilityFilter::default();
    for pair in query.split('&') {
        let mut kv = pair.split('=');
        let (Some(key), Some(value)) = (kv.next(), kv.next()) else {
            continue;
        };
        match key {
            "severity" => {
                let severities: Vec<Severity> = value
                    .split(',')
                    .filter_map(|s| s.trim().parse::<u8>().ok())
                    .filter_map(|s| Severity::try_from(s).ok())
                    .collect();
                if !severities.is_empty() {
                    filter.severities = Some(severities);
                }
            }
            "plugin_id" => {
                let plugins: Vec<i64> =
                    value.split(',').filter_map(|p| p.trim().parse().ok()).collect();
                if !plugins.is_empty() {
                    filter.plugin_ids = Some(plugins);
                }
            }
            "target" => {
                filter.targets = Some(value.split(',').map(str::to_string).collect());
            }
            "include_deleted" => {
                filter.include_deleted = value == "true";
            }
            _ => {}
        }
    }
    filter
}

async fn resolve_storage(
    ctx: &Context,
    org: i64,
) -> Result<Arc<dyn TenantStorage>, Response<Body>> {
    ctx.router.resolve(org).await.map_err(|e| match e {
        RouterError::UnknownTenant(_) => {
            ctx.response.not_found("organisations", &org.to_string())
        }
        RouterError::Configuration(reason) => ctx.response.service_unavailable(&reason),
        RouterError::Directory(e) => ctx.response.internal_server_error(&e),
    })
}

async fn patch_scan(
    ctx: &Context,
    storage: &dyn TenantStorage,
    id: &str,
    patch: ScanPatch,
) -> Response<Body> {
    let mut scan = match storage.get_scan(id).await {
        Ok(scan) => scan,
        Err(_) => return ctx.response.not_found("scans", id),
    };
    // edits are refused while a run is imminent
    if !schedule::can_edit_scan(scan.schedule.start_time_utc, ctx.edit_buffer_minutes) {
        return ctx
            .response
            .conflict("a scan run is imminent, try again later");
    }
    if let Some(name) = patch.name {
        scan.name = name;
    }
    if let Some(targets) = patch.targets {
        scan.targets = targets;
    }
    if let Some(enabled) = patch.enabled {
        scan.enabled = enabled;
    }
    if let Some(new_schedule) = patch.schedule {
        // no two scans over shared targets in the same window
        if let Some(start) = new_schedule.start_time_utc {
            let others = match storage.get_scans().await {
                Ok(scans) => scans,
                Err(e) => return ctx.response.internal_server_error(&e),
            };
            let conflicting = others.iter().any(|other| {
                other.id != scan.id
                    && other.enabled
                    && other
                        .schedule
                        .start_time_utc
                        .map(|o| schedule::schedule_overlaps(start, o, ctx.edit_buffer_minutes))
                        .unwrap_or(false)
                    && schedule::targets_overlap(&scan.targets, &other.targets)
            });
            if conflicting {
                return ctx
                    .response
                    .conflict("another scan covers the same targets in this window");
            }
        }
        scan.schedule = new_schedule;
    }
    match storage.update_scan(scan.clone()).await {
        Ok(()) => ctx.response.ok(&scan),
        Err(e) => ctx.response.internal_server_error(&e),
    }
}

/// Is used to handle all incoming requests.
pub async fn entrypoint(
    req: Request<Body>,
    ctx: Arc<Context>,
) -> Result<Response<Body>, hyper::http::Error> {
    // on head requests we just return an empty response without body
    if req.method() == Method::HEAD {
        return Ok(ctx.response.empty(hyper::StatusCode::OK));
    }
    let kp = KnownPaths::from_path(req.uri().path());
    if let KnownPaths::Health(_) = &kp {
        return Ok(ctx.response.empty(hyper::StatusCode::OK));
    }

    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let identity: Identity = match ctx.verifier.identity_from_header(authorization.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!("{} {} unauthorized: {}", req.method(), kp, e);
            return Ok(ctx.response.unauthorized());
        }
    };

    let Some(org) = kp.organisation() else {
        return Ok(ctx.response.not_found("path", req.uri().path()));
    };
    if !identity.can_access(org) {
        // we return 404 instead of 403 to not leak organisation ids
        tracing::debug!(user = identity.id, org, "organisation scope violation");
        return Ok(ctx.response.not_found("organisations", &org.to_string()));
    }
    let storage = match resolve_storage(&ctx, org).await {
        Ok(storage) => storage,
        Err(resp) => return Ok(resp),
    };

    tracing::debug!("{} {}", req.method(), kp);
    match (req.method(), kp) {
        (&Method::GET, KnownPaths::Scans(_, None)) => match storage.get_scans().await {
            Ok(scans) => Ok(ctx.response.ok(&scans)),
            Err(e) => Ok(ctx.response.internal_server_error(&e)),
        },
        (&Method::GET, KnownPaths::Scans(_, Some(id))) => match storage.get_scan(&id).await {
            Ok(scan) => Ok(ctx.response.ok(&scan)),
            Err(crate::storage::Error::NotFound) => Ok(ctx.response.not_found("scans", &id)),
            Err(e) => Ok(ctx.response.internal_server_error(&e)),
        },
        (&Method::PATCH, KnownPaths::Scans(_, Some(id))) => {
            match json_request::<ScanPatch>(&ctx.response, req).await {
                Ok(patch) => Ok(patch_scan(&ctx, storage.as_ref(), &id, patch).await),
                Err(resp) => Ok(resp),
            }
        }
        (&Method::GET, KnownPaths::Vulnerabilities(_, None)) => {
            let filter = listing_filter(req.uri().query().unwrap_or_default());
            match storage.find_vulnerabilities(&filter).await {
                Ok(vulnerabilities) => {
                    let now = chrono::Utc::now();
                    let views: Vec<VulnerabilityView> = vulnerabilities
                        .into_iter()
                        .map(|v| {
                            let sla = ctx.sla.classify(v.first_seen, v.severity, now);
                            VulnerabilityView {
                                vulnerability: v,
                                sla,
                            }
                        })
                        .collect();
                    Ok(ctx.response.ok(&views))
                }
                Err(e) => Ok(ctx.response.internal_server_error(&e)),
            }
        }
        (&Method::GET, KnownPaths::Vulnerabilities(_, Some(id))) => {
            match storage.get_vulnerability(&id).await {
                Ok(vulnerability) => Ok(ctx.response.ok(&vulnerability)),
                Err(crate::storage::Error::NotFound) => {
                    Ok(ctx.response.not_found("vulnerabilities", &id))
                }
                Err(e) => Ok(ctx.response.internal_server_error(&e)),
            }
        }
        (&Method::POST, KnownPaths::VulnerabilityLock(_, id)) => {
            match lifecycle::lock(storage.as_ref(), &[id], &identity).await {
                Ok(LockOutcome::AlreadyLocked) => {
                    Ok(ctx.response.conflict("already locked by another user"))
                }
                Ok(outcome) => Ok(ctx.response.ok(&outcome)),
                Err(e) => Ok(lifecycle_failure(&ctx, e)),
            }
        }
        (&Method::DELETE, KnownPaths::VulnerabilityLock(_, id)) => {
            match lifecycle::unlock(storage.as_ref(), &[id], &identity).await {
                Ok(0) => Ok(ctx.response.conflict("not the lock holder")),
                Ok(_) => Ok(ctx.response.no_content()),
                Err(e) => Ok(lifecycle_failure(&ctx, e)),
            }
        }
        (&Method::POST, KnownPaths::VulnerabilityAction(_, Some(id))) => {
            match json_request::<VulnerabilityAction>(&ctx.response, req).await {
                Ok(action) => {
                    match lifecycle::perform_action(storage.as_ref(), &id, action, &identity).await
                    {
                        Ok(vulnerability) => Ok(ctx.response.ok(&vulnerability)),
                        Err(e) => Ok(lifecycle_failure(&ctx, e)),
                    }
                }
                Err(resp) => Ok(resp),
            }
        }
        (&Method::POST, KnownPaths::VulnerabilityAction(_, None)) => {
            match json_request::<BulkActionRequest>(&ctx.response, req).await {
                Ok(bulk) => {
                    match lifecycle::perform_action_on_vulnerabilities(
                        storage.as_ref(),
                        &bulk.filter,
                        bulk.action,
                        &identity,
                    )
                    .await
                    {
                        Ok(outcomes) => Ok(ctx.response.ok(&outcomes)),
                        Err(e) => Ok(lifecycle_failure(&ctx, e)),
                    }
                }
                Err(resp) => Ok(resp),
            }
        }
        (&Method::POST, KnownPaths::VulnerabilityHistory(_, vid, hid)) => {
            match json_request::<HistoryDecision>(&ctx.response, req).await {
                Ok(decision) => {
                    match lifecycle::resolve_history(
                        storage.as_ref(),
                        &vid,
                        &hid,
                        decision,
                        &identity,
                    )
                    .await
                    {
                        Ok(vulnerability) => Ok(ctx.response.ok(&vulnerability)),
                        Err(e) => Ok(lifecycle_failure(&ctx, e)),
                    }
                }
                Err(resp) => Ok(resp),
            }
        }
        (&Method::POST, KnownPaths::Notes(_, vid, None)) => {
            match json_request::<NoteRequest>(&ctx.response, req).await {
                Ok(note) => {
                    match lifecycle::add_note(storage.as_ref(), &vid, &note.note, &identity).await
                    {
                        Ok(vulnerability) => Ok(ctx.response.created(&vulnerability)),
                        Err(e) => Ok(lifecycle_failure(&ctx, e)),
                    }
                }
                Err(resp) => Ok(resp),
            }
        }
        (&Method::PATCH, KnownPaths::Notes(_, vid, Some(nid))) => {
            match json_request::<NoteRequest>(&ctx.response, req).await {
                Ok(note) => {
                    match lifecycle::update_note(
                        storage.as_ref(),
                        &vid,
                        &nid,
                        &note.note,
                        &identity,
                    )
                    .await
                    {
                        Ok(vulnerability) => Ok(ctx.response.ok(&vulnerability)),
                        Err(e) => Ok(lifecycle_failure(&ctx, e)),
                    }
                }
                Err(resp) => Ok(resp),
            }
        }
        (&Method::DELETE, KnownPaths::Notes(_, vid, Some(nid))) => {
            match lifecycle::delete_note(storage.as_ref(), &vid, &nid, &identity).await {
                Ok(_) => Ok(ctx.response.no_content()),
                Err(e) => Ok(lifecycle_failure(&ctx, e)),
            }
        }
        (&Method::GET, KnownPaths::Reports(_, None)) => match storage.get_reports().await {
            Ok(reports) => Ok(ctx.response.ok(&reports)),
            Err(e) => Ok(ctx.response.internal_server_error(&e)),
        },
        (&Method::GET, KnownPaths::Reports(_, Some(id))) => match storage.get_report(&id).await {
            Ok(report) => Ok(ctx.response.ok(&report)),
            Err(crate::storage::Error::NotFound) => Ok(ctx.response.not_found("reports", &id)),
            Err(e) => Ok(ctx.response.internal_server_error(&e)),
        },
        (&Method::PATCH, KnownPaths::Reports(_, Some(id))) => {
            if !identity.user_type.is_reviewer() {
                return Ok(ctx.response.forbidden("only reviewers finalise reports"));
            }
            match json_request::<ReportPatch>(&ctx.response, req).await {
                Ok(patch) => match storage.get_report(&id).await {
                    Ok(mut report) => {
                        report.report_type = patch.report_type;
                        match storage.update_report(report.clone()).await {
                            Ok(()) => Ok(ctx.response.ok(&report)),
                            Err(e) => Ok(ctx.response.internal_server_error(&e)),
                        }
                    }
                    Err(crate::storage::Error::NotFound) => {
                        Ok(ctx.response.not_found("reports", &id))
                    }
                    Err(e) => Ok(ctx.response.internal_server_error(&e)),
                },
                Err(resp) => Ok(resp),
            }
        }
        (_, kp) => Ok(ctx.response.not_found("path", &kp.to_string())),
    }
}
