// SPDX-FileCopyrightText: 2024 Greenbone AG
//
// SPDX-License-Identifier: GPL-2.0-or-later

//! Vulnerability lifecycle engine.
//!
//! Implements the per-vulnerability lock semantics, the approve/reject
//! history workflow for the mutually exclusive action fields and the bulk
//! "mark action" application over a filtered set.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    auth::Identity,
    models::{
        ActionKind, HistoryDecision, HistoryEntry, HistoryStatus, LockInfo, Note, Vulnerability,
        VulnerabilityAction,
    },
    storage::{self, TenantStorage, VulnerabilityFilter},
};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("vulnerability not found")]
    NotFound,
    #[error("locked by another user")]
    Locked,
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),
    #[error("not allowed for this user")]
    Forbidden,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(storage::Error),
}

impl From<storage::Error> for LifecycleError {
    fn from(value: storage::Error) -> Self {
        match value {
            storage::Error::NotFound => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}

/// Outcome of a lock request over one or more vulnerabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LockOutcome {
    /// Every requested vulnerability is now locked by the requester.
    Locked { matched: usize },
    /// Some were already locked by someone else.
    Partial { matched: usize, requested: usize },
    /// None could be locked.
    AlreadyLocked,
}

/// Pure lock predicate: unlocked never blocks, a lock held by the
/// requester does not block either.
pub fn is_locked(lock: Option<&LockInfo>, user: &str) -> bool {
    match lock {
        Some(info) => info.user != user,
        None => false,
    }
}

/// Compare-and-set lock over a set of vulnerabilities.
pub async fn lock(
    storage: &dyn TenantStorage,
    ids: &[String],
    requester: &Identity,
) -> Result<LockOutcome, LifecycleError> {
    let matched = storage
        .lock_vulnerabilities(ids, &requester.reference(), Utc::now())
        .await?;
    Ok(match matched {
        0 => LockOutcome::AlreadyLocked,
        n if n == ids.len() => LockOutcome::Locked { matched: n },
        n => LockOutcome::Partial {
            matched: n,
            requested: ids.len(),
        },
    })
}

/// Releases locks held by the requester.
pub async fn unlock(
    storage: &dyn TenantStorage,
    ids: &[String],
    requester: &Identity,
) -> Result<usize, LifecycleError> {
    Ok(storage
        .unlock_vulnerabilities(ids, &requester.reference())
        .await?)
}

fn validate(action: &VulnerabilityAction) -> Result<(), LifecycleError> {
    let mut messages = Vec::new();
    match action {
        VulnerabilityAction::FalsePositive(_) => {}
        VulnerabilityAction::SecurityException(se) => {
            if let Some(end) = se.end_date {
                if end < se.start_date {
                    messages.push("end_date must not be before start_date".to_string());
                }
            }
        }
        VulnerabilityAction::ProposedCloseDate(pcd) => {
            if pcd.date < Utc::now() {
                messages.push("proposed close date must be in the future".to_string());
            }
        }
    }
    if messages.is_empty() {
        Ok(())
    } else {
        Err(LifecycleError::Validation(messages))
    }
}

/// History status of a fresh request, determined by the requester role.
///
/// Proposed close dates always require explicit approval, independent of
/// the role; everything else is auto-approved for staff and admin.
fn initial_status(kind: ActionKind, requester: &Identity) -> HistoryStatus {
    match kind {
        ActionKind::ProposedCloseDate => HistoryStatus::Proposed,
        _ if requester.user_type.is_reviewer() => HistoryStatus::Approved,
        _ => HistoryStatus::Pending,
    }
}

/// Applies one action to one vulnerability.
///
/// Auto-approved requests mutate the live fields immediately; pending and
/// proposed requests only record the history entry and leave the live
/// fields to the approval step.
pub async fn perform_action(
    storage: &dyn TenantStorage,
    vulnerability_id: &str,
    action: VulnerabilityAction,
    requester: &Identity,
) -> Result<Vulnerability, LifecycleError> {
    validate(&action)?;
    let mut vulnerability = storage.get_vulnerability(vulnerability_id).await?;
    if is_locked(vulnerability.locked.as_ref(), &requester.reference()) {
        return Err(LifecycleError::Locked);
    }

    let previous = vulnerability.action_snapshot();
    let status = initial_status(action.kind(), requester);
    let new_values =
        serde_json::to_value(&action).map_err(|_| LifecycleError::Conflict("serialize".into()))?;

    let mut applied = vulnerability.clone();
    applied.set_action(&action);
    if applied.action_snapshot() == previous {
        // nothing changed, no history entry
        return Ok(vulnerability);
    }

    if status == HistoryStatus::Approved {
        vulnerability.set_action(&action);
    }
    vulnerability.history.push(HistoryEntry {
        id: uuid::Uuid::new_v4().to_string(),
        action: action.kind(),
        status,
        previous_values: previous,
        new_values,
        requested_by: requester.reference(),
        requested_at: Utc::now(),
        updated_by: None,
        updated_at: None,
        reject_reason: None,
    });
    storage.replace_vulnerability(vulnerability.clone()).await?;
    Ok(vulnerability)
}

/// Approves or rejects one open history entry.
///
/// Approval copies the proposed values onto the live fields; rejection
/// only transitions the entry, never the substantive fields.
pub async fn resolve_history(
    storage: &dyn TenantStorage,
    vulnerability_id: &str,
    history_id: &str,
    decision: HistoryDecision,
    requester: &Identity,
) -> Result<Vulnerability, LifecycleError> {
    if !requester.user_type.is_reviewer() {
        return Err(LifecycleError::Forbidden);
    }
    if let HistoryDecision::Reject { reject_reason } = &decision {
        if reject_reason.trim().is_empty() {
            return Err(LifecycleError::Validation(vec![
                "reject_reason must not be empty".to_string(),
            ]));
        }
    }

    let mut vulnerability = storage.get_vulnerability(vulnerability_id).await?;
    let entry_index = vulnerability
        .history
        .iter()
        .position(|h| h.id == history_id)
        .ok_or(LifecycleError::NotFound)?;
    if !vulnerability.history[entry_index].status.is_open() {
        return Err(LifecycleError::Conflict(format!(
            "history entry is already {:?}",
            vulnerability.history[entry_index].status
        )));
    }

    match decision {
        HistoryDecision::Approve => {
            let action: VulnerabilityAction =
                serde_json::from_value(vulnerability.history[entry_index].new_values.clone())
                    .map_err(|_| {
                        LifecycleError::Conflict("history entry carries no action".to_string())
                    })?;
            vulnerability.set_action(&action);
            let entry = &mut vulnerability.history[entry_index];
            entry.status = HistoryStatus::Approved;
            entry.updated_by = Some(requester.reference());
            entry.updated_at = Some(Utc::now());
        }
        HistoryDecision::Reject { reject_reason } => {
            let entry = &mut vulnerability.history[entry_index];
            entry.status = HistoryStatus::Rejected;
            entry.reject_reason = Some(reject_reason);
            entry.updated_by = Some(requester.reference());
            entry.updated_at = Some(Utc::now());
        }
    }
    storage.replace_vulnerability(vulnerability.clone()).await?;
    Ok(vulnerability)
}

/// Structured filter of the bulk "mark action" request. The sentinels
/// `"any"` and `"all"` disable a dimension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarkActionFilter {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub plugin_ids: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

fn is_sentinel(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "" | "any" | "all")
}

fn list_dimension<T, F>(values: &[String], parse: F) -> Option<Vec<T>>
where
    F: Fn(&str) -> Option<T>,
{
    if values.is_empty() || values.iter().any(|v| is_sentinel(v)) {
        return None;
    }
    Some(values.iter().filter_map(|v| parse(v.trim())).collect())
}

impl MarkActionFilter {
    pub fn to_query(&self) -> VulnerabilityFilter {
        VulnerabilityFilter {
            ports: list_dimension(&self.ports, |v| v.parse().ok()),
            protocol: if is_sentinel(&self.protocol) {
                None
            } else {
                Some(self.protocol.trim().to_string())
            },
            plugin_ids: list_dimension(&self.plugin_ids, |v| v.parse().ok()),
            targets: list_dimension(&self.targets, |v| Some(v.to_string())),
            severities: None,
            include_deleted: false,
        }
    }
}

/// Per-vulnerability outcome of a bulk application.
#[derive(Debug, Serialize)]
pub struct BulkOutcome {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies the action to every vulnerability matching the filter.
///
/// Best effort: individual failures are reported per id and do not stop
/// the remaining applications.
pub async fn perform_action_on_vulnerabilities(
    storage: &dyn TenantStorage,
    filter: &MarkActionFilter,
    action: VulnerabilityAction,
    requester: &Identity,
) -> Result<Vec<BulkOutcome>, LifecycleError> {
    let matched = storage.find_vulnerabilities(&filter.to_query()).await?;
    let mut outcomes = Vec::with_capacity(matched.len());
    for vulnerability in matched {
        let id = vulnerability.id.clone();
        match perform_action(storage, &id, action.clone(), requester).await {
            Ok(_) => outcomes.push(BulkOutcome {
                id,
                ok: true,
                error: None,
            }),
            Err(e) => {
                tracing::warn!(vulnerability = %id, error = %e, "bulk action skipped one vulnerability");
                outcomes.push(BulkOutcome {
                    id,
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    Ok(outcomes)
}

/// Appends a note. Notes are free form and follow the same lock rules as
/// the action fields.
pub async fn add_note(
    storage: &dyn TenantStorage,
    vulnerability_id: &str,
    text: &str,
    requester: &Identity,
) -> Result<Vulnerability, LifecycleError> {
    if text.trim().is_empty() {
        return Err(LifecycleError::Validation(vec![
            "note must not be empty".to_string(),
        ]));
    }
    let mut vulnerability = storage.get_vulnerability(vulnerability_id).await?;
    if is_locked(vulnerability.locked.as_ref(), &requester.reference()) {
        return Err(LifecycleError::Locked);
    }
    vulnerability.notes.push(Note {
        id: uuid::Uuid::new_v4().to_string(),
        note: text.to_string(),
        created_by: requester.reference(),
        created_at: Utc::now(),
        updated_by: None,
        updated_at: None,
    });
    storage.replace_vulnerability(vulnerability.clone()).await?;
    Ok(vulnerability)
}

pub async fn update_note(
    storage: &dyn TenantStorage,
    vulnerability_id: &str,
    note_id: &str,
    text: &str,
    requester: &Identity,
) -> Result<Vulnerability, LifecycleError> {
    if text.trim().is_empty() {
        return Err(LifecycleError::Validation(vec![
            "note must not be empty".to_string(),
        ]));
    }
    let mut vulnerability = storage.get_vulnerability(vulnerability_id).await?;
    if is_locked(vulnerability.locked.as_ref(), &requester.reference()) {
        return Err(LifecycleError::Locked);
    }
    let note = vulnerability
        .notes
        .iter_mut()
        .find(|n| n.id == note_id)
        .ok_or(LifecycleError::NotFound)?;
    if note.created_by != requester.reference() && !requester.user_type.is_reviewer() {
        return Err(LifecycleError::Forbidden);
    }
    note.note = text.to_string();
    note.updated_by = Some(requester.reference());
    note.updated_at = Some(Utc::now());
    storage.replace_vulnerability(vulnerability.clone()).await?;
    Ok(vulnerability)
}

pub async fn delete_note(
    storage: &dyn TenantStorage,
    vulnerability_id: &str,
    note_id: &str,
    requester: &Identity,
) -> Result<Vulnerability, LifecycleError> {
    let mut vulnerability = storage.get_vulnerability(vulnerability_id).await?;
    if is_locked(vulnerability.locked.as_ref(), &requester.reference()) {
        return Err(LifecycleError::Locked);
    }
    let index = vulnerability
        .notes
        .iter()
        .position(|n| n.id == note_id)
        .ok_or(LifecycleError::NotFound)?;
    if vulnerability.notes[index].created_by != requester.reference()
        && !requester.user_type.is_reviewer()
    {
        return Err(LifecycleError::Forbidden);
    }
    vulnerability.notes.remove(index);
    storage.replace_vulnerability(vulnerability.clone()).await?;
    Ok(vulnerability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserType;
    use crate::models::{
        FalsePositive, ProposedCloseDate, SecurityException, Severity,
    };
    use crate::storage::{inmemory, VulnerabilityStorer as _};
    use chrono::Duration;

    fn customer() -> Identity {
        Identity {
            id: 100,
            user_type: UserType::Customer,
            organizations: vec![1],
        }
    }

    fn admin() -> Identity {
        Identity {
            id: 7,
            user_type: UserType::Admin,
            organizations: vec![],
        }
    }

    fn false_positive() -> VulnerabilityAction {
        VulnerabilityAction::FalsePositive(FalsePositive {
            reason: Some("known lab host".to_string()),
        })
    }

    fn security_exception() -> VulnerabilityAction {
        VulnerabilityAction::SecurityException(SecurityException {
            start_date: Utc::now(),
            end_date: Some(Utc::now() + Duration::days(30)),
        })
    }

    async fn seeded() -> (inmemory::Storage, String) {
        let storage = inmemory::Storage::new();
        let v = Vulnerability {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: 19506,
            target: "10.0.0.1".to_string(),
            port: 443,
            protocol: "TCP".to_string(),
            severity: Severity::High,
            tenable_scan_id: 7,
            count: 1,
            ..Default::default()
        };
        let id = storage.upsert_vulnerability(v).await.unwrap().id;
        (storage, id)
    }

    #[test]
    fn lock_predicate() {
        assert!(!is_locked(None, "alice"));
        let lock = LockInfo {
            user: "alice".to_string(),
            at: Utc::now(),
        };
        assert!(!is_locked(Some(&lock), "alice"));
        assert!(is_locked(Some(&lock), "bob"));
    }

    #[tokio::test]
    async fn lock_outcomes() {
        let (storage, id) = seeded().await;
        let other = Vulnerability {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: 2,
            target: "10.0.0.2".to_string(),
            tenable_scan_id: 7,
            ..Default::default()
        };
        let other_id = storage.upsert_vulnerability(other).await.unwrap().id;

        let alice = customer();
        let bob = Identity { id: 101, ..customer() };

        let outcome = lock(&storage, &[id.clone()], &alice).await.unwrap();
        assert_eq!(outcome, LockOutcome::Locked { matched: 1 });
        // bob gets a partial lock over both, alice holds the first
        let outcome = lock(&storage, &[id.clone(), other_id.clone()], &bob)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LockOutcome::Partial {
                matched: 1,
                requested: 2
            }
        );
        // bob cannot lock the one alice holds at all
        let outcome = lock(&storage, &[id.clone()], &bob).await.unwrap();
        assert_eq!(outcome, LockOutcome::AlreadyLocked);
        // the holder can relock
        let outcome = lock(&storage, &[id], &alice).await.unwrap();
        assert_eq!(outcome, LockOutcome::Locked { matched: 1 });
    }

    #[tokio::test]
    async fn admin_actions_apply_immediately() {
        let (storage, id) = seeded().await;
        let updated = perform_action(&storage, &id, false_positive(), &admin())
            .await
            .unwrap();
        assert!(updated.false_positive.is_some());
        assert_eq!(updated.history.len(), 1);
        assert_eq!(updated.history[0].status, HistoryStatus::Approved);
    }

    #[tokio::test]
    async fn customer_actions_stay_pending_until_approved() {
        let (storage, id) = seeded().await;
        let updated = perform_action(&storage, &id, false_positive(), &customer())
            .await
            .unwrap();
        // live fields untouched until approval
        assert!(updated.false_positive.is_none());
        assert_eq!(updated.history[0].status, HistoryStatus::Pending);

        let history_id = updated.history[0].id.clone();
        let approved = resolve_history(
            &storage,
            &id,
            &history_id,
            HistoryDecision::Approve,
            &admin(),
        )
        .await
        .unwrap();
        assert!(approved.false_positive.is_some());
        assert_eq!(approved.history[0].status, HistoryStatus::Approved);
        assert_eq!(approved.history[0].updated_by.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn single_active_action_invariant() {
        let (storage, id) = seeded().await;
        perform_action(&storage, &id, false_positive(), &admin())
            .await
            .unwrap();
        let updated = perform_action(&storage, &id, security_exception(), &admin())
            .await
            .unwrap();
        assert!(updated.false_positive.is_none());
        assert!(updated.security_exception.is_some());
        assert!(updated.proposed_close_date.is_none());
        assert_eq!(updated.history.len(), 2);
    }

    #[tokio::test]
    async fn proposed_close_date_always_requires_approval() {
        let (storage, id) = seeded().await;
        let action = VulnerabilityAction::ProposedCloseDate(ProposedCloseDate {
            date: Utc::now() + Duration::days(14),
            reason: None,
        });
        let updated = perform_action(&storage, &id, action, &admin())
            .await
            .unwrap();
        assert!(updated.proposed_close_date.is_none());
        assert_eq!(updated.history[0].status, HistoryStatus::Proposed);
    }

    #[tokio::test]
    async fn reject_requires_a_reason_and_keeps_fields() {
        let (storage, id) = seeded().await;
        let updated = perform_action(&storage, &id, false_positive(), &customer())
            .await
            .unwrap();
        let history_id = updated.history[0].id.clone();

        let missing_reason = resolve_history(
            &storage,
            &id,
            &history_id,
            HistoryDecision::Reject {
                reject_reason: "  ".to_string(),
            },
            &admin(),
        )
        .await;
        assert!(matches!(missing_reason, Err(LifecycleError::Validation(_))));
        // no state change happened
        let unchanged = storage.get_vulnerability(&id).await.unwrap();
        assert_eq!(unchanged.history[0].status, HistoryStatus::Pending);

        let rejected = resolve_history(
            &storage,
            &id,
            &history_id,
            HistoryDecision::Reject {
                reject_reason: "not reproducible".to_string(),
            },
            &admin(),
        )
        .await
        .unwrap();
        assert!(rejected.false_positive.is_none());
        assert_eq!(rejected.history[0].status, HistoryStatus::Rejected);
        assert_eq!(
            rejected.history[0].reject_reason.as_deref(),
            Some("not reproducible")
        );
        // a decided entry cannot be decided again
        assert!(matches!(
            resolve_history(&storage, &id, &history_id, HistoryDecision::Approve, &admin()).await,
            Err(LifecycleError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn customers_cannot_review() {
        let (storage, id) = seeded().await;
        let updated = perform_action(&storage, &id, false_positive(), &customer())
            .await
            .unwrap();
        let history_id = updated.history[0].id.clone();
        assert!(matches!(
            resolve_history(&storage, &id, &history_id, HistoryDecision::Approve, &customer())
                .await,
            Err(LifecycleError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn locked_by_other_user_blocks_actions() {
        let (storage, id) = seeded().await;
        let alice = customer();
        let bob = Identity { id: 101, ..customer() };
        lock(&storage, &[id.clone()], &alice).await.unwrap();
        assert!(matches!(
            perform_action(&storage, &id, false_positive(), &bob).await,
            Err(LifecycleError::Locked)
        ));
        // the lock holder can keep editing
        assert!(perform_action(&storage, &id, false_positive(), &alice)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unchanged_action_appends_no_history() {
        let (storage, id) = seeded().await;
        perform_action(&storage, &id, false_positive(), &admin())
            .await
            .unwrap();
        let again = perform_action(&storage, &id, false_positive(), &admin())
            .await
            .unwrap();
        assert_eq!(again.history.len(), 1);
    }

    #[tokio::test]
    async fn bulk_action_is_best_effort() {
        let (storage, id) = seeded().await;
        let second = Vulnerability {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: 19506,
            target: "10.0.0.2".to_string(),
            port: 443,
            protocol: "TCP".to_string(),
            tenable_scan_id: 7,
            ..Default::default()
        };
        let second_id = storage.upsert_vulnerability(second).await.unwrap().id;
        // bob holds the second one, the bulk application skips it
        let bob = Identity { id: 101, ..customer() };
        lock(&storage, &[second_id.clone()], &bob).await.unwrap();

        let filter = MarkActionFilter {
            plugin_ids: vec!["19506".to_string()],
            protocol: "any".to_string(),
            ..Default::default()
        };
        let outcomes =
            perform_action_on_vulnerabilities(&storage, &filter, false_positive(), &admin())
                .await
                .unwrap();
        assert_eq!(outcomes.len(), 2);
        let by_id = |target: &str| outcomes.iter().find(|o| o.id == target).unwrap();
        assert!(by_id(&id).ok);
        assert!(!by_id(&second_id).ok);
    }

    #[test]
    fn mark_filter_sentinels() {
        let filter = MarkActionFilter {
            ports: vec!["any".to_string()],
            protocol: "TCP".to_string(),
            plugin_ids: vec!["19506".to_string(), "10180".to_string()],
            targets: vec!["all".to_string()],
        };
        let query = filter.to_query();
        assert!(query.ports.is_none());
        assert_eq!(query.protocol.as_deref(), Some("TCP"));
        assert_eq!(query.plugin_ids, Some(vec![19506, 10180]));
        assert!(query.targets.is_none());
    }

    #[tokio::test]
    async fn invalid_security_exception_is_rejected_without_side_effects() {
        let (storage, id) = seeded().await;
        let action = VulnerabilityAction::SecurityException(SecurityException {
            start_date: Utc::now(),
            end_date: Some(Utc::now() - Duration::days(1)),
        });
        assert!(matches!(
            perform_action(&storage, &id, action, &admin()).await,
            Err(LifecycleError::Validation(_))
        ));
        let unchanged = storage.get_vulnerability(&id).await.unwrap();
        assert!(unchanged.history.is_empty());
        assert!(unchanged.security_exception.is_none());
    }

    #[tokio::test]
    async fn notes_follow_lock_rules() {
        let (storage, id) = seeded().await;
        let alice = customer();
        let bob = Identity { id: 101, ..customer() };
        let updated = add_note(&storage, &id, "first note", &alice).await.unwrap();
        let note_id = updated.notes[0].id.clone();
        // bob cannot touch alice's note
        assert!(matches!(
            update_note(&storage, &id, &note_id, "rewrite", &bob).await,
            Err(LifecycleError::Forbidden)
        ));
        // but a reviewer can
        update_note(&storage, &id, &note_id, "reviewed", &admin())
            .await
            .unwrap();
        let after = delete_note(&storage, &id, &note_id, &alice).await.unwrap();
        assert!(after.notes.is_empty());
    }
}
