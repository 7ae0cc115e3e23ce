//! Connector between the mutation log and the remote backend.
//!
//! The connector drains pending mutations in operation-id order and applies
//! each one remotely. Recovery rules make every kind idempotent against a
//! single-writer remote:
//!
//! | Local kind | Remote call | Recovery |
//! |------------|-------------|----------|
//! | CREATE | upsert | duplicate key → update |
//! | UPDATE | update | no rows affected → upsert |
//! | DELETE | delete | no rows affected → success |
//!
//! Entries are removed only after the remote confirmed them, so delivery is
//! at-least-once.

use crate::config::SyncConfig;
use crate::credentials::CredentialSource;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tidesync_core::{now_millis, LocalStore, MutationKind, PendingMutation};
use tidesync_sync_protocol::{
    Credentials, RemoteErrorKind, RemoteOpKind, RemoteOperation, RemoteResult,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Summary of one upload pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Entries confirmed by the remote and removed from the log.
    pub uploaded: usize,
    /// Of those, entries that needed a recovery rule.
    pub recovered: usize,
    /// Entries left queued for the next pass.
    pub deferred: usize,
    /// The pass stopped early because a remote table was unavailable.
    pub abandoned: bool,
    /// The pass did nothing because offline mode was asserted.
    pub skipped_offline: bool,
}

impl UploadReport {
    /// Returns true if the pass made no progress it could have made.
    pub fn is_clean(&self) -> bool {
        !self.abandoned && self.deferred == 0
    }
}

/// How a single entry was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Direct,
    Recovered,
}

/// Uploads pending mutations to the remote backend.
pub struct Connector {
    endpoint: String,
    batch_size: usize,
    remote: Arc<dyn RemoteBackend>,
    credentials: Arc<dyn CredentialSource>,
    offline: watch::Receiver<bool>,
}

impl Connector {
    /// Creates a connector.
    ///
    /// `offline` is the receiving end of the offline toggle; while it reads
    /// true the connector never contacts the credential source or remote.
    pub fn new(
        config: &SyncConfig,
        remote: Arc<dyn RemoteBackend>,
        credentials: Arc<dyn CredentialSource>,
        offline: watch::Receiver<bool>,
    ) -> Self {
        Self {
            endpoint: config.remote_endpoint.clone(),
            batch_size: config.upload_batch_size.max(1),
            remote,
            credentials,
            offline,
        }
    }

    /// Returns true if offline mode is asserted.
    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Returns credentials for one pass.
    ///
    /// While offline this returns the sentinel credentials without touching
    /// the credential source. An expired session is refreshed once; a failed
    /// refresh is a credential error.
    pub async fn fetch_credentials(&self) -> SyncResult<Credentials> {
        if self.is_offline() {
            return Ok(Credentials::offline(&self.endpoint));
        }

        let session = self.credentials.current_session().await?;
        let now = now_millis() / 1000;
        let session = if session.is_expired(now) {
            info!(expires_at = session.expires_at, "session expired, refreshing");
            self.credentials
                .refresh_session(&session)
                .await
                .map_err(|e| SyncError::Credential(format!("session refresh failed: {e}")))?
        } else {
            session
        };

        Ok(Credentials::new(&self.endpoint, session.access_token))
    }

    /// Runs one upload pass over the mutation log.
    ///
    /// Rejected entries stay queued and block later entries for the same
    /// entity until the next pass. A table-level rejection abandons the pass
    /// and is reported, not raised. Transport failures are raised.
    pub async fn upload(&self, store: &LocalStore) -> SyncResult<UploadReport> {
        let mut report = UploadReport::default();
        let credentials = self.fetch_credentials().await?;
        if credentials.is_offline() {
            debug!("offline mode asserted, skipping upload");
            report.skipped_offline = true;
            return Ok(report);
        }

        let mut cursor = 0;
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        loop {
            let batch = store.pending_mutations_after(cursor, self.batch_size)?;
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                cursor = entry.op_id;
                let key = (entry.entity_table.clone(), entry.entity_id.clone());
                if blocked.contains(&key) {
                    debug!(
                        op_id = entry.op_id,
                        entity_id = %entry.entity_id,
                        "earlier mutation for entity deferred, skipping"
                    );
                    report.deferred += 1;
                    continue;
                }

                match self.apply_entry(&credentials, &entry).await {
                    Ok(applied) => {
                        store.complete_mutation(entry.op_id)?;
                        report.uploaded += 1;
                        if applied == Applied::Recovered {
                            report.recovered += 1;
                        }
                    }
                    Err(err) if err.kind.is_transport() => {
                        warn!(op_id = entry.op_id, error = %err, "remote unreachable");
                        return Err(SyncError::RemoteUnreachable(err.message));
                    }
                    Err(err) if err.kind.is_table_level() => {
                        warn!(
                            op_id = entry.op_id,
                            table = %entry.entity_table,
                            error = %err,
                            "remote table unavailable, abandoning pass"
                        );
                        report.abandoned = true;
                        report.deferred += 1;
                        return Ok(report);
                    }
                    Err(err) => {
                        let err = SyncError::rejected(entry.op_id, &err);
                        warn!(
                            op_id = entry.op_id,
                            entity_id = %entry.entity_id,
                            table = %entry.entity_table,
                            error = %err,
                            "mutation rejected, deferring"
                        );
                        blocked.insert(key);
                        report.deferred += 1;
                    }
                }
            }
        }

        if report.uploaded > 0 {
            info!(
                uploaded = report.uploaded,
                recovered = report.recovered,
                deferred = report.deferred,
                "upload pass complete"
            );
        }
        Ok(report)
    }

    async fn apply_entry(
        &self,
        credentials: &Credentials,
        entry: &PendingMutation,
    ) -> RemoteResult<Applied> {
        let op = operation_for(entry);
        debug!(op_id = entry.op_id, kind = %op.kind, entity_id = %op.id, "applying mutation");

        match self.remote.apply(credentials, &op).await {
            Ok(()) => Ok(Applied::Direct),
            Err(err) => match (entry.kind, err.kind) {
                (MutationKind::Create, RemoteErrorKind::DuplicateKey) => {
                    debug!(op_id = entry.op_id, "row exists remotely, retrying as update");
                    let retry = op.retarget(RemoteOpKind::Update);
                    self.remote.apply(credentials, &retry).await?;
                    Ok(Applied::Recovered)
                }
                (MutationKind::Update, RemoteErrorKind::NoRowsAffected) => {
                    debug!(op_id = entry.op_id, "row missing remotely, retrying as upsert");
                    let retry = op.retarget(RemoteOpKind::Upsert);
                    self.remote.apply(credentials, &retry).await?;
                    Ok(Applied::Recovered)
                }
                (MutationKind::Delete, RemoteErrorKind::NoRowsAffected) => {
                    debug!(op_id = entry.op_id, "row already absent remotely");
                    Ok(Applied::Recovered)
                }
                _ => Err(err),
            },
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", &self.endpoint)
            .field("batch_size", &self.batch_size)
            .field("offline", &self.is_offline())
            .finish()
    }
}

/// Maps a log entry to its first remote call.
fn operation_for(entry: &PendingMutation) -> RemoteOperation {
    let row = || entry.payload.clone().unwrap_or_else(|| json!({}));
    match entry.kind {
        MutationKind::Create => {
            RemoteOperation::upsert(&entry.entity_table, &entry.entity_id, row())
        }
        MutationKind::Update => {
            RemoteOperation::update(&entry.entity_table, &entry.entity_id, row())
        }
        MutationKind::Delete => RemoteOperation::delete(&entry.entity_table, &entry.entity_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::remote::MemoryRemote;
    use tidesync_core::{NewTask, TaskPatch, TaskService};
    use tidesync_sync_protocol::{RemoteError, Session};

    struct Fixture {
        tasks: TaskService,
        remote: Arc<MemoryRemote>,
        offline: watch::Sender<bool>,
        connector: Connector,
    }

    fn fixture_with(credentials: StaticCredentials, batch: usize) -> Fixture {
        let store = LocalStore::open_in_memory(TaskService::schema()).unwrap();
        let tasks = TaskService::new(store).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let (offline, rx) = watch::channel(false);
        let config = SyncConfig::new("memory://remote").with_upload_batch_size(batch);
        let connector = Connector::new(
            &config,
            Arc::clone(&remote) as Arc<dyn RemoteBackend>,
            Arc::new(credentials),
            rx,
        );
        Fixture {
            tasks,
            remote,
            offline,
            connector,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StaticCredentials::token("tok"), 100)
    }

    #[tokio::test]
    async fn uploads_in_order_and_drains_log() {
        let f = fixture();
        let a = f.tasks.create(NewTask::new("a")).unwrap();
        let b = f.tasks.create(NewTask::new("b")).unwrap();
        f.tasks.complete(a.id).unwrap();

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 3);
        assert_eq!(report.recovered, 0);
        assert!(report.is_clean());
        assert_eq!(f.tasks.store().pending_count().unwrap(), 0);

        let applied = f.remote.applied();
        assert_eq!(applied[0].id, a.id.to_string());
        assert_eq!(applied[1].id, b.id.to_string());
        assert_eq!(applied[2].kind, RemoteOpKind::Update);
        assert_eq!(
            f.remote.row("tasks", &a.id.to_string()).unwrap()["is_completed"],
            1
        );
    }

    #[tokio::test]
    async fn small_batches_cover_whole_log() {
        let f = fixture_with(StaticCredentials::token("tok"), 2);
        for i in 0..5 {
            f.tasks.create(NewTask::new(format!("task {i}"))).unwrap();
        }
        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 5);
        assert_eq!(f.remote.rows("tasks").len(), 5);
    }

    #[tokio::test]
    async fn duplicate_create_becomes_update() {
        let f = fixture();
        f.remote.set_strict_insert(true);
        let task = f.tasks.create(NewTask::new("Buy milk")).unwrap();
        let id = task.id.to_string();
        f.remote.seed("tasks", &id, json!({"id": id, "title": "stale"}));

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(f.remote.row("tasks", &id).unwrap()["title"], "Buy milk");
    }

    #[tokio::test]
    async fn update_of_missing_row_becomes_upsert() {
        let f = fixture();
        let task = f.tasks.create(NewTask::new("draft")).unwrap();
        // Drop the create so only the update reaches the remote.
        let create = f.tasks.store().pending_mutations(1).unwrap().remove(0);
        f.tasks.store().complete_mutation(create.op_id).unwrap();
        f.tasks
            .update(task.id, TaskPatch { title: Some("final".into()), ..Default::default() })
            .unwrap();

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(
            f.remote.row("tasks", &task.id.to_string()).unwrap()["title"],
            "final"
        );
    }

    #[tokio::test]
    async fn delete_of_missing_row_succeeds() {
        let f = fixture();
        let task = f.tasks.create(NewTask::new("gone")).unwrap();
        let create = f.tasks.store().pending_mutations(1).unwrap().remove(0);
        f.tasks.store().complete_mutation(create.op_id).unwrap();
        f.tasks.delete(task.id).unwrap();

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn rejection_blocks_only_that_entity() {
        let f = fixture();
        let a = f.tasks.create(NewTask::new("a")).unwrap();
        let b = f.tasks.create(NewTask::new("b")).unwrap();
        f.tasks.complete(a.id).unwrap();

        f.remote.fail_next(RemoteError::new(
            RemoteErrorKind::ConstraintViolation,
            "check constraint",
        ));
        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(f.remote.applied()[0].id, b.id.to_string());

        let left = f.tasks.store().pending_mutations(10).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|m| m.entity_id == a.id.to_string()));
        assert_eq!(left[0].kind, MutationKind::Create);

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_table_abandons_pass() {
        let f = fixture();
        f.tasks.create(NewTask::new("a")).unwrap();
        f.tasks.create(NewTask::new("b")).unwrap();
        f.remote.set_table_unavailable("tasks", true);

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert!(report.abandoned);
        assert_eq!(report.uploaded, 0);
        assert_eq!(f.remote.call_count(), 1);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn unreachable_remote_is_raised() {
        let f = fixture();
        f.tasks.create(NewTask::new("a")).unwrap();
        f.remote.set_reachable(false);

        let err = f.connector.upload(f.tasks.store()).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnreachable(_)));
        assert_eq!(f.tasks.store().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_short_circuits() {
        let f = fixture();
        f.tasks.create(NewTask::new("a")).unwrap();
        f.offline.send_replace(true);

        let creds = f.connector.fetch_credentials().await.unwrap();
        assert!(creds.is_offline());

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert!(report.skipped_offline);
        assert_eq!(f.remote.call_count(), 0);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn token_named_offline_still_uploads() {
        let f = fixture_with(StaticCredentials::token("offline"), 100);
        f.tasks.create(NewTask::new("a")).unwrap();

        let creds = f.connector.fetch_credentials().await.unwrap();
        assert!(!creds.is_offline());
        assert_eq!(creds.token, "offline");

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert!(!report.skipped_offline);
        assert_eq!(report.uploaded, 1);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed() {
        let source = StaticCredentials::new(Session::new("old", 0))
            .with_refresh(Session::new("fresh", i64::MAX));
        let f = fixture_with(source, 100);
        let creds = f.connector.fetch_credentials().await.unwrap();
        assert_eq!(creds.token, "fresh");
        assert_eq!(creds.endpoint, "memory://remote");
    }

    #[tokio::test]
    async fn failed_refresh_preserves_queue() {
        let f = fixture_with(StaticCredentials::new(Session::new("old", 0)), 100);
        f.tasks.create(NewTask::new("a")).unwrap();

        let err = f.connector.upload(f.tasks.store()).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
        assert_eq!(f.remote.call_count(), 0);
        assert_eq!(f.tasks.store().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cleared_tasks_are_not_resurrected() {
        let f = fixture();
        f.tasks.create(NewTask::new("a")).unwrap();
        f.tasks.create(NewTask::new("b")).unwrap();
        f.tasks.clear_all().unwrap();

        let report = f.connector.upload(f.tasks.store()).await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert!(f.remote.rows("tasks").is_empty());
        assert!(f
            .remote
            .applied()
            .iter()
            .all(|op| op.kind == RemoteOpKind::Delete));
    }
}
