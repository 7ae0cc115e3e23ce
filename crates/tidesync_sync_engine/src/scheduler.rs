//! Sync scheduler and offline controller.
//!
//! A single background task owns the sync state machine:
//!
//! ```text
//! IDLE → ATTEMPTING → (SUCCESS | FAILURE) → WAITING → ATTEMPTING → ...
//! ```
//!
//! plus an orthogonal offline flag. The task is the only writer of the
//! published [`SyncStatus`]; the [`SyncHandle`] is the only writer of the
//! offline flag. Because one task runs every attempt, at most one upload is
//! ever in flight.

use crate::config::{Backoff, SyncConfig};
use crate::connector::{Connector, UploadReport};
use crate::credentials::CredentialSource;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteBackend;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tidesync_core::{now_millis, LocalStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the scheduler task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Spawned, no attempt yet.
    Idle,
    /// An upload pass is in flight.
    Attempting,
    /// Waiting for the next attempt.
    Waiting,
    /// The task has exited.
    Stopped,
}

/// Result of the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SyncOutcome {
    /// The pass ran to completion. Deferred entries do not make it a failure.
    Completed {
        /// Pass summary.
        report: UploadReport,
    },
    /// Offline mode was asserted; the connector was not contacted.
    SkippedOffline,
    /// A remote table was unavailable and the pass was abandoned.
    Abandoned,
    /// The pass failed before finishing.
    Failed {
        /// Error description, for display only.
        error: String,
    },
}

impl SyncOutcome {
    /// Returns true for outcomes that grow the backoff interval.
    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Abandoned | SyncOutcome::Failed { .. })
    }
}

/// Immutable snapshot of the sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// The last attempt reached the remote.
    pub is_connected: bool,
    /// Offline mode is asserted.
    pub offline_mode: bool,
    /// Consecutive failed attempts.
    pub error_count: u32,
    /// Interval before the next attempt, without jitter.
    pub backoff_interval: Duration,
    /// Start of the last attempt, ms since epoch.
    pub last_attempt: Option<i64>,
    /// Current phase.
    pub phase: SyncPhase,
    /// Result of the last attempt.
    pub last_outcome: Option<SyncOutcome>,
}

impl SyncStatus {
    fn initial(backoff: &Backoff, offline: bool) -> Self {
        Self {
            is_connected: false,
            offline_mode: offline,
            error_count: 0,
            backoff_interval: backoff.interval(),
            last_attempt: None,
            phase: SyncPhase::Idle,
            last_outcome: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    SyncNow,
    Shutdown,
}

/// Handle to a running sync scheduler.
///
/// Dropping every handle stops the scheduler after its current attempt.
#[derive(Debug)]
pub struct SyncHandle {
    offline: watch::Sender<bool>,
    status: watch::Receiver<SyncStatus>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Spawns the scheduler on the current tokio runtime.
    ///
    /// The first attempt starts immediately (or is skipped, if
    /// `config.start_offline` is set).
    pub fn spawn(
        store: LocalStore,
        remote: Arc<dyn RemoteBackend>,
        credentials: Arc<dyn CredentialSource>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let (offline_tx, offline_rx) = watch::channel(config.start_offline);
        let backoff = Backoff::new(config.backoff.clone());
        let (status_tx, status_rx) =
            watch::channel(SyncStatus::initial(&backoff, config.start_offline));
        let (command_tx, command_rx) = mpsc::channel(8);

        let connector = Connector::new(&config, remote, credentials, offline_tx.subscribe());
        let worker = Worker {
            store,
            connector,
            backoff,
            attempt_timeout: config.attempt_timeout,
            offline: offline_rx,
            commands: command_rx,
            status: status_tx,
        };
        let task = runtime.spawn(worker.run());

        Ok(Self {
            offline: offline_tx,
            status: status_rx,
            commands: command_tx,
            task,
        })
    }

    /// Asserts or clears offline mode. Returns true if the flag changed.
    ///
    /// Going online cancels any pending wait. Going offline lets an
    /// in-flight attempt finish.
    pub fn set_offline(&self, offline: bool) -> bool {
        let changed = self.offline.send_if_modified(|current| {
            if *current == offline {
                false
            } else {
                *current = offline;
                true
            }
        });
        if changed {
            info!(offline, "offline mode toggled");
        }
        changed
    }

    /// Returns true if offline mode is asserted.
    pub fn is_offline(&self) -> bool {
        *self.offline.borrow()
    }

    /// Requests an attempt without waiting for the backoff interval.
    pub fn sync_now(&self) -> SyncResult<()> {
        match self.commands.try_send(Command::SyncNow) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::Stopped),
        }
    }

    /// Returns the latest status snapshot.
    pub fn status(&self) -> SyncStatus {
        let mut status = self.status.borrow().clone();
        status.offline_mode = self.is_offline();
        status
    }

    /// Subscribes to status snapshots.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stops the scheduler, waiting for an in-flight attempt to finish.
    pub async fn shutdown(self) {
        // A closed channel means the task is already gone.
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "sync scheduler task failed");
        }
    }
}

struct Worker {
    store: LocalStore,
    connector: Connector,
    backoff: Backoff,
    attempt_timeout: Duration,
    offline: watch::Receiver<bool>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SyncStatus>,
}

impl Worker {
    async fn run(mut self) {
        info!("sync scheduler started");
        loop {
            self.attempt().await;
            if !self.wait().await {
                break;
            }
        }
        self.status.send_modify(|s| s.phase = SyncPhase::Stopped);
        info!("sync scheduler stopped");
    }

    async fn attempt(&mut self) {
        let offline = *self.offline.borrow_and_update();
        if offline {
            debug!("offline, skipping attempt");
            // Nothing was attempted, so connectivity is left as last observed.
            self.status.send_modify(|s| {
                s.offline_mode = true;
                s.last_outcome = Some(SyncOutcome::SkippedOffline);
            });
            return;
        }

        self.status.send_modify(|s| {
            s.phase = SyncPhase::Attempting;
            s.offline_mode = false;
            s.last_attempt = Some(now_millis());
        });

        let outcome =
            match tokio::time::timeout(self.attempt_timeout, self.connector.upload(&self.store))
                .await
            {
                Ok(Ok(report)) if report.skipped_offline => SyncOutcome::SkippedOffline,
                Ok(Ok(report)) if report.abandoned => SyncOutcome::Abandoned,
                Ok(Ok(report)) => SyncOutcome::Completed { report },
                Ok(Err(e)) => {
                    warn!(error = %e, "sync attempt failed");
                    SyncOutcome::Failed {
                        error: e.to_string(),
                    }
                }
                Err(_) => {
                    warn!(timeout = ?self.attempt_timeout, "sync attempt timed out");
                    SyncOutcome::Failed {
                        error: SyncError::Timeout.to_string(),
                    }
                }
            };

        match &outcome {
            SyncOutcome::SkippedOffline => {}
            o if o.is_failure() => self.backoff.on_failure(),
            _ => self.backoff.on_success(),
        }
        debug!(
            errors = self.backoff.error_count(),
            interval = ?self.backoff.interval(),
            "attempt finished"
        );

        let connected = match outcome {
            SyncOutcome::SkippedOffline => None,
            SyncOutcome::Completed { .. } | SyncOutcome::Abandoned => Some(true),
            SyncOutcome::Failed { .. } => Some(false),
        };
        let (errors, interval) = (self.backoff.error_count(), self.backoff.interval());
        self.status.send_modify(|s| {
            if let Some(connected) = connected {
                s.is_connected = connected;
            }
            s.error_count = errors;
            s.backoff_interval = interval;
            s.last_outcome = Some(outcome);
        });
    }

    /// Waits for the next attempt. Returns false when the scheduler should
    /// stop.
    async fn wait(&mut self) -> bool {
        let delay = self.backoff.delay();
        self.status.send_modify(|s| s.phase = SyncPhase::Waiting);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::SyncNow) => {
                        debug!("sync requested");
                        return true;
                    }
                    Some(Command::Shutdown) | None => return false,
                },
                changed = self.offline.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let offline = *self.offline.borrow_and_update();
                    self.status.send_modify(|s| s.offline_mode = offline);
                    if !offline {
                        info!("back online, attempting now");
                        return true;
                    }
                }
            }
        }
    }
}
