//! Sync command implementation.

use super::{CliResult, Context};
use std::sync::Arc;
use std::time::Duration;
use tidesync_core::LocalStore;
use tidesync_sync_engine::{
    Connector, CredentialSource, EngineConfig, HttpCredentialSource, RemoteBackend,
    ReqwestClient, RestBackend, StaticCredentials, SyncConfig, SyncHandle, SyncOutcome, SyncStatus,
};
use tokio::sync::watch;
use tracing::info;

/// Runs the sync command.
///
/// Without a duration this runs a single upload pass and prints its report.
/// With one, it runs the scheduler for that long, printing each status change.
pub async fn run(ctx: &Context, offline: bool, duration: Option<u64>) -> CliResult {
    let mut config = ctx
        .config
        .sync_config()
        .ok_or("remote_endpoint is not configured")?;
    if offline {
        config = config.with_start_offline(true);
    }

    let client = Arc::new(ReqwestClient::new(config.request_timeout)?);
    let remote: Arc<dyn RemoteBackend> = Arc::new(RestBackend::new(Arc::clone(&client)));
    let credentials = credential_source(&ctx.config, client)?;
    let store = ctx.open_store()?;

    match duration {
        None => {
            let (_offline, offline_rx) = watch::channel(config.start_offline);
            let connector = Connector::new(&config, remote, credentials, offline_rx);
            let report = connector.upload(&store).await?;
            if report.skipped_offline {
                println!("offline: nothing uploaded");
            } else {
                println!(
                    "uploaded {} ({} recovered), deferred {}{}",
                    report.uploaded,
                    report.recovered,
                    report.deferred,
                    if report.abandoned { ", pass abandoned" } else { "" }
                );
            }
        }
        Some(secs) => run_scheduler(&store, remote, credentials, config, secs).await?,
    }

    println!("{} mutations pending", store.pending_count()?);
    Ok(())
}

async fn run_scheduler(
    store: &LocalStore,
    remote: Arc<dyn RemoteBackend>,
    credentials: Arc<dyn CredentialSource>,
    config: SyncConfig,
    secs: u64,
) -> CliResult {
    let handle = SyncHandle::spawn(store.clone(), remote, credentials, config)?;
    let mut status = handle.subscribe_status();
    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if snapshot.last_outcome.is_some() {
                    print_status(&snapshot);
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn credential_source(
    config: &EngineConfig,
    client: Arc<ReqwestClient>,
) -> CliResult<Arc<dyn CredentialSource>> {
    if let Some(endpoint) = &config.credential_endpoint {
        return Ok(Arc::new(HttpCredentialSource::new(endpoint.as_str(), client)));
    }
    if let Some(token) = &config.access_token {
        return Ok(Arc::new(StaticCredentials::token(token.as_str())));
    }
    Err("configure credential_endpoint or access_token".into())
}

fn print_status(status: &SyncStatus) {
    let outcome = match &status.last_outcome {
        Some(SyncOutcome::Completed { report }) => {
            format!("uploaded {} deferred {}", report.uploaded, report.deferred)
        }
        Some(SyncOutcome::SkippedOffline) => "offline".to_string(),
        Some(SyncOutcome::Abandoned) => "abandoned".to_string(),
        Some(SyncOutcome::Failed { error }) => format!("failed: {error}"),
        None => "-".to_string(),
    };
    println!(
        "{:?} connected={} errors={} next={:.1}s {}",
        status.phase,
        status.is_connected,
        status.error_count,
        status.backoff_interval.as_secs_f64(),
        outcome
    );
}
