//! Watch command implementation.

use super::tasks::print_tasks;
use super::{CliResult, Context};
use std::time::Duration;
use tidesync_core::{tasks_from, OPEN_TASKS_SQL};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Runs the watch command.
///
/// Writes from other processes, such as `tidesync add` in another shell,
/// are picked up by checking the database every `poll_ms` milliseconds.
pub async fn run(ctx: &Context, count: Option<usize>, poll_ms: u64) -> CliResult {
    let store = ctx.open_store()?;
    let mut stream = store.watch(OPEN_TASKS_SQL, &[])?;
    let mut poll = tokio::time::interval(Duration::from_millis(poll_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut printed = 0;

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(snapshot)) => {
                    print_tasks(&tasks_from(&snapshot)?);
                    println!();
                    printed += 1;
                    if count.is_some_and(|n| printed >= n) {
                        break;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
            _ = poll.tick() => {
                if store.poll_external_changes()? {
                    debug!("database changed on disk");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
