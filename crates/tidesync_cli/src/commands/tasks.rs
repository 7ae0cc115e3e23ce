//! Task commands.

use super::{CliResult, Context};
use std::time::Duration;
use tidesync_core::{now_millis, EntityId, NewTask, Priority, Task};

const HOUR_MS: i64 = 3_600_000;

/// Runs the add command.
pub fn add(
    ctx: &Context,
    title: String,
    description: Option<String>,
    priority: &str,
    due_in_hours: Option<u64>,
) -> CliResult {
    let priority: Priority = priority.parse()?;
    let mut input = NewTask::new(title).priority(priority);
    if let Some(description) = description {
        input = input.description(description);
    }
    if let Some(hours) = due_in_hours {
        let offset = i64::try_from(hours)?.saturating_mul(HOUR_MS);
        input = input.due_at(now_millis().saturating_add(offset));
    }

    let task = ctx.tasks()?.create(input)?;
    println!("{}", task.id);
    Ok(())
}

/// Runs the list command.
pub fn list(ctx: &Context, all: bool, format: &str) -> CliResult {
    let service = ctx.tasks()?;
    let tasks = if all {
        service.list_all()?
    } else {
        service.list_open()?
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tasks)?),
        _ => print_tasks(&tasks),
    }
    Ok(())
}

/// Runs the complete command.
pub fn complete(ctx: &Context, id: &str) -> CliResult {
    let task = ctx.tasks()?.complete(id.parse()?)?;
    println!("completed: {}", task.title);
    Ok(())
}

/// Runs the reopen command.
pub fn reopen(ctx: &Context, id: &str) -> CliResult {
    let task = ctx.tasks()?.reopen(id.parse()?)?;
    println!("reopened: {}", task.title);
    Ok(())
}

/// Runs the postpone command.
pub fn postpone(ctx: &Context, id: &str, hours: u64) -> CliResult {
    let delay = Duration::from_secs(hours.saturating_mul(3600));
    let task = ctx.tasks()?.postpone_by(id.parse()?, delay)?;
    println!(
        "postponed: {} ({})",
        task.title,
        describe_due(task.due_at, now_millis())
    );
    Ok(())
}

/// Runs the delete command.
pub fn delete(ctx: &Context, id: &str) -> CliResult {
    let id: EntityId = id.parse()?;
    ctx.tasks()?.delete(id)?;
    println!("deleted: {id}");
    Ok(())
}

/// Runs the clear command.
pub fn clear(ctx: &Context) -> CliResult {
    let removed = ctx.tasks()?.clear_all()?;
    println!("removed {removed} tasks");
    Ok(())
}

/// Prints tasks as a text table.
pub fn print_tasks(tasks: &[Task]) {
    println!("Tasks ({} total)", tasks.len());
    println!("================");

    let now = now_millis();
    for task in tasks {
        let mark = if task.is_completed { "x" } else { " " };
        print!("[{mark}] {} {:6} {}", task.id, task.priority.as_str(), task.title);
        if task.due_at.is_some() && !task.is_completed {
            print!(" ({})", describe_due(task.due_at, now));
        }
        println!();
    }
}

fn describe_due(due_at: Option<i64>, now: i64) -> String {
    match due_at {
        None => "no due date".to_string(),
        Some(due) if due < now => "overdue".to_string(),
        Some(due) => {
            let hours = (due - now + HOUR_MS - 1) / HOUR_MS;
            format!("due in {hours}h")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_descriptions() {
        assert_eq!(describe_due(None, 0), "no due date");
        assert_eq!(describe_due(Some(10), 20), "overdue");
        assert_eq!(describe_due(Some(HOUR_MS), 0), "due in 1h");
        assert_eq!(describe_due(Some(HOUR_MS + 1), 0), "due in 2h");
    }
}
