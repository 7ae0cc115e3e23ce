//! Pending command implementation.

use super::{CliResult, Context};
use tidesync_core::PendingMutation;

/// Runs the pending command.
pub fn run(ctx: &Context, limit: Option<usize>, format: &str) -> CliResult {
    let store = ctx.open_store()?;
    let total = store.pending_count()?;
    let entries = store.pending_mutations(limit.unwrap_or(total))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print_text_output(&entries, total),
    }
    Ok(())
}

fn print_text_output(entries: &[PendingMutation], total: usize) {
    println!("Pending mutations ({} of {} shown)", entries.len(), total);
    println!("================");
    println!();

    for entry in entries {
        print!(
            "[{:08}] {:6} {} {}",
            entry.op_id,
            entry.kind.as_str(),
            entry.entity_table,
            entry.entity_id
        );
        if let Some(ref payload) = entry.payload {
            print!(" payload={} bytes", payload.to_string().len());
        }
        println!();
    }
}
