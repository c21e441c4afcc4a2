//! Summary command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use creditflow::budget::{BudgetsLayout, SlotSnapshot};
use serde::Serialize;

use crate::OutputFormat;

#[derive(Debug, PartialEq, Eq, Serialize)]
struct SummaryOutput {
    path: String,
    capacity: usize,
    live: usize,
    watched: usize,
    remaining: i64,
    watchers: u64,
}

pub fn run(path: &Path, format: OutputFormat) -> Result<()> {
    let layout = BudgetsLayout::attach(path)
        .with_context(|| format!("failed to attach {}", path.display()))?;

    let output = summarize(
        path.display().to_string(),
        layout.capacity(),
        &layout.snapshot(),
    );

    match format {
        OutputFormat::Text => {
            println!("Table:      {}", output.path);
            println!("Capacity:   {}", output.capacity);
            println!("Live:       {}", output.live);
            println!("Watched:    {}", output.watched);
            println!("Remaining:  {}", output.remaining);
            println!("Watchers:   {:#x}", output.watchers);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn summarize(path: String, capacity: usize, budgets: &[SlotSnapshot]) -> SummaryOutput {
    SummaryOutput {
        path,
        capacity,
        live: budgets.len(),
        watched: budgets.iter().filter(|b| b.watchers != 0).count(),
        remaining: budgets.iter().map(|b| b.remaining).sum(),
        watchers: budgets.iter().fold(0, |mask, b| mask | b.watchers),
    }
}
