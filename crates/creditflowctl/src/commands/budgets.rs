//! Budgets command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use creditflow::budget::{BudgetsLayout, SlotSnapshot};
use serde::Serialize;

use crate::OutputFormat;

#[derive(Serialize)]
struct BudgetsOutput {
    path: String,
    budgets: Vec<SlotSnapshot>,
    total: usize,
}

pub fn run(path: &Path, format: OutputFormat) -> Result<()> {
    let layout = BudgetsLayout::attach(path)
        .with_context(|| format!("failed to attach {}", path.display()))?;

    let budgets = layout.snapshot();
    let output = BudgetsOutput {
        path: path.display().to_string(),
        total: budgets.len(),
        budgets,
    };

    match format {
        OutputFormat::Text => {
            if output.budgets.is_empty() {
                println!("No live budgets in {}.", output.path);
            } else {
                println!(
                    "{:>6} {:>18} {:>5} {:>14} {:>18}",
                    "SLOT", "BUDGET ID", "OWNER", "REMAINING", "WATCHERS"
                );
                println!("{}", "-".repeat(65));
                for budget in &output.budgets {
                    println!(
                        "{:>6} {:>#18x} {:>5} {:>14} {:>#18x}",
                        budget.slot, budget.budget_id, budget.owner, budget.remaining, budget.watchers
                    );
                }
                println!();
                println!("Total: {} budget(s)", output.total);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
