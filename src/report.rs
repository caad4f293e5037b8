//! Run summaries.
//!
//! [`summarize`] is a pure projection of a [`RunResult`]; printing is kept
//! separate so `--json` can emit the same data.

use std::collections::BTreeMap;

use colored::Colorize;
use serde::Serialize;
use uuid::Uuid;

use crate::reconcile::{Action, Outcome, RunMode, RunResult};
use crate::schema::RecordType;

/// Count of outcomes per action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub planned_create: usize,
    pub planned_update: usize,
}

impl ActionCounts {
    fn record(&mut self, action: Action) {
        let slot = match action {
            Action::Created => &mut self.created,
            Action::Updated => &mut self.updated,
            Action::Skipped => &mut self.skipped,
            Action::Failed => &mut self.failed,
            Action::PlannedCreate => &mut self.planned_create,
            Action::PlannedUpdate => &mut self.planned_update,
        };
        *slot += 1;
    }

    #[must_use]
    pub const fn get(&self, action: Action) -> usize {
        match action {
            Action::Created => self.created,
            Action::Updated => self.updated,
            Action::Skipped => self.skipped,
            Action::Failed => self.failed,
            Action::PlannedCreate => self.planned_create,
            Action::PlannedUpdate => self.planned_update,
        }
    }

    /// Total outcomes counted.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.created
            + self.updated
            + self.skipped
            + self.failed
            + self.planned_create
            + self.planned_update
    }
}

/// One failed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub record_type: RecordType,
    pub title: String,
    pub error: String,
}

/// Aggregated view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub duration_ms: i64,
    pub counts: ActionCounts,
    pub by_type: BTreeMap<RecordType, ActionCounts>,
    pub failures: Vec<FailureDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl Summary {
    /// True iff nothing failed and the run was not aborted.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }
}

/// Project a run result into counts and a failure list.
#[must_use]
pub fn summarize(result: &RunResult) -> Summary {
    let mut counts = ActionCounts::default();
    let mut by_type: BTreeMap<RecordType, ActionCounts> = BTreeMap::new();
    let mut failures = Vec::new();

    for outcome in &result.outcomes {
        counts.record(outcome.action);
        by_type.entry(outcome.record_type).or_default().record(outcome.action);
        if outcome.action == Action::Failed {
            failures.push(FailureDetail {
                record_type: outcome.record_type,
                title: outcome.title.clone(),
                error: outcome.error.clone().unwrap_or_default(),
            });
        }
    }

    Summary {
        run_id: result.run_id,
        mode: result.mode,
        duration_ms: (result.finished_at - result.started_at).num_milliseconds(),
        counts,
        by_type,
        failures,
        aborted: result.aborted.as_ref().map(ToString::to_string),
    }
}

fn action_label(action: Action) -> colored::ColoredString {
    let label = action.as_str();
    match action {
        Action::Created => label.green(),
        Action::Updated => label.cyan(),
        Action::Skipped => label.dimmed(),
        Action::Failed => label.red().bold(),
        Action::PlannedCreate | Action::PlannedUpdate => label.yellow(),
    }
}

fn describe(outcome: &Outcome) -> String {
    let mut line = format!("{} {}", outcome.record_type, outcome.title);
    if let Some(parent) = &outcome.parent_title {
        line.push_str(&format!(" (epic: {parent})"));
    }
    if let Some(id) = &outcome.remote_id {
        line.push_str(&format!(" [{id}]"));
    }
    if let Some(reason) = outcome.reason {
        line.push_str(&format!(", {reason}"));
    }
    line
}

/// Print every outcome, one per line.
pub fn print_outcomes(result: &RunResult) {
    for outcome in &result.outcomes {
        let mut line = format!("  {:<15} {}", action_label(outcome.action), describe(outcome));
        if let Some(error) = &outcome.error {
            line.push_str(&format!(": {}", error.red()));
        }
        println!("{line}");
    }
}

/// Print the summary block.
pub fn print_summary(summary: &Summary) {
    println!();
    println!(
        "{} {}",
        "Run Summary".bold().underline(),
        format!("({})", summary.mode).dimmed()
    );
    println!();

    for (record_type, counts) in &summary.by_type {
        let parts: Vec<String> = Action::ALL
            .into_iter()
            .filter(|a| counts.get(*a) > 0)
            .map(|a| format!("{} {}", counts.get(a), action_label(a)))
            .collect();
        println!("  {:<8} {}", format!("{record_type}:").bold(), parts.join(", "));
    }
    if summary.by_type.is_empty() {
        println!("  {}", "No records processed.".dimmed());
    }

    if !summary.failures.is_empty() {
        println!();
        println!("{}", "Failures:".red().bold());
        for failure in &summary.failures {
            println!("  {} {}: {}", failure.record_type, failure.title, failure.error);
        }
    }

    if let Some(reason) = &summary.aborted {
        println!();
        println!("{} {}", "Run aborted:".red().bold(), reason);
    }

    println!();
    if summary.is_success() {
        println!("{}", "All records reconciled.".green());
    } else {
        println!(
            "{}",
            "Re-run the same command to retry failed records; created records will be matched."
                .dimmed()
        );
    }
}
