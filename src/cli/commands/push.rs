//! Push command implementation.
//!
//! Load and validate the document, fetch the remote snapshot, reconcile,
//! then report. Validation and schema problems stop the command before any
//! network call.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::cli::PushArgs;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::Document;
use crate::reconcile::{Outcome, Reconciler, RunMode, RunResult};
use crate::remote::{AuthProvider, OfflineStore, RecordStore, RemoteSnapshot, TableApiClient};
use crate::report::{self, Summary};
use crate::schema::{RecordType, Schema};

use super::{load_schema, load_settings, match_policy};

#[derive(Serialize)]
struct PushOutput<'a> {
    summary: &'a Summary,
    outcomes: &'a [Outcome],
}

const fn run_mode(args: &PushArgs) -> RunMode {
    match (args.dry_run, args.update) {
        (true, updates) => RunMode::DryRun { updates },
        (false, true) => RunMode::CreateAndUpdate,
        (false, false) => RunMode::CreateOnly,
    }
}

/// Execute the push command.
///
/// # Errors
///
/// Returns validation, schema, config or auth errors before reconciling, and
/// `Error::RunFailed` (after printing the summary) if any record failed.
pub fn execute(args: &PushArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let settings = load_settings(config)?;
    let schema = Arc::new(load_schema(args.doc.schema.as_deref(), &settings)?);
    let policy = match_policy(args.doc.match_policy, &settings);
    let mode = run_mode(args);
    let concurrency = args.concurrency.unwrap_or(settings.concurrency).max(1);

    let mut document = Document::load(&args.doc.document, &schema, policy)?;
    for warning in document.warnings() {
        tracing::warn!("{warning}");
    }

    // Credentials are checked before the runtime spins up.
    let client = if args.offline {
        None
    } else {
        Some(build_client(&settings, Arc::clone(&schema))?)
    };

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| Error::Other(format!("Failed to create async runtime: {e}")))?;

    let result = match &client {
        Some(client) => rt.block_on(reconcile(client, &schema, &mut document, mode, concurrency))?,
        None => {
            tracing::info!("Offline: skipping remote snapshot, every record is new");
            rt.block_on(reconcile(&OfflineStore, &schema, &mut document, mode, concurrency))?
        }
    };

    if args.write_back && !mode.is_dry_run() {
        document.save(&args.doc.document)?;
        tracing::info!(path = %args.doc.document.display(), "Wrote remote ids back to document");
    }

    let summary = report::summarize(&result);
    if json {
        let output = PushOutput {
            summary: &summary,
            outcomes: &result.outcomes,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        report::print_outcomes(&result);
        report::print_summary(&summary);
    }

    if let Some(error) = result.aborted {
        return Err(error.into());
    }
    if !summary.is_success() {
        return Err(Error::RunFailed {
            failed: summary.counts.failed,
            total: summary.counts.total(),
        });
    }
    Ok(())
}

fn build_client(
    settings: &Settings,
    schema: Arc<Schema>,
) -> Result<TableApiClient<AuthProvider>> {
    let provider = settings.auth_provider()?;
    let client = TableApiClient::new(settings.client_config()?, schema, provider)?;
    Ok(client)
}

async fn reconcile<S: RecordStore>(
    store: &S,
    schema: &Schema,
    document: &mut Document,
    mode: RunMode,
    concurrency: usize,
) -> Result<RunResult> {
    let snapshot: RemoteSnapshot = store
        .fetch_snapshot(&RecordType::ALL, document.policy())
        .await?;
    tracing::info!(
        epics = snapshot.count(RecordType::Epic),
        stories = snapshot.count(RecordType::Story),
        "Remote snapshot"
    );

    let result = Reconciler::new(store, schema)
        .with_concurrency(concurrency)
        .reconcile(document, &snapshot, mode)
        .await;
    Ok(result)
}
