//! Reconciliation engine.
//!
//! Brings the remote store in line with a validated [`Document`]:
//!
//! 1. Epics are classified against the [`RemoteSnapshot`] into new and
//!    existing. New epics are created first, then existing ones are updated
//!    or skipped depending on the [`RunMode`].
//! 2. Stories run only after every epic write has settled. Each story
//!    resolves its parent's remote id, which lands in the schema's parent
//!    field.
//!
//! A failed write is isolated to its record; stories whose epic could not
//! be created are skipped. Only an authentication failure stops the run: no
//! write starts after it, and every record left unwritten is reported as
//! skipped with [`SkipReason::RunAborted`].
//! There is no rollback: running again picks up where a partial run left
//! off since created records are then found in the snapshot.

pub mod mapping;
pub mod types;

pub use types::{Action, ConsistencyError, Outcome, RunMode, RunResult, SkipReason};

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::model::Document;
use crate::remote::{Fields, RecordStore, RemoteError, RemoteSnapshot};
use crate::schema::{RecordType, Schema};

/// Where a story's parent reference comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParentRef {
    Resolved(String),
    /// Dry run: the epic would be created, so there is no id yet.
    Planned,
    Failed,
    /// Never written because the run was aborted.
    Abandoned,
    /// Processed but without an id.
    Unresolved,
}

/// One pending remote write.
#[derive(Debug)]
struct WriteOp {
    record_type: RecordType,
    index: usize,
    title: String,
    parent_title: Option<String>,
    /// Set for updates.
    existing_id: Option<String>,
    fields: Fields,
}

impl WriteOp {
    fn planned(&self) -> Outcome {
        let action = if self.existing_id.is_some() {
            Action::PlannedUpdate
        } else {
            Action::PlannedCreate
        };
        Outcome::new(self.record_type, self.title.clone(), action)
            .with_remote_id(self.existing_id.clone())
            .with_parent(self.parent_title.clone())
    }
}

/// Writes for one level, split by kind.
#[derive(Debug, Default)]
struct Level {
    creates: Vec<WriteOp>,
    updates: Vec<WriteOp>,
    /// Outcomes decided without a write.
    settled: Vec<Outcome>,
}

#[derive(Debug, Default)]
struct Progress {
    outcomes: Vec<Outcome>,
    aborted: Option<RemoteError>,
}

/// Drives one reconciliation run against a [`RecordStore`].
#[derive(Debug)]
pub struct Reconciler<'a, S> {
    store: &'a S,
    schema: &'a Schema,
    concurrency: usize,
}

impl<'a, S: RecordStore> Reconciler<'a, S> {
    #[must_use]
    pub const fn new(store: &'a S, schema: &'a Schema) -> Self {
        Self {
            store,
            schema,
            concurrency: 1,
        }
    }

    /// Maximum in-flight writes within one level (at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Reconcile `document` against `snapshot`.
    ///
    /// Successful creates backfill `remote_id` into the document; so do
    /// snapshot matches. Outcomes are ordered epics first, and within a
    /// level: creates, then updates, then records settled without a write.
    pub async fn reconcile(
        &self,
        document: &mut Document,
        snapshot: &RemoteSnapshot,
        mode: RunMode,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(
            %run_id,
            %mode,
            epics = document.epics().len(),
            stories = document.stories().len(),
            concurrency = self.concurrency,
            "Starting reconciliation"
        );

        let mut progress = Progress::default();

        let epic_refs = self
            .reconcile_epics(document, snapshot, mode, &mut progress)
            .await;

        if progress.aborted.is_some() {
            tracing::error!(%run_id, "Run aborted, remaining stories will not be written");
        }
        self.reconcile_stories(document, snapshot, mode, &epic_refs, &mut progress)
            .await;

        let result = RunResult {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            outcomes: progress.outcomes,
            aborted: progress.aborted,
        };
        tracing::info!(
            %run_id,
            outcomes = result.outcomes.len(),
            failed = result.with_action(Action::Failed).count(),
            "Reconciliation finished"
        );
        result
    }

    async fn reconcile_epics(
        &self,
        document: &mut Document,
        snapshot: &RemoteSnapshot,
        mode: RunMode,
        progress: &mut Progress,
    ) -> Vec<ParentRef> {
        let known = align_remote_ids(document, RecordType::Epic, snapshot);
        let mut refs = vec![ParentRef::Unresolved; document.epics().len()];
        let mut level = Level::default();

        for (index, epic) in document.epics().iter().enumerate() {
            let fields = mapping::epic_fields(self.schema, epic);
            let existing = known.get(index).cloned().flatten();
            if let Some(id) = &existing {
                refs[index] = ParentRef::Resolved(id.clone());
            }
            classify(
                &mut level,
                self.schema,
                mode,
                WriteOp {
                    record_type: RecordType::Epic,
                    index,
                    title: epic.title.clone(),
                    parent_title: None,
                    existing_id: existing,
                    fields,
                },
            );
        }

        for (index, parent) in self.run_level(level, mode, document, progress).await {
            if let Some(slot) = refs.get_mut(index) {
                *slot = parent;
            }
        }
        refs
    }

    async fn reconcile_stories(
        &self,
        document: &mut Document,
        snapshot: &RemoteSnapshot,
        mode: RunMode,
        epic_refs: &[ParentRef],
        progress: &mut Progress,
    ) {
        let known = align_remote_ids(document, RecordType::Story, snapshot);
        let mut level = Level::default();

        for (index, story) in document.stories().iter().enumerate() {
            let parent_title = Some(story.parent_epic_title.clone());
            let parent = document
                .epic_index(&story.parent_epic_title)
                .and_then(|i| epic_refs.get(i))
                .unwrap_or(&ParentRef::Unresolved);

            let parent_id = match parent {
                ParentRef::Resolved(id) => Some(id.as_str()),
                ParentRef::Planned => None,
                ParentRef::Failed => {
                    tracing::warn!(story = %story.title, parent = %story.parent_epic_title, "Skipping story, parent epic failed");
                    level.settled.push(
                        Outcome::skipped(RecordType::Story, story.title.clone(), SkipReason::ParentFailed)
                            .with_parent(parent_title),
                    );
                    continue;
                }
                ParentRef::Abandoned => {
                    level.settled.push(
                        Outcome::skipped(RecordType::Story, story.title.clone(), SkipReason::RunAborted)
                            .with_remote_id(known.get(index).cloned().flatten())
                            .with_parent(parent_title),
                    );
                    continue;
                }
                ParentRef::Unresolved => {
                    let error = ConsistencyError {
                        story: story.title.clone(),
                        parent: story.parent_epic_title.clone(),
                    };
                    tracing::error!(story = %story.title, parent = %story.parent_epic_title, "{error}");
                    level.settled.push(
                        Outcome::failed(RecordType::Story, story.title.clone(), error.to_string())
                            .with_parent(parent_title),
                    );
                    continue;
                }
            };

            classify(
                &mut level,
                self.schema,
                mode,
                WriteOp {
                    record_type: RecordType::Story,
                    index,
                    title: story.title.clone(),
                    parent_title,
                    existing_id: known.get(index).cloned().flatten(),
                    fields: mapping::story_fields(self.schema, story, parent_id),
                },
            );
        }

        self.run_level(level, mode, document, progress).await;
    }

    /// Execute (or plan) a level: creates, then updates.
    ///
    /// Returns the parent reference each written record ends up with.
    async fn run_level(
        &self,
        level: Level,
        mode: RunMode,
        document: &mut Document,
        progress: &mut Progress,
    ) -> Vec<(usize, ParentRef)> {
        let mut resolved = Vec::new();

        for batch in [level.creates, level.updates] {
            if progress.aborted.is_some() {
                for op in batch {
                    resolved.push((op.index, abandon(op, progress)));
                }
                continue;
            }
            if mode.is_dry_run() {
                for op in batch {
                    tracing::debug!(record_type = %op.record_type, title = %op.title, fields = ?op.fields, "Planned write");
                    progress.outcomes.push(op.planned());
                    let parent = op.existing_id.map_or(ParentRef::Planned, ParentRef::Resolved);
                    resolved.push((op.index, parent));
                }
                continue;
            }
            let halted = AtomicBool::new(false);
            for (op, result) in self.execute(batch, &halted).await {
                let index = op.index;
                let parent = match result {
                    Some(result) => settle(op, result, document, progress),
                    None => abandon(op, progress),
                };
                resolved.push((index, parent));
            }
        }

        progress.outcomes.extend(level.settled);
        resolved
    }

    /// Run writes with at most `concurrency` in flight, in input order.
    ///
    /// Once a write fails fatally `halted` is raised and no further write
    /// starts; those ops come back with `None`.
    async fn execute(
        &self,
        batch: Vec<WriteOp>,
        halted: &AtomicBool,
    ) -> Vec<(WriteOp, Option<Result<String, RemoteError>>)> {
        if batch.is_empty() {
            return Vec::new();
        }
        stream::iter(batch)
            .map(|op| async move {
                if halted.load(Ordering::Acquire) {
                    return (op, None);
                }
                let result = match &op.existing_id {
                    None => self.store.create(op.record_type, &op.fields).await,
                    Some(id) => self
                        .store
                        .update(op.record_type, id, &op.fields)
                        .await
                        .map(|ack| ack.remote_id),
                };
                if result.as_ref().is_err_and(RemoteError::is_fatal) {
                    halted.store(true, Ordering::Release);
                }
                (op, Some(result))
            })
            .buffered(self.concurrency)
            .collect::<Vec<_>>()
            .await
    }
}

/// File a record under create, update or skip.
///
/// Only creates carry the schema's static fields; an update must not reset
/// remote workflow state.
fn classify(level: &mut Level, schema: &Schema, mode: RunMode, mut op: WriteOp) {
    let Some(remote_id) = op.existing_id.clone() else {
        op.fields = mapping::with_static_fields(schema, op.record_type, op.fields);
        level.creates.push(op);
        return;
    };
    if mode.touches_existing() {
        level.updates.push(op);
        return;
    }
    tracing::debug!(record_type = %op.record_type, title = %op.title, %remote_id, "Already exists, skipping");
    level.settled.push(
        Outcome::skipped(op.record_type, op.title, SkipReason::AlreadyExists)
            .with_remote_id(Some(remote_id))
            .with_parent(op.parent_title),
    );
}

/// Record the outcome of one write and backfill a created id.
fn settle(
    op: WriteOp,
    result: Result<String, RemoteError>,
    document: &mut Document,
    progress: &mut Progress,
) -> ParentRef {
    match result {
        Ok(remote_id) => {
            let action = if op.existing_id.is_some() {
                Action::Updated
            } else {
                document.set_remote_id(op.record_type, op.index, Some(remote_id.clone()));
                Action::Created
            };
            tracing::info!(record_type = %op.record_type, title = %op.title, %remote_id, %action, "Write succeeded");
            progress.outcomes.push(
                Outcome::new(op.record_type, op.title, action)
                    .with_remote_id(Some(remote_id.clone()))
                    .with_parent(op.parent_title),
            );
            ParentRef::Resolved(remote_id)
        }
        Err(error) => {
            tracing::error!(record_type = %op.record_type, title = %op.title, %error, "Write failed");
            if error.is_fatal() && progress.aborted.is_none() {
                progress.aborted = Some(error.clone());
            }
            progress.outcomes.push(
                Outcome::failed(op.record_type, op.title, error.to_string())
                    .with_remote_id(op.existing_id.clone())
                    .with_parent(op.parent_title),
            );
            // A failed update leaves the record in place; its stories can still link to it.
            op.existing_id.map_or(ParentRef::Failed, ParentRef::Resolved)
        }
    }
}

/// Report a write that never started because the run was aborted.
fn abandon(op: WriteOp, progress: &mut Progress) -> ParentRef {
    tracing::warn!(record_type = %op.record_type, title = %op.title, "Not written, run aborted");
    progress.outcomes.push(
        Outcome::skipped(op.record_type, op.title, SkipReason::RunAborted)
            .with_remote_id(op.existing_id.clone())
            .with_parent(op.parent_title),
    );
    op.existing_id.map_or(ParentRef::Abandoned, ParentRef::Resolved)
}

/// Make every record's `remote_id` agree with the snapshot.
///
/// Returns the snapshot id per record, in document order.
fn align_remote_ids(
    document: &mut Document,
    record_type: RecordType,
    snapshot: &RemoteSnapshot,
) -> Vec<Option<String>> {
    let current: Vec<(String, Option<String>)> = match record_type {
        RecordType::Epic => document
            .epics()
            .iter()
            .map(|e| (e.title.clone(), e.remote_id.clone()))
            .collect(),
        RecordType::Story => document
            .stories()
            .iter()
            .map(|s| (s.title.clone(), s.remote_id.clone()))
            .collect(),
    };

    current
        .into_iter()
        .enumerate()
        .map(|(index, (title, local))| {
            let found = snapshot.get(record_type, &title).map(str::to_string);
            if local != found {
                if local.is_some() {
                    tracing::warn!(
                        %record_type,
                        %title,
                        local_id = ?local,
                        remote_id = ?found,
                        "Document remote id disagrees with the remote store, using the store"
                    );
                }
                document.set_remote_id(record_type, index, found.clone());
            }
            found
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchPolicy;
    use crate::remote::memory::MemoryStore;

    const TWO_BY_THREE: &str = r#"{
        "epics": [
            {"title": "Billing", "priority": "high", "stories": [
                {"title": "Pay invoice", "acceptance_criteria": ["Card accepted"]},
                {"title": "Download receipt"},
                {"title": "Refund payment", "priority": "low"}
            ]},
            {"title": "Search", "stories": [
                {"title": "Search by name"},
                {"title": "Filter results"},
                {"title": "Save search"}
            ]}
        ]
    }"#;

    fn schema() -> Schema {
        Schema::builtin().unwrap()
    }

    fn document(schema: &Schema, raw: &str) -> Document {
        Document::parse(raw, schema, MatchPolicy::Exact).unwrap()
    }

    async fn snapshot_of(store: &MemoryStore) -> RemoteSnapshot {
        store
            .fetch_snapshot(&RecordType::ALL, MatchPolicy::Exact)
            .await
            .unwrap()
    }

    fn count(result: &RunResult, action: Action) -> usize {
        result.with_action(action).count()
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_writes() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::DryRun { updates: false })
            .await;

        assert_eq!(store.write_calls(), 0);
        assert_eq!(result.outcomes.len(), 8);
        assert_eq!(count(&result, Action::PlannedCreate), 8);
        assert!(doc.epics().iter().all(|e| e.remote_id.is_none()));
        assert!(doc.stories().iter().all(|s| s.remote_id.is_none()));
    }

    #[tokio::test]
    async fn test_dry_run_plans_updates_for_existing() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut first = document(&schema, TWO_BY_THREE);
        Reconciler::new(&store, &schema)
            .reconcile(&mut first, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;
        let writes = store.write_calls();

        let mut doc = document(&schema, TWO_BY_THREE);
        let snapshot = snapshot_of(&store).await;
        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &snapshot, RunMode::DryRun { updates: true })
            .await;

        assert_eq!(store.write_calls(), writes);
        assert_eq!(count(&result, Action::PlannedUpdate), 8);
        // Snapshot ids are backfilled even in a dry run.
        assert!(doc.epics().iter().all(|e| e.remote_id.is_some()));
    }

    #[tokio::test]
    async fn test_stories_link_to_their_epic() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        assert_eq!(count(&result, Action::Created), 8);
        assert!(!result.has_failures());

        let records = store.records();
        for story in doc.stories() {
            let parent_id = doc.parent_of(story).and_then(|e| e.remote_id.clone()).unwrap();
            let stored = records
                .iter()
                .find(|r| r.record_type == RecordType::Story && r.title == story.title)
                .unwrap();
            assert_eq!(stored.fields["epic"], serde_json::json!(parent_id));
            assert_eq!(story.remote_id.as_deref(), Some(stored.remote_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_epics_are_written_before_stories() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);

        Reconciler::new(&store, &schema)
            .with_concurrency(4)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        let calls = store.calls();
        let last_epic = calls.iter().rposition(|c| c.starts_with("create epic")).unwrap();
        let first_story = calls.iter().position(|c| c.starts_with("create story")).unwrap();
        assert!(last_epic < first_story);
        assert_eq!(calls.len(), 8);
    }

    #[tokio::test]
    async fn test_second_run_creates_nothing() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);
        Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        let mut again = document(&schema, TWO_BY_THREE);
        let snapshot = snapshot_of(&store).await;
        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut again, &snapshot, RunMode::CreateOnly)
            .await;

        assert_eq!(count(&result, Action::Created), 0);
        assert_eq!(count(&result, Action::Skipped), 8);
        assert!(result
            .outcomes
            .iter()
            .all(|o| o.reason == Some(SkipReason::AlreadyExists)));
        assert_eq!(store.records().len(), 8);
    }

    #[tokio::test]
    async fn test_update_mode_updates_existing_and_creates_new() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);
        Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        let extended = r#"{"epics": [
            {"title": "Billing", "description": "Reworded", "stories": [{"title": "Pay invoice"}]},
            {"title": "Reports", "stories": [{"title": "Monthly report"}]}
        ]}"#;
        let mut doc = document(&schema, extended);
        let snapshot = snapshot_of(&store).await;
        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &snapshot, RunMode::CreateAndUpdate)
            .await;

        assert_eq!(count(&result, Action::Created), 2);
        assert_eq!(count(&result, Action::Updated), 2);

        // Creates precede updates within a level.
        let epic_actions: Vec<Action> = result
            .outcomes
            .iter()
            .filter(|o| o.record_type == RecordType::Epic)
            .map(|o| o.action)
            .collect();
        assert_eq!(epic_actions, vec![Action::Created, Action::Updated]);

        let billing = store
            .records()
            .into_iter()
            .find(|r| r.title == "Billing")
            .unwrap();
        assert_eq!(billing.fields["description"], serde_json::json!("Reworded"));
    }

    #[tokio::test]
    async fn test_failed_epic_skips_its_stories_only() {
        let schema = schema();
        let store = MemoryStore::new("short_description").failing("Billing");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        assert_eq!(count(&result, Action::Failed), 1);
        let failed = result.outcome(RecordType::Epic, "Billing").unwrap();
        assert_eq!(failed.action, Action::Failed);
        assert!(failed.error.as_deref().unwrap().contains("500"));

        for title in ["Pay invoice", "Download receipt", "Refund payment"] {
            let outcome = result.outcome(RecordType::Story, title).unwrap();
            assert_eq!(outcome.action, Action::Skipped);
            assert_eq!(outcome.reason, Some(SkipReason::ParentFailed));
        }
        for title in ["Search by name", "Filter results", "Save search"] {
            assert_eq!(result.outcome(RecordType::Story, title).unwrap().action, Action::Created);
        }
        assert_eq!(result.outcome(RecordType::Epic, "Search").unwrap().action, Action::Created);
        assert!(doc.epics()[0].remote_id.is_none());
        assert!(result.has_failures());
    }

    #[tokio::test]
    async fn test_failed_story_does_not_affect_siblings() {
        let schema = schema();
        let store = MemoryStore::new("short_description").failing("Download receipt");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .with_concurrency(3)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        assert_eq!(count(&result, Action::Failed), 1);
        assert_eq!(count(&result, Action::Created), 7);
    }

    #[tokio::test]
    async fn test_unresolved_parent_is_consistency_error() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);

        // Epics were never processed, so no parent has an id.
        let reconciler = Reconciler::new(&store, &schema);
        let mut progress = Progress::default();
        let refs = vec![ParentRef::Unresolved; doc.epics().len()];
        reconciler
            .reconcile_stories(
                &mut doc,
                &RemoteSnapshot::new(MatchPolicy::Exact),
                RunMode::CreateOnly,
                &refs,
                &mut progress,
            )
            .await;

        assert_eq!(store.write_calls(), 0);
        assert_eq!(progress.outcomes.len(), 6);
        for outcome in &progress.outcomes {
            assert_eq!(outcome.action, Action::Failed);
            assert!(outcome.error.as_deref().unwrap().starts_with("Consistency error"));
        }
    }

    #[tokio::test]
    async fn test_dry_run_stories_of_new_epic_use_placeholder() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::DryRun { updates: false })
            .await;

        let story = result.outcome(RecordType::Story, "Save search").unwrap();
        assert_eq!(story.action, Action::PlannedCreate);
        assert_eq!(story.parent_title.as_deref(), Some("Search"));
        assert!(story.remote_id.is_none());
    }

    #[tokio::test]
    async fn test_stale_document_id_is_replaced_by_snapshot() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let raw = r#"{"epics": [{"title": "Billing", "remote_id": "stale", "stories": []}]}"#;
        let mut doc = document(&schema, raw);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        assert_eq!(count(&result, Action::Created), 1);
        assert_eq!(doc.epics()[0].remote_id.as_deref(), Some("epic-1"));
    }

    #[tokio::test]
    async fn test_auth_failure_stops_writes_and_reports_every_record() {
        let schema = schema();
        let store = MemoryStore::new("short_description").expiring("Billing");
        let mut doc = document(&schema, TWO_BY_THREE);

        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        assert!(matches!(result.aborted, Some(RemoteError::Auth(_))));
        assert_eq!(store.write_calls(), 1);
        assert_eq!(result.outcomes.len(), 8);

        assert_eq!(result.outcome(RecordType::Epic, "Billing").unwrap().action, Action::Failed);
        let search = result.outcome(RecordType::Epic, "Search").unwrap();
        assert_eq!(search.action, Action::Skipped);
        assert_eq!(search.reason, Some(SkipReason::RunAborted));

        for title in ["Pay invoice", "Download receipt", "Refund payment"] {
            let outcome = result.outcome(RecordType::Story, title).unwrap();
            assert_eq!(outcome.reason, Some(SkipReason::ParentFailed));
        }
        for title in ["Search by name", "Filter results", "Save search"] {
            let outcome = result.outcome(RecordType::Story, title).unwrap();
            assert_eq!(outcome.action, Action::Skipped);
            assert_eq!(outcome.reason, Some(SkipReason::RunAborted));
        }

        let summary = crate::report::summarize(&result);
        assert_eq!(summary.counts.total(), 8);
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_auth_failure_abandons_pending_updates() {
        let schema = schema();
        let store = MemoryStore::new("short_description").expiring("Search");
        let mut seed = document(&schema, r#"{"epics": [{"title": "Billing", "stories": []}]}"#);
        Reconciler::new(&store, &schema)
            .reconcile(&mut seed, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;

        let mut doc = document(&schema, TWO_BY_THREE);
        let snapshot = snapshot_of(&store).await;
        let result = Reconciler::new(&store, &schema)
            .with_concurrency(4)
            .reconcile(&mut doc, &snapshot, RunMode::CreateAndUpdate)
            .await;

        // The seed create plus the rejected create of "Search".
        assert_eq!(store.write_calls(), 2);
        assert_eq!(result.outcomes.len(), 8);

        let billing = result.outcome(RecordType::Epic, "Billing").unwrap();
        assert_eq!(billing.reason, Some(SkipReason::RunAborted));
        assert_eq!(billing.remote_id.as_deref(), Some("epic-1"));
        let pay = result.outcome(RecordType::Story, "Pay invoice").unwrap();
        assert_eq!(pay.reason, Some(SkipReason::RunAborted));
        let save = result.outcome(RecordType::Story, "Save search").unwrap();
        assert_eq!(save.reason, Some(SkipReason::ParentFailed));
    }

    #[tokio::test]
    async fn test_update_does_not_reset_static_fields() {
        let schema = schema();
        let store = MemoryStore::new("short_description");
        let mut doc = document(&schema, TWO_BY_THREE);
        Reconciler::new(&store, &schema)
            .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
            .await;
        let created = store
            .records()
            .into_iter()
            .find(|r| r.title == "Pay invoice")
            .unwrap();
        assert_eq!(created.fields["state"], serde_json::json!("-6"));

        let mut again = document(&schema, TWO_BY_THREE);
        let snapshot = snapshot_of(&store).await;
        let result = Reconciler::new(&store, &schema)
            .reconcile(&mut again, &snapshot, RunMode::CreateAndUpdate)
            .await;
        assert_eq!(count(&result, Action::Updated), 8);

        // The memory store replaces fields wholesale, so this is the update payload.
        let updated = store
            .records()
            .into_iter()
            .find(|r| r.title == "Pay invoice")
            .unwrap();
        assert!(!updated.fields.contains_key("state"));
        assert_eq!(updated.fields["epic"], created.fields["epic"]);
    }

    mod table_api {
        use std::sync::Arc;

        use serde_json::json;
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use super::*;
        use crate::remote::{AuthProvider, ClientConfig, Credential, RetryPolicy, TableApiClient};
        use crate::report;

        async fn respond_created(server: &MockServer, table: &str, body: serde_json::Value, sys_id: &str, times: u64) {
            Mock::given(method("POST"))
                .and(path(format!("/api/now/table/{table}")))
                .and(body_partial_json(body))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                    "result": {"sys_id": sys_id}
                })))
                .expect(times)
                .mount(server)
                .await;
        }

        #[tokio::test]
        async fn test_epic_exhausting_retries_skips_only_its_subtree() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/now/table/rm_epic"))
                .and(body_partial_json(json!({"short_description": "Billing"})))
                .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
                .expect(3)
                .mount(&server)
                .await;
            respond_created(&server, "rm_epic", json!({"short_description": "Search"}), "e-search", 1).await;
            respond_created(&server, "rm_story", json!({"epic": "e-search"}), "s-1", 3).await;

            let schema = Arc::new(Schema::builtin().unwrap());
            let config = ClientConfig {
                retry: RetryPolicy::immediate(3),
                ..ClientConfig::new(server.uri())
            };
            let provider = AuthProvider::Static(Credential::Basic {
                username: "admin".to_string(),
                password: "secret".to_string(),
            });
            let client = TableApiClient::new(config, Arc::clone(&schema), provider).unwrap();
            let mut doc = document(&schema, TWO_BY_THREE);

            let result = Reconciler::new(&client, &schema)
                .with_concurrency(2)
                .reconcile(&mut doc, &RemoteSnapshot::new(MatchPolicy::Exact), RunMode::CreateOnly)
                .await;

            assert!(result.aborted.is_none());
            let billing = result.outcome(RecordType::Epic, "Billing").unwrap();
            assert_eq!(billing.action, Action::Failed);
            assert!(billing.error.as_deref().unwrap().contains("500"));
            for title in ["Pay invoice", "Download receipt", "Refund payment"] {
                let outcome = result.outcome(RecordType::Story, title).unwrap();
                assert_eq!(outcome.action, Action::Skipped);
                assert_eq!(outcome.reason, Some(SkipReason::ParentFailed));
            }
            assert_eq!(result.outcome(RecordType::Epic, "Search").unwrap().action, Action::Created);
            for title in ["Search by name", "Filter results", "Save search"] {
                assert_eq!(result.outcome(RecordType::Story, title).unwrap().action, Action::Created);
            }

            let summary = report::summarize(&result);
            assert_eq!(summary.counts.failed, 1);
            assert_eq!(summary.counts.skipped, 3);
            assert_eq!(summary.counts.created, 4);
            assert_eq!(summary.failures.len(), 1);
            assert_eq!(summary.failures[0].title, "Billing");
        }
    }
}
