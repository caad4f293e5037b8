//! Remote record store.
//!
//! The reconciler talks to the remote side only through [`RecordStore`].
//! [`TableApiClient`] implements it over a ServiceNow-style Table API:
//!
//! ```text
//! ┌──────────────────┐
//! │    Reconciler    │
//! └────────┬─────────┘
//!          │ RecordStore
//!          ▼
//! ┌──────────────────┐     ┌──────────────┐
//! │  TableApiClient  │────▶│  TokenCache  │ ← single acquisition per run
//! │ (retry/backoff)  │     └──────┬───────┘
//! └────────┬─────────┘            ▼
//!          │              ┌──────────────┐
//!          ▼              │ AuthProvider │ (basic / bearer / OAuth)
//!   /api/now/table/…      └──────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod retry;

pub use auth::{AuthProvider, Credential, OAuthGrant, OAuthProvider, TokenCache, TokenProvider};
pub use client::{ClientConfig, TableApiClient};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::future::Future;

use crate::model::MatchPolicy;
use crate::schema::RecordType;

/// Remote field name → value, ready to send.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Errors from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Non-success response to a create or update.
    #[error("Remote write failed ({status}): {body}")]
    Write { status: u16, body: String },

    /// Non-success response to a lookup.
    #[error("Remote read failed ({status}): {body}")]
    Read { status: u16, body: String },

    /// Credentials could not be acquired or were rejected after refresh.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection, timeout or other transport failure (after retries).
    #[error("Request failed: {0}")]
    Transport(String),

    /// Success response with an unexpected body.
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether this error means no further write can succeed this run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Acknowledgement of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub remote_id: String,
}

/// Pre-fetched `(record type, title)` → remote id lookup table.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    policy: MatchPolicy,
    entries: HashMap<(RecordType, String), String>,
}

impl RemoteSnapshot {
    #[must_use]
    pub fn new(policy: MatchPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Record an existing remote title. The first id seen for a title wins.
    ///
    /// Returns `false` if the title was already present.
    pub fn insert(&mut self, record_type: RecordType, title: &str, remote_id: impl Into<String>) -> bool {
        let key = (record_type, self.policy.key(title));
        if self.entries.contains_key(&key) {
            tracing::warn!(%record_type, title, "Remote store holds duplicate titles; keeping the first");
            return false;
        }
        self.entries.insert(key, remote_id.into());
        true
    }

    /// Remote id for a title, if it already exists.
    #[must_use]
    pub fn get(&self, record_type: RecordType, title: &str) -> Option<&str> {
        self.entries
            .get(&(record_type, self.policy.key(title)))
            .map(String::as_str)
    }

    #[must_use]
    pub const fn policy(&self) -> MatchPolicy {
        self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries of one record type.
    #[must_use]
    pub fn count(&self, record_type: RecordType) -> usize {
        self.entries.keys().filter(|(t, _)| *t == record_type).count()
    }
}

/// Create/read/update over named record types.
///
/// The trait is generic rather than object-safe; callers pick the concrete
/// store at compile time (the HTTP client in production, an in-memory store
/// in tests).
pub trait RecordStore: Send + Sync {
    /// Look up a single record by exact title.
    fn find_by_title(
        &self,
        record_type: RecordType,
        title: &str,
    ) -> impl Future<Output = Result<Option<String>, RemoteError>> + Send;

    /// Create a record, returning its remote id.
    fn create(
        &self,
        record_type: RecordType,
        fields: &Fields,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    /// Update an existing record.
    fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        fields: &Fields,
    ) -> impl Future<Output = Result<Ack, RemoteError>> + Send;

    /// Bulk-fetch every existing title for the given record types.
    fn fetch_snapshot(
        &self,
        types: &[RecordType],
        policy: MatchPolicy,
    ) -> impl Future<Output = Result<RemoteSnapshot, RemoteError>> + Send;
}

/// Store for offline dry runs: there is no remote, so every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineStore;

impl OfflineStore {
    fn unavailable() -> RemoteError {
        RemoteError::Transport("offline: no remote store configured".to_string())
    }
}

impl RecordStore for OfflineStore {
    async fn find_by_title(&self, _: RecordType, _: &str) -> Result<Option<String>, RemoteError> {
        Err(Self::unavailable())
    }

    async fn create(&self, _: RecordType, _: &Fields) -> Result<String, RemoteError> {
        Err(Self::unavailable())
    }

    async fn update(&self, _: RecordType, _: &str, _: &Fields) -> Result<Ack, RemoteError> {
        Err(Self::unavailable())
    }

    async fn fetch_snapshot(
        &self,
        _: &[RecordType],
        policy: MatchPolicy,
    ) -> Result<RemoteSnapshot, RemoteError> {
        Ok(RemoteSnapshot::new(policy))
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory store for reconciler tests.

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::{Ack, Fields, RecordStore, RemoteError, RemoteSnapshot};
    use crate::model::MatchPolicy;
    use crate::schema::RecordType;

    #[derive(Debug, Clone)]
    pub struct StoredRecord {
        pub record_type: RecordType,
        pub remote_id: String,
        pub title: String,
        pub fields: Fields,
    }

    /// Records every call; titles in `fail_titles` fail with a 500, titles
    /// in `expired_titles` with an auth error.
    #[derive(Debug)]
    pub struct MemoryStore {
        title_field: String,
        records: Mutex<Vec<StoredRecord>>,
        calls: Mutex<Vec<String>>,
        fail_titles: HashSet<String>,
        expired_titles: HashSet<String>,
        next_id: Mutex<usize>,
    }

    impl MemoryStore {
        pub fn new(title_field: &str) -> Self {
            Self {
                title_field: title_field.to_string(),
                records: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                fail_titles: HashSet::new(),
                expired_titles: HashSet::new(),
                next_id: Mutex::new(0),
            }
        }

        pub fn failing(mut self, title: &str) -> Self {
            self.fail_titles.insert(title.to_string());
            self
        }

        pub fn expiring(mut self, title: &str) -> Self {
            self.expired_titles.insert(title.to_string());
            self
        }

        pub fn records(&self) -> Vec<StoredRecord> {
            self.records.lock().unwrap().clone()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn write_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with("create") || c.starts_with("update"))
                .count()
        }

        fn injected_failure(&self, title: &str) -> Option<RemoteError> {
            if self.expired_titles.contains(title) {
                return Some(RemoteError::Auth("expired".to_string()));
            }
            self.fail_titles.contains(title).then(|| RemoteError::Write {
                status: 500,
                body: "Internal Server Error".to_string(),
            })
        }

        fn title_of(&self, fields: &Fields) -> String {
            fields
                .get(&self.title_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        }
    }

    impl RecordStore for MemoryStore {
        async fn find_by_title(
            &self,
            record_type: RecordType,
            title: &str,
        ) -> Result<Option<String>, RemoteError> {
            self.calls.lock().unwrap().push(format!("find {record_type} {title}"));
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.record_type == record_type && r.title == title)
                .map(|r| r.remote_id.clone()))
        }

        async fn create(&self, record_type: RecordType, fields: &Fields) -> Result<String, RemoteError> {
            let title = self.title_of(fields);
            self.calls.lock().unwrap().push(format!("create {record_type} {title}"));
            if let Some(error) = self.injected_failure(&title) {
                return Err(error);
            }
            let remote_id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("{record_type}-{next}")
            };
            self.records.lock().unwrap().push(StoredRecord {
                record_type,
                remote_id: remote_id.clone(),
                title,
                fields: fields.clone(),
            });
            Ok(remote_id)
        }

        async fn update(
            &self,
            record_type: RecordType,
            remote_id: &str,
            fields: &Fields,
        ) -> Result<Ack, RemoteError> {
            let title = self.title_of(fields);
            self.calls.lock().unwrap().push(format!("update {record_type} {title}"));
            if let Some(error) = self.injected_failure(&title) {
                return Err(error);
            }
            let mut records = self.records.lock().unwrap();
            match records.iter_mut().find(|r| r.remote_id == remote_id) {
                Some(record) => {
                    record.fields = fields.clone();
                    Ok(Ack {
                        remote_id: remote_id.to_string(),
                    })
                }
                None => Err(RemoteError::Write {
                    status: 404,
                    body: format!("No record {remote_id}"),
                }),
            }
        }

        async fn fetch_snapshot(
            &self,
            types: &[RecordType],
            policy: MatchPolicy,
        ) -> Result<RemoteSnapshot, RemoteError> {
            self.calls.lock().unwrap().push("snapshot".to_string());
            let mut snapshot = RemoteSnapshot::new(policy);
            for record in self.records.lock().unwrap().iter() {
                if types.contains(&record.record_type) {
                    snapshot.insert(record.record_type, &record.title, record.remote_id.clone());
                }
            }
            Ok(snapshot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_lookup_is_per_type() {
        let mut snapshot = RemoteSnapshot::new(MatchPolicy::Exact);
        snapshot.insert(RecordType::Epic, "Billing", "e1");
        snapshot.insert(RecordType::Story, "Billing", "s1");

        assert_eq!(snapshot.get(RecordType::Epic, "Billing"), Some("e1"));
        assert_eq!(snapshot.get(RecordType::Story, "Billing"), Some("s1"));
        assert_eq!(snapshot.get(RecordType::Epic, "billing"), None);
        assert_eq!(snapshot.count(RecordType::Epic), 1);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_snapshot_first_duplicate_wins() {
        let mut snapshot = RemoteSnapshot::new(MatchPolicy::Exact);
        assert!(snapshot.insert(RecordType::Epic, "Billing", "e1"));
        assert!(!snapshot.insert(RecordType::Epic, "Billing", "e2"));
        assert_eq!(snapshot.get(RecordType::Epic, "Billing"), Some("e1"));
    }

    #[test]
    fn test_snapshot_respects_policy() {
        let mut snapshot = RemoteSnapshot::new(MatchPolicy::Normalized);
        snapshot.insert(RecordType::Epic, "Billing  Portal", "e1");
        assert_eq!(snapshot.get(RecordType::Epic, "billing portal"), Some("e1"));
    }

    #[test]
    fn test_auth_errors_are_fatal() {
        assert!(RemoteError::Auth("expired".into()).is_fatal());
        assert!(!RemoteError::Write { status: 500, body: String::new() }.is_fatal());
    }
}
