//! Table API client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::auth::{TokenCache, TokenProvider};
use super::retry::{RetryPolicy, is_retryable_error, is_retryable_status};
use super::{Ack, Fields, RecordStore, RemoteError, RemoteSnapshot};
use crate::model::MatchPolicy;
use crate::schema::{RecordType, Schema};

/// Default rows per snapshot page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Offset paging is only stable over a fixed order.
const SNAPSHOT_ORDER: &str = "ORDERBYsys_id";

/// Connection settings for [`TableApiClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Instance base URL, e.g. `https://example.service-now.com`.
    pub instance_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub page_size: usize,
}

impl ClientConfig {
    #[must_use]
    pub fn new(instance_url: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

impl Op {
    const fn status_error(self, status: u16, body: String) -> RemoteError {
        match self {
            Self::Read => RemoteError::Read { status, body },
            Self::Write => RemoteError::Write { status, body },
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct RecordRef {
    sys_id: String,
}

/// [`RecordStore`] over `/api/now/table/{table}`.
#[derive(Debug)]
pub struct TableApiClient<P> {
    http: reqwest::Client,
    base_url: String,
    schema: Arc<Schema>,
    auth: TokenCache<P>,
    retry: RetryPolicy,
    page_size: usize,
}

impl<P: TokenProvider> TableApiClient<P> {
    /// Build a client for one run.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::Transport` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, schema: Arc<Schema>, provider: P) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.instance_url.trim_end_matches('/').to_string(),
            schema,
            auth: TokenCache::new(provider),
            retry: config.retry,
            page_size: config.page_size.max(1),
        })
    }

    /// How many times credentials were acquired this run.
    #[must_use]
    pub fn credential_acquisitions(&self) -> usize {
        self.auth.acquisitions()
    }

    fn table_url(&self, record_type: RecordType) -> String {
        format!(
            "{}/api/now/table/{}",
            self.base_url,
            self.schema.table(record_type).table()
        )
    }

    /// Send a request with auth, transient retry and one re-auth on 401.
    ///
    /// `build` is called once per attempt since a `RequestBuilder` cannot be
    /// replayed.
    async fn send<F>(&self, op: Op, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Sync,
    {
        let mut credential = self.auth.current().await?;
        let mut attempt: u32 = 1;
        let mut reauthenticated = false;

        loop {
            let request = credential.apply(build(&self.http).header(ACCEPT, "application/json"));

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if is_retryable_error(&e) => {
                    if let Some(delay) = self.retry.next_delay(attempt) {
                        tracing::warn!(attempt, ?delay, error = %e, "Transient transport error, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(RemoteError::Transport(e.to_string()));
                }
                Err(e) => return Err(RemoteError::Transport(e.to_string())),
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::UNAUTHORIZED {
                if reauthenticated {
                    return Err(RemoteError::Auth(
                        "credentials rejected after re-acquisition".to_string(),
                    ));
                }
                reauthenticated = true;
                credential = self.auth.refresh(&credential).await?;
                continue;
            }

            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                retry_after(&response)
            } else {
                None
            };
            let body = response.text().await.unwrap_or_default();

            if is_retryable_status(status) {
                if let Some(backoff) = self.retry.next_delay(attempt) {
                    let delay = retry_after.map_or(backoff, |d| self.retry.clamp(d));
                    tracing::warn!(attempt, status = status.as_u16(), ?delay, "Transient remote error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            }

            return Err(op.status_error(status.as_u16(), body));
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        response
            .json::<Envelope<T>>()
            .await
            .map(|envelope| envelope.result)
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn fetch_titles(
        &self,
        record_type: RecordType,
        snapshot: &mut RemoteSnapshot,
    ) -> Result<(), RemoteError> {
        let url = self.table_url(record_type);
        let title_field = self.schema.table(record_type).title_field().to_string();
        let fields = format!("sys_id,{title_field}");
        let limit = self.page_size.to_string();
        let mut offset = 0usize;

        loop {
            let offset_param = offset.to_string();
            let response = self
                .send(Op::Read, |http| {
                    http.get(&url).query(&[
                        ("sysparm_query", SNAPSHOT_ORDER),
                        ("sysparm_fields", fields.as_str()),
                        ("sysparm_limit", limit.as_str()),
                        ("sysparm_offset", offset_param.as_str()),
                    ])
                })
                .await?;

            let rows: Vec<Fields> = Self::decode(response).await?;
            let page_len = rows.len();

            for row in &rows {
                let title = row.get(&title_field).and_then(serde_json::Value::as_str);
                let sys_id = row.get("sys_id").and_then(serde_json::Value::as_str);
                if let (Some(title), Some(sys_id)) = (title, sys_id) {
                    snapshot.insert(record_type, title, sys_id);
                }
            }

            tracing::debug!(%record_type, offset, rows = page_len, "Fetched snapshot page");

            if page_len < self.page_size {
                return Ok(());
            }
            offset += page_len;
        }
    }
}

/// Escape a value for use inside an encoded query.
fn escape_query_value(value: &str) -> String {
    value.replace('^', "^^")
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl<P: TokenProvider> RecordStore for TableApiClient<P> {
    async fn find_by_title(
        &self,
        record_type: RecordType,
        title: &str,
    ) -> Result<Option<String>, RemoteError> {
        let url = self.table_url(record_type);
        let title_field = self.schema.table(record_type).title_field();
        let query = format!("{title_field}={}", escape_query_value(title));
        let fields = format!("sys_id,{title_field}");

        let response = self
            .send(Op::Read, |http| {
                http.get(&url).query(&[
                    ("sysparm_query", query.as_str()),
                    ("sysparm_fields", fields.as_str()),
                    ("sysparm_limit", "1"),
                ])
            })
            .await?;

        let rows: Vec<RecordRef> = Self::decode(response).await?;
        Ok(rows.into_iter().next().map(|row| row.sys_id))
    }

    async fn create(&self, record_type: RecordType, fields: &Fields) -> Result<String, RemoteError> {
        let url = self.table_url(record_type);
        let response = self
            .send(Op::Write, |http| {
                http.post(&url)
                    .query(&[("sysparm_fields", "sys_id")])
                    .json(fields)
            })
            .await?;

        let record: RecordRef = Self::decode(response).await?;
        tracing::debug!(%record_type, remote_id = %record.sys_id, "Created record");
        Ok(record.sys_id)
    }

    async fn update(
        &self,
        record_type: RecordType,
        remote_id: &str,
        fields: &Fields,
    ) -> Result<Ack, RemoteError> {
        let url = format!("{}/{remote_id}", self.table_url(record_type));
        self.send(Op::Write, |http| {
            http.patch(&url)
                .query(&[("sysparm_fields", "sys_id")])
                .json(fields)
        })
        .await?;

        tracing::debug!(%record_type, remote_id, "Updated record");
        Ok(Ack {
            remote_id: remote_id.to_string(),
        })
    }

    async fn fetch_snapshot(
        &self,
        types: &[RecordType],
        policy: MatchPolicy,
    ) -> Result<RemoteSnapshot, RemoteError> {
        let mut snapshot = RemoteSnapshot::new(policy);
        for &record_type in types {
            self.fetch_titles(record_type, &mut snapshot).await?;
        }
        tracing::info!(entries = snapshot.len(), "Fetched remote snapshot");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::remote::{AuthProvider, Credential};

    fn basic() -> AuthProvider {
        AuthProvider::Static(Credential::Basic {
            username: "admin".to_string(),
            password: "secret".to_string(),
        })
    }

    fn client<P: TokenProvider>(server: &MockServer, provider: P) -> TableApiClient<P> {
        let config = ClientConfig {
            retry: RetryPolicy::immediate(3),
            ..ClientConfig::new(server.uri())
        };
        TableApiClient::new(config, Arc::new(Schema::builtin().unwrap()), provider).unwrap()
    }

    fn epic_fields(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("short_description".to_string(), json!(title));
        fields
    }

    #[tokio::test]
    async fn test_create_returns_sys_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/now/table/rm_epic"))
            .and(body_partial_json(json!({"short_description": "Billing"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "result": {"sys_id": "abc123"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let id = client.create(RecordType::Epic, &epic_fields("Billing")).await.unwrap();

        assert_eq!(id, "abc123");
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/now/table/rm_epic"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let err = client.create(RecordType::Epic, &epic_fields("Billing")).await.unwrap_err();

        assert_eq!(
            err,
            RemoteError::Write {
                status: 500,
                body: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/now/table/rm_story"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/now/table/rm_story"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "result": {"sys_id": "s1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let id = client.create(RecordType::Story, &Fields::new()).await.unwrap();

        assert_eq!(id, "s1");
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/now/table/rm_epic/e1"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad field"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let err = client
            .update(RecordType::Epic, "e1", &epic_fields("Billing"))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Write { status: 400, .. }));
    }

    struct Rotating {
        issued: AtomicUsize,
    }

    impl TokenProvider for Rotating {
        fn name(&self) -> &'static str {
            "rotating"
        }

        async fn acquire(&self) -> Result<Credential, RemoteError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential::Bearer(format!("token-{n}")))
        }
    }

    #[tokio::test]
    async fn test_unauthorized_reacquires_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "result": {"sys_id": "e9"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(
            &server,
            Rotating {
                issued: AtomicUsize::new(0),
            },
        );

        let first = client.create(RecordType::Epic, &epic_fields("A")).await.unwrap();
        let second = client.create(RecordType::Epic, &epic_fields("B")).await.unwrap();

        assert_eq!(first, "e9");
        assert_eq!(second, "e9");
        assert_eq!(client.credential_acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_repeated_unauthorized_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let err = client.create(RecordType::Epic, &epic_fields("A")).await.unwrap_err();

        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_find_by_title_escapes_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/rm_epic"))
            .and(query_param("sysparm_query", "short_description=A^^B"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"sys_id": "e1", "short_description": "A^B"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/rm_epic"))
            .and(query_param("sysparm_query", "short_description=Missing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
            .mount(&server)
            .await;

        let client = client(&server, basic());

        assert_eq!(
            client.find_by_title(RecordType::Epic, "A^B").await.unwrap(),
            Some("e1".to_string())
        );
        assert_eq!(client.find_by_title(RecordType::Epic, "Missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshot_pages_through_tables() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/rm_epic"))
            .and(query_param("sysparm_query", "ORDERBYsys_id"))
            .and(query_param("sysparm_offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {"sys_id": "e1", "short_description": "Billing"},
                    {"sys_id": "e2", "short_description": "Search"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/rm_epic"))
            .and(query_param("sysparm_query", "ORDERBYsys_id"))
            .and(query_param("sysparm_offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"sys_id": "e3", "short_description": "Reports"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/rm_story"))
            .and(query_param("sysparm_query", "ORDERBYsys_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"sys_id": "s1", "short_description": "Pay invoice"}]
            })))
            .mount(&server)
            .await;

        let config = ClientConfig {
            retry: RetryPolicy::immediate(1),
            page_size: 2,
            ..ClientConfig::new(server.uri())
        };
        let client =
            TableApiClient::new(config, Arc::new(Schema::builtin().unwrap()), basic()).unwrap();

        let snapshot = client
            .fetch_snapshot(&RecordType::ALL, MatchPolicy::Exact)
            .await
            .unwrap();

        assert_eq!(snapshot.count(RecordType::Epic), 3);
        assert_eq!(snapshot.get(RecordType::Epic, "Reports"), Some("e3"));
        assert_eq!(snapshot.get(RecordType::Story, "Pay invoice"), Some("s1"));
    }

    #[tokio::test]
    async fn test_read_failure_is_read_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no access"))
            .mount(&server)
            .await;

        let client = client(&server, basic());
        let err = client
            .fetch_snapshot(&[RecordType::Epic], MatchPolicy::Exact)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RemoteError::Read {
                status: 403,
                body: "no access".to_string()
            }
        );
    }
}
