//! ClickHouse HTTP interface client.
//!
//! Statements are POSTed to `/?database=<db>` with the SQL as the body and
//! credentials in the `X-ClickHouse-User` / `X-ClickHouse-Key` headers.
//! Queries are returned as `JSONEachRow`. Server exceptions carry their code
//! in the `X-ClickHouse-Exception-Code` header (or the `Code: N.` body prefix
//! on older servers).

use async_trait::async_trait;
use clickhousetest_core::{
    ClientError, ConnectionOptions, DatabaseClient, DatabaseConnector, Row,
};
use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

const USER_HEADER: &str = "X-ClickHouse-User";
const KEY_HEADER: &str = "X-ClickHouse-Key";
const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

/// Slack added to the server-side execution limit for the client-side timeout.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Opens [`HttpClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

#[async_trait]
impl DatabaseConnector for HttpConnector {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn DatabaseClient>, ClientError> {
        Ok(Arc::new(HttpClient::new(options)?))
    }
}

/// A connection to one database over the HTTP interface.
///
/// Opening is lazy: nothing is sent until the first statement or ping.
/// `reqwest::Client` pools connections internally and is safe to share.
#[derive(Debug)]
pub struct HttpClient {
    http: Client,
    base_url: String,
    database: String,
    username: String,
    password: String,
    max_execution_secs: u64,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl HttpClient {
    /// Build a client from connection options.
    pub fn new(options: &ConnectionOptions) -> Result<Self, ClientError> {
        let tunables = &options.tunables;
        let request_timeout = tunables.execution_timeout.saturating_add(REQUEST_TIMEOUT_SLACK);

        let http = Client::builder()
            .connect_timeout(tunables.dial_timeout)
            .timeout(request_timeout)
            .pool_max_idle_per_host(tunables.max_idle_conns)
            .pool_idle_timeout(tunables.conn_max_lifetime)
            .build()
            .map_err(|e| ClientError::Transport(format!("build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: options.base_url(),
            database: options.auth.database.clone(),
            username: options.auth.username.clone(),
            password: options.auth.password.clone(),
            max_execution_secs: tunables.execution_timeout.as_secs().max(1),
            request_timeout,
            closed: AtomicBool::new(false),
        })
    }

    /// Database this client is scoped to.
    pub fn database(&self) -> &str {
        &self.database
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// POST a statement and return the response body.
    async fn send(&self, sql: String) -> Result<String, ClientError> {
        self.ensure_open()?;

        let max_execution = self.max_execution_secs.to_string();
        let response = self
            .http
            .post(&self.base_url)
            .query(&[
                ("database", self.database.as_str()),
                ("max_execution_time", max_execution.as_str()),
            ])
            .header(USER_HEADER, &self.username)
            .header(KEY_HEADER, &self.password)
            .body(sql)
            .send()
            .await
            .map_err(|e| self.map_transport(&e))?;

        let status = response.status();
        let header_code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let body = response.text().await.map_err(|e| self.map_transport(&e))?;

        if !status.is_success() {
            debug!(status = %status, database = %self.database, "Statement rejected");
            return Err(ClientError::Server {
                code: header_code.or_else(|| parse_exception_code(&body)),
                message: body.trim().to_string(),
            });
        }

        Ok(body)
    }

    fn map_transport(&self, e: &reqwest::Error) -> ClientError {
        if e.is_timeout() {
            ClientError::Timeout(self.request_timeout)
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl DatabaseClient for HttpClient {
    async fn ping(&self) -> Result<(), ClientError> {
        // SELECT rather than /ping so the database and credentials are checked too
        self.send("SELECT 1".to_string()).await.map(|_| ())
    }

    async fn execute(&self, sql: &str) -> Result<(), ClientError> {
        self.send(sql.to_string()).await.map(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, ClientError> {
        let statement = format!("{} FORMAT JSONEachRow", sql.trim().trim_end_matches(';'));
        let body = self.send(statement).await?;
        parse_json_each_row(&body)
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        debug!(database = %self.database, "Closed HTTP client");
        Ok(())
    }
}

/// Parse a `JSONEachRow` body: one JSON object per non-empty line.
fn parse_json_each_row(body: &str) -> Result<Vec<Row>, ClientError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Row>(line)
                .map_err(|e| ClientError::Decode(format!("{e}: {line}")))
        })
        .collect()
}

/// Extract `N` from a `Code: N. DB::Exception: ...` body.
fn parse_exception_code(body: &str) -> Option<u32> {
    let rest = body.trim_start().strip_prefix("Code:")?.trim_start();
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
