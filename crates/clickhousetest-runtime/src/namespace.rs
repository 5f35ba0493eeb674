//! Per-test database namespaces.
//!
//! A namespace is a uniquely named database inside the instance. Each one is
//! created through the control connection and reached through its own,
//! independent client. Namespaces are never reused and never dropped here;
//! they disappear with the instance's data directory.

use clickhousetest_core::{
    ClientError, ConnectionOptions, DatabaseClient, DatabaseConnector, DatabaseNamer, Error,
    Phase, Result, Row, quote_identifier,
};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Create a fresh database through the control connection and return its name.
///
/// A name collision (server code 82) is retried with a new name up to
/// `collision_retries` times. Any other rejection fails immediately with
/// [`Error::Query`].
pub async fn create_database(
    control: &dyn DatabaseClient,
    namer: &dyn DatabaseNamer,
    collision_retries: u32,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut attempt = 0;
    loop {
        let name = namer.next_name();
        let statement = format!("CREATE DATABASE {}", quote_identifier(&name));

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled { phase: Phase::Namespace }),
            outcome = control.execute(&statement) => outcome,
        };

        match outcome {
            Ok(()) => {
                debug!(database = %name, "Created database");
                return Ok(name);
            }
            Err(source) if source.is_database_exists() && attempt < collision_retries => {
                attempt += 1;
                warn!(database = %name, attempt = attempt, "Database name collision, retrying with a new name");
            }
            Err(source) => {
                return Err(Error::Query {
                    phase: Phase::Namespace,
                    statement,
                    source,
                });
            }
        }
    }
}

/// Open a client scoped to `name` and verify it with a ping.
///
/// The new connection is closed if the ping fails.
pub async fn open_database(
    connector: &dyn DatabaseConnector,
    base: &ConnectionOptions,
    name: &str,
    cancel: &CancellationToken,
) -> Result<IsolatedDatabase> {
    let options = base.with_database(name);
    let target = format!("{}/{name}", options.address());
    let connection_error = |source: ClientError| Error::Connection {
        phase: Phase::Namespace,
        target: target.clone(),
        source,
    };

    let attempt = async {
        let client = connector.connect(&options).await.map_err(connection_error)?;
        if let Err(e) = client.ping().await {
            if let Err(close_err) = client.close().await {
                debug!(database = %name, error = %close_err, "Failed to close rejected connection");
            }
            return Err(connection_error(e));
        }
        Ok(client)
    };

    let client = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(Error::Cancelled { phase: Phase::Namespace }),
        client = attempt => client?,
    };

    Ok(IsolatedDatabase {
        name: name.to_string(),
        instance_address: base.address(),
        client,
    })
}

/// Create a fresh database and open a client scoped to it.
pub async fn new_isolated_database(
    control: &dyn DatabaseClient,
    connector: &dyn DatabaseConnector,
    base: &ConnectionOptions,
    namer: &dyn DatabaseNamer,
    collision_retries: u32,
    cancel: &CancellationToken,
) -> Result<IsolatedDatabase> {
    let name = create_database(control, namer, collision_retries, cancel).await?;
    open_database(connector, base, &name, cancel).await
}

/// A per-test database and the client scoped to it.
///
/// Queries pass straight through to the underlying client.
pub struct IsolatedDatabase {
    name: String,
    instance_address: String,
    client: Arc<dyn DatabaseClient>,
}

impl IsolatedDatabase {
    /// Generated database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the instance this database lives in.
    pub fn instance_address(&self) -> &str {
        &self.instance_address
    }

    /// The underlying client, for callers that need to share it.
    pub fn client(&self) -> Arc<dyn DatabaseClient> {
        Arc::clone(&self.client)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.client.ping().await
    }

    pub async fn execute(&self, sql: &str) -> Result<(), ClientError> {
        self.client.execute(sql).await
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Row>, ClientError> {
        self.client.query(sql).await
    }

    /// Name the server reports for this connection's current database.
    pub async fn current_database(&self) -> Result<String, ClientError> {
        let rows = self
            .client
            .query("SELECT currentDatabase() AS db_name")
            .await?;
        rows.first()
            .and_then(|row| row.get("db_name"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| ClientError::Decode("missing db_name column".to_string()))
    }

    /// Close the client. The database itself is left in place.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.client.close().await
    }
}

impl fmt::Debug for IsolatedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedDatabase")
            .field("name", &self.name)
            .field("instance_address", &self.instance_address)
            .finish_non_exhaustive()
    }
}
