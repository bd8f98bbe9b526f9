use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS hub_subscriptions (
    id BIGSERIAL PRIMARY KEY,
    subscriber VARCHAR(2048) NOT NULL,
    secret VARCHAR(200) NOT NULL DEFAULT '',
    topic VARCHAR(2048) NOT NULL,
    timestamp BIGINT NOT NULL,
    delivery_failures INTEGER NOT NULL DEFAULT 0,
    UNIQUE (subscriber, topic)
);
CREATE INDEX IF NOT EXISTS hub_subscriptions_topic_idx ON hub_subscriptions (topic);
"#;

pub const DEFAULT_DB_TIMEOUT_MS: u64 = 5_000;

/// Postgres handle shared by the store.
///
/// A dropped connection is replaced on the next call to [`HubDb::client`], so a
/// database restart surfaces as failed requests rather than a dead process.
/// Connecting is bounded by `timeout`; callers bound their queries with
/// [`HubDb::timeout`] as well.
#[derive(Clone)]
pub struct HubDb {
    database_url: Arc<str>,
    client: Arc<Mutex<Client>>,
    timeout: Duration,
}

impl HubDb {
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self> {
        let client = open_client(database_url, timeout).await?;
        Ok(Self {
            database_url: Arc::from(database_url),
            client: Arc::new(Mutex::new(client)),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Locks the shared client, reconnecting first if the connection has closed.
    pub async fn client(&self) -> Result<MutexGuard<'_, Client>> {
        let mut client = self.client.lock().await;
        if client.is_closed() {
            tracing::warn!("hub postgres connection closed, reconnecting");
            *client = open_client(&self.database_url, self.timeout).await?;
        }
        Ok(client)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("provision hub_subscriptions schema")?;
        tracing::info!("hub schema ready");
        Ok(())
    }
}

/// Runs `future` with a deadline; `None` means it did not finish in time.
pub async fn within<F: Future>(timeout: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, future).await.ok()
}

async fn open_client(database_url: &str, timeout: Duration) -> Result<Client> {
    let (client, connection) = within(timeout, tokio_postgres::connect(database_url, NoTls))
        .await
        .ok_or_else(|| anyhow!("connect to postgres timed out after {}ms", timeout.as_millis()))?
        .context("connect to postgres")?;

    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(reason = %error, "hub postgres connection error");
        }
    });

    Ok(client)
}
