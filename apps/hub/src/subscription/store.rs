use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::db::{HubDb, within};
use crate::subscription::types::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionStoreError {
    #[error("subscription store unavailable: {0}")]
    Unavailable(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Keyed collection of subscriptions, unique per (subscriber, topic).
///
/// Every method is atomic with respect to concurrent callers.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Upserts `subscription`. An existing row is only replaced when the incoming
    /// timestamp is strictly newer; returns whether the write was applied.
    async fn put(&self, subscription: Subscription) -> Result<bool, SubscriptionStoreError>;

    /// Deletes the row if present; returns whether a row was removed.
    async fn remove(&self, subscriber: &str, topic: &str) -> Result<bool, SubscriptionStoreError>;

    /// Deletes the row only if its failure counter is still at or above
    /// `threshold`, checked and deleted in one step. A row refreshed by a newer
    /// subscribe in the meantime survives.
    async fn remove_if_failing(
        &self,
        subscriber: &str,
        topic: &str,
        threshold: u32,
    ) -> Result<bool, SubscriptionStoreError>;

    async fn list_by_topic(&self, topic: &str)
    -> Result<Vec<Subscription>, SubscriptionStoreError>;

    async fn get(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<Subscription>, SubscriptionStoreError>;

    /// Increments the consecutive failure counter, returning the new value, or
    /// `None` when the row no longer exists.
    async fn record_delivery_failure(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<u32>, SubscriptionStoreError>;

    async fn reset_delivery_failures(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<(), SubscriptionStoreError>;

    async fn ping(&self) -> Result<(), SubscriptionStoreError>;

    fn driver_name(&self) -> &'static str;
}

pub fn memory() -> Arc<dyn SubscriptionStore> {
    Arc::new(MemorySubscriptionStore::default())
}

pub fn postgres(db: Arc<HubDb>) -> Arc<dyn SubscriptionStore> {
    Arc::new(PostgresSubscriptionStore { db })
}

#[derive(Default)]
struct MemorySubscriptionStore {
    rows: Mutex<HashMap<(String, String), Subscription>>,
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn put(&self, subscription: Subscription) -> Result<bool, SubscriptionStoreError> {
        let mut rows = self.rows.lock().await;
        let key = subscription.key();
        if rows
            .get(&key)
            .is_some_and(|existing| subscription.timestamp <= existing.timestamp)
        {
            return Ok(false);
        }
        rows.insert(
            key,
            Subscription {
                delivery_failures: 0,
                ..subscription
            },
        );
        Ok(true)
    }

    async fn remove(&self, subscriber: &str, topic: &str) -> Result<bool, SubscriptionStoreError> {
        let mut rows = self.rows.lock().await;
        Ok(rows
            .remove(&(subscriber.to_string(), topic.to_string()))
            .is_some())
    }

    async fn remove_if_failing(
        &self,
        subscriber: &str,
        topic: &str,
        threshold: u32,
    ) -> Result<bool, SubscriptionStoreError> {
        let mut rows = self.rows.lock().await;
        let key = (subscriber.to_string(), topic.to_string());
        if rows
            .get(&key)
            .is_some_and(|row| row.delivery_failures >= threshold)
        {
            rows.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn list_by_topic(
        &self,
        topic: &str,
    ) -> Result<Vec<Subscription>, SubscriptionStoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|row| row.topic == topic)
            .cloned()
            .collect())
    }

    async fn get(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<Subscription>, SubscriptionStoreError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(subscriber.to_string(), topic.to_string()))
            .cloned())
    }

    async fn record_delivery_failure(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<u32>, SubscriptionStoreError> {
        let mut rows = self.rows.lock().await;
        Ok(rows
            .get_mut(&(subscriber.to_string(), topic.to_string()))
            .map(|row| {
                row.delivery_failures = row.delivery_failures.saturating_add(1);
                row.delivery_failures
            }))
    }

    async fn reset_delivery_failures(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<(), SubscriptionStoreError> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&(subscriber.to_string(), topic.to_string())) {
            row.delivery_failures = 0;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), SubscriptionStoreError> {
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "memory"
    }
}

struct PostgresSubscriptionStore {
    db: Arc<HubDb>,
}

fn unavailable(error: anyhow::Error) -> SubscriptionStoreError {
    SubscriptionStoreError::Unavailable(format!("{error:#}"))
}

fn db_error(error: tokio_postgres::Error) -> SubscriptionStoreError {
    if error.is_closed() {
        SubscriptionStoreError::Unavailable(error.to_string())
    } else {
        SubscriptionStoreError::Db(error.to_string())
    }
}

impl PostgresSubscriptionStore {
    /// Bounds lock acquisition, reconnect and query together, so a silent
    /// database turns into `Unavailable` instead of a stuck caller.
    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        future: F,
    ) -> Result<T, SubscriptionStoreError>
    where
        F: Future<Output = Result<T, SubscriptionStoreError>>,
    {
        let timeout = self.db.timeout();
        within(timeout, future).await.unwrap_or_else(|| {
            Err(SubscriptionStoreError::Unavailable(format!(
                "{operation} timed out after {}ms",
                timeout.as_millis()
            )))
        })
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn put(&self, subscription: Subscription) -> Result<bool, SubscriptionStoreError> {
        self.bounded("put", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let applied = client
                .execute(
                    r#"
                    INSERT INTO hub_subscriptions (subscriber, secret, topic, timestamp, delivery_failures)
                    VALUES ($1, $2, $3, $4, 0)
                    ON CONFLICT (subscriber, topic) DO UPDATE SET
                        secret = EXCLUDED.secret,
                        timestamp = EXCLUDED.timestamp,
                        delivery_failures = 0
                    WHERE EXCLUDED.timestamp > hub_subscriptions.timestamp
                    "#,
                    &[
                        &subscription.subscriber,
                        &subscription.secret,
                        &subscription.topic,
                        &subscription.timestamp,
                    ],
                )
                .await
                .map_err(db_error)?;
            Ok(applied > 0)
        })
        .await
    }

    async fn remove(&self, subscriber: &str, topic: &str) -> Result<bool, SubscriptionStoreError> {
        self.bounded("remove", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let removed = client
                .execute(
                    "DELETE FROM hub_subscriptions WHERE subscriber = $1 AND topic = $2",
                    &[&subscriber, &topic],
                )
                .await
                .map_err(db_error)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn remove_if_failing(
        &self,
        subscriber: &str,
        topic: &str,
        threshold: u32,
    ) -> Result<bool, SubscriptionStoreError> {
        let threshold = i32::try_from(threshold).unwrap_or(i32::MAX);
        self.bounded("remove_if_failing", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let removed = client
                .execute(
                    r#"
                    DELETE FROM hub_subscriptions
                     WHERE subscriber = $1 AND topic = $2 AND delivery_failures >= $3
                    "#,
                    &[&subscriber, &topic, &threshold],
                )
                .await
                .map_err(db_error)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_by_topic(
        &self,
        topic: &str,
    ) -> Result<Vec<Subscription>, SubscriptionStoreError> {
        self.bounded("list_by_topic", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let rows = client
                .query(
                    r#"
                    SELECT subscriber, secret, topic, timestamp, delivery_failures
                      FROM hub_subscriptions
                     WHERE topic = $1
                    "#,
                    &[&topic],
                )
                .await
                .map_err(db_error)?;
            rows.iter()
                .map(|row| map_subscription_row(row).map_err(SubscriptionStoreError::Db))
                .collect()
        })
        .await
    }

    async fn get(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<Subscription>, SubscriptionStoreError> {
        self.bounded("get", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let row = client
                .query_opt(
                    r#"
                    SELECT subscriber, secret, topic, timestamp, delivery_failures
                      FROM hub_subscriptions
                     WHERE subscriber = $1 AND topic = $2
                    "#,
                    &[&subscriber, &topic],
                )
                .await
                .map_err(db_error)?;
            row.as_ref()
                .map(map_subscription_row)
                .transpose()
                .map_err(SubscriptionStoreError::Db)
        })
        .await
    }

    async fn record_delivery_failure(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<Option<u32>, SubscriptionStoreError> {
        self.bounded("record_delivery_failure", async {
            let client = self.db.client().await.map_err(unavailable)?;
            let row = client
                .query_opt(
                    r#"
                    UPDATE hub_subscriptions
                       SET delivery_failures = delivery_failures + 1
                     WHERE subscriber = $1 AND topic = $2
                 RETURNING delivery_failures
                    "#,
                    &[&subscriber, &topic],
                )
                .await
                .map_err(db_error)?;
            let Some(row) = row else {
                return Ok(None);
            };
            let failures: i32 = row
                .try_get("delivery_failures")
                .map_err(|error| SubscriptionStoreError::Db(error.to_string()))?;
            Ok(Some(u32::try_from(failures).unwrap_or_default()))
        })
        .await
    }

    async fn reset_delivery_failures(
        &self,
        subscriber: &str,
        topic: &str,
    ) -> Result<(), SubscriptionStoreError> {
        self.bounded("reset_delivery_failures", async {
            let client = self.db.client().await.map_err(unavailable)?;
            client
                .execute(
                    r#"
                    UPDATE hub_subscriptions
                       SET delivery_failures = 0
                     WHERE subscriber = $1 AND topic = $2 AND delivery_failures <> 0
                    "#,
                    &[&subscriber, &topic],
                )
                .await
                .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), SubscriptionStoreError> {
        self.bounded("ping", async {
            let client = self.db.client().await.map_err(unavailable)?;
            client.simple_query("SELECT 1").await.map_err(db_error)?;
            Ok(())
        })
        .await
    }

    fn driver_name(&self) -> &'static str {
        "postgres"
    }
}

fn map_subscription_row(row: &tokio_postgres::Row) -> Result<Subscription, String> {
    let delivery_failures: i32 = row
        .try_get("delivery_failures")
        .map_err(|e| e.to_string())?;
    Ok(Subscription {
        subscriber: row.try_get("subscriber").map_err(|e| e.to_string())?,
        secret: row.try_get("secret").map_err(|e| e.to_string())?,
        topic: row.try_get("topic").map_err(|e| e.to_string())?,
        timestamp: row.try_get("timestamp").map_err(|e| e.to_string())?,
        delivery_failures: u32::try_from(delivery_failures).unwrap_or_default(),
    })
}
