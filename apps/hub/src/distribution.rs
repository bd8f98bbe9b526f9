//! Fan-out of published content to verified subscribers.
//!
//! Each subscriber of a topic gets its own delivery task; a semaphore caps how
//! many pushes are in flight at once. A push succeeds only on `200 OK`. Any other
//! answer, a transport error or a timeout counts as a failure, and once a
//! subscription reaches `max_delivery_failures` consecutive failures it is
//! removed. There is no retry.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::signing::{SIGNATURE_HEADER, signature_header_value};
use crate::subscription::{Subscription, SubscriptionStore, SubscriptionStoreError};
use crate::tasks::{TaskError, TaskExecutor, TaskHandle};

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Serialize)]
struct DistributionPayload<'a> {
    topic: &'a str,
    content: &'a str,
}

/// Wire body for one publish: `{"topic":…,"content":…}`.
pub fn encode_payload(topic: &str, content: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&DistributionPayload { topic, content })
}

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error(transparent)]
    Store(#[from] SubscriptionStoreError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("encode distribution payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    Status(u16),
    Transport(String),
    Signing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered {
        subscriber: String,
    },
    Failed {
        subscriber: String,
        reason: DeliveryFailure,
        consecutive_failures: u32,
        evicted: bool,
    },
}

impl DeliveryOutcome {
    pub fn subscriber(&self) -> &str {
        match self {
            Self::Delivered { subscriber } | Self::Failed { subscriber, .. } => subscriber,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

pub type DeliveryResult = Result<DeliveryOutcome, SubscriptionStoreError>;

/// One publish event fanned out to a topic snapshot.
pub struct Dispatch {
    pub topic: String,
    pub subscribers: usize,
    handles: Vec<TaskHandle<DeliveryResult>>,
}

impl Dispatch {
    /// Waits for every delivery of this publish.
    pub async fn wait(self) -> Result<Vec<DeliveryOutcome>, DistributionError> {
        let results = futures::future::join_all(self.handles.into_iter().map(TaskHandle::wait)).await;
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result??);
        }
        Ok(outcomes)
    }
}

#[derive(Clone)]
pub struct ContentDistributor {
    store: Arc<dyn SubscriptionStore>,
    http: reqwest::Client,
    timeout: Duration,
    limiter: Arc<Semaphore>,
    max_delivery_failures: u32,
    tasks: TaskExecutor,
}

impl ContentDistributor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        http: reqwest::Client,
        timeout: Duration,
        max_concurrent_deliveries: usize,
        max_delivery_failures: u32,
        tasks: TaskExecutor,
    ) -> Self {
        Self {
            store,
            http,
            timeout,
            limiter: Arc::new(Semaphore::new(max_concurrent_deliveries.max(1))),
            max_delivery_failures: max_delivery_failures.max(1),
            tasks,
        }
    }

    /// Snapshots the topic's subscribers and starts one detached delivery per
    /// subscriber. Only the snapshot read can fail synchronously.
    pub async fn distribute(
        &self,
        topic: &str,
        content: &str,
    ) -> Result<Dispatch, DistributionError> {
        let body = Bytes::from(encode_payload(topic, content)?);
        let subscriptions = self.store.list_by_topic(topic).await?;
        debug!(topic, subscribers = subscriptions.len(), "distributing content");

        let handles = subscriptions
            .into_iter()
            .map(|subscription| {
                let distributor = self.clone();
                let body = body.clone();
                self.tasks.spawn("deliver_content", async move {
                    distributor.deliver(subscription, body).await
                })
            })
            .collect::<Vec<_>>();

        Ok(Dispatch {
            topic: topic.to_string(),
            subscribers: handles.len(),
            handles,
        })
    }

    async fn deliver(&self, subscription: Subscription, body: Bytes) -> DeliveryResult {
        // The semaphore is never closed; a failed acquire just means no limit.
        let _permit = self.limiter.acquire().await.ok();

        let failure = match signature_header_value(&subscription.secret, &body) {
            Ok(signature) => {
                let response = self
                    .http
                    .post(subscription.subscriber.as_str())
                    .header(SIGNATURE_HEADER, signature)
                    .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_JSON)
                    .body(body)
                    .timeout(self.timeout)
                    .send()
                    .await;
                match response {
                    Ok(response) if response.status() == reqwest::StatusCode::OK => None,
                    Ok(response) => Some(DeliveryFailure::Status(response.status().as_u16())),
                    Err(error) => Some(DeliveryFailure::Transport(error.to_string())),
                }
            }
            // Unsigned content is never pushed.
            Err(error) => Some(DeliveryFailure::Signing(error.to_string())),
        };

        let Some(reason) = failure else {
            if subscription.delivery_failures > 0 {
                self.store
                    .reset_delivery_failures(&subscription.subscriber, &subscription.topic)
                    .await?;
            }
            return Ok(DeliveryOutcome::Delivered {
                subscriber: subscription.subscriber,
            });
        };

        let consecutive_failures = self
            .store
            .record_delivery_failure(&subscription.subscriber, &subscription.topic)
            .await?
            .unwrap_or(0);
        // Re-checked inside the store: a subscribe verified since the increment
        // has reset the counter and keeps its row.
        let evicted = consecutive_failures >= self.max_delivery_failures
            && self
                .store
                .remove_if_failing(
                    &subscription.subscriber,
                    &subscription.topic,
                    self.max_delivery_failures,
                )
                .await?;

        warn!(
            subscriber = %subscription.subscriber,
            topic = %subscription.topic,
            reason = ?reason,
            consecutive_failures,
            evicted,
            "content delivery failed"
        );

        Ok(DeliveryOutcome::Failed {
            subscriber: subscription.subscriber,
            reason,
            consecutive_failures,
            evicted,
        })
    }
}
