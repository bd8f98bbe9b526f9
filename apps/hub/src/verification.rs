//! Subscription intent verification.
//!
//! Before a subscription is granted or revoked the hub sends a random challenge
//! to the callback and only acts if the callback echoes it back. A request moves
//! through [`IntentState`]: received, challenge sent, then verified or rejected.
//! Rejections are terminal and silent; nobody is told.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::signing::generate_challenge;
use crate::subscription::{Subscription, SubscriptionMode, SubscriptionStore, SubscriptionStoreError};
use crate::tasks::{TaskExecutor, TaskHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub callback: String,
    pub secret: String,
    pub mode: SubscriptionMode,
    pub topic: String,
    /// Intake time in unix milliseconds; orders competing requests for the same pair.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Received,
    ChallengeSent,
    Verified,
    Rejected,
}

impl IntentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ChallengeSent => "challenge_sent",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    ChallengeMismatch,
    Transport(String),
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "callback_not_found",
            Self::ChallengeMismatch => "challenge_mismatch",
            Self::Transport(_) => "transport_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// The callback echoed the challenge. `applied` is false when the store kept
    /// a newer row (subscribe) or had nothing to delete (unsubscribe).
    Verified {
        mode: SubscriptionMode,
        applied: bool,
    },
    Rejected(RejectReason),
}

impl VerificationOutcome {
    pub fn state(&self) -> IntentState {
        match self {
            Self::Verified { .. } => IntentState::Verified,
            Self::Rejected(_) => IntentState::Rejected,
        }
    }
}

pub type VerificationResult = Result<VerificationOutcome, SubscriptionStoreError>;

#[derive(Clone)]
pub struct IntentVerifier {
    store: Arc<dyn SubscriptionStore>,
    http: reqwest::Client,
    timeout: Duration,
    tasks: TaskExecutor,
}

impl IntentVerifier {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        http: reqwest::Client,
        timeout: Duration,
        tasks: TaskExecutor,
    ) -> Self {
        Self {
            store,
            http,
            timeout,
            tasks,
        }
    }

    /// Runs [`IntentVerifier::verify`] as a detached task.
    pub fn submit(&self, request: IntentRequest) -> TaskHandle<VerificationResult> {
        let verifier = self.clone();
        self.tasks.spawn("verify_intent", async move {
            let callback = request.callback.clone();
            let topic = request.topic.clone();
            let result = verifier.verify(request).await;
            if let Err(error) = &result {
                warn!(
                    subscriber = %callback,
                    topic = %topic,
                    reason = %error,
                    "intent verified but subscription store rejected the change"
                );
            }
            result
        })
    }

    pub async fn verify(&self, request: IntentRequest) -> VerificationResult {
        debug!(
            subscriber = %request.callback,
            topic = %request.topic,
            mode = %request.mode,
            state = IntentState::Received.as_str(),
            "intent received"
        );

        let challenge = generate_challenge();
        if let Some(reason) = self.challenge_callback(&request, &challenge).await {
            info!(
                subscriber = %request.callback,
                topic = %request.topic,
                mode = %request.mode,
                state = IntentState::Rejected.as_str(),
                reason = reason.as_str(),
                "intent verification failed"
            );
            return Ok(VerificationOutcome::Rejected(reason));
        }

        let applied = match request.mode {
            SubscriptionMode::Unsubscribe => {
                let removed = self
                    .store
                    .remove(&request.callback, &request.topic)
                    .await?;
                info!(
                    subscriber = %request.callback,
                    topic = %request.topic,
                    removed,
                    "unsubscribed"
                );
                removed
            }
            SubscriptionMode::Subscribe => {
                let applied = self
                    .store
                    .put(Subscription::new(
                        request.callback.clone(),
                        request.secret.clone(),
                        request.topic.clone(),
                        request.timestamp,
                    ))
                    .await?;
                if applied {
                    info!(subscriber = %request.callback, topic = %request.topic, "(re)subscribed");
                } else {
                    debug!(
                        subscriber = %request.callback,
                        topic = %request.topic,
                        timestamp = request.timestamp,
                        "stale subscribe ignored, a newer request already landed"
                    );
                }
                applied
            }
        };

        Ok(VerificationOutcome::Verified {
            mode: request.mode,
            applied,
        })
    }

    /// Sends the challenge GET; `None` means the callback echoed it correctly.
    async fn challenge_callback(
        &self,
        request: &IntentRequest,
        challenge: &str,
    ) -> Option<RejectReason> {
        let response = self
            .http
            .get(request.callback.as_str())
            .query(&[
                ("hub.mode", request.mode.as_str()),
                ("hub.topic", request.topic.as_str()),
                ("hub.challenge", challenge),
            ])
            .timeout(self.timeout)
            .send()
            .await;
        debug!(
            subscriber = %request.callback,
            topic = %request.topic,
            state = IntentState::ChallengeSent.as_str(),
            "challenge sent"
        );

        let response = match response {
            Ok(response) => response,
            Err(error) => return Some(RejectReason::Transport(error.to_string())),
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Some(RejectReason::NotFound);
        }
        match response.bytes().await {
            Ok(body) if body.as_ref() == challenge.as_bytes() => None,
            Ok(_) => Some(RejectReason::ChallengeMismatch),
            Err(error) => Some(RejectReason::Transport(error.to_string())),
        }
    }

    /// Tells a callback its request was refused at intake, as a detached task.
    pub fn submit_denial(&self, callback: String, topic: String, reason: String) -> TaskHandle<()> {
        let http = self.http.clone();
        let timeout = self.timeout;
        self.tasks.spawn("notify_denial", async move {
            let result = http
                .get(callback.as_str())
                .query(&[
                    ("hub.mode", "denied"),
                    ("hub.topic", topic.as_str()),
                    ("hub.reason", reason.as_str()),
                ])
                .timeout(timeout)
                .send()
                .await;
            if let Err(error) = result {
                debug!(subscriber = %callback, reason = %error, "denial notice not delivered");
            }
        })
    }
}
