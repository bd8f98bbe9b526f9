use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Longest `hub.secret` the hub accepts, in bytes.
pub const MAX_SECRET_BYTES: usize = 200;

/// One verified (subscriber, topic) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Callback URL the hub pushes to.
    pub subscriber: String,
    /// HMAC key supplied at subscription time; empty when none was given.
    pub secret: String,
    pub topic: String,
    /// Intake time of the request that produced this row, in unix milliseconds.
    pub timestamp: i64,
    /// Consecutive failed pushes since the last successful one.
    pub delivery_failures: u32,
}

impl Subscription {
    pub fn new(
        subscriber: impl Into<String>,
        secret: impl Into<String>,
        topic: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            subscriber: subscriber.into(),
            secret: secret.into(),
            topic: topic.into(),
            timestamp,
            delivery_failures: 0,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.subscriber.clone(), self.topic.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported hub.mode: {0}")]
pub struct UnknownModeError(pub String);

impl FromStr for SubscriptionMode {
    type Err = UnknownModeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "subscribe" => Ok(Self::Subscribe),
            "unsubscribe" => Ok(Self::Unsubscribe),
            other => Err(UnknownModeError(other.to_string())),
        }
    }
}
