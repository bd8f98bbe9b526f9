pub mod store;
pub mod types;

pub use store::{SubscriptionStore, SubscriptionStoreError};
pub use types::{Subscription, SubscriptionMode};
