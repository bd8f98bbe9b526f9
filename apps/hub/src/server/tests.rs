use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::{
    assemble_state,
    config::Config,
    content::{ContentSource, ContentSourceError},
    subscription::{Subscription, SubscriptionStore, SubscriptionStoreError, store},
    test_support::StubSubscriber,
};

struct FixedContent(&'static str);

#[async_trait]
impl ContentSource for FixedContent {
    async fn fetch(&self) -> Result<String, ContentSourceError> {
        Ok(self.0.to_string())
    }
}

/// A store whose backend is gone.
struct UnavailableStore;

#[async_trait]
impl SubscriptionStore for UnavailableStore {
    async fn put(&self, _subscription: Subscription) -> Result<bool, SubscriptionStoreError> {
        Err(down())
    }

    async fn remove(&self, _subscriber: &str, _topic: &str) -> Result<bool, SubscriptionStoreError> {
        Err(down())
    }

    async fn remove_if_failing(
        &self,
        _subscriber: &str,
        _topic: &str,
        _threshold: u32,
    ) -> Result<bool, SubscriptionStoreError> {
        Err(down())
    }

    async fn list_by_topic(
        &self,
        _topic: &str,
    ) -> Result<Vec<Subscription>, SubscriptionStoreError> {
        Err(down())
    }

    async fn get(
        &self,
        _subscriber: &str,
        _topic: &str,
    ) -> Result<Option<Subscription>, SubscriptionStoreError> {
        Err(down())
    }

    async fn record_delivery_failure(
        &self,
        _subscriber: &str,
        _topic: &str,
    ) -> Result<Option<u32>, SubscriptionStoreError> {
        Err(down())
    }

    async fn reset_delivery_failures(
        &self,
        _subscriber: &str,
        _topic: &str,
    ) -> Result<(), SubscriptionStoreError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), SubscriptionStoreError> {
        Err(down())
    }

    fn driver_name(&self) -> &'static str {
        "unavailable"
    }
}

fn down() -> SubscriptionStoreError {
    SubscriptionStoreError::Unavailable("connection refused".to_string())
}

const PUBLISH_TOKEN: &str = "test-publish-token";

fn test_config() -> Config {
    Config {
        publish_token: Some(PUBLISH_TOKEN.to_string()),
        ..Config::local()
    }
}

fn test_state(store: Arc<dyn SubscriptionStore>) -> AppState {
    test_state_with(test_config(), store)
}

fn test_state_with(config: Config, store: Arc<dyn SubscriptionStore>) -> AppState {
    assemble_state(
        config,
        store,
        Arc::new(FixedContent("Always double check the lid.")),
        reqwest::Client::new(),
    )
}

fn form_request(body: String) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))?)
}

fn publish_request(topic: &str, content: &str) -> Result<Request<Body>> {
    publish_request_with_auth(topic, content, Some(&format!("Bearer {PUBLISH_TOKEN}")))
}

fn publish_request_with_auth(
    topic: &str,
    content: &str,
    authorization: Option<&str>,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/publish")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(authorization) = authorization {
        builder = builder.header(header::AUTHORIZATION, authorization);
    }
    Ok(builder
        .body(Body::from(serde_json::to_vec(&serde_json::json!({
            "topic": topic,
            "content": content,
        }))?))?)
}

fn get_request(uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder().uri(uri).body(Body::empty())?)
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

async fn send(app: &Router, request: Request<Body>) -> Result<axum::response::Response> {
    Ok(app.clone().oneshot(request).await?)
}

#[tokio::test]
async fn intake_without_topic_is_rejected_before_any_verification() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    let state = test_state(store.clone());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(
        &app,
        form_request(format!(
            "hub.mode=subscribe&hub.callback={}",
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await?;
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["message"], "hub.topic is required");

    tasks.wait_idle().await;
    let verifications = subscriber.verifications().await;
    assert_eq!(verifications.len(), 1);
    assert_eq!(
        verifications[0].get("hub.mode").map(String::as_str),
        Some("denied")
    );
    assert!(!verifications[0].contains_key("hub.challenge"));
    assert!(store.list_by_topic("").await?.is_empty());
    assert!(store.get(&subscriber.url, "").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn intake_without_callback_dispatches_no_task_at_all() -> Result<()> {
    let state = test_state(store::memory());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(
        &app,
        form_request("hub.mode=subscribe&hub.topic=x".to_string())?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(tasks.spawned_total(), 0);

    let response = send(
        &app,
        form_request("hub.mode=subscribe&hub.topic=x&hub.callback=ftp%3A%2F%2Fa".to_string())?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(tasks.spawned_total(), 0);
    Ok(())
}

#[tokio::test]
async fn valid_subscribe_is_accepted_and_lands_after_verification() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    let state = test_state(store.clone());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(
        &app,
        form_request(format!(
            "hub.mode=subscribe&hub.topic=x&hub.secret=k&hub.callback={}",
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = response_json(response).await?;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["mode"], "subscribe");
    assert_eq!(body["topic"], "x");

    tasks.wait_idle().await;
    let row = store
        .get(&subscriber.url, "x")
        .await?
        .ok_or_else(|| anyhow!("subscription missing after verification"))?;
    assert_eq!(row.secret, "k");
    assert!(row.timestamp > 0);
    Ok(())
}

#[tokio::test]
async fn unknown_mode_and_oversized_secret_are_rejected() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    let state = test_state(store.clone());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(
        &app,
        form_request(format!(
            "hub.mode=publish&hub.topic=x&hub.callback={}",
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        form_request(format!(
            "hub.mode=subscribe&hub.topic=x&hub.secret={}&hub.callback={}",
            "s".repeat(201),
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    tasks.wait_idle().await;
    assert!(
        subscriber
            .verifications()
            .await
            .iter()
            .all(|query| query.get("hub.mode").map(String::as_str) == Some("denied"))
    );
    assert!(store.list_by_topic("x").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn publish_evicts_failing_subscriber() -> Result<()> {
    let healthy = StubSubscriber::echoing().await?;
    let failing = StubSubscriber::spawn(
        crate::test_support::VerifyBehavior::Echo(StatusCode::OK),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .await?;
    let store = store::memory();
    store
        .put(Subscription::new(healthy.url.clone(), "", "x", 1))
        .await?;
    store
        .put(Subscription::new(failing.url.clone(), "", "x", 1))
        .await?;
    let state = test_state(store.clone());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(&app, publish_request("x", "hello")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    assert_eq!(body["topic"], "x");
    assert_eq!(body["content"], "hello");
    assert_eq!(body["subscribers"], 2);

    tasks.wait_idle().await;
    let remaining = store.list_by_topic("x").await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].subscriber, healthy.url);
    assert_eq!(healthy.pushes().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn publish_trigger_broadcasts_fetched_content_on_default_topic() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    store
        .put(Subscription::new(subscriber.url.clone(), "", "advice", 1))
        .await?;
    let state = test_state(store);
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(&app, get_request("/publish")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await?;
    assert_eq!(body["topic"], "advice");
    assert_eq!(body["content"], "Always double check the lid.");
    assert_eq!(body["subscribers"], 1);

    tasks.wait_idle().await;
    let pushes = subscriber.pushes().await;
    assert_eq!(pushes.len(), 1);
    let payload: Value = serde_json::from_slice(&pushes[0].body)?;
    assert_eq!(payload["content"], "Always double check the lid.");
    Ok(())
}

#[tokio::test]
async fn publish_with_blank_topic_is_rejected() -> Result<()> {
    let app = build_router(test_state(store::memory()));
    let response = send(&app, publish_request("  ", "hello")?).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn health_and_readiness_endpoints_are_available() -> Result<()> {
    let app = build_router(test_state(store::memory()));

    let health = send(&app, get_request("/healthz")?).await?;
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));
    let body = response_json(health).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store_driver"], "memory");

    let readiness = send(&app, get_request("/readyz")?).await?;
    assert_eq!(readiness.status(), StatusCode::OK);
    assert_eq!(response_json(readiness).await?["status"], "ready");
    Ok(())
}

#[tokio::test]
async fn unavailable_store_answers_service_unavailable() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let state = test_state(Arc::new(UnavailableStore));
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let intake = send(
        &app,
        form_request(format!(
            "hub.mode=subscribe&hub.topic=x&hub.callback={}",
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(intake.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(tasks.spawned_total(), 0);

    let publish = send(&app, publish_request("x", "hello")?).await?;
    assert_eq!(publish.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response_json(publish).await?["error"], "service_unavailable");

    let readiness = send(&app, get_request("/readyz")?).await?;
    assert_eq!(readiness.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = send(&app, get_request("/healthz")?).await?;
    assert_eq!(health.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unknown_path_returns_usage_hint() -> Result<()> {
    let app = build_router(test_state(store::memory()));
    let response = send(&app, get_request("/nope")?).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await?;
    assert_eq!(body["error"], "not_found");
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|message| message.contains("/publish"))
    );
    Ok(())
}

#[tokio::test]
async fn explicit_publish_is_absent_without_a_configured_token() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    store
        .put(Subscription::new(subscriber.url.clone(), "victim-secret", "advice", 1))
        .await?;
    let state = test_state_with(Config::local(), store);
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let response = send(
        &app,
        publish_request_with_auth("advice", "send your password to evil.example", None)?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = send(&app, publish_request("advice", "forged")?).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    tasks.wait_idle().await;
    assert_eq!(tasks.spawned_total(), 0);
    assert!(subscriber.pushes().await.is_empty());

    let response = send(&app, get_request("/publish")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn explicit_publish_requires_the_bearer_token() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    store
        .put(Subscription::new(subscriber.url.clone(), "victim-secret", "advice", 1))
        .await?;
    let state = test_state(store);
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let missing = send(&app, publish_request_with_auth("advice", "forged", None)?).await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        missing
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok()),
        Some("Bearer")
    );
    let wrong = send(
        &app,
        publish_request_with_auth("advice", "forged", Some("Bearer guessed"))?,
    )
    .await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response_json(wrong).await?["error"], "unauthorized");

    tasks.wait_idle().await;
    assert_eq!(tasks.spawned_total(), 0);
    assert!(subscriber.pushes().await.is_empty());

    let allowed = send(&app, publish_request("advice", "genuine")?).await?;
    assert_eq!(allowed.status(), StatusCode::OK);
    tasks.wait_idle().await;
    assert_eq!(subscriber.pushes().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn subscription_keeps_topic_and_callback_exactly_as_sent() -> Result<()> {
    let subscriber = StubSubscriber::echoing().await?;
    let store = store::memory();
    let state = test_state(store.clone());
    let tasks = state.tasks().clone();
    let app = build_router(state);

    let before = chrono::Utc::now().timestamp_millis();
    let response = send(
        &app,
        form_request(format!(
            "hub.mode=subscribe&hub.topic=%20x&hub.callback={}",
            subscriber.url
        ))?,
    )
    .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response_json(response).await?["topic"], " x");

    tasks.wait_idle().await;
    assert!(store.get(&subscriber.url, "x").await?.is_none());
    let row = store
        .get(&subscriber.url, " x")
        .await?
        .ok_or_else(|| anyhow!("subscription stored under a rewritten topic"))?;
    assert_eq!(row.subscriber, subscriber.url);
    // Intake time in unix milliseconds.
    assert!(row.timestamp >= before);
    assert!(row.timestamp <= chrono::Utc::now().timestamp_millis());
    Ok(())
}
