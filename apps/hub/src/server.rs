use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config,
    content::{ContentSource, ContentSourceError},
    distribution::{ContentDistributor, DistributionError},
    subscription::{SubscriptionMode, SubscriptionStore, SubscriptionStoreError, types::MAX_SECRET_BYTES},
    tasks::TaskExecutor,
    verification::{IntentRequest, IntentVerifier},
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    store: Arc<dyn SubscriptionStore>,
    verifier: IntentVerifier,
    distributor: ContentDistributor,
    content_source: Arc<dyn ContentSource>,
    tasks: TaskExecutor,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
        verifier: IntentVerifier,
        distributor: ContentDistributor,
        content_source: Arc<dyn ContentSource>,
        tasks: TaskExecutor,
    ) -> Self {
        Self {
            config,
            store,
            verifier,
            distributor,
            content_source,
            tasks,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn tasks(&self) -> &TaskExecutor {
        &self.tasks
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    store_driver: &'static str,
    tasks_in_flight: usize,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store_driver: &'static str,
    store_ready: bool,
}

/// Subscription form fields as submitted by subscribers.
#[derive(Debug, Default, Deserialize)]
struct IntakeForm {
    #[serde(rename = "hub.callback")]
    callback: Option<String>,
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.topic")]
    topic: Option<String>,
    #[serde(rename = "hub.secret")]
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct IntakeAccepted {
    status: &'static str,
    mode: &'static str,
    topic: String,
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    topic: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    topic: String,
    content: String,
    subscribers: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(subscription_intake))
        .route("/publish", get(publish_from_source).post(publish_content))
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .fallback(not_found)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds,
        store_driver: state.store.driver_name(),
        tasks_in_flight: state.tasks.in_flight(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let store_ready = match state.store.ping().await {
        Ok(()) => true,
        Err(error) => {
            warn!(reason = %error, "subscription store not ready");
            false
        }
    };
    let status = if store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if store_ready { "ready" } else { "not_ready" },
            store_driver: state.store.driver_name(),
            store_ready,
        }),
    )
}

async fn subscription_intake(
    State(state): State<AppState>,
    Form(form): Form<IntakeForm>,
) -> Result<(StatusCode, Json<IntakeAccepted>), ApiError> {
    let request = match validate_intake(form) {
        Ok(request) => request,
        Err(rejection) => {
            info!(
                subscriber = rejection.callback.as_deref().unwrap_or(""),
                topic = %rejection.topic,
                reason = %rejection.reason,
                "subscription request denied"
            );
            if let Some(callback) = rejection.callback {
                let _ = state
                    .verifier
                    .submit_denial(callback, rejection.topic, rejection.reason.clone());
            }
            return Err(ApiError::InvalidRequest(rejection.reason));
        }
    };

    state.store.ping().await.map_err(ApiError::from_store)?;

    let mode = request.mode;
    let topic = request.topic.clone();
    let handle = state.verifier.submit(request);
    Ok((
        StatusCode::ACCEPTED,
        Json(IntakeAccepted {
            status: "accepted",
            mode: mode.as_str(),
            topic,
            task_id: handle.id().to_string(),
        }),
    ))
}

async fn publish_from_source(
    State(state): State<AppState>,
) -> Result<Json<PublishResponse>, ApiError> {
    let content = state
        .content_source
        .fetch()
        .await
        .map_err(ApiError::from_content_source)?;
    let topic = state.config.publish_topic.clone();
    publish(&state, topic, content).await
}

async fn publish_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PublishBody>, JsonRejection>,
) -> Result<Json<PublishResponse>, ApiError> {
    authorize_publish(&state.config, &headers)?;
    let Json(body) = body.map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;
    if body.topic.trim().is_empty() {
        return Err(ApiError::InvalidRequest("topic is required".to_string()));
    }
    publish(&state, body.topic, body.content).await
}

/// `POST /publish` is absent without a configured token and bearer-checked otherwise.
fn authorize_publish(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = config.publish_token.as_deref() else {
        return Err(ApiError::NotFound);
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match presented {
        Some(token) if Sha256::digest(token.as_bytes()) == Sha256::digest(expected.as_bytes()) => {
            Ok(())
        }
        _ => {
            warn!("publish rejected: missing or wrong bearer token");
            Err(ApiError::Unauthorized)
        }
    }
}

async fn publish(
    state: &AppState,
    topic: String,
    content: String,
) -> Result<Json<PublishResponse>, ApiError> {
    let dispatch = state
        .distributor
        .distribute(&topic, &content)
        .await
        .map_err(ApiError::from_distribution)?;
    info!(topic = %topic, subscribers = dispatch.subscribers, "content published");
    Ok(Json(PublishResponse {
        subscribers: dispatch.subscribers,
        topic,
        content,
    }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

#[derive(Debug)]
struct IntakeRejection {
    /// Set only when the callback is a usable URL, so a denial notice can be sent.
    callback: Option<String>,
    topic: String,
    reason: String,
}

fn validate_intake(form: IntakeForm) -> Result<IntentRequest, IntakeRejection> {
    let callback = non_empty(form.callback);
    let topic = non_empty(form.topic);
    let mode = non_empty(form.mode);
    let secret = form.secret.unwrap_or_default();

    let reject = |callback: Option<&String>, reason: String| IntakeRejection {
        callback: callback.filter(|url| is_http_url(url)).cloned(),
        topic: topic.clone().unwrap_or_default(),
        reason,
    };

    let Some(callback) = callback else {
        return Err(reject(None, "hub.callback is required".to_string()));
    };
    if !is_http_url(&callback) {
        return Err(reject(None, "hub.callback must be an http(s) URL".to_string()));
    }
    let Some(mode) = mode else {
        return Err(reject(Some(&callback), "hub.mode is required".to_string()));
    };
    let mode = match mode.parse::<SubscriptionMode>() {
        Ok(mode) => mode,
        Err(error) => return Err(reject(Some(&callback), error.to_string())),
    };
    let Some(topic_value) = topic.clone() else {
        return Err(reject(Some(&callback), "hub.topic is required".to_string()));
    };
    if secret.len() > MAX_SECRET_BYTES {
        return Err(reject(
            Some(&callback),
            format!("hub.secret must be at most {MAX_SECRET_BYTES} bytes"),
        ));
    }

    Ok(IntentRequest {
        callback,
        secret,
        mode,
        topic: topic_value,
        timestamp: Utc::now().timestamp_millis(),
    })
}

/// Blank counts as missing; a present value is kept exactly as sent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn is_http_url(raw: &str) -> bool {
    reqwest::Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    Unauthorized,
    NotFound,
    ServiceUnavailable(String),
    BadGateway(String),
    Internal(String),
}

impl ApiError {
    fn from_store(error: SubscriptionStoreError) -> Self {
        warn!(reason = %error, "subscription store call failed");
        match error {
            SubscriptionStoreError::Unavailable(message) | SubscriptionStoreError::Db(message) => {
                Self::ServiceUnavailable(message)
            }
        }
    }

    fn from_distribution(error: DistributionError) -> Self {
        match error {
            DistributionError::Store(error) => Self::from_store(error),
            DistributionError::Task(error) => Self::Internal(error.to_string()),
            DistributionError::Encode(error) => Self::Internal(error.to_string()),
        }
    }

    fn from_content_source(error: ContentSourceError) -> Self {
        warn!(reason = %error, "content source fetch failed");
        Self::BadGateway(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "publishing content requires a valid bearer token",
                })),
            )
                .into_response(),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                    "message": "subscribe with POST / (hub.mode, hub.topic, hub.callback, hub.secret); publish with GET /publish",
                })),
            )
                .into_response(),
            Self::ServiceUnavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "service_unavailable",
                    "message": message,
                })),
            )
                .into_response(),
            Self::BadGateway(message) => (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "content_source_failed",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests;
