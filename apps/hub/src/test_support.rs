use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};

use crate::signing::SIGNATURE_HEADER;

/// How the stub answers the verification GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyBehavior {
    Echo(StatusCode),
    WrongBody,
}

#[derive(Debug, Clone)]
pub(crate) struct ReceivedPush {
    pub body: Bytes,
    pub signature: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Clone)]
struct StubState {
    verify: Arc<Mutex<VerifyBehavior>>,
    delivery_status: Arc<Mutex<StatusCode>>,
    verifications: Arc<Mutex<Vec<HashMap<String, String>>>>,
    pushes: Arc<Mutex<Vec<ReceivedPush>>>,
}

/// A subscriber callback endpoint on loopback, shut down on drop.
pub(crate) struct StubSubscriber {
    pub url: String,
    state: StubState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StubSubscriber {
    pub async fn echoing() -> Result<Self> {
        Self::spawn(VerifyBehavior::Echo(StatusCode::OK), StatusCode::OK).await
    }

    pub async fn spawn(verify: VerifyBehavior, delivery_status: StatusCode) -> Result<Self> {
        let state = StubState {
            verify: Arc::new(Mutex::new(verify)),
            delivery_status: Arc::new(Mutex::new(delivery_status)),
            verifications: Arc::new(Mutex::new(Vec::new())),
            pushes: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/callback", get(answer_verification).post(accept_push))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(Self {
            url: format!("http://{addr}/callback"),
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    pub async fn set_delivery_status(&self, status: StatusCode) {
        *self.state.delivery_status.lock().await = status;
    }

    pub async fn verifications(&self) -> Vec<HashMap<String, String>> {
        self.state.verifications.lock().await.clone()
    }

    pub async fn pushes(&self) -> Vec<ReceivedPush> {
        self.state.pushes.lock().await.clone()
    }
}

impl Drop for StubSubscriber {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A loopback URL with nothing listening behind it.
pub(crate) async fn unreachable_url() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}/callback"))
}

async fn answer_verification(
    State(state): State<StubState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    state.verifications.lock().await.push(params.clone());
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    match *state.verify.lock().await {
        VerifyBehavior::Echo(status) => (status, challenge),
        VerifyBehavior::WrongBody => (StatusCode::OK, format!("{challenge}-tampered")),
    }
}

async fn accept_push(State(state): State<StubState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    state.pushes.lock().await.push(ReceivedPush {
        body,
        signature: header_value(SIGNATURE_HEADER),
        content_type: header_value(header::CONTENT_TYPE.as_str()),
    });
    *state.delivery_status.lock().await
}
