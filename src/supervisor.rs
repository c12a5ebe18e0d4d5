//! # Task Supervisor
//!
//! Local HTTP control plane for one running task, plus the client used by
//! later CLI invocations.
//!
//! ## Wire Surface
//!
//! Served on `127.0.0.1:<port>`, all bodies JSON:
//!
//! | Route | Method | Response |
//! |-------|--------|----------|
//! | `/ps` | GET | `200` with the status string, e.g. `"Sleeping"` |
//! | `/kill` | POST `{"signal": "<name>"}` | `200` `"Signaled"` |
//! | `/kill` | malformed body | `422` with a JSON error |
//! | `/kill` | unknown signal name | `400` with the accepted names |
//! | either | other method | `405` |
//!
//! Handler failures answer as HTTP errors; they never take the server
//! down.
//!
//! ## Ownership
//!
//! Each supervisor builds its own [`axum::Router`] around an `Arc<Task>`
//! received over a one-shot rendezvous channel, so the run pipeline
//! controls exactly when the task becomes observable and several
//! supervisors can coexist in one process (tests rely on this).

use crate::error::{Error, Result};
use crate::task::{Signal, Task};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Body of a `POST /kill` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalRequest {
    pub signal: String,
}

/// JSON error body for failed control requests.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server answering status queries and signal requests for one task.
pub struct Supervisor {
    task: Arc<Task>,
    port: u16,
}

impl Supervisor {
    /// Creates a supervisor once the run pipeline publishes the task on
    /// the rendezvous channel. Resolves to an error if the sender is
    /// dropped without publishing (startup failed before the hand-off).
    pub async fn new(task: oneshot::Receiver<Arc<Task>>, port: u16) -> Result<Self> {
        let task = task
            .await
            .map_err(|_| Error::Internal("task was never published".to_string()))?;
        Ok(Self { task, port })
    }

    /// Binds `127.0.0.1:<port>` and serves until the process exits.
    pub async fn listen_and_serve(self) -> Result<()> {
        let listener =
            tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)).await?;
        info!(addr = %listener.local_addr()?, "supervisor listening");
        axum::serve(listener, build_router(self.task)).await?;
        Ok(())
    }
}

/// Builds the control-plane router. Exposed so tests can serve it on an
/// ephemeral listener.
pub fn build_router(task: Arc<Task>) -> Router {
    Router::new()
        .route("/ps", get(ps))
        .route("/kill", post(kill))
        .with_state(task)
}

async fn ps(State(task): State<Arc<Task>>) -> Json<String> {
    let status = task.status();
    debug!(%status, "status query");
    Json(status.to_string())
}

async fn kill(State(task): State<Arc<Task>>, body: String) -> Response {
    let request: SignalRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let Some(signal) = Signal::from_name(&request.signal) else {
        let err = Error::UnknownSignal {
            name: request.signal,
            choices: Signal::CHOICES,
        };
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
            .into_response();
    };

    debug!(%signal, "signal request");
    match task.signal(signal) {
        Ok(()) => (StatusCode::OK, Json("Signaled".to_string())).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// =============================================================================
// Client
// =============================================================================

fn endpoint(port: u16, route: &str) -> String {
    format!("http://127.0.0.1:{port}/{route}")
}

/// Asks the supervisor on `port` for the task status string.
pub async fn query_status(port: u16) -> Result<String> {
    let response = reqwest::get(endpoint(port, "ps"))
        .await
        .map_err(connect_error)?;
    let status: String = response.json().await.map_err(connect_error)?;
    Ok(status)
}

/// Asks the supervisor on `port` to deliver `signal_name` to the task.
/// Returns the acknowledgement string (`"Signaled"`) on 200; any other
/// status surfaces as [`Error::SupervisorHttp`] with the response body.
pub async fn send_signal(port: u16, signal_name: &str) -> Result<String> {
    let response = reqwest::Client::new()
        .post(endpoint(port, "kill"))
        .json(&SignalRequest {
            signal: signal_name.to_string(),
        })
        .send()
        .await
        .map_err(connect_error)?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::SupervisorHttp {
            status: response.status().to_string(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    let ack: String = response.json().await.map_err(connect_error)?;
    Ok(ack)
}

fn connect_error(e: reqwest::Error) -> Error {
    Error::SupervisorConnect {
        reason: e.to_string(),
    }
}
