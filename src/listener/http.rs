//! HTTP submission endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{Error, ListenerError};
use crate::pipeline::{Pipeline, Submission};

/// Request header carrying the shared token.
const TOKEN_HEADER: &str = "Token";

/// Body of `POST /send`.
#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub sender: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
}

/// Build the router: `GET /health`, `POST /send`.
pub fn http_routes(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/send", post(send))
        .with_state(pipeline)
}

/// Bind `addr` and serve until the server fails.
pub async fn serve_http(pipeline: Arc<Pipeline>, addr: &str) -> Result<(), ListenerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(%addr, "HTTP listener started");

    axum::serve(listener, http_routes(pipeline))
        .await
        .map_err(|e| ListenerError::Serve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pgp-sendmail"
    }))
}

async fn send(
    State(pipeline): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Json(request): Json<SendRequest>,
) -> Response {
    if let Some(expected) = &pipeline.config().http.token {
        let presented = headers.get(TOKEN_HEADER).map(|v| v.as_bytes());
        if !token_matches(presented, expected) {
            warn!("Rejected HTTP submission with missing or wrong token");
            return error_response(StatusCode::UNAUTHORIZED, "invalid token");
        }
    }

    let submission = Submission {
        sender: request.sender,
        recipients: request.recipients,
        subject: request.subject,
        body: request.body.into_bytes(),
    };

    match pipeline.submit(submission).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            let status = status_for(&e);
            warn!(status = status.as_u16(), error = %e, "HTTP submission failed");
            error_response(status, &e.to_string())
        }
    }
}

/// Map a pipeline error to its HTTP status.
fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Input(_) | Error::Envelope(_) => StatusCode::BAD_REQUEST,
        Error::Authorization(_) => StatusCode::FORBIDDEN,
        Error::Delivery(_) => StatusCode::BAD_GATEWAY,
        Error::KeyStore(_) | Error::Crypto(_) | Error::Config(_) | Error::Listener(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Constant-time comparison of the presented token with the configured one.
fn token_matches(presented: Option<&[u8]>, expected: &SecretString) -> bool {
    let presented = presented.unwrap_or_default();
    presented.ct_eq(expected.expose_secret().as_bytes()).into()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
