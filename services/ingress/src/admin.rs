//! Admin HTTP API for managing credentials.
//!
//! A thin layer over the [`CredentialLedger`]:
//! - `GET /trojan/users` lists keys and their usage
//! - `POST /trojan/users/add` adds a password or pre-hashed key
//! - `DELETE /trojan/users/del` removes a password or pre-hashed key
//!
//! When a request names both a key and a password, the key wins. A request
//! naming neither is accepted and changes nothing.

use std::io;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use veil_credentials::{CredentialKey, CredentialLedger, CredentialUsage, KeyError};

/// Body of add and delete requests.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UserRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Which credential a request names, if any.
enum Target<'a> {
    Key(CredentialKey),
    Password(&'a str),
    Nothing,
}

impl UserRequest {
    fn target(&self) -> Result<Target<'_>, AdminError> {
        if let Some(key) = self.key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(Target::Key(CredentialKey::parse(key)?));
        }
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => Ok(Target::Password(password)),
            _ => Ok(Target::Nothing),
        }
    }
}

/// Admin API errors.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the admin router.
pub fn router(ledger: Arc<CredentialLedger>) -> Router {
    Router::new()
        .route("/trojan/users", get(list_users))
        .route("/trojan/users/add", post(add_user))
        .route("/trojan/users/del", delete(delete_user))
        .layer(TraceLayer::new_for_http())
        .with_state(ledger)
}

/// Serve the admin API until `shutdown` flips to true.
pub async fn serve(
    listener: TcpListener,
    ledger: Arc<CredentialLedger>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(bind_addr = %listener.local_addr()?, "Admin API listening");

    axum::serve(listener, router(ledger))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("Admin API shutting down");
        })
        .await
}

async fn list_users(State(ledger): State<Arc<CredentialLedger>>) -> Json<Vec<CredentialUsage>> {
    Json(ledger.snapshot())
}

async fn add_user(
    State(ledger): State<Arc<CredentialLedger>>,
    Json(request): Json<UserRequest>,
) -> Result<StatusCode, AdminError> {
    match request.target()? {
        Target::Key(key) => {
            ledger.add_key(key);
        }
        Target::Password(password) => {
            ledger.add(password);
        }
        Target::Nothing => {}
    }
    Ok(StatusCode::OK)
}

async fn delete_user(
    State(ledger): State<Arc<CredentialLedger>>,
    Json(request): Json<UserRequest>,
) -> Result<StatusCode, AdminError> {
    match request.target()? {
        Target::Key(key) => {
            ledger.delete_key(&key);
        }
        Target::Password(password) => {
            ledger.delete(password);
        }
        Target::Nothing => {}
    }
    Ok(StatusCode::OK)
}
