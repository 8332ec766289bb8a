//! Loopback receiver for the OAuth redirect
//!
//! The command line client has no browser origin of its own, so it listens on
//! `127.0.0.1` and lets the authorization server redirect there.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    response::{Html, IntoResponse},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tower_http::trace::TraceLayer;

use super::oauth::CallbackParams;
use crate::error::{AppError, Result};

type Sender = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

/// One-shot redirect listener
pub struct CallbackListener {
    addr: SocketAddr,
    receiver: oneshot::Receiver<CallbackParams>,
    server: tokio::task::JoinHandle<()>,
}

impl CallbackListener {
    /// Listen on a loopback port; 0 picks a free one
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to bind callback listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Callback listener has no address: {e}")))?;

        let (sender, receiver) = oneshot::channel();
        let app = Router::new()
            .route("/", get(receive))
            .route("/auth/web/callback", get(receive))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(Mutex::new(Some(sender))));

        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "Callback listener stopped");
            }
        });

        tracing::info!(addr = %addr, "Listening for OAuth redirect");
        Ok(Self {
            addr,
            receiver,
            server,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Host the redirect URI should name
    pub fn redirect_host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Wait for the first redirect, then stop listening
    pub async fn wait(self) -> Result<CallbackParams> {
        let params = self
            .receiver
            .await
            .map_err(|_| AppError::OAuth("Callback listener closed before a redirect".to_string()));
        self.server.abort();
        params
    }
}

async fn receive(State(sender): State<Sender>, Query(params): Query<CallbackParams>) -> impl IntoResponse {
    let message = match (&params.error, params.is_empty()) {
        (Some(error), _) => format!("Sign-in failed: {error}"),
        (None, true) => "Nothing to do here.".to_string(),
        (None, false) => "Signed in. You can close this window.".to_string(),
    };

    if !params.is_empty() {
        if let Some(sender) = sender.lock().await.take() {
            let _ = sender.send(params);
        }
    }

    Html(format!(
        "<!DOCTYPE html><html><head><title>community-feed</title></head><body><p>{message}</p></body></html>"
    ))
}
