//! HTTP glue around the signaling gateway
//!
//! One form endpoint carries the whole handshake: the peer posts a
//! codec-encoded offer and gets the engine-native answer back as JSON. The
//! promotion race is armed only once the answer body exists, and its result
//! is never surfaced over HTTP, since by then the exchange is already done.

use anyhow::{Context, Result};
use axum::extract::{Form, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::rtc::RtcGateway;
use crate::signal;
use crate::transport::WebRtcTransport;

/// Shared server state: the one gateway all requests go through.
pub struct AppState {
    pub gateway: RtcGateway<WebRtcTransport>,
}

#[derive(Debug, Deserialize)]
pub struct OfferForm {
    pub offer: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/offer", post(post_offer))
        .with_state(state)
}

async fn index() -> &'static str {
    "rendezvous"
}

/// Accept one encoded offer and answer it.
///
/// 400: the offer does not decode or the engine rejects it. 500: the answer
/// exists but cannot be serialized. On success the response body is the
/// engine-native answer as JSON and the promotion race is armed; whether the
/// response write itself succeeds no longer matters, the peer may already be
/// acting on the answer.
pub async fn post_offer(
    State(state): State<Arc<AppState>>,
    Form(form): Form<OfferForm>,
) -> Response {
    let offer: RTCSessionDescription = match signal::decode(&form.offer) {
        Ok(offer) => offer,
        Err(e) => {
            log::debug!("rejecting undecodable offer: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let (pending, answer) = match state.gateway.accept(offer).await {
        Ok(accepted) => accepted,
        Err(e) => {
            log::warn!("offer negotiation failed: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let body = match serde_json::to_string(&answer) {
        Ok(body) => body,
        Err(e) => {
            log::error!("failed to encode answer: {e}");
            pending.discard().await;
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode answer").into_response();
        }
    };

    state.gateway.arm(pending);

    (
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Serve until the first interrupt, then drain; a second interrupt kills the
/// process.
pub async fn serve(bind: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    log::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    log::warn!("interrupt received, shutting down");

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::error!("second interrupt received, exiting immediately");
            std::process::exit(1);
        }
    });
}
