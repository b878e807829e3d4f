//! HTTP surface: health check and the Lark event callback.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::lark::{LarkError, LarkEvent};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn lark_receive(State(state): State<Arc<AppState>>, body: String) -> impl IntoResponse {
    let event = match state.decoder.decode(&body) {
        Ok(event) => event,
        Err(LarkError::TokenMismatch) => {
            warn!("Rejected Lark event with a bad verification token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "verification token mismatch" })),
            );
        }
        Err(e) => {
            error!("Lark webhook error: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };

    if let Some(event_id) = event.event_id() {
        if !state.seen_events.first_seen(event_id) {
            info!("Skipping redelivered Lark event {}", event_id);
            return (StatusCode::OK, Json(json!({})));
        }
    }

    match event {
        LarkEvent::UrlVerification { challenge } => {
            info!("Lark URL verification challenge received");
            (StatusCode::OK, Json(json!({ "challenge": challenge })))
        }
        LarkEvent::MessageReceived(message) => {
            debug!("Lark message {} from {}", message.message_id, message.open_id);
            // Detached: the turn outlives this request
            let _ = state.handler.on_message_received(message);
            (StatusCode::OK, Json(json!({})))
        }
        LarkEvent::P2pChatEntered { open_id, .. } => {
            let _ = state.handler.on_p2p_chat_entered(open_id);
            (StatusCode::OK, Json(json!({})))
        }
        LarkEvent::Ignored {
            event_type, reason, ..
        } => {
            debug!("Ignoring Lark event {}: {}", event_type, reason);
            (StatusCode::OK, Json(json!({})))
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/lark/receive", post(lark_receive))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                        let request_id = request
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-");
                        tracing::info_span!(
                            "request",
                            method = %request.method(),
                            uri = %request.uri(),
                            request_id = %request_id,
                        )
                    }),
                )
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
