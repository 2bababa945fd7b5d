use axum::body::Bytes;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::auth;
use crate::channel::telegram::parse_update;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;

pub struct AppState {
    pub secret_token: Option<String>,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/telegram", post(telegram_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve webhook deliveries until `cancel` fires.
pub async fn run(
    config: &GatewayConfig,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let is_loopback = config.is_loopback();
    if !is_loopback && config.secret_token.is_none() {
        anyhow::bail!(
            "Secret token required when binding to non-loopback address. \
             Set gateway.secret_token or KAONASI_WEBHOOK_SECRET."
        );
    }

    let state = Arc::new(AppState {
        secret_token: config.secret_token.clone(),
        dispatcher,
    });
    let app = router(state);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("kaonasi gateway listening on {addr}");
    if is_loopback {
        info!("bound to loopback, expecting a reverse proxy in front");
    } else {
        warn!("bound to {addr}, webhook secret enforced");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Accept one Telegram update. The update is handled on its own task so
/// Telegram gets its 200 without waiting for a reply to be generated.
async fn telegram_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !auth::verify_secret(&headers, state.secret_token.as_deref()) {
        warn!("rejected webhook delivery with bad secret");
        return StatusCode::UNAUTHORIZED;
    }

    let update: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("unparseable webhook body: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };

    match parse_update(&update) {
        Some(event) => state.dispatcher.spawn_event(event),
        None => debug!("ignoring unsupported update kind"),
    }
    StatusCode::OK
}
