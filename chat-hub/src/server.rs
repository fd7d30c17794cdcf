use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        FromRequestParts, State,
    },
    http::{request::Parts, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use futures::StreamExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    hub::HubHandle,
    message::DisplayName,
    pump::{Pump, PumpConfig},
};

/// Request header carrying the caller's display name.
pub const USERNAME_HEADER: &str = "username";

pub const CHAT_PATH: &str = "/chat";

pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    pub fn new(listener: TcpListener, hub: HubHandle, config: PumpConfig) -> Self {
        Self {
            listener,
            router: router(hub, config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves. Upgraded sockets are detached from
    /// the HTTP connection and keep running until their pumps stop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, router } = self;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .context("chat server failed")?;
        info!("server shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    config: Arc<PumpConfig>,
}

pub fn router(hub: HubHandle, config: PumpConfig) -> Router {
    let state = AppState {
        hub,
        config: Arc::new(config),
    };
    Router::new()
        .route(CHAT_PATH, get(chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Display name read from the [`USERNAME_HEADER`]; rejects the request with
/// `400 Bad Request` before any upgrade happens.
pub struct Username(pub DisplayName);

#[async_trait]
impl<S> FromRequestParts<S> for Username
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USERNAME_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        DisplayName::parse(raw)
            .map(Username)
            .map_err(|err| (StatusCode::BAD_REQUEST, format!("apierror: {err}")))
    }
}

async fn chat(
    Username(name): Username,
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    // The transport may buffer up to twice the limit so oversized frames in
    // that range reach the pump's own check and are reported as such.
    let transport_limit = state.config.max_message_size * 2;

    upgrade
        .max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| serve_socket(socket, name, state))
}

async fn serve_socket(socket: WebSocket, name: DisplayName, state: AppState) {
    let pump = Pump::new(name, state.hub.clone(), state.config.as_ref().clone());
    let (sink, stream) = socket.split();
    // The pump logs its own outcome.
    let _ = pump.run(sink, stream).await;
}
