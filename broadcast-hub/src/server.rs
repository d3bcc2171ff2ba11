//! HTTP surface of the hub: the landing page and the WebSocket entry point.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{Path, State, ws::WebSocketUpgrade},
    response::{Html, IntoResponse},
    routing::get,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{dispatcher::BroadcastDispatcher, registry::ConnectionRegistry, session};

const LANDING_PAGE: &str = include_str!("../static/index.html");

/// Tunables for the registry, dispatcher, and sessions.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on a single recipient's send during a broadcast.
    pub send_timeout: Duration,
    /// Frames queued per connection before senders start waiting.
    pub outbound_capacity: usize,
    /// How long a closing session waits for its writer to flush.
    pub drain_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            outbound_capacity: 64,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

/// State shared by every session: one registry and the dispatcher over it.
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    dispatcher: BroadcastDispatcher,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = BroadcastDispatcher::new(registry, config.send_timeout);
        Self { config, dispatcher }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    pub fn dispatcher(&self) -> &BroadcastDispatcher {
        &self.dispatcher
    }
}

pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new(config)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, hub } = self;

        axum::serve(listener, router(hub))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("hub shutting down");
            })
            .await
            .context("http server failed")
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

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/ws/:client_id", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn landing_page() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    debug!(client_id = %client_id, "websocket upgrade requested");
    ws.on_upgrade(move |socket| session::run(socket, client_id, hub))
}
