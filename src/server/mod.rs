//! The signaling service: an axum WebSocket endpoint feeding a single-task
//! hub that owns all room and peer state.

mod connection;
mod hub;
mod room;
pub mod words;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

pub use hub::{Hub, HubEvent};
pub use room::{PeerId, Room};

/// Events queued ahead of the hub loop before backpressure kicks in.
const HUB_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct ServerState {
    pub hub_tx: mpsc::Sender<HubEvent>,
}

/// Build the signaling router and spawn the hub loop behind it.
pub fn build_router() -> Router {
    let (hub_tx, hub_rx) = mpsc::channel(HUB_QUEUE_DEPTH);
    tokio::spawn(Hub::new().run(hub_rx));

    Router::new()
        .route("/ws", get(connection::ws_handler))
        .with_state(ServerState { hub_tx })
}

/// Serve the signaling hub on an already-bound listener. Blocks until the
/// server stops.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    let router = build_router();
    if let Ok(addr) = listener.local_addr() {
        info!("signaling hub listening on ws://{}/ws", addr);
    }
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
