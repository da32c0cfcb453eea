//! The read-only HTTP status page: a projection of the network's connected
//! node set, served as HTML on `/` and as JSON on `/connections?json=true`.
//! The page binds on the node port + 1 and runs on a dedicated thread with
//! its own single-threaded runtime, shutting down with the network.

use crate::network::Network;

use axum::extract::{Query, State};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Starts the status page on a dedicated thread. It stops when the
/// network's running flag clears.
pub fn spawn(network: Arc<Network>, port: u16) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!("Failed to start web runtime: {err}");
                return;
            }
        };
        runtime.block_on(serve(network, port));
    })
}

async fn serve(network: Arc<Network>, port: u16) {
    // Prefer all interfaces; some hosts refuse the wildcard bind, in which
    // case the page is still useful on localhost.
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!("Web bind on *:{port} failed ({err}), retrying on localhost");
            match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("Web bind on localhost:{port} failed: {err}");
                    return;
                }
            }
        }
    };
    match listener.local_addr() {
        Ok(addr) => info!("Web interface listening on http://{addr}"),
        Err(_) => info!("Web interface listening on port {port}"),
    }

    let running = network.running();
    let shutdown = async move {
        while running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/connections", get(connections))
        .with_state(network);
    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("Web interface failed: {err}");
    }
}

async fn index(State(network): State<Arc<Network>>) -> Html<String> {
    render(&network)
}

#[derive(Serialize)]
struct Connections {
    connections: Vec<String>,
}

async fn connections(
    State(network): State<Arc<Network>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("json").is_some_and(|v| v == "true") {
        let connections =
            network.connected_nodes().iter().map(|node| node.name()).collect();
        return Json(Connections { connections }).into_response();
    }
    render(&network).into_response()
}

fn render(network: &Network) -> Html<String> {
    let mut body = String::new();
    let _ = write!(body, "<html><head><title>{}</title></head><body>", network.name());
    let _ = write!(body, "<h1>{}</h1><h2>Connected nodes</h2><ul>", network.name());
    for node in network.connected_nodes() {
        let _ = write!(body, "<li>{node}</li>");
    }
    body.push_str("</ul></body></html>");
    Html(body)
}
