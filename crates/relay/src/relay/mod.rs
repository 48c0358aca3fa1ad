//! HTTP server assembly: routes, middleware chain, graceful shutdown,
//! optional HTTP/2 cleartext for trusted deployments.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::Services;
use crate::http::middleware;

pub mod handler;
pub mod upstream;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub fn app(services: Arc<Services>) -> axum::Router {
	let api = axum::Router::new()
		.route("/v1/messages", post(handler::messages))
		.route("/v1/messages/count_tokens", post(handler::count_tokens))
		.route("/v1/models", get(models))
		.route("/v1/providers", get(providers))
		.layer(axum::middleware::from_fn_with_state(
			services.clone(),
			middleware::limit_concurrency,
		))
		.layer(axum::middleware::from_fn_with_state(
			services.clone(),
			middleware::authenticate,
		));

	axum::Router::new()
		.route("/health", get(health))
		.merge(api)
		.layer(axum::middleware::from_fn(middleware::logging))
		.layer(axum::middleware::from_fn(middleware::request_id))
		.with_state(services)
}

async fn health() -> Json<Value> {
	Json(json!({"status": "ok"}))
}

/// Union of every enabled provider's declared models, first-declaration
/// order, deduplicated by id.
async fn models(State(services): State<Arc<Services>>) -> Json<Value> {
	let state = services.state();
	let mut seen = std::collections::HashSet::new();
	let mut data = Vec::new();
	for info in state.providers.iter() {
		for model in &info.proxy.models {
			if seen.insert(model.clone()) {
				data.push(json!({
					"id": model,
					"object": "model",
					"owned_by": info.name.as_ref(),
				}));
			}
		}
	}
	Json(json!({"object": "list", "data": data}))
}

async fn providers(State(services): State<Arc<Services>>) -> Json<Value> {
	let state = services.state();
	let data: Vec<Value> = state
		.providers
		.iter()
		.map(|info| {
			json!({
				"name": info.name.as_ref(),
				"variant": info.proxy.variant().as_str(),
				"models": info.proxy.models.len(),
				"healthy": info.is_healthy(),
			})
		})
		.collect();
	Json(json!({"providers": data}))
}

/// Accept loop. Serves HTTP/1.1, plus cleartext HTTP/2 when enabled. On
/// shutdown the listener closes immediately and in-flight connections get a
/// bounded drain.
pub async fn serve(services: Arc<Services>, listener: TcpListener) -> std::io::Result<()> {
	let enable_http2 = services.config().enable_http2;
	let app = app(services.clone());
	let shutdown = services.shutdown.clone();
	let tracker = TaskTracker::new();

	info!(addr = %listener.local_addr()?, http2 = enable_http2, "listening");
	loop {
		let (stream, peer) = tokio::select! {
			_ = shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok(conn) => conn,
				Err(e) => {
					warn!("accept failed: {e}");
					continue;
				},
			},
		};

		let service = TowerToHyperService::new(app.clone());
		let conn_shutdown = shutdown.clone();
		tracker.spawn(async move {
			let io = TokioIo::new(stream);
			let mut builder = auto::Builder::new(TokioExecutor::new());
			if !enable_http2 {
				builder = builder.http1_only();
			}
			let conn = builder.serve_connection_with_upgrades(io, service);
			tokio::pin!(conn);
			tokio::select! {
				result = conn.as_mut() => {
					if let Err(e) = result {
						tracing::debug!(%peer, "connection ended: {e}");
					}
				},
				_ = conn_shutdown.cancelled() => {
					conn.as_mut().graceful_shutdown();
					let _ = conn.as_mut().await;
				},
			}
		});
	}

	tracker.close();
	info!("draining in-flight connections");
	if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
		warn!("drain deadline reached; closing remaining connections");
	}
	Ok(())
}
