//! Middleware chain, outer to inner: request-id, structured logging,
//! authentication, concurrency limiting. The limiter permit rides the
//! response body so streaming requests hold their slot to the last byte.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http::HeaderValue;
use tokio::sync::OwnedSemaphorePermit;
use tracing::info;
use uuid::Uuid;

use crate::Services;
use crate::http::{ApiError, Body, Request};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Routing outcome, inserted into response extensions by the handler for the
/// logging middleware and debug headers.
#[derive(Debug, Clone, Default)]
pub struct RouteMeta {
	pub provider: Option<String>,
	pub strategy: Option<&'static str>,
	pub key_prefix: Option<String>,
}

/// Echoes the client's `X-Request-ID` or generates one, and stamps it on the
/// response unconditionally.
pub async fn request_id(mut req: Request, next: Next) -> Response {
	let id = req
		.headers()
		.get(REQUEST_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty() && v.len() <= 128)
		.map(str::to_string)
		.unwrap_or_else(|| Uuid::new_v4().to_string());
	req.extensions_mut().insert(RequestId(id.clone()));
	let mut resp = next.run(req).await;
	if let Ok(v) = HeaderValue::from_str(&id) {
		resp.headers_mut().insert(REQUEST_ID_HEADER, v);
	}
	resp
}

pub async fn logging(req: Request, next: Next) -> Response {
	let start = Instant::now();
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let id = req
		.extensions()
		.get::<RequestId>()
		.map(|r| r.0.clone())
		.unwrap_or_default();
	info!(request_id = %id, %method, %path, "request start");

	let resp = next.run(req).await;

	let meta = resp.extensions().get::<RouteMeta>().cloned().unwrap_or_default();
	info!(
		request_id = %id,
		%method,
		%path,
		status = resp.status().as_u16(),
		latency_ms = start.elapsed().as_millis() as u64,
		provider = meta.provider.as_deref().unwrap_or("-"),
		strategy = meta.strategy.unwrap_or("-"),
		key = meta.key_prefix.as_deref().unwrap_or("-"),
		"request complete"
	);
	resp
}

pub async fn authenticate(
	State(services): State<Arc<Services>>,
	mut req: Request,
	next: Next,
) -> Response {
	let state = services.state();
	match state.auth.validate(req.headers()) {
		Ok(outcome) => {
			req.extensions_mut().insert(outcome);
			next.run(req).await
		},
		Err(err) => {
			let id = req.extensions().get::<RequestId>().map(|r| r.0.clone());
			err.into_response_with_id(id.as_deref()).into_response()
		},
	}
}

/// Counting-semaphore concurrency cap. With a queue wait configured, callers
/// block up to that long for a slot; otherwise exhaustion is an immediate 503.
pub async fn limit_concurrency(
	State(services): State<Arc<Services>>,
	req: Request,
	next: Next,
) -> Response {
	let state = services.state();
	let id = req.extensions().get::<RequestId>().map(|r| r.0.clone());

	let permit = if state.queue_wait.is_zero() {
		state.limiter.clone().try_acquire_owned().ok()
	} else {
		tokio::time::timeout(state.queue_wait, state.limiter.clone().acquire_owned())
			.await
			.ok()
			.and_then(Result::ok)
	};
	let Some(permit) = permit else {
		return ApiError::Overloaded
			.into_response_with_id(id.as_deref())
			.into_response();
	};

	let resp = next.run(req).await;
	attach_permit(resp, permit)
}

/// Moves the permit into the response body stream so it is released only when
/// the body (streaming included) finishes or the client goes away.
fn attach_permit(resp: Response, permit: OwnedSemaphorePermit) -> Response {
	let (parts, body) = resp.into_parts();
	let stream = body.into_data_stream().map(move |chunk| {
		// the permit lives in this closure; it drops with the stream
		let _ = &permit;
		chunk
	});
	Response::from_parts(parts, Body::from_stream(stream))
}
