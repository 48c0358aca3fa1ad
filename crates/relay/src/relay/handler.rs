//! The streaming proxy handler behind `POST /v1/messages`.
//!
//! Pipeline: bounded body read, thinking-block normalization against the
//! signature cache, model filter, routing strategy, key pool, upstream
//! dispatch. Failover-eligible failures before the first flushed byte race
//! the remaining healthy providers under `routing.failover_timeout`; once
//! the response is handed to the client the stream is committed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use bytes::Bytes;
use futures_util::TryStreamExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use http::{HeaderMap, HeaderValue, header};
use tracing::{debug, warn};

use crate::http::auth::AuthOutcome;
use crate::http::middleware::{RequestId, RouteMeta};
use crate::http::{ApiError, Body, Request, Response, read_body_with_limit};
use crate::parse::{aws_sse, sse};
use crate::provider::Operation;
use crate::relay::upstream::{self, DispatchError};
use crate::routing::keypool::{PoolError, PoolKey};
use crate::routing::{ProviderInfo, Selection, filter};
use crate::signature;
use crate::signature::stream::UsageSink;
use crate::types::messages::{RequestSummary, response_usage};
use crate::{RelayState, Services};

const UPSTREAM_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub async fn messages(State(services): State<Arc<Services>>, req: Request) -> Response {
	handle(services, req, Operation::Messages).await
}

pub async fn count_tokens(State(services): State<Arc<Services>>, req: Request) -> Response {
	handle(services, req, Operation::CountTokens).await
}

async fn handle(services: Arc<Services>, req: Request, op: Operation) -> Response {
	let state = services.state();
	let (parts, body) = req.into_parts();
	let request_id = parts
		.extensions
		.get::<RequestId>()
		.map(|r| r.0.clone());
	let auth = parts.extensions.get::<AuthOutcome>().cloned();

	match run(&services, &state, &parts.headers, auth, body, op).await {
		Ok(resp) => resp,
		Err(err) => err.into_response_with_id(request_id.as_deref()),
	}
}

async fn run(
	services: &Arc<Services>,
	state: &Arc<RelayState>,
	inbound_headers: &HeaderMap,
	auth: Option<AuthOutcome>,
	body: Body,
	op: Operation,
) -> Result<Response, ApiError> {
	let raw = read_body_with_limit(body, state.max_body_bytes).await?;
	let mut value: serde_json::Value =
		serde_json::from_slice(&raw).map_err(|e| ApiError::BodyMalformed(e.to_string()))?;
	let summary = RequestSummary::from_body(&value)
		.ok_or_else(|| ApiError::BodyMalformed("model field is required".to_string()))?;

	if state.debug_options.log_request_body {
		let cap = state.debug_options.body_preview_bytes.min(raw.len());
		debug!(
			model = %summary.model,
			preview = %String::from_utf8_lossy(&raw[..cap]),
			"request body preview"
		);
	}

	let group = signature::model_group(&summary.model).to_string();

	// normalize thinking blocks; untouched requests keep their exact bytes
	let body_bytes: Bytes = if op == Operation::Messages {
		let changed = signature::normalize_request(&mut value, &group, &state.signatures).await;
		if changed {
			Bytes::from(serde_json::to_vec(&value).map_err(|e| {
				ApiError::Internal(format!("body re-encode: {e}"))
			})?)
		} else {
			raw
		}
	} else {
		raw
	};

	let filtered = filter::filter_by_model(&summary.model, &state.providers);
	let strategy = services.router.current();
	let selection = strategy
		.select_for(&summary.model, &filtered)
		.map_err(|_| ApiError::NoProviderAvailable { retry_after: None })?;
	let (mut ordered, can_race) = match selection {
		Selection::One(info) => (vec![info], false),
		Selection::Ordered(infos) => (infos, true),
	};

	let ctx = AttemptContext {
		services,
		state,
		op,
		summary: &summary,
		value: &value,
		bytes: &body_bytes,
		inbound_headers,
		auth: auth.as_ref(),
	};

	let primary = ordered.remove(0);
	let first_err = match attempt(&ctx, &primary).await {
		Ok((resp, key)) => {
			return build_response(state, &primary, key, resp, strategy.name(), &group, op).await;
		},
		Err(DispatchError::Fatal(err)) => return Err(err),
		Err(DispatchError::Eligible(err)) => err,
	};

	if !can_race || ordered.is_empty() {
		return Err(first_err);
	}

	warn!(
		provider = %primary.name,
		error = %first_err,
		remaining = ordered.len(),
		"primary failed; racing remaining providers"
	);
	let race_timeout = Duration::from_millis(state.routing.failover_timeout);
	let (info, resp, key) = race(&ctx, ordered, race_timeout, first_err).await?;
	build_response(state, &info, key, resp, strategy.name(), &group, op).await
}

struct AttemptContext<'a> {
	services: &'a Arc<Services>,
	state: &'a Arc<RelayState>,
	op: Operation,
	summary: &'a RequestSummary,
	value: &'a serde_json::Value,
	bytes: &'a Bytes,
	inbound_headers: &'a HeaderMap,
	auth: Option<&'a AuthOutcome>,
}

/// Keeps the breaker's half-open slot from leaking when an attempt future is
/// dropped mid-race.
struct BreakerGuard<'a> {
	info: &'a ProviderInfo,
	armed: bool,
}

impl<'a> BreakerGuard<'a> {
	fn resolve(mut self, success: bool) {
		self.armed = false;
		if success {
			self.info.breaker.on_success();
		} else {
			self.info.breaker.on_failure();
		}
	}

	fn disarm(mut self) {
		self.armed = false;
		self.info.breaker.release();
	}
}

impl Drop for BreakerGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			self.info.breaker.release();
		}
	}
}

async fn attempt(
	ctx: &AttemptContext<'_>,
	info: &Arc<ProviderInfo>,
) -> Result<(reqwest::Response, Option<Arc<PoolKey>>), DispatchError> {
	if !info.breaker.acquire() {
		return Err(DispatchError::Eligible(ApiError::NoProviderAvailable {
			retry_after: None,
		}));
	}
	let guard = BreakerGuard { info, armed: true };

	let transparent = ctx.state.allow_subscription
		&& info.proxy.adapter.supports_transparent_auth()
		&& ctx
			.auth
			.and_then(|a| a.client_bearer.as_deref())
			.is_some();
	let bearer = if transparent {
		ctx.auth.and_then(|a| a.client_bearer.as_deref())
	} else {
		None
	};

	let key = if transparent {
		// transparent auth bypasses the pool entirely: no debit, no usage
		None
	} else {
		match &info.proxy.keypool {
			Some(pool) => match pool.select() {
				Ok(key) => Some(key),
				Err(PoolError::AllKeysExhausted { retry_after }) => {
					// our keys, not the provider's health; don't count it
					guard.disarm();
					return Err(DispatchError::Eligible(ApiError::AllKeysExhausted {
						retry_after: retry_after.map(|d| d.as_secs().max(1)),
					}));
				},
			},
			None => None,
		}
	};

	match upstream::dispatch(
		&ctx.services.client,
		info,
		ctx.op,
		ctx.summary,
		ctx.value,
		ctx.bytes,
		ctx.inbound_headers,
		key.as_ref(),
		bearer,
		ctx.state.timeout,
	)
	.await
	{
		Ok(resp) => {
			guard.resolve(true);
			Ok((resp, key))
		},
		Err(err @ DispatchError::Eligible(_)) => {
			guard.resolve(false);
			Err(err)
		},
		Err(err @ DispatchError::Fatal(_)) => {
			// 4xx means the provider is alive
			guard.resolve(true);
			Err(err)
		},
	}
}

/// Races the remaining providers; the first success wins and losers are
/// cancelled by drop. A fatal outcome propagates immediately.
async fn race(
	ctx: &AttemptContext<'_>,
	rest: Vec<Arc<ProviderInfo>>,
	timeout: Duration,
	mut last_err: ApiError,
) -> Result<(Arc<ProviderInfo>, reqwest::Response, Option<Arc<PoolKey>>), ApiError> {
	let mut futs = FuturesUnordered::new();
	for info in rest {
		futs.push(async move {
			let outcome = attempt(ctx, &info).await;
			(info, outcome)
		});
	}

	let raced = tokio::time::timeout(timeout, async {
		while let Some((info, outcome)) = futs.next().await {
			match outcome {
				Ok((resp, key)) => return Ok(Some((info, resp, key))),
				Err(DispatchError::Fatal(err)) => return Err(err),
				Err(DispatchError::Eligible(err)) => {
					debug!(provider = %info.name, error = %err, "race attempt failed");
					last_err = err;
				},
			}
		}
		Ok(None)
	})
	.await;

	match raced {
		Err(_) => Err(ApiError::Timeout),
		Ok(Err(fatal)) => Err(fatal),
		Ok(Ok(Some(win))) => Ok(win),
		Ok(Ok(None)) => Err(last_err),
	}
}

async fn build_response(
	state: &Arc<RelayState>,
	info: &Arc<ProviderInfo>,
	key: Option<Arc<PoolKey>>,
	resp: reqwest::Response,
	strategy_name: &'static str,
	group: &str,
	op: Operation,
) -> Result<Response, ApiError> {
	let status = resp.status();
	let content_type = resp
		.headers()
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default()
		.to_string();
	let is_sse = content_type.starts_with("text/event-stream");
	let is_event_stream = content_type.starts_with("application/vnd.amazon.eventstream");

	let meta = RouteMeta {
		provider: Some(info.name.to_string()),
		strategy: Some(strategy_name),
		key_prefix: key.as_ref().map(|k| k.prefix()),
	};

	let mut builder = http::Response::builder().status(status);

	if is_sse || is_event_stream {
		let sink: Option<UsageSink> = key.map(|k| {
			Arc::new(move |input: u64, output: u64| k.record_usage(input, output)) as UsageSink
		});
		let upstream_stream = sse::reqwest_stream(resp);
		let body = if is_event_stream {
			// Bedrock: binary Event Stream -> Anthropic SSE, then the learner
			let translated = aws_sse::into_sse(upstream_stream);
			let translated = translated.into_data_stream().map_err(io::Error::other);
			signature::stream::learn_stream(
				translated,
				state.signatures.clone(),
				group.to_string(),
				sink,
			)
		} else {
			signature::stream::learn_stream(
				upstream_stream,
				state.signatures.clone(),
				group.to_string(),
				sink,
			)
		};

		builder = builder
			.header(header::CONTENT_TYPE, "text/event-stream")
			.header(header::CACHE_CONTROL, "no-cache, no-transform")
			.header("x-accel-buffering", "no")
			.header(header::CONNECTION, "keep-alive");
		if state.routing.debug {
			builder = debug_headers(builder, info, strategy_name);
		}
		let mut resp = builder
			.body(body)
			.map_err(|e| ApiError::Internal(e.to_string()))?;
		resp.extensions_mut().insert(meta);
		return Ok(resp);
	}

	// non-streaming: buffer, learn signatures, account usage, re-emit
	let bytes = crate::http::collect_upstream_body(resp, UPSTREAM_BODY_LIMIT).await?;
	let out: Bytes = match serde_json::from_slice::<serde_json::Value>(&bytes) {
		Ok(mut v) => {
			if let Some(key) = &key {
				let (input, output) = response_usage(&v);
				key.record_usage(input, output);
			}
			let changed = if op == Operation::Messages {
				signature::learn_response(&mut v, group, &state.signatures).await
			} else {
				false
			};
			if changed {
				Bytes::from(serde_json::to_vec(&v).map_err(|e| {
					ApiError::Internal(format!("response re-encode: {e}"))
				})?)
			} else {
				bytes
			}
		},
		Err(_) => bytes,
	};
	builder = builder.header(header::CONTENT_TYPE, "application/json");
	if state.routing.debug {
		builder = debug_headers(builder, info, strategy_name);
	}
	let mut resp = builder
		.body(Body::from(out))
		.map_err(|e| ApiError::Internal(e.to_string()))?;
	resp.extensions_mut().insert(meta);
	Ok(resp)
}

fn debug_headers(
	builder: http::response::Builder,
	info: &Arc<ProviderInfo>,
	strategy_name: &'static str,
) -> http::response::Builder {
	let builder = match HeaderValue::from_str(&info.name) {
		Ok(v) => builder.header("x-cc-relay-provider", v),
		Err(_) => builder,
	};
	builder.header("x-cc-relay-strategy", strategy_name)
}
