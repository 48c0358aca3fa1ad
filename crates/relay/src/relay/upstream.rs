//! One upstream attempt: finalize the body for the chosen provider, attach
//! headers and credentials, send, and classify the outcome as success,
//! failover-eligible failure, or fatal.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use tracing::debug;

use crate::http::ApiError;
use crate::provider::{Operation, Provider, ProviderError};
use crate::routing::ProviderInfo;
use crate::routing::keypool::PoolKey;
use crate::types::messages::RequestSummary;

/// Statuses that permit re-attempting on another provider, plus transport
/// failures. Everything else is final.
pub fn failover_eligible(status: u16) -> bool {
	matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[derive(Debug)]
pub enum DispatchError {
	/// Router may retry elsewhere (nothing was written to the client).
	Eligible(ApiError),
	/// Propagate to the client as-is; racing would be wrong.
	Fatal(ApiError),
}

impl DispatchError {
	pub fn into_api_error(self) -> ApiError {
		match self {
			DispatchError::Eligible(e) | DispatchError::Fatal(e) => e,
		}
	}
}

fn provider_error(err: ProviderError, model: &str) -> DispatchError {
	match err {
		ProviderError::NotInferenceProfile(_) => {
			DispatchError::Fatal(ApiError::UnknownModel(model.to_string()))
		},
		ProviderError::UnsupportedOperation => {
			DispatchError::Fatal(ApiError::UnsupportedOperation(
				"this provider does not support the requested operation".to_string(),
			))
		},
		ProviderError::UnsupportedContent(msg) => {
			DispatchError::Fatal(ApiError::BodyMalformed(msg))
		},
		other => DispatchError::Fatal(ApiError::Internal(other.to_string())),
	}
}

/// Sends the request to one provider and returns its (not yet consumed)
/// response. The caller owns breaker bookkeeping.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
	client: &reqwest::Client,
	info: &ProviderInfo,
	op: Operation,
	summary: &RequestSummary,
	body_value: &serde_json::Value,
	body_bytes: &Bytes,
	inbound_headers: &HeaderMap,
	key: Option<&Arc<PoolKey>>,
	transparent_bearer: Option<&str>,
	timeout: Duration,
) -> Result<reqwest::Response, DispatchError> {
	let adapter = &info.proxy.adapter;
	let mapped = info.proxy.map_model(&summary.model);

	adapter
		.validate_request(body_value)
		.map_err(|e| provider_error(e, &summary.model))?;

	let url = adapter
		.target_url(mapped, op, summary.stream)
		.map_err(|e| provider_error(e, &summary.model))?;

	// the original bytes go out untouched unless this provider needs edits
	let final_bytes: Bytes = if mapped != summary.model || adapter.has_body_transform() {
		let mut work = body_value.clone();
		if mapped != summary.model {
			if let Some(obj) = work.as_object_mut() {
				obj.insert(
					"model".to_string(),
					serde_json::Value::String(mapped.to_string()),
				);
			}
		}
		adapter
			.transform_request(&mut work)
			.map_err(|e| provider_error(e, &summary.model))?;
		Bytes::from(serde_json::to_vec(&work).map_err(|e| {
			DispatchError::Fatal(ApiError::Internal(format!("body re-encode: {e}")))
		})?)
	} else {
		body_bytes.clone()
	};

	let mut headers = HeaderMap::new();
	adapter.forward_headers(inbound_headers, &mut headers);
	headers.insert(
		http::header::CONTENT_TYPE,
		HeaderValue::from_static("application/json"),
	);
	adapter
		.authenticate(
			&mut headers,
			&Method::POST,
			&url,
			&final_bytes,
			key.map(|k| k.secret()),
			transparent_bearer,
		)
		.await
		.map_err(|e| provider_error(e, &summary.model))?;

	debug!(provider = %info.name, url = %url, "dispatching upstream");
	let send = client
		.post(url)
		.headers(headers)
		.body(final_bytes)
		.send();
	let resp = match tokio::time::timeout(timeout, send).await {
		Err(_) => return Err(DispatchError::Eligible(ApiError::Timeout)),
		Ok(Err(e)) if e.is_timeout() => {
			return Err(DispatchError::Eligible(ApiError::Timeout));
		},
		Ok(Err(e)) => {
			return Err(DispatchError::Eligible(ApiError::UpstreamTransport(
				e.to_string(),
			)));
		},
		Ok(Ok(resp)) => resp,
	};

	let status = resp.status().as_u16();
	if resp.status().is_success() {
		return Ok(resp);
	}

	// error body, bounded; only its sanitized form ever reaches the client
	let body = resp.bytes().await.ok().map(|b| {
		if b.len() > 64 * 1024 {
			b.slice(..64 * 1024)
		} else {
			b
		}
	});

	if failover_eligible(status) {
		let err = match status {
			429 => ApiError::UpstreamRateLimited { body },
			_ => ApiError::UpstreamServerError { status, body },
		};
		Err(DispatchError::Eligible(err))
	} else {
		Err(DispatchError::Fatal(ApiError::UpstreamClientError {
			status,
			body,
		}))
	}
}
