//! Client-facing HTTP plumbing: body aliases, bounded reads, and
//! Anthropic-shaped error responses.

use axum::response::IntoResponse;
use bytes::Bytes;
use http::{HeaderValue, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::json;

pub mod auth;
pub mod middleware;

pub type Body = axum::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// Reads a request body into memory, rejecting anything over `limit` bytes.
pub async fn read_body_with_limit(body: Body, limit: usize) -> Result<Bytes, ApiError> {
	match axum::body::to_bytes(body, limit).await {
		Ok(b) => Ok(b),
		Err(_) => Err(ApiError::BodyTooLarge { limit }),
	}
}

/// Collects an upstream response body with a cap, for the non-streaming path.
pub async fn collect_upstream_body(
	body: reqwest::Response,
	limit: usize,
) -> Result<Bytes, ApiError> {
	let mut buf = Vec::new();
	let mut stream = body.bytes_stream();
	use futures_util::StreamExt;
	while let Some(chunk) = stream.next().await {
		let chunk = chunk.map_err(|e| ApiError::UpstreamTransport(e.to_string()))?;
		if buf.len() + chunk.len() > limit {
			return Err(ApiError::Internal("upstream response too large".to_string()));
		}
		buf.extend_from_slice(&chunk);
	}
	Ok(Bytes::from(buf))
}

/// Everything the relay can fail with on the client-facing side. Each kind
/// maps to an HTTP status and an Anthropic error-type tag; bodies are always
/// `{"type":"error","error":{"type":...,"message":...}}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
	#[error("missing credentials")]
	AuthMissing,
	#[error("invalid credentials")]
	AuthInvalid,
	#[error("request body exceeds {limit} bytes")]
	BodyTooLarge { limit: usize },
	#[error("malformed request body: {0}")]
	BodyMalformed(String),
	#[error("unknown model {0:?}")]
	UnknownModel(String),
	#[error("operation not supported: {0}")]
	UnsupportedOperation(String),
	#[error("server is at capacity")]
	Overloaded,
	#[error("no provider available")]
	NoProviderAvailable { retry_after: Option<u64> },
	#[error("all keys exhausted")]
	AllKeysExhausted { retry_after: Option<u64> },
	#[error("upstream rate limited")]
	UpstreamRateLimited { body: Option<Bytes> },
	#[error("upstream server error ({status})")]
	UpstreamServerError { status: u16, body: Option<Bytes> },
	#[error("upstream client error ({status})")]
	UpstreamClientError { status: u16, body: Option<Bytes> },
	#[error("upstream transport failure: {0}")]
	UpstreamTransport(String),
	#[error("request deadline exceeded")]
	Timeout,
	#[error("request cancelled")]
	Cancelled,
	#[error("internal error: {0}")]
	Internal(String),
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::AuthMissing | ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
			ApiError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
			ApiError::BodyMalformed(_) | ApiError::UnknownModel(_) => StatusCode::BAD_REQUEST,
			ApiError::UnsupportedOperation(_) => StatusCode::NOT_FOUND,
			ApiError::Overloaded
			| ApiError::NoProviderAvailable { .. }
			| ApiError::AllKeysExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
			ApiError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ApiError::UpstreamServerError { status, .. }
			| ApiError::UpstreamClientError { status, .. } => {
				StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
			},
			ApiError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
			ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ApiError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Anthropic wire tag for the error type.
	fn kind(&self) -> &'static str {
		match self {
			ApiError::AuthMissing | ApiError::AuthInvalid => "authentication_error",
			ApiError::BodyTooLarge { .. } => "request_too_large",
			ApiError::BodyMalformed(_)
			| ApiError::UnknownModel(_)
			| ApiError::UpstreamClientError { .. } => "invalid_request_error",
			ApiError::UnsupportedOperation(_) => "not_found_error",
			ApiError::Overloaded
			| ApiError::NoProviderAvailable { .. }
			| ApiError::AllKeysExhausted { .. } => "overloaded_error",
			ApiError::UpstreamRateLimited { .. } => "rate_limit_error",
			ApiError::UpstreamServerError { .. }
			| ApiError::UpstreamTransport(_)
			| ApiError::Timeout
			| ApiError::Cancelled
			| ApiError::Internal(_) => "api_error",
		}
	}

	fn retry_after(&self) -> Option<u64> {
		match self {
			ApiError::NoProviderAvailable { retry_after }
			| ApiError::AllKeysExhausted { retry_after } => *retry_after,
			_ => None,
		}
	}

	/// Client-safe message. Upstream diagnostics are replaced with the
	/// sanitized body when one is available, generic text otherwise.
	fn client_message(&self, correlation_id: Option<&str>) -> String {
		match self {
			ApiError::UpstreamRateLimited { body }
			| ApiError::UpstreamServerError { body, .. }
			| ApiError::UpstreamClientError { body, .. } => {
				if let Some(msg) = body.as_deref().and_then(extract_error_message) {
					return msg;
				}
				"upstream provider error".to_string()
			},
			ApiError::UpstreamTransport(_) => "upstream provider unreachable".to_string(),
			ApiError::Internal(_) => match correlation_id {
				Some(id) => format!("internal error (request {id})"),
				None => "internal error".to_string(),
			},
			other => other.to_string(),
		}
	}

	pub fn into_response_with_id(self, request_id: Option<&str>) -> Response {
		let status = self.status();
		let body = json!({
			"type": "error",
			"error": {
				"type": self.kind(),
				"message": self.client_message(request_id),
			},
		});
		let mut resp = ::http::Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.expect("static response");
		if let Some(secs) = self.retry_after() {
			resp.headers_mut().insert(
				header::RETRY_AFTER,
				HeaderValue::from_str(&secs.to_string()).expect("numeric header"),
			);
		}
		resp
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> axum::response::Response {
		self.into_response_with_id(None)
	}
}

/// Pulls `error.message` out of an upstream Anthropic-shaped error body.
/// Anything that does not parse, or any extra fields (internal IPs, trace
/// ids, echoed credentials), is discarded.
fn extract_error_message(body: &[u8]) -> Option<String> {
	let v: serde_json::Value = serde_json::from_slice(body).ok()?;
	let msg = v.get("error")?.get("message")?.as_str()?;
	let mut msg = msg.to_string();
	msg.truncate(512);
	Some(msg)
}

/// Re-encodes an upstream error body down to the Anthropic shape, dropping
/// every field other than the error type and message.
pub fn sanitize_error_body(status: StatusCode, body: &[u8]) -> Bytes {
	let (kind, message) = match serde_json::from_slice::<serde_json::Value>(body) {
		Ok(v) => {
			let kind = v
				.get("error")
				.and_then(|e| e.get("type"))
				.and_then(|t| t.as_str())
				.unwrap_or("api_error")
				.to_string();
			let message = v
				.get("error")
				.and_then(|e| e.get("message"))
				.and_then(|m| m.as_str())
				.map(|m| {
					let mut m = m.to_string();
					m.truncate(512);
					m
				})
				.unwrap_or_else(|| generic_message(status).to_string());
			(kind, message)
		},
		Err(_) => ("api_error".to_string(), generic_message(status).to_string()),
	};
	let body = json!({
		"type": "error",
		"error": {"type": kind, "message": message},
	});
	Bytes::from(body.to_string())
}

fn generic_message(status: StatusCode) -> &'static str {
	match status.as_u16() {
		429 => "upstream rate limit exceeded",
		500 => "upstream internal error",
		502 => "upstream bad gateway",
		503 => "upstream overloaded",
		504 => "upstream timeout",
		_ => "upstream provider error",
	}
}

/// Buffers a full axum body; test helper and reload-path convenience.
pub async fn body_to_bytes(body: Body) -> Bytes {
	body
		.collect()
		.await
		.map(|c| c.to_bytes())
		.unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_body_is_anthropic_shaped() {
		let resp = ApiError::AuthMissing.into_response_with_id(None);
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[test]
	fn sanitize_strips_extra_fields() {
		let upstream = br#"{"type":"error","error":{"type":"overloaded_error","message":"slow down"},"internal_trace":"10.0.0.3:9200","api_key":"sk-secret"}"#;
		let out = sanitize_error_body(StatusCode::SERVICE_UNAVAILABLE, upstream);
		let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
		assert_eq!(v["error"]["message"], "slow down");
		assert_eq!(v["error"]["type"], "overloaded_error");
		assert!(v.get("internal_trace").is_none());
		assert!(v.get("api_key").is_none());
	}

	#[test]
	fn sanitize_handles_garbage() {
		let out = sanitize_error_body(StatusCode::BAD_GATEWAY, b"<html>nginx</html>");
		let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
		assert_eq!(v["error"]["message"], "upstream bad gateway");
	}

	#[test]
	fn retry_after_header_set() {
		let resp = ApiError::AllKeysExhausted {
			retry_after: Some(17),
		}
		.into_response_with_id(None);
		assert_eq!(resp.headers()[header::RETRY_AFTER], "17");
	}
}
