//! Anthropic Messages wire types. The request side is deliberately loose:
//! bodies are inspected through `serde_json::Value` so that tool_use blocks,
//! input schemas and beta extensions survive the proxy byte-for-byte.
//! Stream events get typed variants for the SSE scanner, with `rest`
//! catch-alls wherever we might re-serialize.

use serde::{Deserialize, Serialize};

/// The handful of request fields the relay actually reads. Everything else
/// stays inside the raw `serde_json::Value` the handler parsed.
#[derive(Debug, Clone)]
pub struct RequestSummary {
	pub model: String,
	pub stream: bool,
	pub has_thinking_signature: bool,
}

impl RequestSummary {
	/// Extracts model/stream/thinking-signature facts from a parsed body.
	/// `has_thinking_signature` is true iff any content block has
	/// type=thinking with a non-empty signature.
	pub fn from_body(body: &serde_json::Value) -> Option<Self> {
		let model = body.get("model")?.as_str()?.to_string();
		let stream = body
			.get("stream")
			.and_then(serde_json::Value::as_bool)
			.unwrap_or(false);
		let has_thinking_signature = content_blocks(body).any(|block| {
			block.get("type").and_then(|t| t.as_str()) == Some("thinking")
				&& block
					.get("signature")
					.and_then(|s| s.as_str())
					.is_some_and(|s| !s.is_empty())
		});
		Some(Self {
			model,
			stream,
			has_thinking_signature,
		})
	}
}

/// Iterates every content block of every message, in order.
pub fn content_blocks(body: &serde_json::Value) -> impl Iterator<Item = &serde_json::Value> {
	body
		.get("messages")
		.and_then(|m| m.as_array())
		.into_iter()
		.flatten()
		.filter_map(|msg| msg.get("content").and_then(|c| c.as_array()))
		.flatten()
}

/// One streaming event off the wire.
/// https://docs.anthropic.com/en/docs/build-with-claude/streaming
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StreamEvent {
	MessageStart {
		message: MessageStart,
	},
	ContentBlockStart {
		index: usize,
		content_block: serde_json::Value,
	},
	ContentBlockDelta {
		index: usize,
		delta: ContentBlockDelta,
	},
	ContentBlockStop {
		index: usize,
	},
	MessageDelta {
		#[serde(default)]
		delta: serde_json::Value,
		#[serde(default)]
		usage: Option<DeltaUsage>,
	},
	MessageStop,
	Ping,
	Error {
		error: serde_json::Value,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageStart {
	pub id: String,
	pub model: String,
	#[serde(default)]
	pub usage: Option<Usage>,
	#[serde(flatten, default)]
	pub rest: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentBlockDelta {
	TextDelta {
		text: String,
	},
	InputJsonDelta {
		partial_json: String,
	},
	ThinkingDelta {
		thinking: String,
	},
	SignatureDelta {
		signature: String,
	},
	CitationsDelta {
		#[serde(default)]
		citations: serde_json::Value,
	},
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct DeltaUsage {
	#[serde(default)]
	pub input_tokens: Option<u64>,
	#[serde(default)]
	pub output_tokens: Option<u64>,
}

/// Non-streaming response usage, for rate-window accounting.
pub fn response_usage(body: &serde_json::Value) -> (u64, u64) {
	let usage = body.get("usage");
	let input = usage
		.and_then(|u| u.get("input_tokens"))
		.and_then(serde_json::Value::as_u64)
		.unwrap_or(0);
	let output = usage
		.and_then(|u| u.get("output_tokens"))
		.and_then(serde_json::Value::as_u64)
		.unwrap_or(0);
	(input, output)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn summary_reads_model_and_stream() {
		let body = json!({
			"model": "claude-sonnet-4-5",
			"stream": true,
			"messages": [{"role": "user", "content": "ping"}],
		});
		let s = RequestSummary::from_body(&body).unwrap();
		assert_eq!(s.model, "claude-sonnet-4-5");
		assert!(s.stream);
		assert!(!s.has_thinking_signature);
	}

	#[test]
	fn summary_detects_signed_thinking() {
		let body = json!({
			"model": "claude-sonnet-4-5",
			"messages": [{
				"role": "assistant",
				"content": [
					{"type": "thinking", "thinking": "hmm", "signature": "sig-1"},
					{"type": "text", "text": "hi"},
				],
			}],
		});
		assert!(RequestSummary::from_body(&body).unwrap().has_thinking_signature);
	}

	#[test]
	fn summary_ignores_empty_signature() {
		let body = json!({
			"model": "m",
			"messages": [{
				"role": "assistant",
				"content": [{"type": "thinking", "thinking": "hmm", "signature": ""}],
			}],
		});
		assert!(!RequestSummary::from_body(&body).unwrap().has_thinking_signature);
	}

	#[test]
	fn missing_model_is_none() {
		assert!(RequestSummary::from_body(&json!({"messages": []})).is_none());
	}

	#[test]
	fn stream_event_parses_signature_delta() {
		let raw = r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"abc"}}"#;
		let ev: StreamEvent = serde_json::from_str(raw).unwrap();
		match ev {
			StreamEvent::ContentBlockDelta {
				index: 0,
				delta: ContentBlockDelta::SignatureDelta { signature },
			} => assert_eq!(signature, "abc"),
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[test]
	fn unknown_event_tolerated() {
		let ev: StreamEvent =
			serde_json::from_str(r#"{"type":"content_block_fancy","index":9}"#).unwrap();
		assert!(matches!(ev, StreamEvent::Unknown));
	}
}
