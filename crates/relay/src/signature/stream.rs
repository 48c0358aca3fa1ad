//! Response-path signature learning for streaming responses.
//!
//! A scanner composed with the SSE passthrough accumulates `thinking_delta`
//! text per content-block index; when a `signature_delta` arrives, the
//! (group, text) pair is written to the cache and the outgoing event is
//! rewritten with the prefixed signature. Every other event passes through
//! with its original bytes.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::Stream;

use crate::http::Body;
use crate::parse::sse::{SseFrame, transform_body};
use crate::signature::{SignatureCache, wrap_signature};
use crate::types::messages::{ContentBlockDelta, StreamEvent};

/// Token counts observed while streaming, fed back into the selected key's
/// rate window.
pub type UsageSink = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub fn learn_stream<S>(
	upstream: S,
	cache: Arc<SignatureCache>,
	group: String,
	usage_sink: Option<UsageSink>,
) -> Body
where
	S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
	let mut thinking: HashMap<usize, String> = HashMap::new();
	let mut reported_output: u64 = 0;

	transform_body(upstream, move |frame: &SseFrame| {
		let data = frame.data.as_deref()?;
		let event: StreamEvent = serde_json::from_str(data).ok()?;
		match event {
			StreamEvent::ContentBlockStart {
				index,
				content_block,
			} => {
				if content_block.get("type").and_then(|t| t.as_str()) == Some("thinking") {
					let seed = content_block
						.get("thinking")
						.and_then(|t| t.as_str())
						.unwrap_or_default()
						.to_string();
					thinking.insert(index, seed);
				}
				None
			},
			StreamEvent::ContentBlockDelta { index, delta } => match delta {
				ContentBlockDelta::ThinkingDelta { thinking: text } => {
					thinking.entry(index).or_default().push_str(&text);
					None
				},
				ContentBlockDelta::SignatureDelta { signature } => {
					let text = thinking.get(&index).cloned().unwrap_or_default();
					let learn_cache = cache.clone();
					let learn_group = group.clone();
					let learn_sig = signature.clone();
					// learning happens off the streaming path; a failed write
					// only costs future cross-provider continuity
					tokio::spawn(async move {
						learn_cache.learn(&learn_group, &text, &learn_sig).await;
					});

					let wrapped = wrap_signature(&group, &signature);
					let mut value: serde_json::Value = serde_json::from_str(data).ok()?;
					value
						.get_mut("delta")
						.and_then(|d| d.as_object_mut())
						.map(|d| {
							d.insert(
								"signature".to_string(),
								serde_json::Value::String(wrapped),
							)
						})?;
					Some(frame.with_data(&value.to_string()))
				},
				_ => None,
			},
			StreamEvent::ContentBlockStop { index } => {
				thinking.remove(&index);
				None
			},
			StreamEvent::MessageStart { message } => {
				if let (Some(sink), Some(usage)) = (&usage_sink, message.usage) {
					sink(usage.input_tokens, usage.output_tokens);
					reported_output = usage.output_tokens;
				}
				None
			},
			StreamEvent::MessageDelta { usage, .. } => {
				if let (Some(sink), Some(usage)) = (&usage_sink, usage) {
					if let Some(total) = usage.output_tokens {
						let delta = total.saturating_sub(reported_output);
						if delta > 0 {
							sink(0, delta);
							reported_output = total;
						}
					}
				}
				None
			},
			_ => None,
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::MokaStore;
	use std::time::Duration;

	fn cache() -> Arc<SignatureCache> {
		Arc::new(SignatureCache::new(
			Arc::new(MokaStore::new(1024 * 1024)),
			Duration::from_secs(60),
		))
	}

	fn stream_of(
		bytes: &'static [u8],
	) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
		futures_util::stream::iter(vec![Ok(Bytes::from_static(bytes))])
	}

	const THINKING_STREAM: &[u8] = b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n\
event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"thinking\",\"thinking\":\"\"}}\n\n\
event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"think-123\"}}\n\n\
event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"signature_delta\",\"signature\":\"sig-xyz\"}}\n\n\
event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";

	#[tokio::test]
	async fn learns_and_prefixes_signature() {
		let cache = cache();
		let body = learn_stream(
			stream_of(THINKING_STREAM),
			cache.clone(),
			"claude".to_string(),
			None,
		);
		let out = crate::http::body_to_bytes(body).await;
		let text = String::from_utf8(out.to_vec()).unwrap();
		assert!(text.contains("ccr1:claude:sig-xyz"), "got: {text}");
		// give the spawned learn task a moment
		tokio::task::yield_now().await;
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(
			cache.lookup("claude", "think-123").await.as_deref(),
			Some("sig-xyz")
		);
	}

	#[tokio::test]
	async fn non_signature_events_are_byte_identical() {
		let body = learn_stream(
			stream_of(THINKING_STREAM),
			cache(),
			"claude".to_string(),
			None,
		);
		let out = crate::http::body_to_bytes(body).await;
		let text = String::from_utf8(out.to_vec()).unwrap();
		// every event except the signature_delta must be untouched
		assert!(text.contains("event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\""));
		assert!(text.contains("event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"thinking_delta\",\"thinking\":\"think-123\"}}"));
		assert!(text.contains("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
	}

	#[tokio::test]
	async fn usage_reported_to_sink() {
		let totals = Arc::new(std::sync::Mutex::new((0u64, 0u64)));
		let totals2 = totals.clone();
		let sink: UsageSink = Arc::new(move |input, output| {
			let mut t = totals2.lock().unwrap();
			t.0 += input;
			t.1 += output;
		});
		const WITH_DELTA: &[u8] = b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\",\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n\
event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":9}}\n\n\
event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";
		let body = learn_stream(
			stream_of(WITH_DELTA),
			cache(),
			"claude".to_string(),
			Some(sink),
		);
		crate::http::body_to_bytes(body).await;
		let t = *totals.lock().unwrap();
		assert_eq!(t.0, 12);
		assert_eq!(t.1, 9);
	}
}
