//! AWS Event Stream decoding for Bedrock responses.
//!
//! `invoke-with-response-stream` answers with the binary Event Stream
//! framing; each `chunk` event carries a base64 `bytes` payload holding one
//! Anthropic streaming event. This module re-encodes that sequence as the
//! SSE the client expects, in arrival order.

use std::io;

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use aws_smithy_types::event_stream::Message;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

use crate::http::Body;

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
	#[error("event stream protocol error: {0}")]
	Protocol(aws_smithy_eventstream::error::Error),
	#[error(transparent)]
	Io(#[from] io::Error),
}

impl From<aws_smithy_eventstream::error::Error> for EventStreamError {
	fn from(err: aws_smithy_eventstream::error::Error) -> Self {
		Self::Protocol(err)
	}
}

/// `tokio_util` decoder over AWS Smithy's frame decoder.
#[derive(Default)]
pub struct EventStreamCodec {
	inner: MessageFrameDecoder,
}

impl Decoder for EventStreamCodec {
	type Item = Message;
	type Error = EventStreamError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, EventStreamError> {
		match self.inner.decode_frame(src)? {
			DecodedFrame::Complete(message) => Ok(Some(message)),
			DecodedFrame::Incomplete => Ok(None),
		}
	}
}

fn header_str<'a>(msg: &'a Message, name: &str) -> Option<&'a str> {
	msg
		.headers()
		.iter()
		.find(|h| h.name().as_str() == name)
		.and_then(|h| h.value().as_string().ok())
		.map(|s| s.as_str())
}

#[derive(Deserialize)]
struct ChunkPayload {
	bytes: String,
}

/// Renders one decoded frame as SSE bytes, or None for frames with nothing
/// to tell the client (unknown event types, undecodable chunks).
fn frame_to_sse(msg: &Message) -> Option<Bytes> {
	let message_type = header_str(msg, ":message-type").unwrap_or("event");
	if message_type != "event" {
		// exception or error frame: surface as an Anthropic error event
		let kind = header_str(msg, ":exception-type").unwrap_or("api_error");
		let data = serde_json::json!({
			"type": "error",
			"error": {"type": "api_error", "message": format!("upstream stream error: {kind}")},
		});
		return Some(Bytes::from(format!("event: error\ndata: {data}\n\n")));
	}
	match header_str(msg, ":event-type") {
		Some("chunk") | None => {
			let payload: ChunkPayload = serde_json::from_slice(msg.payload()).ok()?;
			let inner = base64::engine::general_purpose::STANDARD
				.decode(payload.bytes)
				.ok()?;
			let event: serde_json::Value = serde_json::from_slice(&inner).ok()?;
			let name = event.get("type").and_then(|t| t.as_str())?.to_string();
			let data = String::from_utf8(inner).ok()?;
			Some(Bytes::from(format!("event: {name}\ndata: {data}\n\n")))
		},
		Some(_) => None,
	}
}

/// Translates a Bedrock Event Stream body into Anthropic SSE.
pub fn into_sse<S>(upstream: S) -> Body
where
	S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
	let reader = StreamReader::new(upstream);
	let frames = FramedRead::new(reader, EventStreamCodec::default());
	let out = frames.filter_map(|frame| async move {
		match frame {
			Ok(msg) => frame_to_sse(&msg).map(Ok),
			Err(e) => Some(Err(io::Error::other(e))),
		}
	});
	Body::from_stream(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use aws_smithy_eventstream::frame::write_message_to;
	use aws_smithy_types::event_stream::{Header, HeaderValue};
	use aws_smithy_types::str_bytes::StrBytes;

	fn chunk_message(inner_json: &str) -> Vec<u8> {
		let payload = serde_json::json!({
			"bytes": base64::engine::general_purpose::STANDARD.encode(inner_json),
		});
		let msg = Message::new(Bytes::from(payload.to_string()))
			.add_header(Header::new(
				":message-type",
				HeaderValue::String(StrBytes::from("event")),
			))
			.add_header(Header::new(
				":event-type",
				HeaderValue::String(StrBytes::from("chunk")),
			));
		let mut buf = Vec::new();
		write_message_to(&msg, &mut buf).unwrap();
		buf
	}

	#[tokio::test]
	async fn chunk_becomes_named_sse_event() {
		let wire = chunk_message(r#"{"type":"message_start","message":{"id":"m1","model":"claude"}}"#);
		let body = into_sse(futures_util::stream::iter(vec![Ok(Bytes::from(wire))]));
		let out = crate::http::body_to_bytes(body).await;
		let text = String::from_utf8(out.to_vec()).unwrap();
		assert!(text.starts_with("event: message_start\ndata: {\"type\":\"message_start\""));
		assert!(text.ends_with("\n\n"));
	}

	#[tokio::test]
	async fn events_keep_arrival_order() {
		let mut wire = chunk_message(r#"{"type":"content_block_start","index":0}"#);
		wire.extend(chunk_message(r#"{"type":"content_block_stop","index":0}"#));
		let body = into_sse(futures_util::stream::iter(vec![Ok(Bytes::from(wire))]));
		let text = String::from_utf8(crate::http::body_to_bytes(body).await.to_vec()).unwrap();
		let start = text.find("content_block_start").unwrap();
		let stop = text.find("content_block_stop").unwrap();
		assert!(start < stop);
	}
}
