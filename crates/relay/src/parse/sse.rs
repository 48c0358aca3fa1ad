//! A line-delimited SSE scanner expressed as a body transform.
//!
//! The decoder splits the upstream byte stream into whole events while
//! keeping the original bytes of each event. A transform callback may swap
//! an event for rewritten bytes; everything it declines passes through with
//! the exact bytes that arrived, so the proxy never perturbs upstream
//! framing, field order, or whitespace.

use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

use crate::http::Body;

/// One SSE frame. `raw` is the untouched wire representation including the
/// blank-line terminator; `event`/`data` are parsed views for inspection.
#[derive(Debug, Clone)]
pub struct SseFrame {
	pub raw: Bytes,
	pub event: Option<String>,
	pub data: Option<String>,
	/// Set when the stream ended mid-event and `raw` is an unterminated tail.
	pub partial: bool,
}

impl SseFrame {
	fn parse(raw: Bytes, partial: bool) -> Self {
		let text = String::from_utf8_lossy(&raw);
		let mut event = None;
		let mut data_lines: Vec<&str> = Vec::new();
		for line in text.lines() {
			if let Some(v) = line.strip_prefix("event:") {
				event = Some(v.trim_start_matches(' ').to_string());
			} else if let Some(v) = line.strip_prefix("data:") {
				data_lines.push(v.strip_prefix(' ').unwrap_or(v));
			}
		}
		let data = if data_lines.is_empty() {
			None
		} else {
			Some(data_lines.join("\n"))
		};
		Self {
			raw,
			event,
			data,
			partial,
		}
	}

	/// Rebuilds an event with replacement data, preserving the event name.
	pub fn with_data(&self, data: &str) -> Bytes {
		let mut out = String::new();
		if let Some(ev) = &self.event {
			out.push_str("event: ");
			out.push_str(ev);
			out.push('\n');
		}
		out.push_str("data: ");
		out.push_str(data);
		out.push_str("\n\n");
		Bytes::from(out)
	}
}

/// Splits on the SSE event terminator (`\n\n` or `\r\n\r\n`).
#[derive(Default)]
pub struct SseFrameCodec;

fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
	let mut i = 0;
	while i + 1 < buf.len() {
		if buf[i] == b'\n' && buf[i + 1] == b'\n' {
			return Some((i, 2));
		}
		if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
			return Some((i, 4));
		}
		i += 1;
	}
	None
}

impl Decoder for SseFrameCodec {
	type Item = SseFrame;
	type Error = io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, io::Error> {
		match find_terminator(src) {
			Some((at, len)) => {
				let raw = src.split_to(at + len).freeze();
				Ok(Some(SseFrame::parse(raw, false)))
			},
			None => Ok(None),
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, io::Error> {
		if let Some(frame) = self.decode(src)? {
			return Ok(Some(frame));
		}
		if src.is_empty() {
			return Ok(None);
		}
		let raw = src.split().freeze();
		Ok(Some(SseFrame::parse(raw, true)))
	}
}

/// Wraps an upstream byte stream in the scanner. The callback returns
/// `Some(bytes)` to substitute an event or `None` to pass the original bytes
/// through untouched. Each event is emitted as its own frame, so nothing is
/// held longer than one write.
pub fn transform_body<S>(
	upstream: S,
	mut f: impl FnMut(&SseFrame) -> Option<Bytes> + Send + 'static,
) -> Body
where
	S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
{
	let reader = StreamReader::new(upstream);
	let frames = FramedRead::new(reader, SseFrameCodec);
	let out = frames.map(move |frame| match frame {
		Ok(frame) => {
			if frame.partial {
				// never rewrite a torn tail
				return Ok(frame.raw);
			}
			match f(&frame) {
				Some(replacement) => Ok(replacement),
				None => Ok(frame.raw),
			}
		},
		Err(e) => Err(e),
	});
	Body::from_stream(out)
}

/// Adapter for reqwest response streams.
pub fn reqwest_stream(
	resp: reqwest::Response,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send {
	resp.bytes_stream().map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn collect(body: Body) -> Bytes {
		crate::http::body_to_bytes(body).await
	}

	fn chunks(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, io::Error>> {
		futures_util::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
	}

	#[tokio::test]
	async fn passthrough_is_byte_exact() {
		let wire: &[u8] = b"event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: ping\ndata: {\"type\": \"ping\"}\n\n";
		let body = transform_body(chunks(vec![wire]), |_| None);
		assert_eq!(collect(body).await, Bytes::from_static(wire));
	}

	#[tokio::test]
	async fn passthrough_survives_arbitrary_chunking() {
		let wire = b"event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0}\n\n";
		// split mid-line
		let body = transform_body(
			chunks(vec![&wire[..10], &wire[10..11], &wire[11..]]),
			|_| None,
		);
		assert_eq!(collect(body).await, Bytes::from_static(wire));
	}

	#[tokio::test]
	async fn crlf_terminator_preserved() {
		let wire: &[u8] = b"event: ping\r\ndata: {}\r\n\r\n";
		let body = transform_body(chunks(vec![wire]), |_| None);
		assert_eq!(collect(body).await, Bytes::from_static(wire));
	}

	#[tokio::test]
	async fn unterminated_tail_flushed_verbatim() {
		let wire: &[u8] = b"event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: mess";
		let body = transform_body(chunks(vec![wire]), |_| None);
		assert_eq!(collect(body).await, Bytes::from_static(wire));
	}

	#[tokio::test]
	async fn callback_sees_parsed_fields() {
		let wire: &[u8] = b"event: content_block_delta\ndata: {\"a\":1}\n\n";
		let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let seen2 = seen.clone();
		let body = transform_body(chunks(vec![wire]), move |f| {
			seen2
				.lock()
				.unwrap()
				.push((f.event.clone(), f.data.clone()));
			None
		});
		collect(body).await;
		let seen = seen.lock().unwrap();
		assert_eq!(
			seen[0],
			(
				Some("content_block_delta".to_string()),
				Some("{\"a\":1}".to_string())
			)
		);
	}

	#[tokio::test]
	async fn rewrite_replaces_single_event_only() {
		let wire: &[u8] = b"event: a\ndata: {\"n\":1}\n\nevent: b\ndata: {\"n\":2}\n\n";
		let body = transform_body(chunks(vec![wire]), |f| {
			if f.event.as_deref() == Some("b") {
				Some(f.with_data("{\"n\":99}"))
			} else {
				None
			}
		});
		assert_eq!(
			collect(body).await,
			Bytes::from_static(b"event: a\ndata: {\"n\":1}\n\nevent: b\ndata: {\"n\":99}\n\n")
		);
	}

	#[tokio::test]
	async fn multiline_data_joined() {
		let wire: &[u8] = b"data: line1\ndata: line2\n\n";
		let captured = std::sync::Arc::new(std::sync::Mutex::new(None));
		let c2 = captured.clone();
		let body = transform_body(chunks(vec![wire]), move |f| {
			*c2.lock().unwrap() = f.data.clone();
			None
		});
		collect(body).await;
		assert_eq!(captured.lock().unwrap().as_deref(), Some("line1\nline2"));
	}
}
