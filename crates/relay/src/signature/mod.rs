//! Extended-thinking signature discipline.
//!
//! A thinking signature only validates with the provider family that minted
//! it. Because consecutive turns of one conversation may route to different
//! backends, the relay rewrites thinking blocks on the way in (strip our
//! prefix, substitute a cached signature for the destination's model group,
//! or drop the block) and learns signatures on the way out, re-emitting them
//! wrapped in a prefix that names the group they came from.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::cache::SignatureStore;

pub mod stream;

/// Wire prefix for signatures that passed through this relay. The full form
/// is `ccr1:<group>:<signature>`; wrapping is idempotent and stripping is
/// its exact inverse.
pub const PREFIX_TAG: &str = "ccr1";

/// Gemini never returns a learnable signature; requests into the gemini
/// group carry this sentinel instead of dropping the block.
pub const GEMINI_SENTINEL: &str = "skip_thought_signature_validator";

/// Families of models that accept each other's thinking signatures.
pub fn model_group(model: &str) -> &str {
	if model.starts_with("claude") {
		"claude"
	} else if model.starts_with("gpt") {
		"gpt"
	} else if model.starts_with("gemini") {
		"gemini"
	} else {
		model
	}
}

pub fn wrap_signature(group: &str, signature: &str) -> String {
	if strip_signature(signature).is_some() {
		return signature.to_string();
	}
	format!("{PREFIX_TAG}:{group}:{signature}")
}

/// Returns `(group, inner)` when the value carries our prefix.
pub fn strip_signature(signature: &str) -> Option<(&str, &str)> {
	let rest = signature.strip_prefix(PREFIX_TAG)?.strip_prefix(':')?;
	rest.split_once(':')
}

fn cache_key(group: &str, thinking_text: &str) -> String {
	let digest = Sha256::digest(thinking_text.as_bytes());
	format!("sig:{group}:{}", hex::encode(digest))
}

pub struct SignatureCache {
	store: Arc<dyn SignatureStore>,
	ttl: Duration,
}

impl SignatureCache {
	pub fn new(store: Arc<dyn SignatureStore>, ttl: Duration) -> Self {
		Self { store, ttl }
	}

	pub async fn lookup(&self, group: &str, thinking_text: &str) -> Option<String> {
		let value = self.store.get(&cache_key(group, thinking_text)).await?;
		String::from_utf8(value.to_vec()).ok()
	}

	pub async fn learn(&self, group: &str, thinking_text: &str, signature: &str) {
		self
			.store
			.set_with_ttl(
				&cache_key(group, thinking_text),
				Bytes::from(signature.as_bytes().to_vec()),
				self.ttl,
			)
			.await;
	}
}

/// Request-path normalization for every `thinking` content block:
/// a prefixed signature is unwrapped (cache-substituted when it was minted by
/// a different group), a raw signature passes through, and an unsigned block
/// is filled from the cache or dropped. Returns whether the body changed.
pub async fn normalize_request(
	body: &mut serde_json::Value,
	dest_group: &str,
	cache: &SignatureCache,
) -> bool {
	let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
		return false;
	};
	let mut changed = false;
	for message in messages.iter_mut() {
		let Some(content) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
			continue;
		};
		let mut rewritten: Vec<serde_json::Value> = Vec::with_capacity(content.len());
		let mut message_changed = false;
		for mut block in content.drain(..) {
			if block.get("type").and_then(|t| t.as_str()) != Some("thinking") {
				rewritten.push(block);
				continue;
			}
			let thinking_text = block
				.get("thinking")
				.and_then(|t| t.as_str())
				.unwrap_or_default()
				.to_string();
			let signature = block
				.get("signature")
				.and_then(|s| s.as_str())
				.unwrap_or_default()
				.to_string();

			let resolved: Option<String> = if let Some((group, inner)) = strip_signature(&signature) {
				if group == dest_group {
					Some(inner.to_string())
				} else {
					cache.lookup(dest_group, &thinking_text).await
				}
			} else if !signature.is_empty() {
				// raw signature from the client; forward untouched
				rewritten.push(block);
				continue;
			} else {
				cache.lookup(dest_group, &thinking_text).await
			};

			let resolved = match resolved {
				Some(sig) => Some(sig),
				None if dest_group == "gemini" => Some(GEMINI_SENTINEL.to_string()),
				None => None,
			};

			match resolved {
				Some(sig) => {
					if sig != signature {
						if let Some(obj) = block.as_object_mut() {
							obj.insert("signature".to_string(), serde_json::Value::String(sig));
						}
						message_changed = true;
					}
					rewritten.push(block);
				},
				None => {
					// unsigned and unknown: the upstream would reject it
					message_changed = true;
				},
			}
		}
		*content = rewritten;
		changed |= message_changed;
	}
	changed
}

/// Response-path learning for the non-streaming case: store every signed
/// thinking block and re-emit its signature in prefixed form.
pub async fn learn_response(
	body: &mut serde_json::Value,
	group: &str,
	cache: &SignatureCache,
) -> bool {
	let Some(content) = body.get_mut("content").and_then(|c| c.as_array_mut()) else {
		return false;
	};
	let mut changed = false;
	for block in content.iter_mut() {
		if block.get("type").and_then(|t| t.as_str()) != Some("thinking") {
			continue;
		}
		let thinking_text = block
			.get("thinking")
			.and_then(|t| t.as_str())
			.unwrap_or_default()
			.to_string();
		let Some(signature) = block
			.get("signature")
			.and_then(|s| s.as_str())
			.filter(|s| !s.is_empty())
			.map(str::to_string)
		else {
			continue;
		};
		cache.learn(group, &thinking_text, &signature).await;
		let wrapped = wrap_signature(group, &signature);
		if wrapped != signature {
			if let Some(obj) = block.as_object_mut() {
				obj.insert("signature".to_string(), serde_json::Value::String(wrapped));
			}
			changed = true;
		}
	}
	changed
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::MokaStore;
	use serde_json::json;

	fn cache() -> SignatureCache {
		SignatureCache::new(Arc::new(MokaStore::new(1024 * 1024)), Duration::from_secs(60))
	}

	#[test]
	fn groups_by_prefix() {
		assert_eq!(model_group("claude-sonnet-4-5"), "claude");
		assert_eq!(model_group("gpt-4o"), "gpt");
		assert_eq!(model_group("gemini-2.0-flash"), "gemini");
		assert_eq!(model_group("qwen3:8b"), "qwen3:8b");
	}

	#[test]
	fn wrap_is_idempotent_and_strip_inverts() {
		let wrapped = wrap_signature("claude", "EoUBCkYI");
		assert_eq!(wrapped, "ccr1:claude:EoUBCkYI");
		assert_eq!(wrap_signature("claude", &wrapped), wrapped);
		assert_eq!(strip_signature(&wrapped), Some(("claude", "EoUBCkYI")));
		assert_eq!(strip_signature("EoUBCkYI"), None);
	}

	#[tokio::test]
	async fn learn_then_lookup_round_trips() {
		let c = cache();
		c.learn("claude", "think-123", "sig-abc").await;
		assert_eq!(c.lookup("claude", "think-123").await.as_deref(), Some("sig-abc"));
		assert_eq!(c.lookup("claude", "think-999").await, None);
		assert_eq!(c.lookup("gpt", "think-123").await, None);
	}

	#[tokio::test]
	async fn unsigned_block_with_cache_hit_is_substituted() {
		let c = cache();
		c.learn("claude", "think-123", "sig-abc").await;
		let mut body = json!({
			"model": "claude-sonnet-4-5",
			"messages": [{
				"role": "assistant",
				"content": [{"type": "thinking", "thinking": "think-123", "signature": ""}],
			}],
		});
		let changed = normalize_request(&mut body, "claude", &c).await;
		assert!(changed);
		assert_eq!(
			body["messages"][0]["content"][0]["signature"],
			"sig-abc"
		);
	}

	#[tokio::test]
	async fn unsigned_block_without_hit_is_dropped() {
		let c = cache();
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [
					{"type": "thinking", "thinking": "mystery"},
					{"type": "text", "text": "hello"},
				],
			}],
		});
		let changed = normalize_request(&mut body, "claude", &c).await;
		assert!(changed);
		let content = body["messages"][0]["content"].as_array().unwrap();
		assert_eq!(content.len(), 1);
		assert_eq!(content[0]["type"], "text");
	}

	#[tokio::test]
	async fn prefixed_signature_is_stripped_for_same_group() {
		let c = cache();
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [{
					"type": "thinking",
					"thinking": "t",
					"signature": "ccr1:claude:inner-sig",
				}],
			}],
		});
		assert!(normalize_request(&mut body, "claude", &c).await);
		assert_eq!(body["messages"][0]["content"][0]["signature"], "inner-sig");
	}

	#[tokio::test]
	async fn cross_group_prefixed_signature_uses_cache() {
		let c = cache();
		c.learn("gpt", "t", "gpt-sig").await;
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [{
					"type": "thinking",
					"thinking": "t",
					"signature": "ccr1:claude:claude-sig",
				}],
			}],
		});
		assert!(normalize_request(&mut body, "gpt", &c).await);
		assert_eq!(body["messages"][0]["content"][0]["signature"], "gpt-sig");
	}

	#[tokio::test]
	async fn raw_signature_passes_through() {
		let c = cache();
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [{"type": "thinking", "thinking": "t", "signature": "raw-sig"}],
			}],
		});
		assert!(!normalize_request(&mut body, "claude", &c).await);
		assert_eq!(body["messages"][0]["content"][0]["signature"], "raw-sig");
	}

	#[tokio::test]
	async fn gemini_gets_sentinel_instead_of_drop() {
		let c = cache();
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [{"type": "thinking", "thinking": "t"}],
			}],
		});
		assert!(normalize_request(&mut body, "gemini", &c).await);
		assert_eq!(
			body["messages"][0]["content"][0]["signature"],
			GEMINI_SENTINEL
		);
	}

	#[tokio::test]
	async fn tool_use_blocks_untouched() {
		let c = cache();
		let mut body = json!({
			"messages": [{
				"role": "assistant",
				"content": [
					{"type": "tool_use", "id": "t_1", "name": "f", "input": {"x": 1}},
					{"type": "tool_use", "id": "t_2", "name": "g", "input": {"y": 2}},
				],
			}],
		});
		assert!(!normalize_request(&mut body, "claude", &c).await);
		let content = body["messages"][0]["content"].as_array().unwrap();
		assert_eq!(content[0]["id"], "t_1");
		assert_eq!(content[1]["id"], "t_2");
	}

	#[tokio::test]
	async fn response_learning_wraps_signature() {
		let c = cache();
		let mut body = json!({
			"content": [{"type": "thinking", "thinking": "deep", "signature": "sig-x"}],
		});
		assert!(learn_response(&mut body, "claude", &c).await);
		assert_eq!(body["content"][0]["signature"], "ccr1:claude:sig-x");
		assert_eq!(c.lookup("claude", "deep").await.as_deref(), Some("sig-x"));
	}
}
