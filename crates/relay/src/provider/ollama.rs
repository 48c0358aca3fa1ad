//! Ollama: a local anthropic-compatible endpoint. No credentials, no token
//! counting, and images must already be inline base64 (there is no fetcher
//! on the other side).

use reqwest::Url;

use crate::ProviderConfig;
use crate::provider::anthropic::{join_path, op_path};
use crate::provider::{Operation, ProviderError};

pub const DEFAULT_BASE: &str = "http://localhost:11434";

#[derive(Clone)]
pub struct Adapter {
	pub base: Url,
}

impl Adapter {
	pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
		let raw = cfg.base_url.as_deref().unwrap_or(DEFAULT_BASE);
		let base = Url::parse(raw).map_err(|_| ProviderError::BaseUrl(raw.to_string()))?;
		Ok(Self { base })
	}

	pub fn target_url(&self, op: Operation) -> Result<Url, ProviderError> {
		match op {
			Operation::Messages => join_path(&self.base, op_path(op)),
			Operation::CountTokens => Err(ProviderError::UnsupportedOperation),
		}
	}

	/// Rejects URL image sources. `cache_control` blocks pass through; the
	/// upstream accepts and ignores them.
	pub fn validate_request(&self, body: &serde_json::Value) -> Result<(), ProviderError> {
		for block in crate::types::messages::content_blocks(body) {
			if block.get("type").and_then(|t| t.as_str()) != Some("image") {
				continue;
			}
			let source_type = block
				.get("source")
				.and_then(|s| s.get("type"))
				.and_then(|t| t.as_str());
			if source_type == Some("url") {
				return Err(ProviderError::UnsupportedContent(
					"image URLs are not supported; inline base64 data required".to_string(),
				));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn adapter() -> Adapter {
		let cfg = ProviderConfig {
			name: "local".to_string(),
			variant: crate::ProviderVariant::Ollama,
			base_url: None,
			enabled: true,
			models: vec![],
			model_mapping: Default::default(),
			keys: vec![],
			pooling: Default::default(),
			weight: 1,
			priority: 0,
			region: None,
			project_id: None,
			resource: None,
			entra_auth: false,
		};
		Adapter::new(&cfg).unwrap()
	}

	#[test]
	fn messages_url_on_localhost() {
		assert_eq!(
			adapter().target_url(Operation::Messages).unwrap().as_str(),
			"http://localhost:11434/v1/messages"
		);
	}

	#[test]
	fn count_tokens_unsupported() {
		assert!(matches!(
			adapter().target_url(Operation::CountTokens),
			Err(ProviderError::UnsupportedOperation)
		));
	}

	#[test]
	fn url_images_rejected() {
		let body = json!({
			"messages": [{
				"role": "user",
				"content": [{"type": "image", "source": {"type": "url", "url": "https://x/y.png"}}],
			}],
		});
		assert!(adapter().validate_request(&body).is_err());
	}

	#[test]
	fn base64_images_and_cache_control_pass() {
		let body = json!({
			"messages": [{
				"role": "user",
				"content": [
					{"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}},
					{"type": "text", "text": "hi", "cache_control": {"type": "ephemeral"}},
				],
			}],
		});
		assert!(adapter().validate_request(&body).is_ok());
	}
}
