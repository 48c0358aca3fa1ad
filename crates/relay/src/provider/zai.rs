//! Z.AI: the anthropic wire dialect on a different host, with model mapping
//! handled by the proxy layer.

use http::HeaderMap;
use reqwest::Url;
use secrecy::SecretString;

use crate::ProviderConfig;
use crate::provider::anthropic::{attach_anthropic_auth, join_path, op_path};
use crate::provider::{Operation, ProviderError};

pub const DEFAULT_BASE: &str = "https://api.z.ai/api/anthropic";

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
		join_path(&self.base, op_path(op))
	}

	pub fn authenticate(
		&self,
		headers: &mut HeaderMap,
		key: Option<&SecretString>,
		transparent_bearer: Option<&str>,
	) -> Result<(), ProviderError> {
		attach_anthropic_auth(headers, key, transparent_bearer)
	}
}
