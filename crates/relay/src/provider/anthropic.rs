//! Anthropic-native backend: identity request transform, `x-api-key` auth,
//! transparent bearer passthrough for subscription clients.

use http::{HeaderMap, HeaderValue};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use crate::ProviderConfig;
use crate::provider::{Operation, ProviderError};

pub const DEFAULT_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_VERSION: &str = "2023-06-01";

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

pub(super) fn op_path(op: Operation) -> &'static str {
	match op {
		Operation::Messages => "v1/messages",
		Operation::CountTokens => "v1/messages/count_tokens",
	}
}

/// Appends a path segment to a base that may itself carry a path prefix
/// (Z.AI's anthropic-compatible endpoint does).
pub(super) fn join_path(base: &Url, path: &str) -> Result<Url, ProviderError> {
	let mut url = base.clone();
	let prefix = base.path().trim_end_matches('/');
	url.set_path(&format!("{prefix}/{path}"));
	Ok(url)
}

/// Shared by the anthropic and zai variants: a client bearer passes through
/// untouched when present, otherwise the pool key goes into `x-api-key`.
/// `anthropic-version` is defaulted when the client did not pin one.
pub(super) fn attach_anthropic_auth(
	headers: &mut HeaderMap,
	key: Option<&SecretString>,
	transparent_bearer: Option<&str>,
) -> Result<(), ProviderError> {
	if let Some(token) = transparent_bearer {
		let mut v = HeaderValue::from_str(&format!("Bearer {token}"))
			.map_err(|_| ProviderError::Credentials("invalid bearer token".to_string()))?;
		v.set_sensitive(true);
		headers.insert(http::header::AUTHORIZATION, v);
	} else if let Some(key) = key {
		let mut v = HeaderValue::from_str(key.expose_secret())
			.map_err(|_| ProviderError::Credentials("invalid api key".to_string()))?;
		v.set_sensitive(true);
		headers.insert("x-api-key", v);
	} else {
		return Err(ProviderError::Credentials("no credentials available".to_string()));
	}
	if !headers.contains_key("anthropic-version") {
		headers.insert("anthropic-version", HeaderValue::from_static(DEFAULT_VERSION));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg(base_url: Option<&str>) -> ProviderConfig {
		ProviderConfig {
			name: "a".to_string(),
			variant: crate::ProviderVariant::Anthropic,
			base_url: base_url.map(str::to_string),
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
		}
	}

	#[test]
	fn default_url() {
		let a = Adapter::new(&cfg(None)).unwrap();
		assert_eq!(
			a.target_url(Operation::Messages).unwrap().as_str(),
			"https://api.anthropic.com/v1/messages"
		);
		assert_eq!(
			a.target_url(Operation::CountTokens).unwrap().as_str(),
			"https://api.anthropic.com/v1/messages/count_tokens"
		);
	}

	#[test]
	fn base_with_path_prefix() {
		let a = Adapter::new(&cfg(Some("https://api.z.ai/api/anthropic"))).unwrap();
		assert_eq!(
			a.target_url(Operation::Messages).unwrap().as_str(),
			"https://api.z.ai/api/anthropic/v1/messages"
		);
	}

	#[test]
	fn key_goes_to_x_api_key() {
		let a = Adapter::new(&cfg(None)).unwrap();
		let mut headers = HeaderMap::new();
		let key = SecretString::from("sk-ant-123");
		a.authenticate(&mut headers, Some(&key), None).unwrap();
		assert_eq!(headers["x-api-key"], "sk-ant-123");
		assert!(headers["x-api-key"].is_sensitive());
		assert_eq!(headers["anthropic-version"], DEFAULT_VERSION);
		assert!(!headers.contains_key(http::header::AUTHORIZATION));
	}

	#[test]
	fn transparent_bearer_wins_over_key() {
		let a = Adapter::new(&cfg(None)).unwrap();
		let mut headers = HeaderMap::new();
		let key = SecretString::from("sk-ant-123");
		a.authenticate(&mut headers, Some(&key), Some("subscr-token"))
			.unwrap();
		assert_eq!(headers[http::header::AUTHORIZATION], "Bearer subscr-token");
		assert!(!headers.contains_key("x-api-key"));
	}

	#[test]
	fn client_pinned_version_kept() {
		let a = Adapter::new(&cfg(None)).unwrap();
		let mut headers = HeaderMap::new();
		headers.insert("anthropic-version", HeaderValue::from_static("2024-10-22"));
		let key = SecretString::from("k");
		a.authenticate(&mut headers, Some(&key), None).unwrap();
		assert_eq!(headers["anthropic-version"], "2024-10-22");
	}
}
