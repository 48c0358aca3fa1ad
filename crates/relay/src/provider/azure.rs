//! Azure AI Foundry: the anthropic dialect under
//! `https://{resource}.services.ai.azure.com/anthropic/v1/messages`. Auth is
//! `x-api-key` (not the OpenAI-style `api-key`) or an Entra ID bearer; the
//! model field carries the deployment name, which the mapping supplies.

use std::sync::Arc;

use azure_core::auth::TokenCredential;
use http::{HeaderMap, HeaderValue};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use crate::ProviderConfig;
use crate::provider::{Operation, ProviderError};

const ENTRA_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

#[derive(Clone)]
pub struct Adapter {
	pub base: Url,
	entra: Option<Arc<dyn TokenCredential>>,
}

impl Adapter {
	pub fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
		let raw = match (&cfg.base_url, &cfg.resource) {
			(Some(base), _) => base.clone(),
			(None, Some(resource)) => format!("https://{resource}.services.ai.azure.com"),
			(None, None) => return Err(ProviderError::MissingField("resource")),
		};
		let base = Url::parse(&raw).map_err(|_| ProviderError::BaseUrl(raw))?;
		let entra = if cfg.entra_auth {
			let credential = azure_identity::create_default_credential()
				.map_err(|e| ProviderError::Credentials(e.to_string()))?;
			Some(credential)
		} else {
			None
		};
		Ok(Self { base, entra })
	}

	pub fn target_url(&self, op: Operation) -> Result<Url, ProviderError> {
		let path = match op {
			Operation::Messages => "anthropic/v1/messages",
			Operation::CountTokens => "anthropic/v1/messages/count_tokens",
		};
		super::anthropic::join_path(&self.base, path)
	}

	pub async fn authenticate(
		&self,
		headers: &mut HeaderMap,
		key: Option<&SecretString>,
	) -> Result<(), ProviderError> {
		if let Some(credential) = &self.entra {
			let token = credential
				.get_token(&[ENTRA_SCOPE])
				.await
				.map_err(|e| ProviderError::Credentials(e.to_string()))?;
			let mut v = HeaderValue::from_str(&format!("Bearer {}", token.token.secret()))
				.map_err(|_| ProviderError::Credentials("invalid entra token".to_string()))?;
			v.set_sensitive(true);
			headers.insert(http::header::AUTHORIZATION, v);
			return Ok(());
		}
		let key = key.ok_or_else(|| {
			ProviderError::Credentials("no key and entra auth disabled".to_string())
		})?;
		let mut v = HeaderValue::from_str(key.expose_secret())
			.map_err(|_| ProviderError::Credentials("invalid api key".to_string()))?;
		v.set_sensitive(true);
		headers.insert("x-api-key", v);
		Ok(())
	}
}
