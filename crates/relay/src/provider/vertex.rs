//! Google Vertex AI: anthropic models behind `rawPredict` /
//! `streamRawPredict`, OAuth bearer auth, and the vertex anthropic_version
//! marker in the body (which drops `model` — it lives in the URL).

use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use reqwest::Url;

use crate::ProviderConfig;
use crate::provider::gcp::TokenManager;
use crate::provider::{Operation, ProviderError};

pub const ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

#[derive(Clone)]
pub struct Adapter {
	project_id: String,
	location: String,
	host: String,
	token: Arc<TokenManager>,
}

fn host_for(region: Option<&str>) -> String {
	match region {
		None | Some("global") => "aiplatform.googleapis.com".to_string(),
		Some(region) => format!("{region}-aiplatform.googleapis.com"),
	}
}

fn build_url(
	host: &str,
	project_id: &str,
	location: &str,
	model: &str,
	op: Operation,
	streaming: bool,
) -> Result<Url, ProviderError> {
	let (model, verb) = match op {
		Operation::CountTokens => ("count-tokens", "rawPredict"),
		Operation::Messages if streaming => (model, "streamRawPredict"),
		Operation::Messages => (model, "rawPredict"),
	};
	let raw = format!(
		"https://{host}/v1/projects/{project_id}/locations/{location}/publishers/anthropic/models/{model}:{verb}"
	);
	Url::parse(&raw).map_err(|_| ProviderError::BaseUrl(raw))
}

impl Adapter {
	pub async fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
		let project_id = cfg
			.project_id
			.clone()
			.ok_or(ProviderError::MissingField("project_id"))?;
		Ok(Self {
			project_id,
			location: cfg.region.clone().unwrap_or_else(|| "global".to_string()),
			host: host_for(cfg.region.as_deref()),
			token: Arc::new(TokenManager::new().await?),
		})
	}

	pub fn target_url(
		&self,
		model: &str,
		op: Operation,
		streaming: bool,
	) -> Result<Url, ProviderError> {
		build_url(
			&self.host,
			&self.project_id,
			&self.location,
			model,
			op,
			streaming,
		)
	}

	pub fn transform_request(&self, body: &mut serde_json::Value) -> Result<bool, ProviderError> {
		let Some(obj) = body.as_object_mut() else {
			return Ok(false);
		};
		obj.insert(
			"anthropic_version".to_string(),
			serde_json::Value::String(ANTHROPIC_VERSION.to_string()),
		);
		obj.shift_remove("model");
		obj.shift_remove("stream");
		Ok(true)
	}

	pub async fn authenticate(&self, headers: &mut HeaderMap) -> Result<(), ProviderError> {
		let bearer = self.token.bearer().await?;
		let mut v = HeaderValue::from_str(&bearer)
			.map_err(|_| ProviderError::Credentials("invalid oauth token".to_string()))?;
		v.set_sensitive(true);
		headers.insert(http::header::AUTHORIZATION, v);
		Ok(())
	}

	pub fn probe_url(&self) -> Url {
		Url::parse(&format!("https://{}/", self.host)).expect("static host url")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn streaming_url_uses_stream_raw_predict() {
		let url = build_url(
			"us-east5-aiplatform.googleapis.com",
			"proj-1",
			"us-east5",
			"claude-sonnet-4-5@20250929",
			Operation::Messages,
			true,
		)
		.unwrap();
		assert_eq!(
			url.as_str(),
			"https://us-east5-aiplatform.googleapis.com/v1/projects/proj-1/locations/us-east5/publishers/anthropic/models/claude-sonnet-4-5@20250929:streamRawPredict"
		);
	}

	#[test]
	fn non_streaming_uses_raw_predict() {
		let url = build_url(
			"aiplatform.googleapis.com",
			"proj-1",
			"global",
			"claude-sonnet-4-5@20250929",
			Operation::Messages,
			false,
		)
		.unwrap();
		assert!(url.as_str().ends_with(":rawPredict"));
	}

	#[test]
	fn regional_host_derivation() {
		assert_eq!(host_for(None), "aiplatform.googleapis.com");
		assert_eq!(host_for(Some("global")), "aiplatform.googleapis.com");
		assert_eq!(host_for(Some("us-east5")), "us-east5-aiplatform.googleapis.com");
	}
}
