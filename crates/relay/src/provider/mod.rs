//! The provider adapter layer: six backends behind one capability surface.
//!
//! The router and the streaming handler consume [`ProviderProxy`] and the
//! [`Provider`] sum type only; variant-specific wire details (URL-embedded
//! model ids, SigV4, OAuth bearers, Event Stream translation) stay inside
//! their modules.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method};
use indexmap::IndexMap;
use reqwest::Url;
use secrecy::SecretString;

use crate::routing::filter;
use crate::routing::keypool::KeyPool;
use crate::{ProviderConfig, ProviderVariant};

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod gcp;
pub mod ollama;
pub mod vertex;
pub mod zai;

/// The two operations the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	Messages,
	CountTokens,
}

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
	#[error("invalid base url {0:?}")]
	BaseUrl(String),
	#[error("missing required field: {0}")]
	MissingField(&'static str),
	#[error("model {0:?} is not an inference profile id (region-prefixed)")]
	NotInferenceProfile(String),
	#[error("unsupported content: {0}")]
	UnsupportedContent(String),
	#[error("operation not supported by this provider")]
	UnsupportedOperation,
	#[error("credential error: {0}")]
	Credentials(String),
	#[error("request signing failed: {0}")]
	Signing(String),
}

#[derive(Clone)]
pub enum Provider {
	Anthropic(anthropic::Adapter),
	Zai(zai::Adapter),
	Ollama(ollama::Adapter),
	Bedrock(bedrock::Adapter),
	Azure(azure::Adapter),
	Vertex(vertex::Adapter),
}

impl Provider {
	pub fn variant(&self) -> ProviderVariant {
		match self {
			Provider::Anthropic(_) => ProviderVariant::Anthropic,
			Provider::Zai(_) => ProviderVariant::Zai,
			Provider::Ollama(_) => ProviderVariant::Ollama,
			Provider::Bedrock(_) => ProviderVariant::Bedrock,
			Provider::Azure(_) => ProviderVariant::Azure,
			Provider::Vertex(_) => ProviderVariant::Vertex,
		}
	}

	/// Whether a client-supplied `Authorization: Bearer` may be forwarded in
	/// place of a pool key.
	pub fn supports_transparent_auth(&self) -> bool {
		matches!(self, Provider::Anthropic(_) | Provider::Zai(_))
	}

	pub fn supports_count_tokens(&self) -> bool {
		!matches!(self, Provider::Ollama(_))
	}

	/// Bedrock answers with AWS Event Stream framing that must be translated
	/// back into Anthropic SSE; everyone else streams SSE natively.
	pub fn translates_response_stream(&self) -> bool {
		matches!(self, Provider::Bedrock(_))
	}

	/// Resolved upstream URL for the already-mapped model. Parsing of the
	/// base happened once at construction.
	pub fn target_url(
		&self,
		model: &str,
		op: Operation,
		streaming: bool,
	) -> Result<Url, ProviderError> {
		match self {
			Provider::Anthropic(a) => a.target_url(op),
			Provider::Zai(a) => a.target_url(op),
			Provider::Ollama(a) => a.target_url(op),
			Provider::Bedrock(a) => a.target_url(model, op, streaming),
			Provider::Azure(a) => a.target_url(op),
			Provider::Vertex(a) => a.target_url(model, op, streaming),
		}
	}

	/// Whether this variant rewrites the body beyond the model field.
	pub fn has_body_transform(&self) -> bool {
		matches!(self, Provider::Bedrock(_) | Provider::Vertex(_))
	}

	/// Variant-specific body edits, after the generic model rewrite. Returns
	/// whether anything changed.
	pub fn transform_request(
		&self,
		body: &mut serde_json::Value,
	) -> Result<bool, ProviderError> {
		match self {
			Provider::Bedrock(a) => a.transform_request(body),
			Provider::Vertex(a) => a.transform_request(body),
			_ => Ok(false),
		}
	}

	/// Non-mutating request validation (ollama's inline-image rule).
	pub fn validate_request(&self, body: &serde_json::Value) -> Result<(), ProviderError> {
		match self {
			Provider::Ollama(a) => a.validate_request(body),
			_ => Ok(()),
		}
	}

	/// Copies forwardable inbound headers onto the outbound request.
	pub fn forward_headers(&self, inbound: &HeaderMap, outbound: &mut HeaderMap) {
		match self {
			// SigV4 covers every signed header; keep the outbound set minimal
			Provider::Bedrock(_) => {},
			_ => {
				for (name, value) in inbound {
					let n = name.as_str();
					let forwardable = (n.starts_with("anthropic-") || n.starts_with("x-"))
						&& n != "x-api-key"
						&& n != "x-request-id";
					if forwardable {
						outbound.append(name.clone(), value.clone());
					}
				}
			},
		}
	}

	/// Attaches credentials. For Bedrock this signs the final request and
	/// must therefore run after every other header is in place.
	pub async fn authenticate(
		&self,
		headers: &mut HeaderMap,
		method: &Method,
		url: &Url,
		body: &Bytes,
		key: Option<&SecretString>,
		transparent_bearer: Option<&str>,
	) -> Result<(), ProviderError> {
		match self {
			Provider::Anthropic(a) => a.authenticate(headers, key, transparent_bearer),
			Provider::Zai(a) => a.authenticate(headers, key, transparent_bearer),
			Provider::Ollama(_) => Ok(()),
			Provider::Bedrock(a) => a.authenticate(headers, method, url, body).await,
			Provider::Azure(a) => a.authenticate(headers, key).await,
			Provider::Vertex(a) => a.authenticate(headers).await,
		}
	}

	/// A cheap connectivity target for the background health checker.
	pub fn probe_url(&self) -> Url {
		match self {
			Provider::Anthropic(a) => a.base.clone(),
			Provider::Zai(a) => a.base.clone(),
			Provider::Ollama(a) => a.base.clone(),
			Provider::Bedrock(a) => a.probe_url(),
			Provider::Azure(a) => a.base.clone(),
			Provider::Vertex(a) => a.probe_url(),
		}
	}
}

/// Per-provider reverse-proxy instance: adapter plus the runtime pieces the
/// handler needs (mapping, declared models, key pool).
pub struct ProviderProxy {
	pub name: Arc<str>,
	pub adapter: Provider,
	pub models: Vec<String>,
	pub model_mapping: IndexMap<String, String>,
	pub keypool: Option<KeyPool>,
}

impl ProviderProxy {
	pub async fn build(
		cfg: &ProviderConfig,
		_client: reqwest::Client,
	) -> Result<Self, ProviderError> {
		let adapter = match cfg.variant {
			ProviderVariant::Anthropic => Provider::Anthropic(anthropic::Adapter::new(cfg)?),
			ProviderVariant::Zai => Provider::Zai(zai::Adapter::new(cfg)?),
			ProviderVariant::Ollama => Provider::Ollama(ollama::Adapter::new(cfg)?),
			ProviderVariant::Bedrock => Provider::Bedrock(bedrock::Adapter::new(cfg).await?),
			ProviderVariant::Azure => Provider::Azure(azure::Adapter::new(cfg)?),
			ProviderVariant::Vertex => Provider::Vertex(vertex::Adapter::new(cfg).await?),
		};
		let keypool = if cfg.keys.is_empty() {
			None
		} else {
			Some(KeyPool::new(cfg.keys.clone(), cfg.pooling.strategy))
		};
		Ok(Self {
			name: Arc::from(cfg.name.as_str()),
			adapter,
			models: cfg.models.clone(),
			model_mapping: cfg.model_mapping.clone(),
			keypool,
		})
	}

	pub fn variant(&self) -> ProviderVariant {
		self.adapter.variant()
	}

	/// Upstream model id for an incoming model, via longest-prefix mapping.
	pub fn map_model<'a>(&'a self, model: &'a str) -> &'a str {
		filter::map_model(&self.model_mapping, model)
	}

	/// Lightweight connectivity probe; any response at all counts, this is
	/// reachability, not correctness.
	pub async fn probe(&self, client: &reqwest::Client) -> bool {
		let url = self.adapter.probe_url();
		client
			.get(url)
			.timeout(std::time::Duration::from_secs(2))
			.send()
			.await
			.is_ok()
	}

	#[cfg(test)]
	pub fn for_tests(name: &str) -> Self {
		let cfg = ProviderConfig {
			name: name.to_string(),
			variant: ProviderVariant::Anthropic,
			base_url: Some("http://127.0.0.1:9".to_string()),
			enabled: true,
			models: vec![],
			model_mapping: IndexMap::new(),
			keys: vec![],
			pooling: Default::default(),
			weight: 1,
			priority: 0,
			region: None,
			project_id: None,
			resource: None,
			entra_auth: false,
		};
		Self {
			name: Arc::from(name),
			adapter: Provider::Anthropic(anthropic::Adapter::new(&cfg).expect("static test url")),
			models: vec![],
			model_mapping: IndexMap::new(),
			keypool: None,
		}
	}
}
