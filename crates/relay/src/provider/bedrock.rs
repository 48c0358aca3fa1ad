//! AWS Bedrock: the model id rides in the URL path, the body gains
//! `anthropic_version` and loses `model`/`stream`, and the final request is
//! SigV4-signed including the body hash. Responses come back as AWS Event
//! Stream frames (see `parse::aws_sse`).

use std::time::SystemTime;

use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method};
use reqwest::Url;

use crate::ProviderConfig;
use crate::provider::{Operation, ProviderError};

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
const SERVICE: &str = "bedrock";

#[derive(Clone)]
pub struct Adapter {
	region: String,
	host: String,
	credentials: SharedCredentialsProvider,
}

impl Adapter {
	pub async fn new(cfg: &ProviderConfig) -> Result<Self, ProviderError> {
		let region = cfg
			.region
			.clone()
			.ok_or(ProviderError::MissingField("region"))?;
		let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
			.region(aws_config::Region::new(region.clone()))
			.load()
			.await;
		let credentials = sdk_config
			.credentials_provider()
			.ok_or_else(|| ProviderError::Credentials("no AWS credentials resolved".to_string()))?;
		Ok(Self {
			host: format!("bedrock-runtime.{region}.amazonaws.com"),
			region,
			credentials,
		})
	}

	/// On-demand Bedrock traffic requires inference-profile ids (region
	/// prefixed) or a full ARN; bare foundation-model ids are rejected here
	/// rather than with an opaque 400 from AWS.
	pub fn is_inference_profile(model: &str) -> bool {
		model.starts_with("us.")
			|| model.starts_with("eu.")
			|| model.starts_with("apac.")
			|| model.starts_with("jp.")
			|| model.starts_with("au.")
			|| model.starts_with("global.")
			|| model.starts_with("arn:")
	}

	pub fn target_url(
		&self,
		model: &str,
		op: Operation,
		streaming: bool,
	) -> Result<Url, ProviderError> {
		if !Self::is_inference_profile(model) {
			return Err(ProviderError::NotInferenceProfile(model.to_string()));
		}
		let action = match (op, streaming) {
			(Operation::CountTokens, _) => "count-tokens",
			(Operation::Messages, true) => "invoke-with-response-stream",
			(Operation::Messages, false) => "invoke",
		};
		let raw = format!("https://{}/model/{}/{}", self.host, model, action);
		Url::parse(&raw).map_err(|_| ProviderError::BaseUrl(raw))
	}

	/// `model` moves into the URL; `stream` is expressed by the action; the
	/// body must declare the bedrock anthropic_version.
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

	pub async fn authenticate(
		&self,
		headers: &mut HeaderMap,
		method: &Method,
		url: &Url,
		body: &Bytes,
	) -> Result<(), ProviderError> {
		let credentials = self
			.credentials
			.provide_credentials()
			.await
			.map_err(|e| ProviderError::Credentials(e.to_string()))?;
		let identity = credentials.into();

		let params = v4::SigningParams::builder()
			.identity(&identity)
			.region(&self.region)
			.name(SERVICE)
			.time(SystemTime::now())
			.settings(SigningSettings::default())
			.build()
			.map_err(|e| ProviderError::Signing(e.to_string()))?
			.into();

		// the host header participates in the signature
		headers.insert(
			http::header::HOST,
			HeaderValue::from_str(&self.host)
				.map_err(|e| ProviderError::Signing(e.to_string()))?,
		);

		let header_pairs: Vec<(String, String)> = headers
			.iter()
			.filter_map(|(name, value)| {
				value
					.to_str()
					.ok()
					.map(|v| (name.as_str().to_string(), v.to_string()))
			})
			.collect();
		let signable = SignableRequest::new(
			method.as_str(),
			url.as_str(),
			header_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
			SignableBody::Bytes(body),
		)
		.map_err(|e| ProviderError::Signing(e.to_string()))?;

		let (instructions, _signature) = sign(signable, &params)
			.map_err(|e| ProviderError::Signing(e.to_string()))?
			.into_parts();

		// route the instructions through a scratch request to collect the
		// generated headers (x-amz-date, x-amz-content-sha256, authorization)
		let mut scratch = http::Request::builder()
			.method(method.clone())
			.uri(url.as_str())
			.body(())
			.map_err(|e| ProviderError::Signing(e.to_string()))?;
		instructions.apply_to_request_http1x(&mut scratch);
		for (name, value) in scratch.headers() {
			headers.insert(name.clone(), value.clone());
		}
		Ok(())
	}

	pub fn probe_url(&self) -> Url {
		Url::parse(&format!("https://{}/", self.host)).expect("static host url")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn adapter() -> Adapter {
		Adapter {
			region: "us-west-2".to_string(),
			host: "bedrock-runtime.us-west-2.amazonaws.com".to_string(),
			credentials: SharedCredentialsProvider::new(aws_credential_types::Credentials::new(
				"AKIDEXAMPLE",
				"secret",
				None,
				None,
				"static-test",
			)),
		}
	}

	#[test]
	fn inference_profile_forms() {
		assert!(Adapter::is_inference_profile("us.anthropic.claude-sonnet-4-5-20250929-v1:0"));
		assert!(Adapter::is_inference_profile("eu.anthropic.claude-haiku-4-5-20251001-v1:0"));
		assert!(Adapter::is_inference_profile(
			"arn:aws:bedrock:us-west-2:123456789012:inference-profile/us.anthropic.claude-sonnet-4-5-20250929-v1:0"
		));
		assert!(!Adapter::is_inference_profile("anthropic.claude-sonnet-4-5-20250929-v1:0"));
		assert!(!Adapter::is_inference_profile("claude-sonnet-4-5"));
	}

	#[test]
	fn bare_model_id_rejected() {
		assert!(matches!(
			adapter().target_url("claude-sonnet-4-5", Operation::Messages, true),
			Err(ProviderError::NotInferenceProfile(_))
		));
	}

	#[test]
	fn body_transform_moves_fields() {
		let mut body = serde_json::json!({
			"model": "us.anthropic.claude-sonnet-4-5-20250929-v1:0",
			"max_tokens": 16,
			"stream": true,
			"messages": [{"role": "user", "content": "hi"}],
		});
		assert!(adapter().transform_request(&mut body).unwrap());
		assert!(body.get("model").is_none());
		assert!(body.get("stream").is_none());
		assert_eq!(body["anthropic_version"], ANTHROPIC_VERSION);
		assert_eq!(body["max_tokens"], 16);
	}

	#[test]
	fn url_embeds_model_and_action() {
		let url = adapter()
			.target_url(
				"us.anthropic.claude-sonnet-4-5-20250929-v1:0",
				Operation::Messages,
				true,
			)
			.unwrap();
		assert_eq!(
			url.as_str(),
			"https://bedrock-runtime.us-west-2.amazonaws.com/model/us.anthropic.claude-sonnet-4-5-20250929-v1:0/invoke-with-response-stream"
		);
		let url = adapter()
			.target_url(
				"us.anthropic.claude-sonnet-4-5-20250929-v1:0",
				Operation::Messages,
				false,
			)
			.unwrap();
		assert!(url.as_str().ends_with("/invoke"));
	}

	#[tokio::test]
	async fn signing_adds_authorization_and_date() {
		let adapter = adapter();
		let url = adapter
			.target_url(
				"us.anthropic.claude-sonnet-4-5-20250929-v1:0",
				Operation::Messages,
				false,
			)
			.unwrap();
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		let body = Bytes::from_static(b"{\"max_tokens\":8}");
		adapter
			.authenticate(&mut headers, &Method::POST, &url, &body)
			.await
			.unwrap();
		let authz = headers[http::header::AUTHORIZATION].to_str().unwrap();
		assert!(authz.starts_with("AWS4-HMAC-SHA256"));
		assert!(authz.contains("us-west-2/bedrock/aws4_request"));
		assert!(headers.contains_key("x-amz-date"));
	}
}
