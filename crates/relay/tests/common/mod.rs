//! Shared harness for integration tests: builds a relay from a YAML config
//! against wiremock upstreams and serves it on an ephemeral port.

use std::sync::Arc;

use cc_relay::{RawConfig, Services};

pub struct TestRelay {
	pub base: String,
	pub services: Arc<Services>,
	pub client: reqwest::Client,
}

impl TestRelay {
	pub async fn start(yaml: &str) -> TestRelay {
		let raw: RawConfig = serde_yaml::from_str(yaml).expect("test config parses");
		let cfg = raw.validate().expect("test config validates");
		let services = Services::new(cfg).await.expect("services build");

		let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
			.await
			.expect("ephemeral bind");
		let base = format!("http://{}", listener.local_addr().unwrap());
		let serve_services = services.clone();
		tokio::spawn(async move {
			let _ = cc_relay::relay::serve(serve_services, listener).await;
		});

		TestRelay {
			base,
			services,
			client: reqwest::Client::new(),
		}
	}

	pub fn url(&self, path: &str) -> String {
		format!("{}{path}", self.base)
	}

	pub async fn post_messages(&self, body: serde_json::Value) -> reqwest::Response {
		self
			.client
			.post(self.url("/v1/messages"))
			.json(&body)
			.send()
			.await
			.expect("relay reachable")
	}
}

impl Drop for TestRelay {
	fn drop(&mut self) {
		self.services.shutdown.cancel();
	}
}

/// Two-provider anthropic config against the given upstream base URLs.
pub fn two_provider_yaml(strategy: &str, a: &str, b: &str) -> String {
	format!(
		r#"
server:
  listen: "127.0.0.1:0"
providers:
  - name: alpha
    variant: anthropic
    base_url: "{a}"
    priority: 10
    keys: [{{key: sk-alpha}}]
  - name: beta
    variant: anthropic
    base_url: "{b}"
    priority: 5
    keys: [{{key: sk-beta}}]
routing:
  strategy: {strategy}
  failover_timeout: 2000
"#
	)
}

/// The canonical six-event streaming body for a tiny completion.
pub fn canonical_sse() -> &'static [u8] {
	b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-sonnet-4-5\",\"content\":[],\"stop_reason\":null,\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}\n\nevent: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\nevent: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"pong\"}}\n\nevent: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\nevent: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":4}}\n\nevent: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
}
