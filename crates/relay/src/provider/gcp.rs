//! Google OAuth token management for Vertex AI.
//!
//! Access tokens live an hour; the manager re-fetches once a token is
//! within five minutes of expiry so requests never race the deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use tokio::sync::Mutex;
use tracing::debug;

use crate::provider::ProviderError;

const SCOPES: [&str; 1] = ["https://www.googleapis.com/auth/cloud-platform"];
const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

pub struct TokenManager {
	source: Arc<dyn TokenSource>,
	cached: Mutex<Option<(String, Instant)>>,
}

impl TokenManager {
	pub async fn new() -> Result<Self, ProviderError> {
		let config = Config::default().with_scopes(&SCOPES);
		let provider = DefaultTokenSourceProvider::new(config)
			.await
			.map_err(|e| ProviderError::Credentials(e.to_string()))?;
		Ok(Self {
			source: provider.token_source(),
			cached: Mutex::new(None),
		})
	}

	/// Current `Authorization` header value ("Bearer ...").
	pub async fn bearer(&self) -> Result<String, ProviderError> {
		let mut cached = self.cached.lock().await;
		if let Some((token, fetched_at)) = cached.as_ref() {
			if fetched_at.elapsed() + REFRESH_MARGIN < TOKEN_LIFETIME {
				return Ok(token.clone());
			}
			debug!("vertex token within refresh margin; fetching a new one");
		}
		let token = self
			.source
			.token()
			.await
			.map_err(|e| ProviderError::Credentials(e.to_string()))?;
		*cached = Some((token.clone(), Instant::now()));
		Ok(token)
	}
}
