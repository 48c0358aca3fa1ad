//! Inbound authentication: a bearer validator chained before an API-key
//! validator, returning a typed result the middleware turns into 401s.

use http::HeaderMap;
use http::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};

use crate::AuthConfig;
use crate::http::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
	ApiKey,
	Bearer,
	/// No validators configured; the relay is open.
	Anonymous,
}

/// Successful validation. `client_bearer` keeps the raw token so the handler
/// can pass it through to providers that accept subscription credentials.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
	pub auth_type: AuthType,
	pub client_bearer: Option<String>,
}

#[derive(Clone)]
pub struct AuthValidator {
	api_key: Option<SecretString>,
	bearer_secret: Option<SecretString>,
	allow_bearer: bool,
}

impl AuthValidator {
	pub fn new(cfg: &AuthConfig) -> Self {
		Self {
			api_key: cfg.api_key.clone(),
			bearer_secret: cfg.bearer_secret.clone(),
			allow_bearer: cfg.allow_bearer,
		}
	}

	fn open(&self) -> bool {
		self.api_key.is_none() && !self.allow_bearer
	}

	/// Bearer first (when allowed), then `x-api-key`. Note the documented
	/// foot-gun: `allow_bearer` with an empty `bearer_secret` accepts any
	/// bearer token, which is only sane behind another auth layer.
	pub fn validate(&self, headers: &HeaderMap) -> Result<AuthOutcome, ApiError> {
		let bearer = headers
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.map(str::to_string);

		if self.open() {
			return Ok(AuthOutcome {
				auth_type: AuthType::Anonymous,
				client_bearer: bearer,
			});
		}

		if self.allow_bearer {
			if let Some(token) = &bearer {
				let ok = match &self.bearer_secret {
					Some(secret) if !secret.expose_secret().is_empty() => {
						token == secret.expose_secret()
					},
					_ => true,
				};
				if ok {
					return Ok(AuthOutcome {
						auth_type: AuthType::Bearer,
						client_bearer: bearer,
					});
				}
				return Err(ApiError::AuthInvalid);
			}
		}

		if let Some(expected) = &self.api_key {
			match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
				Some(got) if got == expected.expose_secret() => {
					return Ok(AuthOutcome {
						auth_type: AuthType::ApiKey,
						client_bearer: bearer,
					});
				},
				Some(_) => return Err(ApiError::AuthInvalid),
				None => {},
			}
		}

		Err(ApiError::AuthMissing)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut h = HeaderMap::new();
		for (k, v) in pairs {
			h.insert(
				http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
				v.parse().unwrap(),
			);
		}
		h
	}

	fn validator(api_key: Option<&str>, bearer: Option<&str>, allow_bearer: bool) -> AuthValidator {
		AuthValidator::new(&AuthConfig {
			api_key: api_key.map(SecretString::from),
			bearer_secret: bearer.map(SecretString::from),
			allow_bearer,
			allow_subscription: false,
		})
	}

	#[test]
	fn api_key_accepted() {
		let v = validator(Some("sk-local"), None, false);
		let out = v.validate(&headers(&[("x-api-key", "sk-local")])).unwrap();
		assert_eq!(out.auth_type, AuthType::ApiKey);
	}

	#[test]
	fn wrong_api_key_rejected() {
		let v = validator(Some("sk-local"), None, false);
		assert!(matches!(
			v.validate(&headers(&[("x-api-key", "nope")])),
			Err(ApiError::AuthInvalid)
		));
	}

	#[test]
	fn missing_credentials_rejected() {
		let v = validator(Some("sk-local"), None, false);
		assert!(matches!(v.validate(&headers(&[])), Err(ApiError::AuthMissing)));
	}

	#[test]
	fn bearer_checked_before_api_key() {
		let v = validator(Some("sk-local"), Some("hunter2"), true);
		let out = v
			.validate(&headers(&[("authorization", "Bearer hunter2")]))
			.unwrap();
		assert_eq!(out.auth_type, AuthType::Bearer);
		assert_eq!(out.client_bearer.as_deref(), Some("hunter2"));
	}

	#[test]
	fn empty_bearer_secret_accepts_any_bearer() {
		let v = validator(None, None, true);
		let out = v
			.validate(&headers(&[("authorization", "Bearer anything-at-all")]))
			.unwrap();
		assert_eq!(out.auth_type, AuthType::Bearer);
	}

	#[test]
	fn open_relay_when_nothing_configured() {
		let v = validator(None, None, false);
		let out = v.validate(&headers(&[])).unwrap();
		assert_eq!(out.auth_type, AuthType::Anonymous);
	}
}
