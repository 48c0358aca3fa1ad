//! cc-relay: a multi-backend reverse proxy for the Anthropic Messages API.
//!
//! Clients speak the Anthropic dialect to a single endpoint; the relay picks a
//! backend (Anthropic, Z.AI, Ollama, AWS Bedrock, Azure AI Foundry, Google
//! Vertex AI), picks an API key under its rate windows, and re-streams the
//! response without disturbing SSE ordering, tool-use identifiers, or
//! extended-thinking signatures.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod cache;
pub mod health;
pub mod http;
pub mod parse;
pub mod provider;
pub mod relay;
pub mod routing;
pub mod signature;
pub mod types;

use crate::cache::SignatureStore;
use crate::http::auth::AuthValidator;
use crate::routing::{ProviderInfo, RouterHandle};
use crate::signature::SignatureCache;

/// RawConfig is the user-facing configuration surface. Loading (file I/O,
/// `${VAR}` expansion, file watching) is the caller's problem; this crate
/// consumes the parsed structure and validates it into [`Config`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub providers: Vec<ProviderConfig>,
	#[serde(default)]
	pub routing: RoutingConfig,
	#[serde(default)]
	pub health: HealthConfig,
	#[serde(default)]
	pub cache: CacheConfig,
	#[serde(default)]
	pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
	/// Listen address, e.g. "127.0.0.1:3456". Changing this requires a restart.
	pub listen: String,
	/// Whole-request deadline in milliseconds.
	pub timeout_ms: u64,
	/// Global in-flight request cap.
	pub max_concurrent: usize,
	/// How long a request may wait for a concurrency slot before 503.
	/// Zero rejects immediately.
	pub queue_wait_ms: u64,
	/// Request body cap in bytes.
	pub max_body_bytes: usize,
	/// Serve HTTP/2 cleartext in addition to HTTP/1.1. Trusted deployments only.
	pub enable_http2: bool,
	pub auth: AuthConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: "127.0.0.1:3456".to_string(),
			timeout_ms: 600_000,
			max_concurrent: 256,
			queue_wait_ms: 0,
			max_body_bytes: 8 * 1024 * 1024,
			enable_http2: false,
			auth: AuthConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthConfig {
	/// Static API key clients must present in `x-api-key`.
	pub api_key: Option<SecretString>,
	/// Shared secret for `Authorization: Bearer`. When `allow_bearer` is set
	/// and this is empty, ANY bearer token is accepted.
	pub bearer_secret: Option<SecretString>,
	pub allow_bearer: bool,
	/// Allow clients to bring their own upstream credentials (subscription
	/// tokens) for providers that support transparent auth.
	pub allow_subscription: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderVariant {
	Anthropic,
	Zai,
	Ollama,
	Bedrock,
	Azure,
	Vertex,
}

impl ProviderVariant {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProviderVariant::Anthropic => "anthropic",
			ProviderVariant::Zai => "zai",
			ProviderVariant::Ollama => "ollama",
			ProviderVariant::Bedrock => "bedrock",
			ProviderVariant::Azure => "azure",
			ProviderVariant::Vertex => "vertex",
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
	pub name: String,
	pub variant: ProviderVariant,
	/// Overrides the variant's default endpoint. Required for azure (the
	/// resource endpoint) unless `resource` is set; ignored for bedrock and
	/// vertex, which derive URLs from region/project.
	#[serde(default)]
	pub base_url: Option<String>,
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Models this provider declares for `GET /v1/models`.
	#[serde(default)]
	pub models: Vec<String>,
	/// Incoming-model prefix -> upstream model id. Keys may end in `*`.
	/// Empty means "accepts any model, unmapped".
	#[serde(default)]
	pub model_mapping: IndexMap<String, String>,
	#[serde(default)]
	pub keys: Vec<KeyConfig>,
	#[serde(default)]
	pub pooling: PoolingConfig,
	/// Router weight for weighted strategies.
	#[serde(default = "default_weight")]
	pub weight: u32,
	/// Failover ordering; higher is tried first.
	#[serde(default)]
	pub priority: i32,

	// variant-specific
	/// AWS region (bedrock) or Vertex location.
	#[serde(default)]
	pub region: Option<String>,
	/// GCP project (vertex).
	#[serde(default)]
	pub project_id: Option<String>,
	/// Azure AI Foundry resource name; expands to
	/// `https://{resource}.services.ai.azure.com`.
	#[serde(default)]
	pub resource: Option<String>,
	/// Use Entra ID bearer auth instead of `x-api-key` (azure).
	#[serde(default)]
	pub entra_auth: bool,
}

fn default_true() -> bool {
	true
}

fn default_weight() -> u32 {
	1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KeyConfig {
	pub key: SecretString,
	/// Requests per sliding minute; 0 is unlimited.
	pub rpm_limit: u32,
	/// Input tokens per sliding minute; 0 is unlimited.
	pub input_tpm: u64,
	/// Output tokens per sliding minute; 0 is unlimited.
	pub output_tpm: u64,
	pub weight: u32,
	/// Higher is tried first under failover.
	pub priority: i32,
}

impl Default for KeyConfig {
	fn default() -> Self {
		Self {
			key: SecretString::from(""),
			rpm_limit: 0,
			input_tpm: 0,
			output_tpm: 0,
			weight: 1,
			priority: 0,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolingConfig {
	pub enabled: bool,
	pub strategy: PoolStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
	#[default]
	LeastLoaded,
	RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
	pub strategy: StrategyKind,
	/// Budget for racing the remaining providers after a failover-eligible
	/// failure, in milliseconds.
	pub failover_timeout: u64,
	/// Emit `X-CC-Relay-Provider` / `X-CC-Relay-Strategy` response headers.
	pub debug: bool,
	/// Model prefix -> provider name, consumed by `model_based`.
	pub model_mapping: IndexMap<String, String>,
	/// Fallback provider for `model_based` when no prefix matches.
	pub default_provider: Option<String>,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		Self {
			strategy: StrategyKind::Failover,
			failover_timeout: 15_000,
			debug: false,
			model_mapping: IndexMap::new(),
			default_provider: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
	RoundRobin,
	WeightedRoundRobin,
	Shuffle,
	Failover,
	ModelBased,
}

impl StrategyKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			StrategyKind::RoundRobin => "round_robin",
			StrategyKind::WeightedRoundRobin => "weighted_round_robin",
			StrategyKind::Shuffle => "shuffle",
			StrategyKind::Failover => "failover",
			StrategyKind::ModelBased => "model_based",
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
	pub circuit_breaker: BreakerConfig,
	pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BreakerConfig {
	pub failure_threshold: u32,
	pub open_duration_ms: u64,
	pub half_open_probes: u32,
}

impl Default for BreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			open_duration_ms: 30_000,
			half_open_probes: 3,
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthCheckConfig {
	pub enabled: bool,
	pub interval_ms: u64,
}

impl Default for HealthCheckConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			interval_ms: 5_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
	pub mode: CacheMode,
	/// Signature TTL in seconds.
	pub ttl_secs: u64,
	/// Cost bound for the single-node backend, in bytes.
	pub max_cost_bytes: u64,
	pub ha: HaCacheConfig,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			mode: CacheMode::Single,
			ttl_secs: 3 * 60 * 60,
			max_cost_bytes: 64 * 1024 * 1024,
			ha: HaCacheConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
	#[default]
	Single,
	Ha,
	Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HaCacheConfig {
	/// Data-plane bind address for the replicated store. Gossip membership
	/// runs on this port + 2. Changing this requires a restart.
	pub bind: Option<String>,
	/// Seed peers' data-plane addresses.
	pub peers: Vec<String>,
	pub replicas: usize,
	pub read_quorum: usize,
	pub write_quorum: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
	pub level: String,
	pub format: LogFormat,
	pub debug_options: DebugOptions,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_string(),
			format: LogFormat::Text,
			debug_options: DebugOptions::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
	#[default]
	Text,
	Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DebugOptions {
	/// Log a redacted request-body preview at debug level.
	pub log_request_body: bool,
	pub body_preview_bytes: usize,
}

impl Default for DebugOptions {
	fn default() -> Self {
		Self {
			log_request_body: false,
			body_preview_bytes: 1024,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("invalid listen address {0:?}: {1}")]
	Listen(String, std::net::AddrParseError),
	#[error("duplicate provider name {0:?}")]
	DuplicateProvider(String),
	#[error("provider {0:?}: {1}")]
	Provider(String, String),
	#[error("routing: {0}")]
	Routing(String),
	#[error("cache: {0}")]
	Cache(String),
}

/// Validated runtime configuration. Produced from [`RawConfig`], swapped
/// atomically on reload; requests load one snapshot on entry and keep it.
#[derive(Debug, Clone)]
pub struct Config {
	pub listen: SocketAddr,
	pub timeout: Duration,
	pub max_concurrent: usize,
	pub queue_wait: Duration,
	pub max_body_bytes: usize,
	pub enable_http2: bool,
	pub auth: AuthConfig,
	pub providers: Vec<ProviderConfig>,
	pub routing: RoutingConfig,
	pub health: HealthConfig,
	pub cache: CacheConfig,
	pub logging: LoggingConfig,
}

impl RawConfig {
	pub fn validate(self) -> Result<Config, ConfigError> {
		let listen: SocketAddr = self
			.server
			.listen
			.parse()
			.map_err(|e| ConfigError::Listen(self.server.listen.clone(), e))?;

		let mut seen = std::collections::HashSet::new();
		for p in &self.providers {
			if !seen.insert(p.name.as_str()) {
				return Err(ConfigError::DuplicateProvider(p.name.clone()));
			}
			if !p.enabled {
				continue;
			}
			match p.variant {
				// ollama is unauthenticated; bedrock and vertex sign with
				// ambient credentials, and azure may use entra
				ProviderVariant::Ollama | ProviderVariant::Bedrock | ProviderVariant::Vertex => {},
				ProviderVariant::Azure if p.entra_auth => {},
				_ => {
					if p.keys.is_empty() && !self.server.auth.allow_subscription {
						return Err(ConfigError::Provider(
							p.name.clone(),
							"no keys configured and transparent auth is disabled".to_string(),
						));
					}
				},
			}
			if p.variant == ProviderVariant::Bedrock && p.region.is_none() {
				return Err(ConfigError::Provider(
					p.name.clone(),
					"bedrock requires a region".to_string(),
				));
			}
			if p.variant == ProviderVariant::Vertex && p.project_id.is_none() {
				return Err(ConfigError::Provider(
					p.name.clone(),
					"vertex requires a project_id".to_string(),
				));
			}
			if p.variant == ProviderVariant::Azure && p.resource.is_none() && p.base_url.is_none() {
				return Err(ConfigError::Provider(
					p.name.clone(),
					"azure requires resource or base_url".to_string(),
				));
			}
		}

		if self.routing.failover_timeout == 0 {
			return Err(ConfigError::Routing(
				"failover_timeout must be non-zero".to_string(),
			));
		}
		if self.routing.strategy == StrategyKind::ModelBased
			&& self.routing.model_mapping.is_empty()
			&& self.routing.default_provider.is_none()
		{
			return Err(ConfigError::Routing(
				"model_based requires model_mapping or default_provider".to_string(),
			));
		}

		if self.cache.mode == CacheMode::Ha {
			let ha = &self.cache.ha;
			if ha.bind.is_none() {
				return Err(ConfigError::Cache("ha mode requires a bind address".to_string()));
			}
			if ha.replicas == 0 || ha.read_quorum == 0 || ha.write_quorum == 0 {
				return Err(ConfigError::Cache(
					"ha replicas and quorums must be non-zero".to_string(),
				));
			}
			if ha.read_quorum > ha.replicas || ha.write_quorum > ha.replicas {
				return Err(ConfigError::Cache(
					"quorum cannot exceed replica count".to_string(),
				));
			}
		}

		Ok(Config {
			listen,
			timeout: Duration::from_millis(self.server.timeout_ms),
			max_concurrent: self.server.max_concurrent,
			queue_wait: Duration::from_millis(self.server.queue_wait_ms),
			max_body_bytes: self.server.max_body_bytes,
			enable_http2: self.server.enable_http2,
			auth: self.server.auth,
			providers: self.providers,
			routing: self.routing,
			health: self.health,
			cache: self.cache,
			logging: self.logging,
		})
	}
}

/// Everything a request needs, captured once on entry. Rebuilt wholesale on
/// config reload and swapped atomically; in-flight requests keep the snapshot
/// they loaded.
pub struct RelayState {
	pub providers: Arc<[Arc<ProviderInfo>]>,
	pub limiter: Arc<Semaphore>,
	pub auth: AuthValidator,
	pub signatures: Arc<SignatureCache>,
	pub routing: RoutingConfig,
	pub timeout: Duration,
	pub queue_wait: Duration,
	pub max_body_bytes: usize,
	pub debug_options: DebugOptions,
	pub allow_subscription: bool,
}

/// The service container. Explicit wiring, no service locator: constructed at
/// startup, handed to the server, mutated only through [`Services::reload`].
pub struct Services {
	config: ArcSwap<Config>,
	state: ArcSwap<RelayState>,
	pub router: RouterHandle,
	store: Arc<dyn SignatureStore>,
	pub client: reqwest::Client,
	pub shutdown: CancellationToken,
}

impl Services {
	pub async fn new(cfg: Config) -> Result<Arc<Self>, BuildError> {
		let client = reqwest::Client::builder()
			.pool_max_idle_per_host(16)
			.build()
			.map_err(BuildError::Client)?;
		let shutdown = CancellationToken::new();
		let store = cache::build_store(&cfg.cache, shutdown.clone()).await?;
		let router = RouterHandle::new(&cfg.routing);
		let state = build_state(&cfg, store.clone(), client.clone()).await?;
		Ok(Arc::new(Self {
			config: ArcSwap::from_pointee(cfg),
			state: ArcSwap::new(state),
			router,
			store,
			client,
			shutdown,
		}))
	}

	pub fn config(&self) -> Arc<Config> {
		self.config.load_full()
	}

	pub fn state(&self) -> Arc<RelayState> {
		self.state.load_full()
	}

	/// Applies a new validated config. Providers, key pools, circuit state and
	/// limiter are rebuilt; the router is rebuilt only when the strategy or
	/// failover timeout changed, so round-robin cursors survive a reload. The
	/// listen address and the HA cache bind address are ignored here (restart
	/// settings).
	pub async fn reload(&self, cfg: Config) -> Result<(), BuildError> {
		let old = self.config.load();
		if cfg.listen != old.listen {
			warn!("listen address change requires a restart; keeping {}", old.listen);
		}
		if cfg.cache.ha.bind != old.cache.ha.bind {
			warn!("ha cache bind change requires a restart");
		}
		let state = build_state(&cfg, self.store.clone(), self.client.clone()).await?;
		self.router.rebuild_if_changed(&old.routing, &cfg.routing);
		self.state.store(state);
		self.config.store(Arc::new(cfg));
		info!("configuration reloaded");
		Ok(())
	}

	/// Spawns the background health prober. No-op unless enabled.
	pub fn spawn_health_checker(self: &Arc<Self>) {
		let cfg = self.config();
		if !cfg.health.health_check.enabled {
			return;
		}
		health::spawn_checker(self.clone(), cfg.health.health_check);
	}
}

async fn build_state(
	cfg: &Config,
	store: Arc<dyn SignatureStore>,
	client: reqwest::Client,
) -> Result<Arc<RelayState>, BuildError> {
	let mut infos: Vec<Arc<ProviderInfo>> = Vec::new();
	for pc in cfg.providers.iter().filter(|p| p.enabled) {
		let proxy = provider::ProviderProxy::build(pc, client.clone())
			.await
			.map_err(|e| BuildError::Provider(pc.name.clone(), e))?;
		let breaker = Arc::new(health::CircuitBreaker::new(
			pc.name.clone(),
			cfg.health.circuit_breaker,
		));
		infos.push(Arc::new(ProviderInfo {
			name: proxy.name.clone(),
			weight: pc.weight,
			priority: pc.priority,
			proxy: Arc::new(proxy),
			breaker,
		}));
	}

	let signatures = Arc::new(SignatureCache::new(
		store,
		Duration::from_secs(cfg.cache.ttl_secs),
	));

	Ok(Arc::new(RelayState {
		providers: infos.into(),
		limiter: Arc::new(Semaphore::new(cfg.max_concurrent)),
		auth: AuthValidator::new(&cfg.auth),
		signatures,
		routing: cfg.routing.clone(),
		timeout: cfg.timeout,
		queue_wait: cfg.queue_wait,
		max_body_bytes: cfg.max_body_bytes,
		debug_options: cfg.logging.debug_options.clone(),
		allow_subscription: cfg.auth.allow_subscription,
	}))
}

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
	#[error("http client: {0}")]
	Client(reqwest::Error),
	#[error("provider {0}: {1}")]
	Provider(String, provider::ProviderError),
	#[error("cache: {0}")]
	Cache(String),
}
