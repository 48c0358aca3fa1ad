//! Signature storage backends.
//!
//! Three modes share one contract: `single` is an in-process TinyLFU cache
//! bounded by memory cost, `ha` replicates entries across relay replicas
//! with quorum reads and writes, and `disabled` always misses. A backend
//! failure is never a request failure; callers treat errors as misses and
//! lose only cross-provider signature continuity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::{BuildError, CacheConfig, CacheMode};

pub mod ha;

#[async_trait]
pub trait SignatureStore: Send + Sync {
	async fn get(&self, key: &str) -> Option<Bytes>;
	async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration);
	async fn delete(&self, key: &str);
	async fn exists(&self, key: &str) -> bool;
	async fn close(&self);
}

pub async fn build_store(
	cfg: &CacheConfig,
	shutdown: CancellationToken,
) -> Result<Arc<dyn SignatureStore>, BuildError> {
	match cfg.mode {
		CacheMode::Disabled => Ok(Arc::new(DisabledStore)),
		CacheMode::Single => Ok(Arc::new(MokaStore::new(cfg.max_cost_bytes))),
		CacheMode::Ha => {
			let store = ha::HaStore::start(&cfg.ha, shutdown)
				.await
				.map_err(|e| BuildError::Cache(e.to_string()))?;
			Ok(store)
		},
	}
}

/// `disabled` mode: every read misses, every write is dropped.
pub struct DisabledStore;

#[async_trait]
impl SignatureStore for DisabledStore {
	async fn get(&self, _key: &str) -> Option<Bytes> {
		None
	}
	async fn set_with_ttl(&self, _key: &str, _value: Bytes, _ttl: Duration) {}
	async fn delete(&self, _key: &str) {}
	async fn exists(&self, _key: &str) -> bool {
		false
	}
	async fn close(&self) {}
}

/// Single-node backend: admission-policy (TinyLFU) cache weighted by entry
/// cost in bytes, with per-entry TTL. Reads are lock-free and never block
/// writers.
pub struct MokaStore {
	cache: moka::future::Cache<String, (Bytes, std::time::Instant)>,
}

impl MokaStore {
	pub fn new(max_cost_bytes: u64) -> Self {
		let cache = moka::future::Cache::builder()
			.max_capacity(max_cost_bytes)
			.weigher(|k: &String, v: &(Bytes, std::time::Instant)| {
				(k.len() + v.0.len()).try_into().unwrap_or(u32::MAX)
			})
			// per-entry deadlines are enforced on read; this bounds occupancy
			.time_to_live(Duration::from_secs(24 * 60 * 60))
			.build();
		Self { cache }
	}
}

#[async_trait]
impl SignatureStore for MokaStore {
	async fn get(&self, key: &str) -> Option<Bytes> {
		let (value, deadline) = self.cache.get(key).await?;
		if std::time::Instant::now() >= deadline {
			self.cache.invalidate(key).await;
			return None;
		}
		Some(value)
	}

	async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) {
		let deadline = std::time::Instant::now() + ttl;
		self.cache.insert(key.to_string(), (value, deadline)).await;
	}

	async fn delete(&self, key: &str) {
		self.cache.invalidate(key).await;
	}

	async fn exists(&self, key: &str) -> bool {
		self.get(key).await.is_some()
	}

	async fn close(&self) {
		self.cache.invalidate_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn moka_round_trip() {
		let store = MokaStore::new(1024 * 1024);
		store
			.set_with_ttl("sig:claude:abc", Bytes::from_static(b"sig-value"), Duration::from_secs(60))
			.await;
		assert_eq!(
			store.get("sig:claude:abc").await,
			Some(Bytes::from_static(b"sig-value"))
		);
		assert!(store.exists("sig:claude:abc").await);
		store.delete("sig:claude:abc").await;
		assert!(store.get("sig:claude:abc").await.is_none());
	}

	#[tokio::test]
	async fn moka_expires_by_ttl() {
		let store = MokaStore::new(1024);
		store
			.set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_millis(0))
			.await;
		assert!(store.get("k").await.is_none());
	}

	#[tokio::test]
	async fn disabled_always_misses() {
		let store = DisabledStore;
		store
			.set_with_ttl("k", Bytes::from_static(b"v"), Duration::from_secs(60))
			.await;
		assert!(store.get("k").await.is_none());
		assert!(!store.exists("k").await);
	}
}
