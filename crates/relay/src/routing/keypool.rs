//! Per-provider API-key pools with sliding-minute rate windows.
//!
//! A window tracks request timestamps and token debits over the trailing 60
//! seconds. Selection evicts, filters to keys with headroom, applies the
//! pooling policy, and registers the pending request in one pass under each
//! key's lock. Observation (`usage`) is pure: it never evicts or debits.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};

use crate::{KeyConfig, PoolStrategy};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
	/// Every key is at one of its limits. Carries the duration until the
	/// earliest window eviction frees capacity, when known.
	#[error("all keys exhausted")]
	AllKeysExhausted { retry_after: Option<Duration> },
}

#[derive(Debug, Default)]
pub struct RateWindow {
	requests: VecDeque<Instant>,
	input_tokens: VecDeque<(Instant, u64)>,
	output_tokens: VecDeque<(Instant, u64)>,
	input_sum: u64,
	output_sum: u64,
}

impl RateWindow {
	fn evict(&mut self, now: Instant) {
		let cutoff = now - WINDOW;
		while self.requests.front().is_some_and(|t| *t <= cutoff) {
			self.requests.pop_front();
		}
		while self.input_tokens.front().is_some_and(|(t, _)| *t <= cutoff) {
			let (_, n) = self.input_tokens.pop_front().expect("front checked");
			self.input_sum -= n;
		}
		while self.output_tokens.front().is_some_and(|(t, _)| *t <= cutoff) {
			let (_, n) = self.output_tokens.pop_front().expect("front checked");
			self.output_sum -= n;
		}
	}

	/// Counts without mutating; used by observation paths.
	fn peek(&self, now: Instant) -> WindowUsage {
		let cutoff = now - WINDOW;
		WindowUsage {
			requests: self.requests.iter().filter(|t| **t > cutoff).count() as u32,
			input_tokens: self
				.input_tokens
				.iter()
				.filter(|(t, _)| *t > cutoff)
				.map(|(_, n)| n)
				.sum(),
			output_tokens: self
				.output_tokens
				.iter()
				.filter(|(t, _)| *t > cutoff)
				.map(|(_, n)| n)
				.sum(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
	pub requests: u32,
	pub input_tokens: u64,
	pub output_tokens: u64,
}

pub struct PoolKey {
	cfg: KeyConfig,
	window: Mutex<RateWindow>,
}

impl PoolKey {
	pub fn secret(&self) -> &SecretString {
		&self.cfg.key
	}

	/// First eight characters of the key, for logs. Never the whole thing.
	pub fn prefix(&self) -> String {
		let exposed = self.cfg.key.expose_secret();
		let head: String = exposed.chars().take(8).collect();
		if exposed.len() > 8 { format!("{head}…") } else { head }
	}

	pub fn usage(&self) -> WindowUsage {
		self.window.lock().peek(Instant::now())
	}

	/// Records observed token usage from an upstream response.
	pub fn record_usage(&self, input_tokens: u64, output_tokens: u64) {
		let now = Instant::now();
		let mut w = self.window.lock();
		if input_tokens > 0 {
			w.input_tokens.push_back((now, input_tokens));
			w.input_sum += input_tokens;
		}
		if output_tokens > 0 {
			w.output_tokens.push_back((now, output_tokens));
			w.output_sum += output_tokens;
		}
	}

	fn admits(&self, w: &RateWindow) -> bool {
		let c = &self.cfg;
		(c.rpm_limit == 0 || (w.requests.len() as u32) < c.rpm_limit)
			&& (c.input_tpm == 0 || w.input_sum < c.input_tpm)
			&& (c.output_tpm == 0 || w.output_sum < c.output_tpm)
	}
}

pub struct KeyPool {
	keys: Vec<Arc<PoolKey>>,
	strategy: PoolStrategy,
	cursor: AtomicUsize,
}

impl KeyPool {
	pub fn new(mut configs: Vec<KeyConfig>, strategy: PoolStrategy) -> Self {
		// higher priority keys come first so failover ordering is positional
		configs.sort_by_key(|k| std::cmp::Reverse(k.priority));
		Self {
			keys: configs
				.into_iter()
				.map(|cfg| {
					Arc::new(PoolKey {
						cfg,
						window: Mutex::new(RateWindow::default()),
					})
				})
				.collect(),
			strategy,
			cursor: AtomicUsize::new(0),
		}
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Picks a key whose window admits one more request and registers that
	/// request. Eviction, admission and the debit happen atomically under
	/// each key's lock.
	pub fn select(&self) -> Result<Arc<PoolKey>, PoolError> {
		let now = Instant::now();
		let mut admitted: Vec<(usize, f64, u64)> = Vec::with_capacity(self.keys.len());
		let mut earliest_free: Option<Duration> = None;

		for (i, key) in self.keys.iter().enumerate() {
			let mut w = key.window.lock();
			w.evict(now);
			if key.admits(&w) {
				let load = if key.cfg.rpm_limit == 0 {
					w.requests.len() as f64 / u32::MAX as f64
				} else {
					w.requests.len() as f64 / key.cfg.rpm_limit as f64
				};
				let token_headroom = key
					.cfg
					.input_tpm
					.saturating_sub(w.input_sum)
					.saturating_add(key.cfg.output_tpm.saturating_sub(w.output_sum));
				admitted.push((i, load, token_headroom));
			} else if let Some(oldest) = w.requests.front() {
				let free_in = (*oldest + WINDOW).saturating_duration_since(now);
				earliest_free = Some(match earliest_free {
					Some(cur) => cur.min(free_in),
					None => free_in,
				});
			}
		}

		if admitted.is_empty() {
			return Err(PoolError::AllKeysExhausted {
				retry_after: earliest_free,
			});
		}

		let chosen = match self.strategy {
			PoolStrategy::LeastLoaded => {
				admitted
					.iter()
					.min_by(|a, b| {
						a.1
							.partial_cmp(&b.1)
							.unwrap_or(std::cmp::Ordering::Equal)
							// ties broken by token headroom, larger first
							.then(b.2.cmp(&a.2))
					})
					.expect("admitted is non-empty")
					.0
			},
			PoolStrategy::RoundRobin => {
				let n = self.cursor.fetch_add(1, Ordering::Relaxed);
				admitted[n % admitted.len()].0
			},
		};

		let key = &self.keys[chosen];
		key.window.lock().requests.push_back(now);
		Ok(key.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(name: &str, rpm: u32) -> KeyConfig {
		KeyConfig {
			key: SecretString::from(name),
			rpm_limit: rpm,
			..KeyConfig::default()
		}
	}

	fn pool(keys: Vec<KeyConfig>, strategy: PoolStrategy) -> KeyPool {
		KeyPool::new(keys, strategy)
	}

	#[test]
	fn single_key_admits_until_rpm() {
		let p = pool(vec![key("k1", 2)], PoolStrategy::LeastLoaded);
		assert!(p.select().is_ok());
		assert!(p.select().is_ok());
		assert!(matches!(
			p.select(),
			Err(PoolError::AllKeysExhausted { retry_after: Some(_) })
		));
	}

	#[test]
	fn zero_limits_mean_unlimited() {
		let p = pool(vec![key("k1", 0)], PoolStrategy::LeastLoaded);
		for _ in 0..1000 {
			assert!(p.select().is_ok());
		}
	}

	#[test]
	fn least_loaded_prefers_emptier_key() {
		let p = pool(vec![key("k1", 10), key("k2", 10)], PoolStrategy::LeastLoaded);
		let first = p.select().unwrap();
		let second = p.select().unwrap();
		// second selection must go to the other key
		assert_ne!(
			first.secret().expose_secret(),
			second.secret().expose_secret()
		);
	}

	#[test]
	fn round_robin_cycles() {
		let p = pool(vec![key("k1", 0), key("k2", 0)], PoolStrategy::RoundRobin);
		let a = p.select().unwrap().prefix();
		let b = p.select().unwrap().prefix();
		let c = p.select().unwrap().prefix();
		assert_ne!(a, b);
		assert_eq!(a, c);
	}

	#[test]
	fn observation_does_not_consume_capacity() {
		let p = pool(vec![key("k1", 2), key("k2", 2)], PoolStrategy::LeastLoaded);
		let chosen = p.select().unwrap();
		let before = chosen.usage();
		for _ in 0..50 {
			let _ = chosen.usage();
			for k in &p.keys {
				let _ = k.usage();
			}
		}
		assert_eq!(chosen.usage(), before);
		// the next select is deterministic: k's windows were not touched
		let next = p.select().unwrap();
		assert_ne!(
			next.secret().expose_secret(),
			chosen.secret().expose_secret()
		);
	}

	#[test]
	fn token_limits_block_selection() {
		let p = pool(
			vec![KeyConfig {
				key: SecretString::from("k1"),
				rpm_limit: 0,
				input_tpm: 100,
				output_tpm: 0,
				weight: 1,
				priority: 0,
			}],
			PoolStrategy::LeastLoaded,
		);
		let k = p.select().unwrap();
		k.record_usage(100, 0);
		assert!(matches!(p.select(), Err(PoolError::AllKeysExhausted { .. })));
	}

	#[test]
	fn higher_priority_key_sorts_first() {
		let p = pool(
			vec![
				KeyConfig {
					key: SecretString::from("low"),
					priority: 0,
					..KeyConfig::default()
				},
				KeyConfig {
					key: SecretString::from("high"),
					priority: 10,
					..KeyConfig::default()
				},
			],
			PoolStrategy::LeastLoaded,
		);
		assert_eq!(p.keys[0].secret().expose_secret(), "high");
	}

	#[test]
	fn key_prefix_is_truncated() {
		let p = pool(vec![key("sk-ant-api03-verylongkey", 0)], PoolStrategy::LeastLoaded);
		let prefix = p.keys[0].prefix();
		assert!(prefix.starts_with("sk-ant-a"));
		assert!(!prefix.contains("verylongkey"));
	}
}
