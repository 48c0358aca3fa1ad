//! Provider selection: pluggable routing strategies over the filtered,
//! healthy provider set.
//!
//! The active strategy is reached through a live handle so a hot reload
//! takes effect on the next request; stateful strategies (round-robin
//! cursors, smooth-WRR weights, shuffle decks) are rebuilt only when the
//! routing section of the config actually changed, preserving their state
//! across unrelated reloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwapAny;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::health::CircuitBreaker;
use crate::provider::ProviderProxy;
use crate::{RoutingConfig, StrategyKind};

pub mod filter;
pub mod keypool;

/// One row of the router's input. The slice is an atomically-swapped
/// snapshot; strategies never mutate it.
pub struct ProviderInfo {
	pub name: Arc<str>,
	pub weight: u32,
	pub priority: i32,
	pub proxy: Arc<ProviderProxy>,
	pub breaker: Arc<CircuitBreaker>,
}

impl ProviderInfo {
	pub fn is_healthy(&self) -> bool {
		self.breaker.available()
	}
}

#[derive(thiserror::Error, Debug)]
pub enum RoutingError {
	#[error("no provider available")]
	NoProviderAvailable,
}

/// What the strategy decided. `Ordered` carries the failover ordering: the
/// head is attempted first, the tail is raced when the head fails with a
/// failover-eligible outcome before any byte reached the client.
pub enum Selection {
	One(Arc<ProviderInfo>),
	Ordered(Vec<Arc<ProviderInfo>>),
}

pub trait RoutingStrategy: Send + Sync {
	fn name(&self) -> &'static str;
	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError>;

	/// Model-aware entry point; only `model_based` cares about the model.
	fn select_for(
		&self,
		_model: &str,
		infos: &[Arc<ProviderInfo>],
	) -> Result<Selection, RoutingError> {
		self.select(infos)
	}
}

fn healthy(infos: &[Arc<ProviderInfo>]) -> Vec<Arc<ProviderInfo>> {
	infos.iter().filter(|i| i.is_healthy()).cloned().collect()
}

/// Atomic counter modulo the healthy count. The instance is cached across
/// requests; rebuilding it would reset the cursor.
pub struct RoundRobin {
	counter: AtomicUsize,
}

impl RoundRobin {
	pub fn new() -> Self {
		Self {
			counter: AtomicUsize::new(0),
		}
	}
}

impl RoutingStrategy for RoundRobin {
	fn name(&self) -> &'static str {
		"round_robin"
	}

	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError> {
		let healthy = healthy(infos);
		if healthy.is_empty() {
			return Err(RoutingError::NoProviderAvailable);
		}
		let n = self.counter.fetch_add(1, Ordering::Relaxed);
		Ok(Selection::One(healthy[n % healthy.len()].clone()))
	}
}

/// Nginx smooth weighted round-robin: each pick raises every candidate's
/// current weight by its effective weight, takes the max, then subtracts the
/// total. Weights 3:1 interleave as A,A,B,A rather than A,A,A,B.
pub struct WeightedRoundRobin {
	current: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
	pub fn new() -> Self {
		Self {
			current: Mutex::new(HashMap::new()),
		}
	}
}

impl RoutingStrategy for WeightedRoundRobin {
	fn name(&self) -> &'static str {
		"weighted_round_robin"
	}

	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError> {
		let healthy = healthy(infos);
		if healthy.is_empty() {
			return Err(RoutingError::NoProviderAvailable);
		}
		let all_zero = healthy.iter().all(|i| i.weight == 0);
		let effective =
			|i: &ProviderInfo| -> i64 { if all_zero { 1 } else { i.weight as i64 } };
		let total: i64 = healthy.iter().map(|i| effective(i)).sum();

		let mut current = self.current.lock();
		let mut best: Option<(i64, usize)> = None;
		for (idx, info) in healthy.iter().enumerate() {
			let entry = current.entry(info.name.to_string()).or_insert(0);
			*entry += effective(info);
			match best {
				Some((score, _)) if *entry <= score => {},
				_ => best = Some((*entry, idx)),
			}
		}
		let (_, idx) = best.expect("healthy is non-empty");
		let chosen = healthy[idx].clone();
		*current
			.entry(chosen.name.to_string())
			.or_insert(0) -= total;
		Ok(Selection::One(chosen))
	}
}

/// Fisher-Yates card dealing: a shuffled deck is consumed one provider per
/// request and reshuffled when empty, so every provider is served exactly
/// once per cycle.
pub struct Shuffle {
	deck: Mutex<Vec<String>>,
}

impl Shuffle {
	pub fn new() -> Self {
		Self {
			deck: Mutex::new(Vec::new()),
		}
	}
}

impl RoutingStrategy for Shuffle {
	fn name(&self) -> &'static str {
		"shuffle"
	}

	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError> {
		let healthy = healthy(infos);
		if healthy.is_empty() {
			return Err(RoutingError::NoProviderAvailable);
		}
		let mut deck = self.deck.lock();
		loop {
			match deck.pop() {
				Some(name) => {
					if let Some(info) = healthy.iter().find(|i| i.name.as_ref() == name) {
						return Ok(Selection::One(info.clone()));
					}
					// provider disappeared or went unhealthy mid-cycle; deal again
				},
				None => {
					let mut names: Vec<String> =
						healthy.iter().map(|i| i.name.to_string()).collect();
					names.shuffle(&mut rand::rng());
					*deck = names;
				},
			}
		}
	}
}

/// Priority-ordered failover. The handler attempts the head; a
/// failover-eligible failure before first flush races the rest under the
/// configured timeout.
pub struct Failover;

impl RoutingStrategy for Failover {
	fn name(&self) -> &'static str {
		"failover"
	}

	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError> {
		let mut healthy = healthy(infos);
		if healthy.is_empty() {
			return Err(RoutingError::NoProviderAvailable);
		}
		// stable sort keeps input order among equal priorities
		healthy.sort_by_key(|i| std::cmp::Reverse(i.priority));
		Ok(Selection::Ordered(healthy))
	}
}

/// Deterministic routing by model prefix; unmatched models fall back to
/// failover semantics.
pub struct ModelBased {
	mapping: IndexMap<String, String>,
	default_provider: Option<String>,
	fallback: Failover,
}

impl ModelBased {
	pub fn new(mapping: IndexMap<String, String>, default_provider: Option<String>) -> Self {
		Self {
			mapping,
			default_provider,
			fallback: Failover,
		}
	}

	/// The request model, stashed by the handler before selection.
	fn target_for(&self, model: &str) -> Option<&str> {
		self
			.mapping
			.iter()
			.filter_map(|(key, provider)| {
				let prefix = key.strip_suffix('*').unwrap_or(key);
				model
					.starts_with(prefix)
					.then_some((prefix.len(), provider.as_str()))
			})
			.max_by_key(|(len, _)| *len)
			.map(|(_, provider)| provider)
			.or(self.default_provider.as_deref())
	}

	pub fn select_for_model(
		&self,
		model: &str,
		infos: &[Arc<ProviderInfo>],
	) -> Result<Selection, RoutingError> {
		if let Some(target) = self.target_for(model) {
			if let Some(info) = infos
				.iter()
				.find(|i| i.name.as_ref() == target && i.is_healthy())
			{
				return Ok(Selection::One(info.clone()));
			}
		}
		self.fallback.select(infos)
	}
}

impl RoutingStrategy for ModelBased {
	fn name(&self) -> &'static str {
		"model_based"
	}

	fn select(&self, infos: &[Arc<ProviderInfo>]) -> Result<Selection, RoutingError> {
		// without a model the mapping cannot apply
		self.fallback.select(infos)
	}

	fn select_for(
		&self,
		model: &str,
		infos: &[Arc<ProviderInfo>],
	) -> Result<Selection, RoutingError> {
		self.select_for_model(model, infos)
	}
}

type SharedStrategy = ArcSwapAny<Arc<Box<dyn RoutingStrategy>>>;

/// Live indirection to the active strategy. Handlers call `current()` per
/// request; `rebuild_if_changed` swaps in a new instance only when the
/// routing config materially changed.
pub struct RouterHandle {
	inner: SharedStrategy,
}

impl RouterHandle {
	pub fn new(cfg: &RoutingConfig) -> Self {
		Self {
			inner: ArcSwapAny::new(build_strategy(cfg)),
		}
	}

	pub fn current(&self) -> Arc<Box<dyn RoutingStrategy>> {
		self.inner.load_full()
	}

	pub fn rebuild_if_changed(&self, old: &RoutingConfig, new: &RoutingConfig) {
		let changed = old.strategy != new.strategy
			|| old.failover_timeout != new.failover_timeout
			|| old.model_mapping != new.model_mapping
			|| old.default_provider != new.default_provider;
		if changed {
			self.inner.store(build_strategy(new));
		}
	}
}

pub fn build_strategy(cfg: &RoutingConfig) -> Arc<Box<dyn RoutingStrategy>> {
	match cfg.strategy {
		StrategyKind::RoundRobin => Arc::new(Box::new(RoundRobin::new())),
		StrategyKind::WeightedRoundRobin => Arc::new(Box::new(WeightedRoundRobin::new())),
		StrategyKind::Shuffle => Arc::new(Box::new(Shuffle::new())),
		StrategyKind::Failover => Arc::new(Box::new(Failover)),
		StrategyKind::ModelBased => Arc::new(Box::new(ModelBased::new(
			cfg.model_mapping.clone(),
			cfg.default_provider.clone(),
		))),
	}
}
