//! Per-provider circuit breaking and background health probing.
//!
//! One three-state machine per provider: CLOSED counts consecutive
//! failures, OPEN rejects until `open_duration_ms` elapses, HALF_OPEN lets a
//! single trial request through at a time and closes after
//! `half_open_probes` consecutive successes. Only 429/5xx and transport
//! failures count; a provider returning 400s all day is healthy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{BreakerConfig, HealthCheckConfig, Services};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
	state: CircuitState,
	consecutive_failures: u32,
	opened_at: Instant,
	half_open_successes: u32,
	half_open_in_flight: bool,
}

pub struct CircuitBreaker {
	name: String,
	cfg: BreakerConfig,
	inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
	pub fn new(name: String, cfg: BreakerConfig) -> Self {
		Self {
			name,
			cfg,
			inner: Mutex::new(BreakerInner {
				state: CircuitState::Closed,
				consecutive_failures: 0,
				opened_at: Instant::now(),
				half_open_successes: 0,
				half_open_in_flight: false,
			}),
		}
	}

	fn open_duration(&self) -> Duration {
		Duration::from_millis(self.cfg.open_duration_ms)
	}

	pub fn state(&self) -> CircuitState {
		self.inner.lock().state
	}

	/// Non-mutating view used by routing filters: would a request be allowed
	/// right now? OPEN circuits past their deadline count as available since
	/// admission would move them to HALF_OPEN.
	pub fn available(&self) -> bool {
		let inner = self.inner.lock();
		match inner.state {
			CircuitState::Closed => true,
			CircuitState::Open => inner.opened_at.elapsed() >= self.open_duration(),
			CircuitState::HalfOpen => !inner.half_open_in_flight,
		}
	}

	/// Admission for a real request. In HALF_OPEN this reserves the single
	/// trial slot; callers must resolve it via `on_success`, `on_failure`,
	/// or `release`.
	pub fn acquire(&self) -> bool {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitState::Closed => true,
			CircuitState::Open => {
				if inner.opened_at.elapsed() >= self.open_duration() {
					info!(provider = %self.name, "circuit half-open");
					inner.state = CircuitState::HalfOpen;
					inner.half_open_successes = 0;
					inner.half_open_in_flight = true;
					true
				} else {
					false
				}
			},
			CircuitState::HalfOpen => {
				if inner.half_open_in_flight {
					false
				} else {
					inner.half_open_in_flight = true;
					true
				}
			},
		}
	}

	pub fn on_success(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitState::Closed => inner.consecutive_failures = 0,
			CircuitState::HalfOpen => {
				inner.half_open_in_flight = false;
				inner.half_open_successes += 1;
				if inner.half_open_successes >= self.cfg.half_open_probes {
					info!(provider = %self.name, "circuit closed");
					inner.state = CircuitState::Closed;
					inner.consecutive_failures = 0;
				}
			},
			CircuitState::Open => {},
		}
	}

	pub fn on_failure(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitState::Closed => {
				inner.consecutive_failures += 1;
				if inner.consecutive_failures >= self.cfg.failure_threshold {
					warn!(
						provider = %self.name,
						failures = inner.consecutive_failures,
						"circuit open"
					);
					inner.state = CircuitState::Open;
					inner.opened_at = Instant::now();
				}
			},
			CircuitState::HalfOpen => {
				warn!(provider = %self.name, "half-open probe failed; circuit re-open");
				inner.state = CircuitState::Open;
				inner.opened_at = Instant::now();
				inner.half_open_in_flight = false;
			},
			CircuitState::Open => {},
		}
	}

	/// Resolves an admission without counting it either way (client
	/// disconnect, request never dispatched).
	pub fn release(&self) {
		let mut inner = self.inner.lock();
		if inner.state == CircuitState::HalfOpen {
			inner.half_open_in_flight = false;
		}
	}

	/// A successful out-of-band connectivity probe moves an OPEN circuit to
	/// HALF_OPEN early. Probes never touch CLOSED circuits.
	pub fn probe_success(&self) {
		let mut inner = self.inner.lock();
		if inner.state == CircuitState::Open {
			info!(provider = %self.name, "health probe succeeded; circuit half-open");
			inner.state = CircuitState::HalfOpen;
			inner.half_open_successes = 0;
			inner.half_open_in_flight = false;
		}
	}
}

/// Background prober: periodically checks connectivity of providers whose
/// circuits are OPEN, accelerating recovery without waiting out the full
/// open duration.
pub fn spawn_checker(services: Arc<Services>, cfg: HealthCheckConfig) {
	let interval = Duration::from_millis(cfg.interval_ms.max(250));
	let shutdown = services.shutdown.clone();
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(interval);
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = tick.tick() => {},
			}
			let state = services.state();
			for info in state.providers.iter() {
				if info.breaker.state() != CircuitState::Open {
					continue;
				}
				let ok = info.proxy.probe(&services.client).await;
				debug!(provider = %info.name, ok, "health probe");
				if ok {
					info.breaker.probe_success();
				}
			}
		}
	});
}
