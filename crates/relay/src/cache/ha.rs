//! Replicated signature store for multi-replica deployments.
//!
//! Each relay replica runs a small data plane (HTTP, on `cache.ha.bind`) and
//! a membership heartbeat (UDP, on the same port + 2). Keys are placed by
//! rendezvous hashing onto `replicas` members; reads and writes fan out to
//! the owner set and succeed once the configured quorum answers. Quorum
//! failures surface as cache misses, never as request failures.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes as AxBytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::HaCacheConfig;
use crate::cache::SignatureStore;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const MEMBER_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const GOSSIP_FANOUT: usize = 2;

#[derive(thiserror::Error, Debug)]
pub enum HaError {
	#[error("invalid bind address {0:?}")]
	Bind(String),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Member {
	id: String,
	/// Data-plane address ("host:port"); gossip runs on port + 2.
	addr: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
	from: Member,
	members: Vec<Member>,
}

struct MemberState {
	member: Member,
	last_seen: Instant,
}

struct HaInner {
	node: Member,
	replicas: usize,
	read_quorum: usize,
	write_quorum: usize,
	local: RwLock<HashMap<String, (Bytes, Instant)>>,
	members: RwLock<HashMap<String, MemberState>>,
	seeds: Vec<String>,
	client: reqwest::Client,
	gossip: UdpSocket,
}

pub struct HaStore {
	inner: Arc<HaInner>,
}

impl HaStore {
	pub async fn start(
		cfg: &HaCacheConfig,
		shutdown: CancellationToken,
	) -> Result<Arc<Self>, HaError> {
		let bind = cfg
			.bind
			.clone()
			.ok_or_else(|| HaError::Bind("<unset>".to_string()))?;
		let data_addr: SocketAddr = bind.parse().map_err(|_| HaError::Bind(bind.clone()))?;
		let gossip_addr = SocketAddr::new(data_addr.ip(), data_addr.port() + 2);

		let listener = tokio::net::TcpListener::bind(data_addr).await?;
		let gossip = UdpSocket::bind(gossip_addr).await?;

		let node = Member {
			id: uuid::Uuid::new_v4().to_string(),
			addr: bind.clone(),
		};
		let inner = Arc::new(HaInner {
			node: node.clone(),
			replicas: cfg.replicas,
			read_quorum: cfg.read_quorum,
			write_quorum: cfg.write_quorum,
			local: RwLock::new(HashMap::new()),
			members: RwLock::new(HashMap::new()),
			seeds: cfg.peers.clone(),
			client: reqwest::Client::new(),
			gossip,
		});
		inner.members.write().insert(
			node.id.clone(),
			MemberState {
				member: node,
				last_seen: Instant::now(),
			},
		);

		let app = Router::new()
			.route(
				"/internal/cache/{key}",
				get(handle_get).put(handle_put).delete(handle_delete),
			)
			.with_state(inner.clone());
		let serve_shutdown = shutdown.clone();
		tokio::spawn(async move {
			let _ = axum::serve(listener, app)
				.with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
				.await;
		});

		tokio::spawn(gossip_loop(inner.clone(), shutdown.clone()));
		tokio::spawn(sweep_loop(inner.clone(), shutdown));

		Ok(Arc::new(Self { inner }))
	}
}

impl HaInner {
	fn live_members(&self) -> Vec<Member> {
		let now = Instant::now();
		self
			.members
			.read()
			.values()
			.filter(|m| m.member.id == self.node.id || now - m.last_seen < MEMBER_TIMEOUT)
			.map(|m| m.member.clone())
			.collect()
	}

	/// Rendezvous placement: every member scores the key, the top `replicas`
	/// scores own it. Stable under membership churn for unaffected keys.
	fn owners(&self, key: &str) -> Vec<Member> {
		let mut scored: Vec<(u64, Member)> = self
			.live_members()
			.into_iter()
			.map(|m| {
				let mut hasher = Sha256::new();
				hasher.update(key.as_bytes());
				hasher.update(m.id.as_bytes());
				let digest = hasher.finalize();
				let score = u64::from_be_bytes(digest[..8].try_into().expect("sha256 >= 8 bytes"));
				(score, m)
			})
			.collect();
		scored.sort_by(|a, b| b.0.cmp(&a.0));
		scored
			.into_iter()
			.take(self.replicas)
			.map(|(_, m)| m)
			.collect()
	}

	fn local_get(&self, key: &str) -> Option<Bytes> {
		let map = self.local.read();
		let (value, deadline) = map.get(key)?;
		if Instant::now() >= *deadline {
			return None;
		}
		Some(value.clone())
	}

	fn local_set(&self, key: &str, value: Bytes, ttl: Duration) {
		self
			.local
			.write()
			.insert(key.to_string(), (value, Instant::now() + ttl));
	}

	fn local_delete(&self, key: &str) {
		self.local.write().remove(key);
	}
}

// data-plane handlers

async fn handle_get(
	State(inner): State<Arc<HaInner>>,
	Path(key): Path<String>,
) -> Result<Vec<u8>, StatusCode> {
	match inner.local_get(&key) {
		Some(v) => Ok(v.to_vec()),
		None => Err(StatusCode::NOT_FOUND),
	}
}

#[derive(Deserialize)]
struct PutParams {
	ttl_ms: u64,
}

async fn handle_put(
	State(inner): State<Arc<HaInner>>,
	Path(key): Path<String>,
	Query(params): Query<PutParams>,
	body: AxBytes,
) -> StatusCode {
	inner.local_set(&key, body, Duration::from_millis(params.ttl_ms));
	StatusCode::NO_CONTENT
}

async fn handle_delete(State(inner): State<Arc<HaInner>>, Path(key): Path<String>) -> StatusCode {
	inner.local_delete(&key);
	StatusCode::NO_CONTENT
}

// membership

fn gossip_addr_of(data_addr: &str) -> Option<SocketAddr> {
	let addr: SocketAddr = data_addr.parse().ok()?;
	Some(SocketAddr::new(addr.ip(), addr.port() + 2))
}

async fn gossip_loop(inner: Arc<HaInner>, shutdown: CancellationToken) {
	let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return,
			_ = tick.tick() => {
				send_heartbeats(&inner).await;
			},
			recv = inner.gossip.recv_from(&mut buf) => {
				let Ok((n, _)) = recv else { continue };
				let Ok(hb) = serde_json::from_slice::<Heartbeat>(&buf[..n]) else {
					continue;
				};
				merge_heartbeat(&inner, hb);
			},
		}
	}
}

async fn send_heartbeats(inner: &Arc<HaInner>) {
	let members = inner.live_members();
	let hb = Heartbeat {
		from: inner.node.clone(),
		members: members.clone(),
	};
	let Ok(payload) = serde_json::to_vec(&hb) else {
		return;
	};

	// seeds always, plus a small random fanout of known members
	let mut targets: Vec<String> = inner.seeds.clone();
	let sample = members
		.iter()
		.filter(|m| m.id != inner.node.id)
		.map(|m| m.addr.clone())
		.choose_multiple(&mut rand::rng(), GOSSIP_FANOUT);
	targets.extend(sample);
	targets.sort();
	targets.dedup();

	for target in targets {
		if target == inner.node.addr {
			continue;
		}
		if let Some(addr) = gossip_addr_of(&target) {
			if let Err(e) = inner.gossip.send_to(&payload, addr).await {
				debug!("heartbeat to {target} failed: {e}");
			}
		}
	}
}

fn merge_heartbeat(inner: &Arc<HaInner>, hb: Heartbeat) {
	let now = Instant::now();
	let mut members = inner.members.write();
	members
		.entry(hb.from.id.clone())
		.and_modify(|m| m.last_seen = now)
		.or_insert_with(|| MemberState {
			member: hb.from.clone(),
			last_seen: now,
		});
	for m in hb.members {
		if m.id == inner.node.id {
			continue;
		}
		members.entry(m.id.clone()).or_insert_with(|| MemberState {
			member: m,
			last_seen: now,
		});
	}
}

async fn sweep_loop(inner: Arc<HaInner>, shutdown: CancellationToken) {
	let mut tick = tokio::time::interval(SWEEP_INTERVAL);
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => return,
			_ = tick.tick() => {
				let now = Instant::now();
				inner.local.write().retain(|_, (_, deadline)| *deadline > now);
				inner
					.members
					.write()
					.retain(|id, m| *id == inner.node.id || now - m.last_seen < MEMBER_TIMEOUT * 2);
			},
		}
	}
}

#[async_trait]
impl SignatureStore for HaStore {
	async fn get(&self, key: &str) -> Option<Bytes> {
		let inner = &self.inner;
		let owners = inner.owners(key);
		if owners.is_empty() {
			return None;
		}
		let mut responses = 0usize;
		let mut hit: Option<Bytes> = None;
		for owner in &owners {
			if owner.id == inner.node.id {
				responses += 1;
				if hit.is_none() {
					hit = inner.local_get(key);
				}
				continue;
			}
			let url = format!("http://{}/internal/cache/{}", owner.addr, key);
			match inner
				.client
				.get(&url)
				.timeout(Duration::from_millis(250))
				.send()
				.await
			{
				Ok(resp) if resp.status().is_success() => {
					responses += 1;
					if hit.is_none() {
						hit = resp.bytes().await.ok();
					}
				},
				Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
					responses += 1;
				},
				_ => {},
			}
			if responses >= inner.read_quorum && hit.is_some() {
				break;
			}
		}
		if responses < inner.read_quorum {
			debug!("read quorum not met for {key} ({responses}/{})", inner.read_quorum);
			return None;
		}
		hit
	}

	async fn set_with_ttl(&self, key: &str, value: Bytes, ttl: Duration) {
		let inner = &self.inner;
		let owners = inner.owners(key);
		let mut acks = 0usize;
		for owner in &owners {
			if owner.id == inner.node.id {
				inner.local_set(key, value.clone(), ttl);
				acks += 1;
				continue;
			}
			let url = format!(
				"http://{}/internal/cache/{}?ttl_ms={}",
				owner.addr,
				key,
				ttl.as_millis()
			);
			match inner
				.client
				.put(&url)
				.timeout(Duration::from_millis(250))
				.body(value.clone())
				.send()
				.await
			{
				Ok(resp) if resp.status().is_success() => acks += 1,
				_ => {},
			}
		}
		if acks < inner.write_quorum {
			warn!(
				"write quorum not met for {key} ({acks}/{}); entry is under-replicated",
				inner.write_quorum
			);
		}
	}

	async fn delete(&self, key: &str) {
		let inner = &self.inner;
		for owner in inner.owners(key) {
			if owner.id == inner.node.id {
				inner.local_delete(key);
				continue;
			}
			let url = format!("http://{}/internal/cache/{}", owner.addr, key);
			let _ = inner
				.client
				.delete(&url)
				.timeout(Duration::from_millis(250))
				.send()
				.await;
		}
	}

	async fn exists(&self, key: &str) -> bool {
		self.get(key).await.is_some()
	}

	async fn close(&self) {
		self.inner.local.write().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn inner_with_members(ids: &[&str]) -> Arc<HaInner> {
		let node = Member {
			id: ids[0].to_string(),
			addr: "127.0.0.1:4400".to_string(),
		};
		let gossip = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		gossip.set_nonblocking(true).unwrap();
		let inner = Arc::new(HaInner {
			node: node.clone(),
			replicas: 2,
			read_quorum: 1,
			write_quorum: 1,
			local: RwLock::new(HashMap::new()),
			members: RwLock::new(HashMap::new()),
			seeds: vec![],
			client: reqwest::Client::new(),
			gossip: UdpSocket::from_std(gossip).unwrap(),
		});
		let mut members = inner.members.write();
		for id in ids {
			let idx = members.len();
			members.insert(
				id.to_string(),
				MemberState {
					member: Member {
						id: id.to_string(),
						addr: format!("127.0.0.1:44{:02}", idx),
					},
					last_seen: Instant::now(),
				},
			);
		}
		drop(members);
		inner
	}

	#[tokio::test]
	async fn owners_are_stable_and_bounded() {
		let inner = inner_with_members(&["n1", "n2", "n3"]);
		let a = inner.owners("sig:claude:abcd");
		let b = inner.owners("sig:claude:abcd");
		assert_eq!(a, b);
		assert_eq!(a.len(), 2);
	}

	#[tokio::test]
	async fn different_keys_spread() {
		let inner = inner_with_members(&["n1", "n2", "n3", "n4"]);
		let mut first_owners = std::collections::HashSet::new();
		for i in 0..32 {
			let owners = inner.owners(&format!("sig:claude:{i}"));
			first_owners.insert(owners[0].id.clone());
		}
		assert!(first_owners.len() > 1, "rendezvous hash placed everything on one node");
	}

	#[tokio::test]
	async fn local_entries_expire() {
		let inner = inner_with_members(&["n1"]);
		inner.local_set("k", Bytes::from_static(b"v"), Duration::from_millis(0));
		assert!(inner.local_get("k").is_none());
	}

	#[test]
	fn heartbeat_merge_adds_members() {
		let rt = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.unwrap();
		let _guard = rt.enter();
		let inner = inner_with_members(&["n1"]);
		merge_heartbeat(
			&inner,
			Heartbeat {
				from: Member {
					id: "n2".to_string(),
					addr: "127.0.0.1:4500".to_string(),
				},
				members: vec![Member {
					id: "n3".to_string(),
					addr: "127.0.0.1:4600".to_string(),
				}],
			},
		);
		assert_eq!(inner.live_members().len(), 3);
	}
}
