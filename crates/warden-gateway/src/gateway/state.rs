//! Allocation pool and connection registry.
//!
//! Both structures live behind a single `RwLock` so that "is this client
//! connected" and "which slot does it own" are always observed together.
//! Callers only ever get snapshot copies; nothing here performs I/O while
//! the lock is held.

use crate::gateway::agent::NetworkAgent;
use crate::gateway::metrics::GatewayMetrics;
use crate::gateway::types::{Allocation, GatewayError, GatewayErrorKind, GatewayResult, Session};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Host octets excluded from the pool: network, gateway, broadcast.
const RESERVED_HOSTS: [u8; 3] = [0, 1, 255];

/// Usable client addresses of the /24 starting at `network`, in order.
pub fn pool_addresses(network: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = network.octets();
    (0..=255u8)
        .filter(|h| !RESERVED_HOSTS.contains(h))
        .map(|h| Ipv4Addr::new(a, b, c, h))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Shared state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Slot {
    ip: Ipv4Addr,
    owner: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    slots: Vec<Slot>,
    sessions: HashMap<String, Session>,
}

/// Pool slots plus active sessions, guarded together.
#[derive(Debug)]
pub struct GatewayState {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl GatewayState {
    /// Build a pool over a fixed address list. The order is the scan order.
    pub fn new(addresses: Vec<Ipv4Addr>) -> Self {
        let slots: Vec<Slot> = addresses
            .into_iter()
            .map(|ip| Slot { ip, owner: None })
            .collect();
        Self {
            capacity: slots.len(),
            inner: RwLock::new(Inner {
                slots,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Build the pool for a private /24 block.
    pub fn for_block(network: Ipv4Addr) -> Self {
        Self::new(pool_addresses(network))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ── Pool ─────────────────────────────────────────────────────

    /// Claim a slot for `client`, or hand back the one it already owns.
    pub async fn reserve(&self, client: &str) -> GatewayResult<Allocation> {
        let mut inner = self.inner.write().await;

        if let Some(slot) = inner
            .slots
            .iter()
            .find(|s| s.owner.as_deref() == Some(client))
        {
            return Ok(Allocation {
                ip: slot.ip,
                client: slot.owner.clone(),
            });
        }

        match inner.slots.iter_mut().find(|s| s.owner.is_none()) {
            Some(slot) => {
                slot.owner = Some(client.to_string());
                Ok(Allocation {
                    ip: slot.ip,
                    client: slot.owner.clone(),
                })
            }
            None => Err(GatewayError::new(
                GatewayErrorKind::PoolExhausted,
                format!("no free address for client `{}`", client),
            )
            .with_detail(format!("pool capacity {}", self.capacity))),
        }
    }

    /// Free the slot owned by `client`. Returns the released address, if any.
    pub async fn release(&self, client: &str) -> Option<Ipv4Addr> {
        let mut inner = self.inner.write().await;
        inner
            .slots
            .iter_mut()
            .find(|s| s.owner.as_deref() == Some(client))
            .map(|slot| {
                slot.owner = None;
                slot.ip
            })
    }

    /// Snapshot of pool slots in pool order.
    pub async fn list_allocations(&self, only_allocated: bool) -> Vec<Allocation> {
        let inner = self.inner.read().await;
        inner
            .slots
            .iter()
            .filter(|s| !only_allocated || s.owner.is_some())
            .map(|s| Allocation {
                ip: s.ip,
                client: s.owner.clone(),
            })
            .collect()
    }

    // ── Registry ─────────────────────────────────────────────────

    pub async fn lookup(&self, client: &str) -> Option<Session> {
        self.inner.read().await.sessions.get(client).cloned()
    }

    /// Record a session. Returns the number of active sessions afterwards.
    pub async fn insert(&self, session: Session) -> usize {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.client.clone(), session);
        inner.sessions.len()
    }

    pub async fn remove(&self, client: &str) -> Option<Session> {
        self.inner.write().await.sessions.remove(client)
    }

    /// Active sessions ordered by address, client id, then establishment time.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> =
            self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.ip()
                .cmp(&b.ip())
                .then_with(|| a.client.cmp(&b.client))
                .then_with(|| a.established_at.cmp(&b.established_at))
        });
        sessions
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Per-client gates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keyed mutexes serialising connect/disconnect work for one client id.
///
/// Entries are weak so the map only holds gates somebody is using or
/// waiting on; dead entries are swept on each acquire.
#[derive(Debug, Default)]
pub struct ClientGates {
    gates: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl ClientGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, client: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            gates.retain(|_, g| g.strong_count() > 0);
            match gates.get(client).and_then(Weak::upgrade) {
                Some(g) => g,
                None => {
                    let g = Arc::new(Mutex::new(()));
                    gates.insert(client.to_string(), Arc::downgrade(&g));
                    g
                }
            }
        };
        gate.lock_owned().await
    }

    /// Number of gates currently alive.
    pub fn len(&self) -> usize {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.values().filter(|g| g.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handles shared by the connect, disconnect and revoke paths.
#[derive(Clone)]
pub struct GatewayContext {
    pub state: Arc<GatewayState>,
    pub gates: Arc<ClientGates>,
    pub network: Arc<dyn NetworkAgent>,
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayContext {
    pub fn new(
        state: Arc<GatewayState>,
        network: Arc<dyn NetworkAgent>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            state,
            gates: Arc::new(ClientGates::new()),
            network,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::time::Duration;

    fn block() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 127, 0)
    }

    fn session(client: &str, ip: Ipv4Addr, secs: i64) -> Session {
        Session {
            client: client.to_string(),
            allocation: Allocation {
                ip,
                client: Some(client.to_string()),
            },
            routes: vec!["10.0.0.0/24".into()],
            established_at: Utc.timestamp_opt(secs, 0).unwrap(),
            source_address: "198.51.100.7".into(),
            identity: client.to_string(),
        }
    }

    #[test]
    fn pool_excludes_network_gateway_broadcast() {
        let addrs = pool_addresses(block());
        assert_eq!(addrs.len(), 253);
        assert_eq!(addrs.first(), Some(&Ipv4Addr::new(192, 168, 127, 2)));
        assert_eq!(addrs.last(), Some(&Ipv4Addr::new(192, 168, 127, 254)));
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_client() {
        let state = GatewayState::for_block(block());
        let a = state.reserve("alice").await.unwrap();
        let again = state.reserve("alice").await.unwrap();
        assert_eq!(a, again);
        assert_eq!(state.list_allocations(true).await.len(), 1);

        let b = state.reserve("bob").await.unwrap();
        assert_ne!(a.ip, b.ip);
        assert_eq!(b.ip, Ipv4Addr::new(192, 168, 127, 3));
    }

    #[tokio::test]
    async fn exhaustion_after_capacity() {
        let state = GatewayState::new(vec![
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
        ]);
        state.reserve("a").await.unwrap();
        state.reserve("b").await.unwrap();
        let e = state.reserve("c").await.unwrap_err();
        assert_eq!(e.kind, GatewayErrorKind::PoolExhausted);

        // an existing owner still gets its slot back
        assert!(state.reserve("a").await.is_ok());
    }

    #[tokio::test]
    async fn release_frees_slot_for_reuse() {
        let state = GatewayState::for_block(block());
        let a = state.reserve("alice").await.unwrap();
        assert_eq!(state.release("alice").await, Some(a.ip));
        assert_eq!(state.release("alice").await, None);
        assert!(state.list_allocations(true).await.is_empty());
        assert_eq!(state.reserve("bob").await.unwrap().ip, a.ip);
    }

    #[tokio::test]
    async fn list_allocations_filters() {
        let state = GatewayState::for_block(block());
        state.reserve("alice").await.unwrap();
        let all = state.list_allocations(false).await;
        assert_eq!(all.len(), 253);
        assert_eq!(all.iter().filter(|a| a.is_allocated()).count(), 1);
        let owned = state.list_allocations(true).await;
        assert_eq!(owned[0].client.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn concurrent_reservations_never_share_an_address() {
        let state = Arc::new(GatewayState::for_block(block()));
        let mut handles = Vec::new();
        for i in 0..300 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                state.reserve(&format!("client-{}", i)).await
            }));
        }
        let mut ips = HashSet::new();
        let mut exhausted = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(a) => assert!(ips.insert(a.ip), "duplicate {}", a.ip),
                Err(e) => {
                    assert_eq!(e.kind, GatewayErrorKind::PoolExhausted);
                    exhausted += 1;
                }
            }
        }
        assert_eq!(ips.len(), 253);
        assert_eq!(exhausted, 300 - 253);
    }

    #[tokio::test]
    async fn registry_ops_and_ordering() {
        let state = GatewayState::for_block(block());
        state.insert(session("zed", Ipv4Addr::new(192, 168, 127, 2), 10)).await;
        state.insert(session("amy", Ipv4Addr::new(192, 168, 127, 9), 5)).await;
        let n = state.insert(session("bob", Ipv4Addr::new(192, 168, 127, 3), 1)).await;
        assert_eq!(n, 3);

        let clients: Vec<String> = state
            .list_sessions()
            .await
            .into_iter()
            .map(|s| s.client)
            .collect();
        assert_eq!(clients, vec!["zed", "bob", "amy"]);

        assert!(state.lookup("bob").await.is_some());
        assert!(state.remove("bob").await.is_some());
        assert!(state.lookup("bob").await.is_none());
        assert_eq!(state.session_count().await, 2);
    }

    #[tokio::test]
    async fn gates_serialise_same_client() {
        let gates = Arc::new(ClientGates::new());
        let first = gates.acquire("alice").await;

        let g = gates.clone();
        let waiter = tokio::spawn(async move {
            let _guard = g.acquire("alice").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // a different client is never blocked
        let _other = gates.acquire("bob").await;

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn gates_are_swept_when_unused() {
        let gates = ClientGates::new();
        {
            let _a = gates.acquire("alice").await;
            assert_eq!(gates.len(), 1);
        }
        assert!(gates.is_empty());
    }
}
