use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pylon_core::config::BrokerConfig;
use pylon_core::{PylonError, Result};
use pylon_protocol::Role;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::buffer::ReplayBuffer;
use crate::message::Message;
use crate::registry::{ConnId, Connection, Registry, WaiterId};

/// Process-wide broker state: the replay buffer, the id counter, and the
/// registry of live connections. One owned instance per process, passed by
/// handle to every command handler — no ambient globals.
#[derive(Debug)]
struct BrokerInner {
    buffer: ReplayBuffer,
    registry: Registry,
}

/// Cloneable handle to the broker.
///
/// A single mutex guards all state and is never held across an await, so
/// each logical operation (id allocation, buffer update, fanout) runs to
/// completion before the next begins. `subscribe` in particular performs its
/// catch-up replay and registry insertion as one unit: no gap, no duplicate.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<Mutex<BrokerInner>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                buffer: ReplayBuffer::new(config.max_queue),
                registry: Registry::new(),
            })),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().expect("broker mutex poisoned")
    }

    pub fn max_subscriptions(&self) -> usize {
        self.config.max_subscriptions_per_connection
    }

    pub fn comet_timeout(&self) -> Duration {
        Duration::from_secs(self.config.comet_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.config.liveness_timeout_secs)
    }

    /// Register a push-transport connection. Fails with `server-capacity`
    /// when the global cap is reached; a failed registration is not counted.
    pub fn register(
        &self,
        role: Role,
        tx: mpsc::UnboundedSender<Arc<Message>>,
    ) -> Result<ConnId> {
        let mut inner = self.lock();
        if inner.registry.connection_count() >= self.config.max_connections {
            return Err(PylonError::ServerCapacity {
                max: self.config.max_connections,
            });
        }
        let id = ConnId::new_v4();
        // Default watermark: current head, so a bare set-filter subscribes
        // live-only. start-msg overrides the baseline.
        let last_seen_id = inner.buffer.last_id();
        inner.registry.insert(
            id,
            Connection {
                role,
                tx,
                channels: HashSet::new(),
                last_seen_id,
            },
        );
        Ok(id)
    }

    pub fn unregister(&self, id: &ConnId) {
        self.lock().registry.remove(id);
    }

    pub fn role_of(&self, id: &ConnId) -> Option<Role> {
        self.lock().registry.get(id).map(|c| c.role)
    }

    /// Publish: allocate the id, store, and fan out to every live subscriber
    /// of the channel plus any parked long-poll waiters — all under one lock,
    /// so the id has been delivered (or queued) by the time this returns.
    pub fn post(&self, channel: String, payload: Value) -> u64 {
        let mut inner = self.lock();
        let msg = inner.buffer.post(channel, payload);

        let members: Vec<ConnId> = inner.registry.members_of(&msg.channel).collect();
        for conn_id in members {
            if let Some(conn) = inner.registry.get_mut(&conn_id) {
                conn.last_seen_id = msg.id;
                if conn.tx.send(Arc::clone(&msg)).is_err() {
                    debug!(conn_id = %conn_id, "delivery to closed connection dropped");
                }
            }
        }
        for waiter in inner.registry.take_waiters_of(&msg.channel, msg.id) {
            let _ = waiter.tx.send(Arc::clone(&msg));
        }
        msg.id
    }

    /// Set the connection's watermark baseline for future catch-up.
    pub fn set_start(&self, id: &ConnId, start: u64) {
        if let Some(conn) = self.lock().registry.get_mut(id) {
            conn.last_seen_id = start;
        }
    }

    /// Replace the connection's subscriptions and synchronously replay every
    /// retained message newer than its watermark, as one atomic unit.
    /// Anything published after this call is seen live; anything before, via
    /// the replay — no gap, no duplicate, while retained.
    pub fn set_filter(&self, id: &ConnId, channels: HashSet<String>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.registry.set_channels(id, channels);
        let Some(conn) = inner.registry.get_mut(id) else {
            return;
        };
        let replay = inner.buffer.catch_up(conn.last_seen_id, &conn.channels);
        for msg in replay {
            conn.last_seen_id = msg.id;
            if conn.tx.send(msg).is_err() {
                break;
            }
        }
    }

    pub fn last_id(&self) -> u64 {
        self.lock().buffer.last_id()
    }

    /// Long-poll entry point: either an immediate catch-up hit, or a parked
    /// waiter resolved by the next matching post with `id > last`. Catch-up
    /// and waiter registration happen under the same lock, so no message can
    /// slip between the two.
    pub fn poll_wait(&self, channels: Vec<String>, last: u64) -> Result<PollOutcome> {
        let mut inner = self.lock();
        if inner.registry.connection_count() >= self.config.max_connections {
            return Err(PylonError::ServerCapacity {
                max: self.config.max_connections,
            });
        }
        let channel_set: HashSet<String> = channels.iter().cloned().collect();
        if let Some(msg) = inner.buffer.catch_up(last, &channel_set).into_iter().next() {
            return Ok(PollOutcome::Immediate(msg));
        }
        let (tx, rx) = oneshot::channel();
        let waiter_id = inner.registry.add_waiter(channels, last, tx);
        Ok(PollOutcome::Wait(WaiterHandle {
            rx,
            _guard: WaiterGuard {
                inner: Arc::clone(&self.inner),
                id: waiter_id,
            },
        }))
    }

    /// Live connections plus parked waiters, for capacity accounting.
    pub fn connection_count(&self) -> usize {
        self.lock().registry.connection_count()
    }
}

/// Outcome of a long-poll request.
pub enum PollOutcome {
    /// The buffer already held a matching message newer than the watermark.
    Immediate(Arc<Message>),
    /// Parked until a matching post or expiry.
    Wait(WaiterHandle),
}

impl std::fmt::Debug for PollOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollOutcome::Immediate(msg) => f.debug_tuple("Immediate").field(msg).finish(),
            PollOutcome::Wait(_) => f.debug_tuple("Wait").finish(),
        }
    }
}

/// A parked long-poll waiter. Dropping the handle — timeout or client
/// disconnect mid-poll — deregisters the waiter, so an abandoned request
/// leaks nothing.
pub struct WaiterHandle {
    rx: oneshot::Receiver<Arc<Message>>,
    _guard: WaiterGuard,
}

impl WaiterHandle {
    /// Block (as a registered waiter, never a busy loop) until a matching
    /// message arrives or `timeout` elapses.
    pub async fn wait(self, timeout: Duration) -> Option<Arc<Message>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(msg)) => Some(msg),
            _ => None,
        }
    }
}

struct WaiterGuard {
    inner: Arc<Mutex<BrokerInner>>,
    id: WaiterId,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        // No-op when the waiter was already consumed by a delivery.
        if let Ok(mut inner) = self.inner.lock() {
            inner.registry.remove_waiter(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(max_queue: usize, max_connections: usize) -> Broker {
        Broker::new(BrokerConfig {
            max_queue,
            max_connections,
            ..BrokerConfig::default()
        })
    }

    fn subscribe(b: &Broker, channels: &[&str]) -> (ConnId, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = b.register(Role::Client, tx).unwrap();
        b.set_filter(&id, channels.iter().map(|s| s.to_string()).collect());
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<Message>>) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            ids.push(msg.id);
        }
        ids
    }

    #[test]
    fn live_fanout_reaches_only_the_channels_subscribers() {
        let b = broker(10, 100);
        let (_x, mut rx_x) = subscribe(&b, &["x"]);
        let (_y, mut rx_y) = subscribe(&b, &["y"]);

        b.post("x".into(), json!("only x"));

        assert_eq!(drain(&mut rx_x).len(), 1);
        assert!(drain(&mut rx_y).is_empty());
    }

    #[test]
    fn subscribe_replays_then_sees_live_posts_in_order() {
        let b = broker(10, 100);
        b.post("ch".into(), json!(1));
        b.post("ch".into(), json!(2));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = b.register(Role::Client, tx).unwrap();
        b.set_start(&id, 0);
        b.set_filter(&id, ["ch".to_string()].into());
        b.post("ch".into(), json!(3));

        assert_eq!(drain(&mut rx), vec![1, 2, 3]);
    }

    #[test]
    fn default_watermark_skips_history() {
        let b = broker(10, 100);
        b.post("ch".into(), json!("old"));

        // no start-msg: a bare set-filter must not replay the backlog
        let (_id, mut rx) = subscribe(&b, &["ch"]);
        assert!(drain(&mut rx).is_empty());

        b.post("ch".into(), json!("new"));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn eviction_scenario_max_queue_three() {
        let b = broker(3, 100);
        for payload in ["A", "B", "C", "D"] {
            b.post("ch".into(), json!(payload));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = b.register(Role::Client, tx).unwrap();
        b.set_start(&id, 0);
        b.set_filter(&id, ["ch".to_string()].into());

        let replayed: Vec<_> = drain(&mut rx);
        assert_eq!(replayed, vec![2, 3, 4]); // B, C, D
    }

    #[test]
    fn capacity_rejection_is_not_counted() {
        let b = broker(10, 2);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id1 = b.register(Role::Client, tx1).unwrap();
        let _id2 = b.register(Role::Client, tx2).unwrap();

        let (tx3, _rx3) = mpsc::unbounded_channel();
        let err = b.register(Role::Client, tx3).unwrap_err();
        assert_eq!(err.code(), "server-capacity");
        assert_eq!(b.connection_count(), 2);

        // freeing a slot lets the next attempt in
        b.unregister(&id1);
        let (tx4, _rx4) = mpsc::unbounded_channel();
        assert!(b.register(Role::Client, tx4).is_ok());
    }

    #[tokio::test]
    async fn waiter_is_woken_by_matching_post() {
        let b = broker(10, 100);
        let outcome = b.poll_wait(vec!["ch".into()], 0).unwrap();
        let handle = match outcome {
            PollOutcome::Wait(h) => h,
            PollOutcome::Immediate(_) => panic!("buffer was empty"),
        };

        let b2 = b.clone();
        tokio::spawn(async move {
            b2.post("ch".into(), json!("wake"));
        });

        let msg = handle.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg.channel, "ch");
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn waiter_ahead_of_head_ignores_already_seen_ids() {
        let b = broker(10, 100);
        // poller claims to have seen id 2 while the buffer is still empty
        let PollOutcome::Wait(handle) = b.poll_wait(vec!["ch".into()], 2).unwrap() else {
            panic!("expected wait");
        };

        let b2 = b.clone();
        let woken = tokio::spawn(async move { handle.wait(Duration::from_secs(5)).await });
        b2.post("ch".into(), json!("seen"));   // id 1 ≤ 2: must not wake
        b2.post("ch".into(), json!("seen"));   // id 2 ≤ 2: must not wake
        b2.post("ch".into(), json!("fresh"));  // id 3: wakes

        let msg = woken.await.unwrap().unwrap();
        assert_eq!(msg.id, 3);
    }

    #[tokio::test]
    async fn waiter_catch_up_hit_is_immediate() {
        let b = broker(10, 100);
        b.post("ch".into(), json!("already here"));
        match b.poll_wait(vec!["ch".into()], 0).unwrap() {
            PollOutcome::Immediate(msg) => assert_eq!(msg.id, 1),
            PollOutcome::Wait(_) => panic!("expected immediate catch-up"),
        }
    }

    #[tokio::test]
    async fn dropped_waiter_deregisters() {
        let b = broker(10, 1);
        let outcome = b.poll_wait(vec!["ch".into()], 0).unwrap();
        assert_eq!(b.connection_count(), 1);
        drop(outcome);
        assert_eq!(b.connection_count(), 0);

        // the freed slot is usable again
        assert!(b.poll_wait(vec!["ch".into()], 0).is_ok());
    }

    #[tokio::test]
    async fn waiter_timeout_returns_none() {
        let b = broker(10, 100);
        let PollOutcome::Wait(handle) = b.poll_wait(vec!["quiet".into()], 0).unwrap() else {
            panic!("expected wait");
        };
        let got = handle.wait(Duration::from_millis(20)).await;
        assert!(got.is_none());
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn poll_at_capacity_is_rejected() {
        let b = broker(10, 1);
        let _parked = match b.poll_wait(vec!["ch".into()], 0).unwrap() {
            PollOutcome::Wait(h) => h,
            PollOutcome::Immediate(_) => panic!(),
        };
        let err = b.poll_wait(vec!["ch".into()], 0).unwrap_err();
        assert_eq!(err.code(), "server-capacity");
    }
}
