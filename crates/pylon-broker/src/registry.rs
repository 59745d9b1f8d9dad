use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pylon_protocol::Role;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::message::Message;

pub type ConnId = Uuid;
pub type WaiterId = u64;

/// One registered push-transport connection. The registry holds references
/// by id; the transport task owns the socket.
#[derive(Debug)]
pub struct Connection {
    pub role: Role,
    pub tx: mpsc::UnboundedSender<Arc<Message>>,
    pub channels: HashSet<String>,
    /// Highest id delivered to this connection. Owned by the dispatcher on
    /// the connection's behalf — never shared with the client's own watermark.
    pub last_seen_id: u64,
}

/// A parked long-poll request: resolved with the first matching message
/// newer than its watermark, consumed on delivery.
#[derive(Debug)]
pub struct Waiter {
    pub channels: Vec<String>,
    /// Highest id the poller has already processed; posts at or below it
    /// leave the waiter parked.
    pub last: u64,
    pub tx: oneshot::Sender<Arc<Message>>,
}

/// Channel name → subscriber membership, for both transports.
///
/// Membership is indexed per channel so delivering one message costs time
/// proportional to that channel's audience, not the total connection count.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnId, Connection>,
    members: HashMap<String, HashSet<ConnId>>,
    waiters: HashMap<WaiterId, Waiter>,
    waiter_members: HashMap<String, HashSet<WaiterId>>,
    next_waiter_id: WaiterId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections plus parked waiters — both count against the global cap.
    pub fn connection_count(&self) -> usize {
        self.connections.len() + self.waiters.len()
    }

    pub fn insert(&mut self, id: ConnId, conn: Connection) {
        self.connections.insert(id, conn);
    }

    pub fn get(&self, id: &ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Drop a connection and clear it from every channel's member set.
    pub fn remove(&mut self, id: &ConnId) {
        if let Some(conn) = self.connections.remove(id) {
            for channel in &conn.channels {
                if let Some(set) = self.members.get_mut(channel) {
                    set.remove(id);
                    if set.is_empty() {
                        self.members.remove(channel);
                    }
                }
            }
        }
    }

    /// Full-replacement subscribe: prior membership is cleared first, so
    /// `[A]` then `[B]` stops further `A` deliveries.
    pub fn set_channels(&mut self, id: &ConnId, channels: HashSet<String>) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        for old in &conn.channels {
            if let Some(set) = self.members.get_mut(old) {
                set.remove(id);
                if set.is_empty() {
                    self.members.remove(old);
                }
            }
        }
        for channel in &channels {
            self.members.entry(channel.clone()).or_default().insert(*id);
        }
        conn.channels = channels;
    }

    /// Members of one channel. Missing channel means no subscribers.
    pub fn members_of(&self, channel: &str) -> impl Iterator<Item = ConnId> + '_ {
        self.members
            .get(channel)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn add_waiter(
        &mut self,
        channels: Vec<String>,
        last: u64,
        tx: oneshot::Sender<Arc<Message>>,
    ) -> WaiterId {
        self.next_waiter_id += 1;
        let id = self.next_waiter_id;
        for channel in &channels {
            self.waiter_members.entry(channel.clone()).or_default().insert(id);
        }
        self.waiters.insert(id, Waiter { channels, last, tx });
        id
    }

    /// Deregister a waiter (poll timeout or client disconnect). No-op when
    /// the waiter was already consumed by a delivery.
    pub fn remove_waiter(&mut self, id: WaiterId) {
        if let Some(waiter) = self.waiters.remove(&id) {
            for channel in &waiter.channels {
                if let Some(set) = self.waiter_members.get_mut(channel) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.waiter_members.remove(channel);
                    }
                }
            }
        }
    }

    /// Take every waiter parked on `channel` whose watermark predates `id` —
    /// each is consumed by this delivery and removed from all its channel
    /// indexes. Waiters whose watermark is at or ahead of `id` stay parked.
    pub fn take_waiters_of(&mut self, channel: &str, id: u64) -> Vec<Waiter> {
        let ids: Vec<WaiterId> = self
            .waiter_members
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut taken = Vec::with_capacity(ids.len());
        for waiter_id in ids {
            if self.waiters.get(&waiter_id).map_or(true, |w| w.last >= id) {
                continue;
            }
            if let Some(waiter) = self.waiters.remove(&waiter_id) {
                for ch in &waiter.channels {
                    if let Some(set) = self.waiter_members.get_mut(ch) {
                        set.remove(&waiter_id);
                        if set.is_empty() {
                            self.waiter_members.remove(ch);
                        }
                    }
                }
                taken.push(waiter);
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(tx: mpsc::UnboundedSender<Arc<Message>>) -> Connection {
        Connection {
            role: Role::Client,
            tx,
            channels: HashSet::new(),
            last_seen_id: 0,
        }
    }

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_channels_replaces_membership() {
        let mut reg = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        reg.insert(id, client(tx));

        reg.set_channels(&id, set(&["a"]));
        assert_eq!(reg.members_of("a").count(), 1);

        reg.set_channels(&id, set(&["b"]));
        assert_eq!(reg.members_of("a").count(), 0);
        assert_eq!(reg.members_of("b").count(), 1);
    }

    #[test]
    fn remove_clears_every_member_set() {
        let mut reg = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        reg.insert(id, client(tx));
        reg.set_channels(&id, set(&["a", "b"]));

        reg.remove(&id);
        assert_eq!(reg.members_of("a").count(), 0);
        assert_eq!(reg.members_of("b").count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn waiter_is_consumed_once_and_fully_unindexed() {
        let mut reg = Registry::new();
        let (tx, mut rx) = oneshot::channel();
        reg.add_waiter(vec!["a".into(), "b".into()], 0, tx);

        let taken = reg.take_waiters_of("a", 1);
        assert_eq!(taken.len(), 1);
        // consumed: the same waiter must not be reachable via its other channel
        assert!(reg.take_waiters_of("b", 2).is_empty());
        assert_eq!(reg.connection_count(), 0);

        let msg = Arc::new(Message {
            id: 1,
            channel: "a".into(),
            payload: json!(null),
        });
        taken.into_iter().next().unwrap().tx.send(msg).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn waiter_ahead_of_the_post_stays_parked() {
        let mut reg = Registry::new();
        let (tx, _rx) = oneshot::channel();
        reg.add_waiter(vec!["a".into()], 5, tx);

        // posts the waiter has already seen leave it registered
        assert!(reg.take_waiters_of("a", 4).is_empty());
        assert!(reg.take_waiters_of("a", 5).is_empty());
        assert_eq!(reg.connection_count(), 1);

        let taken = reg.take_waiters_of("a", 6);
        assert_eq!(taken.len(), 1);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn remove_waiter_after_consumption_is_a_noop() {
        let mut reg = Registry::new();
        let (tx, _rx) = oneshot::channel();
        let id = reg.add_waiter(vec!["a".into()], 0, tx);
        let _ = reg.take_waiters_of("a", 1);
        reg.remove_waiter(id); // already gone
        assert_eq!(reg.connection_count(), 0);
    }
}
