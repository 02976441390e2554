//! Live connection registry.
//!
//! A single control-loop task owns the `user id -> connection` map. Every
//! mutation (register, unregister, broadcast delivery) arrives on its own
//! bounded channel and is applied by that one task, so no lock guards the
//! map and no two mutations interleave.
//!
//! A connection's outbound queue has exactly one sender, held by the
//! registry. Dropping that sender is how the registry closes a connection:
//! the write loop sees its queue end, sends a close frame and exits.

use playzy_messages::Message;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::RegistryConfig;

/// Identifies one physical connection, distinct from the user it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The (user, connection) pair used to unregister without holding the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionKey {
    pub user_id: String,
    pub connection_id: ConnectionId,
}

/// What the registry stores per user: who it is and the only sender into
/// that connection's outbound queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    outbound: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh connection id and its outbound queue.
    pub fn new(
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Self {
            key: ConnectionKey {
                user_id: user_id.into(),
                connection_id: ConnectionId::new(),
            },
            outbound,
        };
        (handle, rx)
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry {0} queue is full")]
    Saturated(&'static str),
    #[error("registry control loop has stopped")]
    Closed,
}

/// Channel capacities for the control loop's inputs.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub register_capacity: usize,
    pub unregister_capacity: usize,
    pub broadcast_capacity: usize,
}

impl From<&RegistryConfig> for RegistrySettings {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            register_capacity: config.register_capacity,
            unregister_capacity: config.unregister_capacity,
            broadcast_capacity: config.broadcast_capacity,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

enum Query {
    Lookup(String, oneshot::Sender<Option<ConnectionId>>),
    Len(oneshot::Sender<usize>),
}

/// Cloneable handle onto the registry's control loop.
#[derive(Clone)]
pub struct ConnectionRegistry {
    register_tx: mpsc::Sender<ConnectionHandle>,
    unregister_tx: mpsc::Sender<ConnectionKey>,
    broadcast_tx: mpsc::Sender<Message>,
    query_tx: mpsc::Sender<Query>,
}

/// A reserved slot in the register queue.
///
/// Reserving before the WebSocket upgrade lets the gateway answer 503
/// while it still owns the HTTP response.
pub struct RegisterPermit(mpsc::OwnedPermit<ConnectionHandle>);

impl RegisterPermit {
    pub fn admit(self, handle: ConnectionHandle) {
        self.0.send(handle);
    }
}

impl ConnectionRegistry {
    /// Spawns the control loop and returns a handle to it.
    ///
    /// The loop stops once every handle clone has been dropped.
    pub fn spawn(settings: RegistrySettings) -> Self {
        let (register_tx, register_rx) = mpsc::channel(settings.register_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(settings.unregister_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(settings.broadcast_capacity);
        let (query_tx, query_rx) = mpsc::channel(16);

        let control = ControlLoop {
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            query_rx,
        };
        tokio::spawn(control.run());

        Self {
            register_tx,
            unregister_tx,
            broadcast_tx,
            query_tx,
        }
    }

    /// Reserves room in the register queue without waiting.
    pub fn try_reserve_register(&self) -> Result<RegisterPermit, RegistryError> {
        self.register_tx
            .clone()
            .try_reserve_owned()
            .map(RegisterPermit)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RegistryError::Saturated("register"),
                mpsc::error::TrySendError::Closed(_) => RegistryError::Closed,
            })
    }

    /// Registers a connection, waiting for queue space.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        self.register_tx
            .send(handle)
            .await
            .map_err(|_| RegistryError::Closed)
    }

    /// Asks the registry to forget `key`. Stale keys (already superseded)
    /// are ignored by the control loop.
    pub async fn unregister(&self, key: ConnectionKey) {
        if self.unregister_tx.send(key).await.is_err() {
            tracing::warn!("unregister dropped: registry control loop has stopped");
        }
    }

    /// Queues a message for delivery to its receiver without waiting.
    pub fn try_broadcast(&self, message: Message) -> Result<(), RegistryError> {
        self.broadcast_tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::Saturated("broadcast"),
            mpsc::error::TrySendError::Closed(_) => RegistryError::Closed,
        })
    }

    /// The connection currently registered for `user_id`, if any.
    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(Query::Lookup(user_id.to_string(), tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.query_tx.send(Query::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct ControlLoop {
    connections: HashMap<String, ConnectionHandle>,
    register_rx: mpsc::Receiver<ConnectionHandle>,
    unregister_rx: mpsc::Receiver<ConnectionKey>,
    broadcast_rx: mpsc::Receiver<Message>,
    query_rx: mpsc::Receiver<Query>,
}

impl ControlLoop {
    async fn run(mut self) {
        tracing::debug!("connection registry started");
        loop {
            tokio::select! {
                biased;
                Some(handle) = self.register_rx.recv() => self.admit(handle),
                Some(key) = self.unregister_rx.recv() => self.release(key),
                Some(message) = self.broadcast_rx.recv() => self.deliver(message),
                Some(query) = self.query_rx.recv() => self.answer(query),
                else => break,
            }
        }
        tracing::debug!(
            remaining = self.connections.len(),
            "connection registry stopped"
        );
    }

    fn admit(&mut self, handle: ConnectionHandle) {
        let key = handle.key.clone();
        // Replacing the entry drops the old sender, which closes the old
        // connection's queue.
        if let Some(previous) = self.connections.insert(key.user_id.clone(), handle) {
            tracing::info!(
                user_id = %key.user_id,
                old_connection = %previous.key.connection_id,
                new_connection = %key.connection_id,
                "superseded existing connection"
            );
        }
        tracing::info!(
            user_id = %key.user_id,
            connection_id = %key.connection_id,
            online = self.connections.len(),
            "connection registered"
        );
    }

    fn release(&mut self, key: ConnectionKey) {
        let current = self
            .connections
            .get(&key.user_id)
            .map(|handle| handle.key.connection_id);

        if current != Some(key.connection_id) {
            tracing::debug!(
                user_id = %key.user_id,
                connection_id = %key.connection_id,
                "ignoring unregister for a connection that is no longer registered"
            );
            return;
        }

        self.connections.remove(&key.user_id);
        tracing::info!(
            user_id = %key.user_id,
            connection_id = %key.connection_id,
            online = self.connections.len(),
            "connection unregistered"
        );
    }

    fn deliver(&mut self, message: Message) {
        let Some(handle) = self.connections.get(&message.receiver_id) else {
            tracing::debug!(
                receiver_id = %message.receiver_id,
                message_id = %message.id,
                "receiver offline, message kept for history only"
            );
            return;
        };

        match handle.outbound.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    user_id = %message.receiver_id,
                    connection_id = %handle.key.connection_id,
                    "outbound queue full, evicting slow connection"
                );
                self.connections.remove(&message.receiver_id);
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                tracing::debug!(
                    user_id = %message.receiver_id,
                    "outbound queue already closed, removing connection"
                );
                self.connections.remove(&message.receiver_id);
            }
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Lookup(user_id, reply) => {
                let found = self
                    .connections
                    .get(&user_id)
                    .map(|handle| handle.key.connection_id);
                let _ = reply.send(found);
            }
            Query::Len(reply) => {
                let _ = reply.send(self.connections.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playzy_messages::NewMessage;
    use std::time::Duration;
    use tokio::time::timeout;

    fn message(from: &str, to: &str, content: &str) -> Message {
        NewMessage::new(from, to, content).into_unpersisted()
    }

    #[tokio::test]
    async fn superseding_closes_the_previous_queue() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());

        let (first, mut first_rx) = ConnectionHandle::new("alice", 8);
        let (second, mut second_rx) = ConnectionHandle::new("alice", 8);
        let second_id = second.key().connection_id;

        registry.register(first).await.expect("register first");
        registry.register(second).await.expect("register second");

        let closed = timeout(Duration::from_secs(1), first_rx.recv())
            .await
            .expect("first queue should close promptly");
        assert!(closed.is_none());

        assert_eq!(registry.lookup("alice").await, Some(second_id));
        assert_eq!(registry.len().await, 1);

        registry
            .try_broadcast(message("bob", "alice", "hi"))
            .expect("broadcast");
        let delivered = timeout(Duration::from_secs(1), second_rx.recv())
            .await
            .expect("delivery")
            .expect("second queue open");
        assert_eq!(delivered.content, "hi");
    }

    #[tokio::test]
    async fn stale_unregister_leaves_replacement_in_place() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());

        let (first, _first_rx) = ConnectionHandle::new("alice", 8);
        let stale = first.key().clone();
        let (second, _second_rx) = ConnectionHandle::new("alice", 8);
        let second_id = second.key().connection_id;

        registry.register(first).await.expect("register");
        registry.register(second).await.expect("register");
        registry.unregister(stale).await;

        assert_eq!(registry.lookup("alice").await, Some(second_id));
    }

    #[tokio::test]
    async fn unregister_closes_queue() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());
        let (handle, mut rx) = ConnectionHandle::new("alice", 8);
        let key = handle.key().clone();

        registry.register(handle).await.expect("register");
        registry.unregister(key).await;

        assert!(timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("queue should close")
            .is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn offline_receiver_is_a_no_op() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());
        let (handle, mut rx) = ConnectionHandle::new("alice", 8);
        registry.register(handle).await.expect("register");

        registry
            .try_broadcast(message("alice", "bob", "anyone?"))
            .expect("broadcast");

        assert_eq!(registry.lookup("bob").await, None);
        assert!(rx.try_recv().is_err(), "sender must not receive an echo");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn full_outbound_queue_evicts_the_connection() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());
        let (handle, mut rx) = ConnectionHandle::new("bob", 1);
        registry.register(handle).await.expect("register");

        registry
            .try_broadcast(message("alice", "bob", "one"))
            .expect("broadcast");
        registry
            .try_broadcast(message("alice", "bob", "two"))
            .expect("broadcast");

        // Queries are answered after pending broadcasts.
        assert_eq!(registry.lookup("bob").await, None);

        let first = rx.recv().await.expect("first message buffered");
        assert_eq!(first.content, "one");
        assert!(rx.recv().await.is_none(), "queue closes after eviction");
    }

    #[tokio::test]
    async fn reserved_permit_registers_on_admit() {
        let registry = ConnectionRegistry::spawn(RegistrySettings::default());
        let (handle, _rx) = ConnectionHandle::new("alice", 8);
        let id = handle.key().connection_id;

        let permit = registry.try_reserve_register().expect("permit");
        permit.admit(handle);

        assert_eq!(registry.lookup("alice").await, Some(id));
    }

    #[test]
    fn settings_follow_registry_config() {
        let config = RegistryConfig {
            register_capacity: 3,
            unregister_capacity: 4,
            broadcast_capacity: 5,
        };
        let settings = RegistrySettings::from(&config);
        assert_eq!(settings.register_capacity, 3);
        assert_eq!(settings.unregister_capacity, 4);
        assert_eq!(settings.broadcast_capacity, 5);

        let defaults = RegistrySettings::default();
        assert_eq!(defaults.register_capacity, RegistryConfig::default().register_capacity);
        assert_eq!(defaults.broadcast_capacity, RegistryConfig::default().broadcast_capacity);
    }

    #[tokio::test]
    async fn saturated_register_queue_refuses_reservation() {
        let registry = ConnectionRegistry::spawn(RegistrySettings {
            register_capacity: 1,
            ..RegistrySettings::default()
        });

        let _held = registry.try_reserve_register().expect("first permit");
        assert_eq!(
            registry.try_reserve_register().err(),
            Some(RegistryError::Saturated("register"))
        );
    }
}
