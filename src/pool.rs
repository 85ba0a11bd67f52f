//! Registry of live duplex connections, addressed by group id.
//!
//! Registry mutations take one lock for the map update only. Delivery and
//! attach/detach hooks run outside it. Each connection's outbound queue is
//! small and bounded; a peer that cannot take a message within the send
//! timeout is closed and evicted so it cannot hold up the rest of its group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One live duplex connection.
#[derive(Debug)]
pub struct Connection {
    pub group_id: String,
    pub connection_id: String,
    pub attached_at: DateTime<Utc>,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
    cancel: CancellationToken,
}

#[derive(Debug, PartialEq, Eq)]
enum DeliveryError {
    Stalled,
    Closed,
}

impl Connection {
    /// New connection with a fresh id. The receiver is the connection's
    /// outbound queue, drained by its write loop.
    pub fn new(group_id: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            group_id: group_id.into(),
            connection_id: uuid::Uuid::new_v4().to_string(),
            attached_at: Utc::now(),
            outbound,
            closed: CancellationToken::new(),
            cancel: CancellationToken::new(),
        };
        (Arc::new(conn), rx)
    }

    /// Fires when the connection should shut down.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Cancellation token handed to jobs started from this connection.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn deliver(&self, payload: String, timeout: Duration) -> Result<(), DeliveryError> {
        match tokio::time::timeout(timeout, self.outbound.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Closed),
            Err(_) => Err(DeliveryError::Stalled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub group_count: usize,
    pub connection_count: usize,
}

/// Notified, off the registry lock, as connections come and go.
#[async_trait]
pub trait PoolObserver: Send + Sync {
    async fn on_attach(&self, group_id: &str, connection_id: &str);
    async fn on_detach(&self, group_id: &str, connection_id: &str);
}

/// Decides where a broadcast payload goes.
#[async_trait]
pub trait BroadcastHandler: Send + Sync {
    async fn dispatch(&self, pool: &ConnectionPool, payload: &[u8]);
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    groups: HashMap<String, Vec<String>>,
}

pub struct ConnectionPool {
    registry: Mutex<Registry>,
    send_timeout: Duration,
    observer: Option<Arc<dyn PoolObserver>>,
    broadcast: Option<Arc<dyn BroadcastHandler>>,
}

impl ConnectionPool {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            send_timeout,
            observer: None,
            broadcast: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_broadcast(mut self, handler: Arc<dyn BroadcastHandler>) -> Self {
        self.broadcast = Some(handler);
        self
    }

    pub async fn attach(&self, connection: Arc<Connection>) {
        let group_id = connection.group_id.clone();
        let connection_id = connection.connection_id.clone();
        {
            let mut registry = self.registry.lock().await;
            registry
                .connections
                .insert(connection_id.clone(), connection);
            let members = registry.groups.entry(group_id.clone()).or_default();
            if !members.contains(&connection_id) {
                members.push(connection_id.clone());
            }
        }

        if let Some(observer) = self.observer.clone() {
            tokio::spawn(async move { observer.on_attach(&group_id, &connection_id).await });
        }
    }

    /// Remove a connection. Unknown ids are ignored; a group disappears with
    /// its last connection. The connection leaves the group it attached to,
    /// whatever `group_id` says.
    pub async fn detach(&self, group_id: &str, connection_id: &str) {
        let removed = {
            let mut registry = self.registry.lock().await;
            let owner = registry
                .connections
                .remove(connection_id)
                .map(|conn| conn.group_id.clone());
            let group = owner.clone().unwrap_or_else(|| group_id.to_string());
            if let Some(members) = registry.groups.get_mut(&group) {
                members.retain(|id| id != connection_id);
                if members.is_empty() {
                    registry.groups.remove(&group);
                }
            }
            owner
        };

        if let (Some(group_id), Some(observer)) = (removed, self.observer.clone()) {
            let connection_id = connection_id.to_string();
            tokio::spawn(async move { observer.on_detach(&group_id, &connection_id).await });
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let registry = self.registry.lock().await;
        PoolStats {
            group_count: registry.groups.len(),
            connection_count: registry.connections.len(),
        }
    }

    /// Queue `payload` on every connection of `group_id`, concurrently.
    /// Returns how many connections took it.
    pub async fn send_to(&self, group_id: &str, payload: String) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let registry = self.registry.lock().await;
            registry
                .groups
                .get(group_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| registry.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };
        if targets.is_empty() {
            return 0;
        }

        let results = join_all(
            targets
                .iter()
                .map(|conn| conn.deliver(payload.clone(), self.send_timeout)),
        )
        .await;

        let mut delivered = 0;
        for (conn, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    tracing::warn!(
                        group_id = %conn.group_id,
                        connection_id = %conn.connection_id,
                        ?reason,
                        "evicting connection that cannot take messages"
                    );
                    conn.close();
                    self.detach(&conn.group_id, &conn.connection_id).await;
                }
            }
        }
        delivered
    }

    /// Hand `payload` to the installed broadcast handler.
    pub async fn broadcast(&self, payload: &[u8]) {
        match &self.broadcast {
            Some(handler) => handler.dispatch(self, payload).await,
            None => tracing::warn!("broadcast dropped, no handler installed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_attach_then_detach_restores_stats() {
        let pool = pool();
        let (existing, _rx0) = Connection::new("g0", 2);
        pool.attach(existing).await;
        let before = pool.stats().await;

        let (conn, _rx) = Connection::new("g1", 2);
        pool.attach(conn.clone()).await;
        assert_eq!(
            pool.stats().await,
            PoolStats {
                group_count: 2,
                connection_count: 2
            }
        );

        pool.detach("g1", &conn.connection_id).await;
        assert_eq!(pool.stats().await, before);
    }

    #[tokio::test]
    async fn test_detach_unknown_is_noop() {
        let pool = pool();
        let (conn, _rx) = Connection::new("g", 2);
        pool.attach(conn).await;
        let before = pool.stats().await;
        pool.detach("g", "no-such-connection").await;
        pool.detach("no-such-group", "no-such-connection").await;
        assert_eq!(pool.stats().await, before);
    }

    #[tokio::test]
    async fn test_group_vanishes_with_last_connection() {
        let pool = pool();
        let (a, _ra) = Connection::new("shared", 2);
        let (b, _rb) = Connection::new("shared", 2);
        pool.attach(a.clone()).await;
        pool.attach(b.clone()).await;
        assert_eq!(pool.stats().await.group_count, 1);

        pool.detach("shared", &a.connection_id).await;
        assert_eq!(pool.stats().await.group_count, 1);
        pool.detach("shared", &b.connection_id).await;
        assert_eq!(
            pool.stats().await,
            PoolStats {
                group_count: 0,
                connection_count: 0
            }
        );
    }

    #[tokio::test]
    async fn test_reattach_does_not_duplicate_delivery() {
        let pool = pool();
        let (conn, mut rx) = Connection::new("g", 4);
        pool.attach(conn.clone()).await;
        pool.attach(conn.clone()).await;

        assert_eq!(pool.send_to("g", "once".into()).await, 1);
        assert_eq!(rx.recv().await.as_deref(), Some("once"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_with_wrong_group_clears_owning_group() {
        let pool = pool();
        let (conn, _rx) = Connection::new("real", 2);
        pool.attach(conn.clone()).await;

        pool.detach("elsewhere", &conn.connection_id).await;
        assert_eq!(
            pool.stats().await,
            PoolStats {
                group_count: 0,
                connection_count: 0
            }
        );
        assert_eq!(pool.send_to("real", "x".into()).await, 0);
    }

    #[tokio::test]
    async fn test_send_to_reaches_only_the_group() {
        let pool = pool();
        let (a, mut ra) = Connection::new("g", 2);
        let (b, mut rb) = Connection::new("g", 2);
        let (other, mut ro) = Connection::new("other", 2);
        pool.attach(a).await;
        pool.attach(b).await;
        pool.attach(other).await;

        assert_eq!(pool.send_to("g", "hello".into()).await, 2);
        assert_eq!(ra.recv().await.as_deref(), Some("hello"));
        assert_eq!(rb.recv().await.as_deref(), Some("hello"));
        assert!(ro.try_recv().is_err());

        assert_eq!(pool.send_to("nobody", "x".into()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_evicted_without_blocking_others() {
        let pool = pool();
        let (stalled, _keep_stalled_rx) = Connection::new("g", 1);
        let (healthy, mut healthy_rx) = Connection::new("g", 8);
        pool.attach(stalled.clone()).await;
        pool.attach(healthy.clone()).await;

        assert_eq!(pool.send_to("g", "one".into()).await, 2);
        // the stalled peer's queue is now full
        assert_eq!(pool.send_to("g", "two".into()).await, 1);

        assert!(stalled.closed().is_cancelled());
        assert!(!healthy.closed().is_cancelled());
        assert_eq!(pool.stats().await.connection_count, 1);
        assert_eq!(healthy_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(healthy_rx.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_closed_receiver_is_evicted() {
        let pool = pool();
        let (conn, rx) = Connection::new("g", 2);
        pool.attach(conn.clone()).await;
        drop(rx);

        assert_eq!(pool.send_to("g", "lost".into()).await, 0);
        assert!(conn.closed().is_cancelled());
        assert_eq!(pool.stats().await.connection_count, 0);
    }

    struct Recorder(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl PoolObserver for Recorder {
        async fn on_attach(&self, group_id: &str, _connection_id: &str) {
            let _ = self.0.send(format!("attach {group_id}"));
        }

        async fn on_detach(&self, group_id: &str, _connection_id: &str) {
            let _ = self.0.send(format!("detach {group_id}"));
        }
    }

    #[tokio::test]
    async fn test_hooks_fire_for_attach_and_detach() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let pool = pool().with_observer(Arc::new(Recorder(tx)));
        let (conn, _rx) = Connection::new("g", 2);

        pool.attach(conn.clone()).await;
        assert_eq!(events.recv().await.as_deref(), Some("attach g"));

        pool.detach("g", &conn.connection_id).await;
        assert_eq!(events.recv().await.as_deref(), Some("detach g"));

        // unknown ids fire nothing
        pool.detach("g", &conn.connection_id).await;
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    struct ToGroup(&'static str);

    #[async_trait]
    impl BroadcastHandler for ToGroup {
        async fn dispatch(&self, pool: &ConnectionPool, payload: &[u8]) {
            pool.send_to(self.0, String::from_utf8_lossy(payload).into_owned())
                .await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_delegates_to_handler() {
        let pool = pool().with_broadcast(Arc::new(ToGroup("g")));
        let (conn, mut rx) = Connection::new("g", 2);
        pool.attach(conn).await;

        pool.broadcast(b"ping").await;
        assert_eq!(rx.recv().await.as_deref(), Some("ping"));
    }
}
