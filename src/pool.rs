//! Outbound connection pool.
//!
//! A concurrent map (`dashmap`) keyed by peer identity, with eviction
//! marking a connection dead before anyone closes the socket so a
//! concurrent user never observes a half-torn-down entry.

use crate::common::NodeId;
use crate::error::{FabricError, Result};
use dashmap::DashMap;
use socket2::SockRef;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// A pooled outbound TCP connection plus its liveness flag.
pub struct PooledConnection {
    stream: Mutex<TcpStream>,
    alive: AtomicBool,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Locks the underlying stream for exclusive use by one caller at a
    /// time. Request/response traffic on a pooled connection is always
    /// strictly sequential (one in-flight request per socket), so a plain
    /// mutex is sufficient — no multiplexing is attempted.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }
}

/// Enables TCP keepalive on a freshly dialed socket so a peer that drops
/// off the network without a clean FIN is still detected and evicted
/// rather than held as "alive" indefinitely.
fn configure_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Concurrent map from peer identity to a live connection.
pub struct ConnectionPool {
    conns: DashMap<NodeId, Arc<PooledConnection>>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            conns: DashMap::new(),
            connect_timeout,
        }
    }

    /// Returns a live pooled connection to `peer`, reusing an existing one
    /// if it is still marked alive, otherwise dialing a fresh socket.
    pub async fn get_or_connect(&self, peer: &NodeId) -> Result<Arc<PooledConnection>> {
        if let Some(existing) = self.conns.get(peer) {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
        }
        self.evict(peer);

        let addr = peer
            .socket_addr()
            .map_err(|_| FabricError::PeerUnreachable(peer.to_string()))?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FabricError::ConnectTimeout(peer.to_string()))?
            .map_err(|_| FabricError::PeerUnreachable(peer.to_string()))?;
        stream.set_nodelay(true).ok();
        configure_keepalive(&stream);

        let conn = Arc::new(PooledConnection::new(stream));
        self.conns.insert(peer.clone(), conn.clone());
        Ok(conn)
    }

    /// Marks `peer`'s entry dead and removes it from the map. The socket
    /// itself closes when the last `Arc` referencing it (held by whatever
    /// caller was mid-use) is dropped, never while a user is in the middle
    /// of a read or write.
    pub fn evict(&self, peer: &NodeId) {
        if let Some((_, conn)) = self.conns.remove(peer) {
            conn.mark_dead();
        }
    }

    /// Evicts every pooled connection, run as part of the `shutdown`
    /// sequence to close all outstanding sockets.
    pub fn close_all(&self) {
        let peers: Vec<NodeId> = self.conns.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.evict(&peer);
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reuses_live_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(Duration::from_secs(1));
        let peer = NodeId::from(addr);

        let first = pool.get_or_connect(&peer).await.unwrap();
        let second = pool.get_or_connect(&peer).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn eviction_removes_and_marks_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(Duration::from_secs(1));
        let peer = NodeId::from(addr);
        let conn = pool.get_or_connect(&peer).await.unwrap();

        pool.evict(&peer);
        assert!(pool.is_empty());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let pool = ConnectionPool::new(Duration::from_secs(1));
        pool.get_or_connect(&NodeId::from(addr)).await.unwrap();
        assert_eq!(pool.len(), 1);

        pool.close_all();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_is_reported() {
        let pool = ConnectionPool::new(Duration::from_millis(200));
        // Port 1 is reserved and will refuse immediately on loopback.
        let peer = NodeId::from_string("127.0.0.1:1");
        let result = pool.get_or_connect(&peer).await;
        assert!(result.is_err());
    }
}
