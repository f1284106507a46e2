//! Connected UDP sockets towards remote tunnel endpoints.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::UdpSocket;
use tracing::debug;

/// Lazily created sockets keyed by `"host:port"`.
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<UdpSocket>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pooled socket for `target`, connecting one on first use.
    pub async fn get_or_connect(&self, target: SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let key = target.to_string();
        let existing = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(socket) = existing {
            return Ok(socket);
        }

        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        debug!(%target, "opened tunnel connection");

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another forwarder may have connected in the meantime; keep theirs.
        Ok(connections.entry(key).or_insert_with(|| Arc::new(socket)).clone())
    }

    /// Drop the socket for `target` so the next use reconnects.
    pub fn evict(&self, target: SocketAddr) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&target.to_string());
        if removed.is_some() {
            debug!(%target, "closed tunnel connection");
        }
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
