//! Packet echo server.
//!
//! Accepts transports on the configured endpoint, attaches each to a
//! connection and echoes every inbound packet back with the same code.

use crate::config::Config;
use packet_link::packet::pack_raw;
use packet_link::{Acceptor, Connection, ConnectionOwner, Endpoint, Packet, PacketReader, StopReason};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Packet code answered with an empty packet of the same code.
pub const PING: u8 = 0;

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert the connection built for the next free key.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert_with<F>(&mut self, build: F) -> Option<(usize, Arc<Connection>)>
    where
        F: FnOnce(usize) -> Arc<Connection>,
    {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        let entry = self.connections.vacant_entry();
        let key = entry.key();
        let conn = build(key);
        entry.insert(conn.clone());
        Some((key, conn))
    }

    #[cfg(test)]
    pub fn get(&self, key: usize) -> Option<&Arc<Connection>> {
        self.connections.get(key)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, key: usize) -> Option<Arc<Connection>> {
        self.connections.try_remove(key)
    }

    #[cfg(test)]
    pub fn contains(&self, key: usize) -> bool {
        self.connections.contains(key)
    }

    /// Number of live connections.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<Connection>)> {
        self.connections.iter()
    }
}

type SharedRegistry = Arc<Mutex<ConnectionRegistry>>;

/// Echoes packets and drops its registry entry once the connection finishes.
struct EchoOwner {
    key: usize,
    registry: SharedRegistry,
}

impl ConnectionOwner for EchoOwner {
    fn process_packets(
        &self,
        conn: &Arc<Connection>,
        reader: &mut PacketReader<'_>,
    ) -> packet_link::Result<()> {
        while let Some(Packet { code, payload }) = reader.next_packet()? {
            if code == PING {
                conn.send(pack_raw(PING, &[]));
            } else {
                conn.send(pack_raw(code, payload));
            }
        }
        Ok(())
    }

    fn shutdown(&self, conn: &Arc<Connection>) {
        debug!(conn = %conn.id(), reason = ?conn.stop_reason(), "connection shutting down");
    }

    fn finish(&self, conn: &Arc<Connection>) {
        self.registry.lock().remove(self.key);
        info!(conn = %conn.id(), reason = ?conn.stop_reason(), "connection finished");
    }
}

/// Server instance
pub struct Server {
    config: Config,
    registry: SharedRegistry,
    acceptor: Acceptor,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Mutex::new(ConnectionRegistry::new(config.max_connections)));

        let acceptor = {
            let registry = registry.clone();
            let options = config.connection.clone();
            Acceptor::new(move |transport| {
                let peer = transport.peer();
                let inserted = registry.lock().insert_with(|key| {
                    let owner = Arc::new(EchoOwner {
                        key,
                        registry: registry.clone(),
                    });
                    Connection::new(owner, options.clone())
                });
                let Some((key, conn)) = inserted else {
                    warn!(%peer, "connection limit reached, dropping transport");
                    return;
                };
                if let Err(e) = conn.start(transport) {
                    warn!(%peer, error = %e, "failed to start connection");
                    registry.lock().remove(key);
                }
            })
        };

        Server {
            config,
            registry,
            acceptor,
        }
    }

    /// Bind the listening endpoint and start the idle sweeper.
    ///
    /// Returns the bound endpoint.
    pub async fn start(&self) -> Result<Endpoint, Box<dyn std::error::Error>> {
        let local = self.acceptor.start(&self.config.listen).await?;
        info!(endpoint = %local, "Server listening");

        if self.config.idle_timeout > 0 {
            let registry = Arc::clone(&self.registry);
            let idle_timeout = self.config.idle_timeout;
            tokio::spawn(async move {
                idle_sweep_task(registry, idle_timeout).await;
            });
        }
        Ok(local)
    }

    /// Serve until Ctrl-C, then stop every connection.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    /// Cancel the acceptor and stop every live connection.
    pub async fn shutdown(&self) {
        self.acceptor.cancel();
        self.acceptor.join().await;

        let live: Vec<_> = self
            .registry
            .lock()
            .iter()
            .map(|(_, conn)| conn.clone())
            .collect();
        for conn in live {
            conn.stop(StopReason::Local, None);
        }
    }

    #[cfg(test)]
    pub fn connections(&self) -> usize {
        self.registry.lock().len()
    }
}

/// Background task stopping connections without traffic
async fn idle_sweep_task(registry: SharedRegistry, idle_timeout_secs: u64) {
    let period = Duration::from_secs((idle_timeout_secs / 2).max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let count = sweep_idle(&registry, idle_timeout_secs.saturating_mul(1000), now_millis());
        if count > 0 {
            debug!(count, "Stopped idle connections");
        }
    }
}

/// Stop connections whose last read and last write are both older than
/// `idle_millis` before `now`. Returns the number stopped.
fn sweep_idle(registry: &SharedRegistry, idle_millis: u64, now: i64) -> usize {
    let idle_millis = i64::try_from(idle_millis).unwrap_or(i64::MAX);
    // Collected first; stopping may finish a connection, which takes the lock
    let idle: Vec<_> = registry
        .lock()
        .iter()
        .filter(|(_, conn)| {
            let last = conn.last_read().max(conn.last_write());
            now.saturating_sub(last) > idle_millis
        })
        .map(|(_, conn)| conn.clone())
        .collect();

    idle.iter()
        .filter(|conn| conn.stop(StopReason::Local, None))
        .count()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
