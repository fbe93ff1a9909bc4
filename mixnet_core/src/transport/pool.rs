/*!
Per-destination pool of reusable TCP connections.

A destination gets one connection that every sender shares; transient
errors are retried with exponential backoff on a fresh connection.
When the retries are exhausted the destination is marked unhealthy for
a cooldown and the circuit builder stops routing through it until the
cooldown passes.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::debug;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;

use std::sync::Arc;

use mixnet_packet::packet::Packet;

use crate::circuit::HealthCheck;
use crate::stats::Stats;
use crate::time::clock_now;
use crate::transport::codec::{DecodeError, EncodeError, FrameCodec};

/// Tunables of the connection pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Send attempts per frame before the destination is given up on.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub base_backoff: Duration,
    /// Limit on establishing one connection.
    pub connect_timeout: Duration,
    /// Limit on waiting for a response in [`ConnectionPool::call`].
    pub response_timeout: Duration,
    /// How long a failed destination stays excluded.
    pub unhealthy_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            unhealthy_cooldown: Duration::from_secs(30),
        }
    }
}

/// Error that can happen when talking to a destination.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("Failed to connect to {}: {}", saddr, error)]
    Connect {
        /// Destination address.
        saddr: SocketAddr,
        /// Underlying error.
        error: std::io::Error,
    },
    /// Frame could not be encoded or written.
    #[error("Failed to send frame: {0}")]
    Send(#[from] EncodeError),
    /// Response could not be read or parsed.
    #[error("Failed to read response: {0}")]
    Recv(#[from] DecodeError),
    /// Peer closed the connection.
    #[error("Connection closed by {}", saddr)]
    Closed {
        /// Destination address.
        saddr: SocketAddr,
    },
    /// No response within the configured timeout.
    #[error("Response from {} timed out", saddr)]
    Timeout {
        /// Destination address.
        saddr: SocketAddr,
    },
    /// Destination is in its unhealthy cooldown.
    #[error("Destination {} is marked unhealthy", saddr)]
    Unhealthy {
        /// Destination address.
        saddr: SocketAddr,
    },
}

type Connection = Arc<Mutex<Framed<TcpStream, FrameCodec>>>;

/// Shared pool of one connection per destination.
pub struct ConnectionPool {
    config: PoolConfig,
    stats: Stats,
    connections: Mutex<HashMap<SocketAddr, Connection>>,
    unhealthy_until: RwLock<HashMap<SocketAddr, Instant>>,
}

impl ConnectionPool {
    /// New `ConnectionPool`.
    pub fn new(config: PoolConfig, stats: Stats) -> ConnectionPool {
        ConnectionPool {
            config,
            stats,
            connections: Mutex::new(HashMap::new()),
            unhealthy_until: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the destination is outside its unhealthy cooldown.
    pub fn is_healthy(&self, saddr: SocketAddr) -> bool {
        match self
            .unhealthy_until
            .read()
            .expect("health map lock poisoned")
            .get(&saddr)
        {
            Some(&until) => clock_now() >= until,
            None => true,
        }
    }

    fn mark_unhealthy(&self, saddr: SocketAddr) {
        self.unhealthy_until
            .write()
            .expect("health map lock poisoned")
            .insert(saddr, clock_now() + self.config.unhealthy_cooldown);
    }

    async fn connection(&self, saddr: SocketAddr) -> Result<Connection, TransportError> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(&saddr) {
            return Ok(connection.clone());
        }
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(saddr))
            .await
            .map_err(|_| TransportError::Timeout { saddr })?
            .map_err(|error| TransportError::Connect { saddr, error })?;
        let connection = Arc::new(Mutex::new(Framed::new(
            stream,
            FrameCodec::new(self.stats.clone()),
        )));
        connections.insert(saddr, connection.clone());
        Ok(connection)
    }

    async fn evict(&self, saddr: SocketAddr) {
        self.connections.lock().await.remove(&saddr);
    }

    /** Send one frame, retrying on transient errors.

    Every retry reconnects from scratch with exponentially growing
    backoff. When all attempts fail the destination goes into the
    unhealthy cooldown and the last error is returned.
    */
    pub async fn send_frame(&self, saddr: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_healthy(saddr) {
            return Err(TransportError::Unhealthy { saddr });
        }

        let mut last_error = TransportError::Unhealthy { saddr };
        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.base_backoff * (1 << (attempt - 1))).await;
            }
            match self.try_send_frame(saddr, frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!("send to {} failed (attempt {}): {}", saddr, attempt + 1, error);
                    self.evict(saddr).await;
                    last_error = error;
                }
            }
        }
        self.mark_unhealthy(saddr);
        Err(last_error)
    }

    async fn try_send_frame(&self, saddr: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        let connection = self.connection(saddr).await?;
        let mut connection = connection.lock().await;
        connection.send(frame).await?;
        Ok(())
    }

    /** Send a packet and wait for the peer's reply on the same
    connection. Used for the circuit handshake.
    */
    pub async fn call(&self, saddr: SocketAddr, packet: Packet) -> Result<Packet, TransportError> {
        if !self.is_healthy(saddr) {
            return Err(TransportError::Unhealthy { saddr });
        }
        let result = self.try_call(saddr, packet).await;
        if result.is_err() {
            self.evict(saddr).await;
        }
        result
    }

    async fn try_call(&self, saddr: SocketAddr, packet: Packet) -> Result<Packet, TransportError> {
        let connection = self.connection(saddr).await?;
        let mut connection = connection.lock().await;
        connection.send(packet).await?;
        match timeout(self.config.response_timeout, connection.next()).await {
            Err(_) => Err(TransportError::Timeout { saddr }),
            Ok(None) => Err(TransportError::Closed { saddr }),
            Ok(Some(response)) => Ok(response?),
        }
    }
}

impl HealthCheck for ConnectionPool {
    fn is_healthy(&self, saddr: SocketAddr) -> bool {
        ConnectionPool::is_healthy(self, saddr)
    }
}
