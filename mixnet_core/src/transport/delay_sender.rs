/*!
Delayed frame dispatch.

Frames sit in a [`DelayQueue`] until their VRF-assigned hold time has
passed, then go out through the connection pool. The sender is the
[`PacketSink`] the pipeline workers hand their finished frames to;
verified exit payloads bypass the queue and go straight to the local
delivery channel.
*/

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::poll_fn;
use log::debug;
use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;

use crate::pipeline::PacketSink;
use crate::stats::Stats;
use crate::transport::pool::ConnectionPool;

/// [`PacketSink`] that honors per-frame delays.
#[derive(Clone)]
pub struct DelaySender {
    tx: mpsc::UnboundedSender<(SocketAddr, Bytes, Duration)>,
    delivery_tx: mpsc::Sender<Vec<u8>>,
}

impl DelaySender {
    /// Spawn the dispatch task. Exit payloads are pushed into
    /// `delivery_tx`.
    pub fn new(
        pool: Arc<ConnectionPool>,
        delivery_tx: mpsc::Sender<Vec<u8>>,
        stats: Stats,
    ) -> DelaySender {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, pool, stats));
        DelaySender { tx, delivery_tx }
    }
}

#[async_trait]
impl PacketSink for DelaySender {
    async fn forward(&self, saddr: SocketAddr, frame: Bytes, delay: Duration) {
        // receiver only goes away at shutdown; the frame is lost then
        // anyway
        let _ = self.tx.send((saddr, frame, delay));
    }

    async fn deliver(&self, payload: Vec<u8>) {
        let _ = self.delivery_tx.send(payload).await;
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes, Duration)>,
    pool: Arc<ConnectionPool>,
    stats: Stats,
) {
    let mut queue: DelayQueue<(SocketAddr, Bytes)> = DelayQueue::new();
    loop {
        tokio::select! {
            scheduled = rx.recv() => match scheduled {
                Some((saddr, frame, delay)) => {
                    queue.insert((saddr, frame), delay);
                }
                None => break,
            },
            // poll_expired is Ready(None) on an empty queue; the guard
            // keeps the branch from spinning
            expired = poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                if let Some(expired) = expired {
                    let (saddr, frame) = expired.into_inner();
                    if let Err(error) = pool.send_frame(saddr, frame).await {
                        debug!("dropping delayed frame for {}: {}", saddr, error);
                        stats.counters.increase_dropped();
                    }
                }
            }
        }
    }

    // drain what is already admitted before shutting down
    while let Some(expired) = poll_fn(|cx| queue.poll_expired(cx)).await {
        let (saddr, frame) = expired.into_inner();
        if let Err(error) = pool.send_frame(saddr, frame).await {
            debug!("dropping delayed frame for {}: {}", saddr, error);
            stats.counters.increase_dropped();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use tokio_util::codec::Framed;

    use mixnet_binary_io::ToBytes;
    use mixnet_packet::circuit::{CircuitResponse, CIRCUIT_RESPONSE_MAC_SIZE};
    use mixnet_packet::packet::Packet;

    use crate::transport::codec::FrameCodec;
    use crate::transport::pool::PoolConfig;

    fn frame() -> Bytes {
        let packet = Packet::CircuitResponse(CircuitResponse {
            link_id: 42,
            mac: [42; CIRCUIT_RESPONSE_MAC_SIZE],
        });
        let mut buf = [0; 64];
        let (_, size) = packet.to_bytes((&mut buf, 0)).unwrap();
        Bytes::copy_from_slice(&buf[..size])
    }

    async fn arrival_server() -> (SocketAddr, mpsc::UnboundedReceiver<Instant>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let saddr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new(Stats::new()));
            while let Some(Ok(_)) = framed.next().await {
                tx.send(Instant::now()).unwrap();
            }
        });
        (saddr, rx)
    }

    #[tokio::test]
    async fn frame_held_for_its_delay() {
        let (saddr, mut arrivals) = arrival_server().await;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Stats::new()));
        let (delivery_tx, _delivery_rx) = mpsc::channel(1);
        let sender = DelaySender::new(pool, delivery_tx, Stats::new());

        let sent_at = Instant::now();
        sender
            .forward(saddr, frame(), Duration::from_millis(100))
            .await;
        let arrived_at = arrivals.recv().await.unwrap();
        assert!(arrived_at - sent_at >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn zero_delay_goes_straight_out() {
        let (saddr, mut arrivals) = arrival_server().await;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Stats::new()));
        let (delivery_tx, _delivery_rx) = mpsc::channel(1);
        let sender = DelaySender::new(pool, delivery_tx, Stats::new());

        sender.forward(saddr, frame(), Duration::ZERO).await;
        assert!(arrivals.recv().await.is_some());
    }

    #[tokio::test]
    async fn shorter_delay_overtakes_longer() {
        let (saddr, mut arrivals) = arrival_server().await;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Stats::new()));
        let (delivery_tx, _delivery_rx) = mpsc::channel(1);
        let sender = DelaySender::new(pool.clone(), delivery_tx, Stats::new());

        sender
            .forward(saddr, frame(), Duration::from_millis(200))
            .await;
        sender
            .forward(saddr, frame(), Duration::from_millis(20))
            .await;

        let first = arrivals.recv().await.unwrap();
        let second = arrivals.recv().await.unwrap();
        assert!(second - first >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exit_payload_reaches_delivery_channel() {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Stats::new()));
        let (delivery_tx, mut delivery_rx) = mpsc::channel(1);
        let sender = DelaySender::new(pool, delivery_tx, Stats::new());

        sender.deliver(b"for the application".to_vec()).await;
        assert_eq!(delivery_rx.recv().await.unwrap(), b"for the application");
    }
}
