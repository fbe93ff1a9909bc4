/*!
Batched packet processing.

Jobs enter through a bounded submission queue; a batcher task groups
them by size or by deadline and spreads the batches round-robin over a
fixed pool of workers. Each worker runs the whole per-packet path,
encode or peel, replay check, delay assignment, and hands finished
frames to the transport sink. Packet buffers come from a per-worker
freelist so the steady state allocates nothing.

A full submission queue rejects synchronously with
[`SubmitError::Overloaded`]; admitted jobs are never aborted, shutdown
lets the queues drain.
*/

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use rand::thread_rng;
use thiserror::Error;
use tokio::sync::mpsc;

use mixnet_binary_io::ToBytes;
use mixnet_packet::onion::{MixPacket, MIX_PACKET_SIZE};

use crate::circuit::{Circuit, CircuitId, CircuitRegistry, LinkTable};
use crate::delay::DelayScheduler;
use crate::onion::{build_packet, peel, OnionPeelError, PeeledPacket};
use crate::replay::ReplayGuard;
use crate::stats::{Counters, Stats, StatsSnapshot};
use crate::time::clock_now;

/// Tunables of the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity of the submission queue.
    pub queue_capacity: usize,
    /// Jobs per batch.
    pub batch_size: usize,
    /// How long the batcher waits for a batch to fill up.
    pub batch_timeout: Duration,
    /// Number of worker tasks.
    pub workers: usize,
    /// Buffers kept on each worker's freelist.
    pub pool_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            queue_capacity: 1024,
            batch_size: 32,
            batch_timeout: Duration::from_millis(5),
            workers: 4,
            pool_capacity: 64,
        }
    }
}

/// Error that can happen when submitting a job.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SubmitError {
    /// Submission queue is full.
    #[error("Pipeline is overloaded")]
    Overloaded,
    /// The circuit id is unknown or the circuit is closing.
    #[error("Unknown circuit")]
    UnknownCircuit,
}

/// Where finished frames go. Implemented by the transport adapter and
/// by test stubs.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Send a frame to a relay after holding it for `delay`.
    async fn forward(&self, saddr: SocketAddr, frame: Bytes, delay: Duration);

    /// Hand a verified exit payload to the local consumer.
    async fn deliver(&self, payload: Vec<u8>);
}

enum Job {
    Outbound {
        circuit: Arc<Circuit>,
        payload: Vec<u8>,
    },
    Inbound {
        packet: MixPacket,
    },
}

/// Freelist of packet-sized buffers, one per worker.
struct BufferPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl BufferPool {
    fn new(capacity: usize, counters: Arc<Counters>) -> BufferPool {
        BufferPool {
            free: Vec::with_capacity(capacity),
            capacity,
            counters,
        }
    }

    fn get(&mut self) -> Vec<u8> {
        match self.free.pop() {
            Some(buf) => {
                self.counters.increase_pool_hits();
                buf
            }
            None => {
                self.counters.increase_pool_misses();
                vec![0; MIX_PACKET_SIZE]
            }
        }
    }

    fn put(&mut self, buf: Vec<u8>) {
        if self.free.len() < self.capacity {
            self.free.push(buf);
        }
    }
}

/// Handle to a running pipeline.
#[derive(Clone)]
pub struct Pipeline {
    tx: mpsc::Sender<Job>,
    registry: CircuitRegistry,
    stats: Stats,
}

impl Pipeline {
    /// Spawn the batcher and the workers, returning the handle.
    pub fn run(
        config: PipelineConfig,
        registry: CircuitRegistry,
        links: Arc<LinkTable>,
        replay: Arc<ReplayGuard>,
        delay: Arc<DelayScheduler>,
        sink: Arc<dyn PacketSink>,
        stats: Stats,
    ) -> Pipeline {
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let mut worker_txs = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            // one batch in flight per worker keeps backpressure tight
            let (worker_tx, worker_rx) = mpsc::channel::<Vec<Job>>(1);
            worker_txs.push(worker_tx);
            tokio::spawn(worker(
                worker_rx,
                links.clone(),
                replay.clone(),
                delay.clone(),
                sink.clone(),
                stats.clone(),
                config.pool_capacity,
            ));
        }
        tokio::spawn(batcher(
            rx,
            worker_txs,
            config.batch_size,
            config.batch_timeout,
        ));

        Pipeline {
            tx,
            registry,
            stats,
        }
    }

    /// Submit a payload for sending over a circuit. Closed and expired
    /// circuits are gone from the registry, so both reject here.
    pub fn submit(&self, circuit_id: CircuitId, payload: Vec<u8>) -> Result<(), SubmitError> {
        let circuit = self
            .registry
            .get(circuit_id)
            .ok_or(SubmitError::UnknownCircuit)?;
        self.enqueue(Job::Outbound { circuit, payload })
    }

    /// Submit a received packet for relaying.
    pub fn submit_inbound(&self, packet: MixPacket) -> Result<(), SubmitError> {
        self.enqueue(Job::Inbound { packet })
    }

    fn enqueue(&self, job: Job) -> Result<(), SubmitError> {
        self.tx.try_send(job).map_err(|_| {
            self.stats.counters.increase_dropped();
            SubmitError::Overloaded
        })
    }

    /// Whether the pipeline still has admission capacity.
    pub fn is_healthy(&self) -> bool {
        self.tx.capacity() > 0
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

async fn batcher(
    mut rx: mpsc::Receiver<Job>,
    worker_txs: Vec<mpsc::Sender<Vec<Job>>>,
    batch_size: usize,
    batch_timeout: Duration,
) {
    let mut next_worker = 0;
    while let Some(job) = rx.recv().await {
        let mut batch = Vec::with_capacity(batch_size);
        batch.push(job);
        let deadline = clock_now() + batch_timeout;
        while batch.len() < batch_size {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => batch.push(job),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        if worker_txs[next_worker].send(batch).await.is_err() {
            return;
        }
        next_worker = (next_worker + 1) % worker_txs.len();
    }
}

async fn worker(
    mut rx: mpsc::Receiver<Vec<Job>>,
    links: Arc<LinkTable>,
    replay: Arc<ReplayGuard>,
    delay: Arc<DelayScheduler>,
    sink: Arc<dyn PacketSink>,
    stats: Stats,
    pool_capacity: usize,
) {
    let mut pool = BufferPool::new(pool_capacity, stats.counters.clone());
    while let Some(batch) = rx.recv().await {
        for job in batch {
            let started = clock_now();
            match job {
                Job::Outbound { circuit, payload } => {
                    process_outbound(&circuit, payload, &mut pool, sink.as_ref(), &stats).await
                }
                Job::Inbound { packet } => {
                    process_inbound(
                        packet,
                        &links,
                        &replay,
                        &delay,
                        &mut pool,
                        sink.as_ref(),
                        &stats,
                    )
                    .await
                }
            }
            stats
                .counters
                .record_latency_us((clock_now() - started).as_micros() as u64);
        }
    }
}

async fn process_outbound(
    circuit: &Circuit,
    payload: Vec<u8>,
    pool: &mut BufferPool,
    sink: &dyn PacketSink,
    stats: &Stats,
) {
    let (saddr, packet) = match build_packet(&mut thread_rng(), &circuit.hops, &payload) {
        Ok(built) => built,
        Err(error) => {
            debug!("dropping outbound packet: {}", error);
            stats.counters.increase_dropped();
            return;
        }
    };
    let frame = match frame_packet(&packet, pool) {
        Some(frame) => frame,
        None => {
            stats.counters.increase_dropped();
            return;
        }
    };
    sink.forward(saddr, frame, Duration::ZERO).await;
    stats.counters.increase_processed();
}

async fn process_inbound(
    packet: MixPacket,
    links: &LinkTable,
    replay: &ReplayGuard,
    delay: &DelayScheduler,
    pool: &mut BufferPool,
    sink: &dyn PacketSink,
    stats: &Stats,
) {
    let session_key = match links.session_key(packet.link_id) {
        Some(session_key) => session_key,
        None => {
            debug!("dropping packet for unknown link {}", packet.link_id);
            stats.counters.increase_dropped();
            return;
        }
    };

    // only packets that pass the header MAC get to occupy filter
    // capacity, so unauthenticated garbage cannot raise the
    // false-positive rate
    let peeled = peel(&packet, &session_key);
    let tag = packet.replay_tag();
    if peeled.is_ok() && !replay.observe(&tag) {
        stats.counters.increase_replays_rejected();
        return;
    }

    match peeled {
        Ok(PeeledPacket::Forward {
            saddr,
            packet: next,
        }) => {
            let ticket = delay.schedule(&tag);
            let frame = match frame_packet(&next, pool) {
                Some(frame) => frame,
                None => {
                    stats.counters.increase_dropped();
                    return;
                }
            };
            sink.forward(saddr, frame, ticket.delay).await;
            stats.counters.increase_processed();
        }
        Ok(PeeledPacket::Deliver { payload }) => {
            sink.deliver(payload).await;
            stats.counters.increase_processed();
        }
        Err(OnionPeelError::InvalidMac) | Err(OnionPeelError::InvalidDigest) => {
            stats.counters.increase_integrity_rejected();
        }
        Err(OnionPeelError::InvalidEntry) => {
            stats.counters.increase_integrity_rejected();
        }
    }
}

fn frame_packet(packet: &MixPacket, pool: &mut BufferPool) -> Option<Bytes> {
    let mut buf = pool.get();
    let frame = match packet.to_bytes((&mut buf, 0)) {
        Ok((_, size)) => Some(Bytes::copy_from_slice(&buf[..size])),
        Err(error) => {
            warn!("failed to serialize packet: {:?}", error);
            None
        }
    };
    pool.put(buf);
    frame
}
