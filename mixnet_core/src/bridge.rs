/*!
Orchestration bridge between the application and the relay engine.

The bridge owns the directory, the circuit builder and the pipeline,
and exposes the one-call surface the application uses: discover nodes,
route a payload at a privacy level, close circuits, read stats. Per
level it keeps at most one circuit alive and builds it lazily on the
first route call.

When the pipeline has no admission capacity the bridge falls back to a
direct single-layer send so the payload still leaves the host; how
often that happens is visible as `fallback_ratio` in the stats.
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use log::{debug, warn};
use rand::thread_rng;
use thiserror::Error;

use mixnet_binary_io::ToBytes;
use mixnet_packet::descriptor::{DescriptorId, ServiceDescriptor};
use mixnet_packet::ip_port::{IpPort, IpPortPadding, SIZE_IPPORT};
use mixnet_packet::onion::{MAX_PAYLOAD_SIZE, MIX_PACKET_SIZE};
use mixnet_packet::relay_node::RelayNode;

use crate::circuit::{Circuit, CircuitBuilder, CircuitError, CircuitId};
use crate::directory::NodeDirectory;
use crate::onion::{build_packet, OnionBuildError};
use crate::pipeline::{PacketSink, Pipeline, SubmitError};
use crate::stats::{Stats, StatsSnapshot};
use crate::time::unix_time;

use std::net::SocketAddr;

/// How much anonymity a routed payload gets, as a hop count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrivacyLevel {
    /// One hop.
    Basic,
    /// Three hops.
    Standard,
    /// Five hops.
    High,
    /// Seven hops.
    Maximum,
}

impl PrivacyLevel {
    /// Number of hops the level buys.
    pub fn hops(self) -> usize {
        match self {
            PrivacyLevel::Basic => 1,
            PrivacyLevel::Standard => 3,
            PrivacyLevel::High => 5,
            PrivacyLevel::Maximum => 7,
        }
    }
}

/// Which machinery served a route call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    /// The batch pipeline.
    Pipeline,
    /// The direct single-layer fallback.
    Direct,
}

/// Pick the backend for the next route call.
pub fn select_backend(pipeline_healthy: bool) -> Backend {
    if pipeline_healthy {
        Backend::Pipeline
    } else {
        Backend::Direct
    }
}

/// Where a routed payload should end up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// A relay's socket address.
    Relay(SocketAddr),
    /// A hidden service, resolved through the descriptor store.
    Service(DescriptorId),
}

/// Error that can happen when routing a payload.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No descriptor stored under the given id.
    #[error("Unknown descriptor")]
    UnknownDescriptor,
    /// A descriptor failed its signature check.
    #[error("Invalid descriptor signature")]
    InvalidDescriptor,
    /// Payload plus destination header exceeds the packet capacity.
    #[error("Payload should not be longer than {} bytes: {} bytes", MAX_PAYLOAD_SIZE - SIZE_IPPORT, len)]
    PayloadTooBig {
        /// Length of the rejected payload.
        len: usize,
    },
    /// Circuit construction failed.
    #[error("Circuit error: {0}")]
    Circuit(#[from] CircuitError),
    /// Packet could not be serialized.
    #[error("Failed to serialize packet")]
    Serialize,
    /// Both the pipeline and the fallback rejected the payload.
    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),
}

/// The engine's application-facing handle.
pub struct MixBridge {
    directory: NodeDirectory,
    builder: Arc<CircuitBuilder>,
    pipeline: Pipeline,
    sink: Arc<dyn PacketSink>,
    descriptors: RwLock<HashMap<DescriptorId, ServiceDescriptor>>,
    stats: Stats,
}

impl MixBridge {
    /// New `MixBridge` over an already running pipeline.
    pub fn new(
        directory: NodeDirectory,
        builder: Arc<CircuitBuilder>,
        pipeline: Pipeline,
        sink: Arc<dyn PacketSink>,
        stats: Stats,
    ) -> MixBridge {
        MixBridge {
            directory,
            builder,
            pipeline,
            sink,
            descriptors: RwLock::new(HashMap::new()),
            stats,
        }
    }

    /// Merge optional seed nodes into the directory and return the
    /// currently known nodes.
    pub fn discover_nodes(&self, seeds: Option<Vec<RelayNode>>) -> Vec<RelayNode> {
        if let Some(seeds) = seeds {
            let snapshot = self.directory.snapshot();
            let mut nodes = snapshot.nodes.clone();
            for seed in seeds {
                if snapshot.get(&seed.pk).is_none() {
                    nodes.push(seed);
                }
            }
            self.directory
                .refresh(nodes, unix_time(SystemTime::now()));
        }
        self.directory.snapshot().nodes.clone()
    }

    /// Replace the directory contents with a fresh node listing.
    pub fn refresh_directory(&self, nodes: Vec<RelayNode>) {
        self.directory.refresh(nodes, unix_time(SystemTime::now()));
    }

    /// Store a service descriptor after checking its signature.
    pub fn add_descriptor(&self, descriptor: ServiceDescriptor) -> Result<(), RouteError> {
        if !descriptor.is_valid() {
            return Err(RouteError::InvalidDescriptor);
        }
        self.descriptors
            .write()
            .expect("descriptor store lock poisoned")
            .insert(descriptor.id(), descriptor);
        Ok(())
    }

    /// Build a circuit of the given hop count explicitly.
    pub async fn build_circuit(&self, hop_count: usize) -> Result<Arc<Circuit>, CircuitError> {
        let expires_at = unix_time(SystemTime::now()) + self.builder.lifetime_secs();
        self.builder.build(hop_count, &HashSet::new(), expires_at).await
    }

    /// Tear down a circuit.
    pub async fn close_circuit(&self, id: CircuitId) -> Result<(), CircuitError> {
        self.builder.close(id).await
    }

    /** Route a payload to a destination at the given privacy level.

    Picks the backend from the pipeline's health, reuses an existing
    circuit of the right length or builds one, and returns which
    backend carried the payload. If the pipeline rejects the payload
    with `Overloaded` the direct fallback is tried before giving up.
    */
    pub async fn route(
        &self,
        level: PrivacyLevel,
        destination: Destination,
        payload: &[u8],
    ) -> Result<Backend, RouteError> {
        let target = self.resolve(&destination)?;
        let envelope = seal_envelope(target, payload)?;

        match select_backend(self.pipeline.is_healthy()) {
            Backend::Pipeline => {
                let circuit = self.circuit_for(level.hops()).await?;
                match self.pipeline.submit(circuit.id, envelope.clone()) {
                    Ok(()) => {
                        self.stats.counters.increase_pipeline_served();
                        Ok(Backend::Pipeline)
                    }
                    Err(SubmitError::Overloaded) => {
                        debug!("pipeline overloaded, falling back to direct send");
                        self.route_direct(envelope).await
                    }
                    Err(error) => Err(error.into()),
                }
            }
            Backend::Direct => self.route_direct(envelope).await,
        }
    }

    /// Point-in-time engine counters.
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn resolve(&self, destination: &Destination) -> Result<SocketAddr, RouteError> {
        match destination {
            Destination::Relay(saddr) => Ok(*saddr),
            Destination::Service(id) => {
                let descriptors = self
                    .descriptors
                    .read()
                    .expect("descriptor store lock poisoned");
                let descriptor = descriptors.get(id).ok_or(RouteError::UnknownDescriptor)?;
                descriptor
                    .intro_points
                    .first()
                    .map(|node| node.saddr)
                    .ok_or(RouteError::UnknownDescriptor)
            }
        }
    }

    /// Reuse a live circuit of the right length or build a fresh one.
    /// Expired circuits never come back from the registry, so a
    /// route call cannot pick one whose links the hops already forgot.
    async fn circuit_for(&self, hops: usize) -> Result<Arc<Circuit>, CircuitError> {
        if let Some(circuit) = self.builder.registry().find_by_hops(hops) {
            return Ok(circuit);
        }
        let expires_at = unix_time(SystemTime::now()) + self.builder.lifetime_secs();
        self.builder.build(hops, &HashSet::new(), expires_at).await
    }

    async fn route_direct(&self, envelope: Vec<u8>) -> Result<Backend, RouteError> {
        let circuit = self.circuit_for(1).await?;
        let (saddr, packet) = build_packet(&mut thread_rng(), &circuit.hops, &envelope)
            .map_err(|error| match error {
                OnionBuildError::PayloadTooBig { len } => RouteError::PayloadTooBig { len },
                OnionBuildError::BadPathLength { .. } => {
                    CircuitError::BadHopCount { hops: 1 }.into()
                }
            })?;
        let mut buf = [0; MIX_PACKET_SIZE];
        let frame = match packet.to_bytes((&mut buf, 0)) {
            Ok((_, size)) => Bytes::copy_from_slice(&buf[..size]),
            Err(error) => {
                warn!("failed to serialize direct packet: {:?}", error);
                self.stats.counters.increase_dropped();
                return Err(RouteError::Serialize);
            }
        };
        self.sink.forward(saddr, frame, Duration::ZERO).await;
        self.stats.counters.increase_direct_served();
        self.stats.counters.increase_processed();
        Ok(Backend::Direct)
    }
}

/// Prefix the payload with the destination so the exit's consumer
/// knows where to hand it on.
fn seal_envelope(target: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, RouteError> {
    if payload.len() > MAX_PAYLOAD_SIZE - SIZE_IPPORT {
        return Err(RouteError::PayloadTooBig { len: payload.len() });
    }
    let mut envelope = vec![0; SIZE_IPPORT + payload.len()];
    let (_, size) = IpPort::from_saddr(target)
        .to_bytes((&mut envelope[..], 0), IpPortPadding::WithPadding)
        .expect("ip port always fits");
    debug_assert_eq!(size, SIZE_IPPORT);
    envelope[SIZE_IPPORT..].copy_from_slice(payload);
    Ok(envelope)
}

/// Split a delivered envelope back into destination and payload.
pub fn open_envelope(envelope: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
    let (payload, ip_port) = IpPort::from_bytes(envelope, IpPortPadding::WithPadding).ok()?;
    Some((ip_port.to_saddr(), payload.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use crypto_box::SecretKey;
    use ed25519_dalek::SigningKey;

    use mixnet_binary_io::FromBytes;
    use mixnet_crypto::SessionKey;
    use mixnet_packet::onion::MixPacket;
    use mixnet_packet::relay_node::{NodeRole, OperatorId};

    use crate::circuit::{HopHandshake, LinkTable};
    use crate::delay::DelayScheduler;
    use crate::onion::{peel, PeeledPacket};
    use crate::pipeline::PipelineConfig;
    use crate::replay::{ReplayGuard, REPLAY_WINDOW};

    #[derive(Default)]
    struct RecordingSink {
        forwarded: Mutex<Vec<(SocketAddr, Bytes, Duration)>>,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn forward(&self, saddr: SocketAddr, frame: Bytes, delay: Duration) {
            self.forwarded.lock().unwrap().push((saddr, frame, delay));
        }

        async fn deliver(&self, _payload: Vec<u8>) {}
    }

    struct AcceptAll;

    #[async_trait]
    impl HopHandshake for AcceptAll {
        async fn establish(
            &self,
            _node: &RelayNode,
            _link_id: u32,
            _session_key: &SessionKey,
            _expires_at: u64,
        ) -> Result<(), CircuitError> {
            Ok(())
        }

        async fn release(&self, _node: &RelayNode, _link_id: u32) {}
    }

    fn node(addr: &str, operator: u8, role: NodeRole) -> RelayNode {
        RelayNode::new(
            addr.parse().unwrap(),
            SecretKey::generate(&mut thread_rng()).public_key(),
            OperatorId([operator; 32]),
            role,
            25_000,
        )
    }

    fn mesh() -> Vec<RelayNode> {
        let mut nodes = vec![];
        for i in 0..8u8 {
            nodes.push(node(&format!("10.0.0.{}:33445", i + 1), i, NodeRole::Entry));
            nodes.push(node(&format!("10.0.1.{}:33445", i + 1), 10 + i, NodeRole::Middle));
            nodes.push(node(&format!("10.0.2.{}:33445", i + 1), 20 + i, NodeRole::Exit));
        }
        nodes
    }

    fn bridge_with(sink: Arc<dyn PacketSink>, config: PipelineConfig) -> MixBridge {
        let stats = Stats::new();
        let directory = NodeDirectory::new();
        directory.refresh(mesh(), 1700000000);
        let builder = Arc::new(CircuitBuilder::new(directory.clone(), Arc::new(AcceptAll)));
        let pipeline = Pipeline::run(
            config,
            builder.registry().clone(),
            Arc::new(LinkTable::new()),
            Arc::new(ReplayGuard::new(REPLAY_WINDOW)),
            Arc::new(DelayScheduler::new(SigningKey::generate(&mut thread_rng()))),
            sink.clone(),
            stats.clone(),
        );
        MixBridge::new(directory, builder, pipeline, sink, stats)
    }

    #[test]
    fn privacy_levels_map_to_hops() {
        assert_eq!(PrivacyLevel::Basic.hops(), 1);
        assert_eq!(PrivacyLevel::Standard.hops(), 3);
        assert_eq!(PrivacyLevel::High.hops(), 5);
        assert_eq!(PrivacyLevel::Maximum.hops(), 7);
    }

    #[test]
    fn backend_follows_pipeline_health() {
        assert_eq!(select_backend(true), Backend::Pipeline);
        assert_eq!(select_backend(false), Backend::Direct);
    }

    #[test]
    fn envelope_roundtrip() {
        let target: SocketAddr = "5.6.7.8:443".parse().unwrap();
        let envelope = seal_envelope(target, b"request body").unwrap();
        let (opened_target, payload) = open_envelope(&envelope).unwrap();
        assert_eq!(opened_target, target);
        assert_eq!(payload, b"request body");
    }

    #[tokio::test]
    async fn route_standard_uses_pipeline() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink.clone(), PipelineConfig::default());

        let backend = bridge
            .route(
                PrivacyLevel::Standard,
                Destination::Relay("5.6.7.8:443".parse().unwrap()),
                b"over three hops",
            )
            .await
            .unwrap();
        assert_eq!(backend, Backend::Pipeline);

        // the packet leaves through the sink towards the circuit's
        // first hop
        for _ in 0..200 {
            if !sink.forwarded.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let circuit = bridge.builder.registry().find_by_hops(3).unwrap();
        let (saddr, frame, _) = sink.forwarded.lock().unwrap()[0].clone();
        assert_eq!(saddr, circuit.hops[0].saddr);

        // unwrap all three layers and check the envelope
        let (_, mut packet) = MixPacket::from_bytes(&frame).unwrap();
        for hop in &circuit.hops[..2] {
            packet = match peel(&packet, &hop.session_key).unwrap() {
                PeeledPacket::Forward { packet, .. } => packet,
                PeeledPacket::Deliver { .. } => panic!("delivered early"),
            };
        }
        let payload = match peel(&packet, &circuit.hops[2].session_key).unwrap() {
            PeeledPacket::Deliver { payload } => payload,
            PeeledPacket::Forward { .. } => panic!("not delivered at the exit"),
        };
        let (target, body) = open_envelope(&payload).unwrap();
        assert_eq!(target, "5.6.7.8:443".parse::<SocketAddr>().unwrap());
        assert_eq!(body, b"over three hops");
    }

    #[tokio::test]
    async fn route_reuses_the_circuit() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink, PipelineConfig::default());
        let destination = Destination::Relay("5.6.7.8:443".parse().unwrap());

        bridge
            .route(PrivacyLevel::Standard, destination.clone(), b"one")
            .await
            .unwrap();
        bridge
            .route(PrivacyLevel::Standard, destination, b"two")
            .await
            .unwrap();
        assert_eq!(bridge.builder.registry().len(), 1);
    }

    #[tokio::test]
    async fn service_destination_resolves_to_intro_point() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink, PipelineConfig::default());

        let signing_key = SigningKey::generate(&mut thread_rng());
        let intro = node("9.9.9.9:33445", 99, NodeRole::Middle);
        let descriptor = ServiceDescriptor::new(&signing_key, vec![intro], 1700000000);
        let id = descriptor.id();
        bridge.add_descriptor(descriptor).unwrap();

        let backend = bridge
            .route(PrivacyLevel::Basic, Destination::Service(id), b"hello")
            .await
            .unwrap();
        assert_eq!(backend, Backend::Pipeline);
    }

    #[tokio::test]
    async fn unknown_descriptor_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink, PipelineConfig::default());
        assert!(matches!(
            bridge
                .route(
                    PrivacyLevel::Basic,
                    Destination::Service(DescriptorId([9; 32])),
                    b"hello",
                )
                .await,
            Err(RouteError::UnknownDescriptor)
        ));
    }

    #[tokio::test]
    async fn tampered_descriptor_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink, PipelineConfig::default());

        let signing_key = SigningKey::generate(&mut thread_rng());
        let intro = node("9.9.9.9:33445", 99, NodeRole::Middle);
        let mut descriptor = ServiceDescriptor::new(&signing_key, vec![intro], 1700000000);
        descriptor.timestamp += 1;
        assert!(matches!(
            bridge.add_descriptor(descriptor),
            Err(RouteError::InvalidDescriptor)
        ));
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let bridge = bridge_with(sink, PipelineConfig::default());
        let payload = vec![0; MAX_PAYLOAD_SIZE];
        assert!(matches!(
            bridge
                .route(
                    PrivacyLevel::Basic,
                    Destination::Relay("5.6.7.8:443".parse().unwrap()),
                    &payload,
                )
                .await,
            Err(RouteError::PayloadTooBig { .. })
        ));
    }

    #[tokio::test]
    async fn overloaded_pipeline_falls_back_to_direct() {
        // slow enough to jam the single worker, but the direct path
        // still completes through it
        struct SlowSink;

        #[async_trait]
        impl PacketSink for SlowSink {
            async fn forward(&self, _saddr: SocketAddr, _frame: Bytes, _delay: Duration) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            async fn deliver(&self, _payload: Vec<u8>) {}
        }

        let bridge = bridge_with(
            Arc::new(SlowSink),
            PipelineConfig {
                queue_capacity: 1,
                batch_size: 1,
                batch_timeout: Duration::from_millis(1),
                workers: 1,
                pool_capacity: 4,
            },
        );
        let destination = Destination::Relay("5.6.7.8:443".parse().unwrap());

        let mut saw_direct = false;
        for _ in 0..64 {
            match bridge
                .route(PrivacyLevel::Basic, destination.clone(), b"flood")
                .await
            {
                Ok(Backend::Direct) => {
                    saw_direct = true;
                    break;
                }
                Ok(Backend::Pipeline) => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(error) => panic!("unexpected error: {:?}", error),
            }
        }
        assert!(saw_direct);
        assert!(bridge.get_stats().fallback_ratio > 0.0);
    }
}
