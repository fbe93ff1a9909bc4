/*!
Circuit construction and bookkeeping.

The circuit owner picks a path through the directory, shares a session
key with every hop over a [`HopHandshake`] and keeps the finished
circuit in a [`CircuitRegistry`]. On the relay side the [`LinkTable`]
holds the accepted links and resolves incoming packets to their session
keys.

Path selection never places two relays of the same operator on one
circuit, so a single operator observes at most one hop of it.
*/

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use crypto_box::{SalsaBox, SecretKey};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use thiserror::Error;
use tokio::time::Instant;

use mixnet_crypto::{PublicKey, SessionKey};
use mixnet_packet::circuit::{CircuitRequest, CircuitRequestPayload, CircuitResponse};
use mixnet_packet::onion::MAX_HOPS;
use mixnet_packet::relay_node::{NodeRole, OperatorId, RelayNode};

use crate::directory::NodeDirectory;
use crate::onion::PathHop;
use crate::time::{clock_now, unix_time};

/// Default circuit lifetime in seconds.
pub const CIRCUIT_LIFETIME_SECS: u64 = 600;

/// Identifier of a circuit at its owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub u64);

/// Error that can happen when building or using a circuit.
#[derive(Debug, Error)]
pub enum CircuitError {
    /// Directory has too few usable nodes for the requested path.
    #[error("Not enough usable nodes: needed {}, available {}", needed, available)]
    InsufficientNodes {
        /// Nodes the path needs.
        needed: usize,
        /// Usable nodes the directory offers.
        available: usize,
    },
    /// Requested number of hops is out of range.
    #[error("Hop count should be in range 1..=7: {}", hops)]
    BadHopCount {
        /// Rejected hop count.
        hops: usize,
    },
    /// A hop refused or failed the handshake.
    #[error("Handshake with {} failed: {}", saddr, reason)]
    HandshakeFailed {
        /// Address of the failed hop.
        saddr: SocketAddr,
        /// Failure description.
        reason: String,
    },
    /// The circuit id is unknown or already closed.
    #[error("Unknown circuit")]
    NotFound,
}

/// One established circuit at its owner.
///
/// A circuit enters the registry only after every hop has confirmed
/// its link, and leaves it on teardown or when a lookup finds it past
/// `expires_at`; registry membership is the whole lifecycle.
pub struct Circuit {
    /// Identifier of the circuit.
    pub id: CircuitId,
    /// Hops in path order; session keys are erased on drop.
    pub hops: Vec<PathHop>,
    /// When the circuit was established.
    pub created_at: Instant,
    /// Unix time in seconds the hops will expire the links at.
    pub expires_at: u64,
}

/// Seam between the circuit builder and the network.
#[async_trait]
pub trait HopHandshake: Send + Sync {
    /// Deliver a session key to one hop and wait for its confirmation.
    async fn establish(
        &self,
        node: &RelayNode,
        link_id: u32,
        session_key: &SessionKey,
        expires_at: u64,
    ) -> Result<(), CircuitError>;

    /// Tell one hop to drop a link. Failures are ignored, the hop
    /// expires the link on its own anyway.
    async fn release(&self, node: &RelayNode, link_id: u32);
}

/// Health filter consulted during path selection.
pub trait HealthCheck: Send + Sync {
    /// Whether the destination is currently usable.
    fn is_healthy(&self, saddr: SocketAddr) -> bool;
}

/// Health filter that excludes nothing.
pub struct AlwaysHealthy;

impl HealthCheck for AlwaysHealthy {
    fn is_healthy(&self, _saddr: SocketAddr) -> bool {
        true
    }
}

/// Shared store of the circuits an owner keeps open.
#[derive(Clone, Default)]
pub struct CircuitRegistry {
    circuits: Arc<RwLock<HashMap<CircuitId, Arc<Circuit>>>>,
    next_id: Arc<AtomicU64>,
}

impl CircuitRegistry {
    /// New empty `CircuitRegistry`.
    pub fn new() -> Self {
        Default::default()
    }

    pub(crate) fn insert(&self, hops: Vec<PathHop>, expires_at: u64) -> Arc<Circuit> {
        let id = CircuitId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let circuit = Arc::new(Circuit {
            id,
            hops,
            created_at: clock_now(),
            expires_at,
        });
        self.circuits
            .write()
            .expect("circuit registry lock poisoned")
            .insert(id, circuit.clone());
        circuit
    }

    /// Get a circuit by id. A circuit past its deadline is purged and
    /// never returned; the hops have dropped its links by then.
    /// In-flight packets keep the hop keys alive through this `Arc`
    /// even if the circuit is closed meanwhile.
    pub fn get(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        let circuit = self
            .circuits
            .read()
            .expect("circuit registry lock poisoned")
            .get(&id)
            .cloned()?;
        if circuit.expires_at <= unix_time(SystemTime::now()) {
            self.remove(id);
            return None;
        }
        Some(circuit)
    }

    /// Any live circuit with the given number of hops.
    pub fn find_by_hops(&self, hops: usize) -> Option<Arc<Circuit>> {
        self.purge_expired(unix_time(SystemTime::now()));
        self.circuits
            .read()
            .expect("circuit registry lock poisoned")
            .values()
            .find(|circuit| circuit.hops.len() == hops)
            .cloned()
    }

    /// Drop every circuit past its deadline (unix seconds).
    pub fn purge_expired(&self, now: u64) {
        self.circuits
            .write()
            .expect("circuit registry lock poisoned")
            .retain(|_, circuit| circuit.expires_at > now);
    }

    /// Remove a circuit. The session keys are zeroized when the last
    /// `Arc` reference drops.
    pub fn remove(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits
            .write()
            .expect("circuit registry lock poisoned")
            .remove(&id)
    }

    /// Number of open circuits.
    pub fn len(&self) -> usize {
        self.circuits
            .read()
            .expect("circuit registry lock poisoned")
            .len()
    }

    /// Check if no circuits are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds circuits against the current directory snapshot.
pub struct CircuitBuilder {
    directory: NodeDirectory,
    handshake: Arc<dyn HopHandshake>,
    health: Arc<dyn HealthCheck>,
    registry: CircuitRegistry,
    lifetime_secs: u64,
}

impl CircuitBuilder {
    /// New `CircuitBuilder` without a health filter.
    pub fn new(directory: NodeDirectory, handshake: Arc<dyn HopHandshake>) -> CircuitBuilder {
        CircuitBuilder {
            directory,
            handshake,
            health: Arc::new(AlwaysHealthy),
            registry: CircuitRegistry::new(),
            lifetime_secs: CIRCUIT_LIFETIME_SECS,
        }
    }

    /// Consult the given health filter during path selection.
    pub fn with_health(mut self, health: Arc<dyn HealthCheck>) -> CircuitBuilder {
        self.health = health;
        self
    }

    /// Registry holding the circuits built by this builder.
    pub fn registry(&self) -> &CircuitRegistry {
        &self.registry
    }

    /** Build a circuit of `hop_count` hops.

    Selects a path of distinct operators, none of them in `exclude`,
    preferring role-matching nodes per position, performs the handshake
    hop by hop and registers the finished circuit. If any handshake
    fails the already established links are released before the error
    is returned.
    */
    pub async fn build(
        &self,
        hop_count: usize,
        exclude: &HashSet<OperatorId>,
        expires_at: u64,
    ) -> Result<Arc<Circuit>, CircuitError> {
        if hop_count == 0 || hop_count > MAX_HOPS {
            return Err(CircuitError::BadHopCount { hops: hop_count });
        }

        let path = self.select_path(hop_count, exclude)?;

        let mut hops: Vec<PathHop> = Vec::with_capacity(hop_count);
        let mut established: Vec<(RelayNode, u32)> = Vec::with_capacity(hop_count);
        for node in &path {
            let link_id = thread_rng().gen();
            let session_key = SessionKey::generate(&mut thread_rng());
            match self
                .handshake
                .establish(node, link_id, &session_key, expires_at)
                .await
            {
                Ok(()) => {
                    hops.push(PathHop {
                        saddr: node.saddr,
                        link_id,
                        session_key,
                    });
                    established.push((node.clone(), link_id));
                }
                Err(error) => {
                    for (node, link_id) in established {
                        self.handshake.release(&node, link_id).await;
                    }
                    return Err(error);
                }
            }
        }

        Ok(self.registry.insert(hops, expires_at))
    }

    /// Lifetime hint for new circuits, seconds from now.
    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    /** Tear down a circuit.

    The circuit leaves the registry immediately so no new packets are
    built over it, then every hop is told to drop its link. Session
    keys are erased once the last in-flight reference drops.
    */
    pub async fn close(&self, id: CircuitId) -> Result<(), CircuitError> {
        let circuit = self.registry.remove(id).ok_or(CircuitError::NotFound)?;
        let snapshot = self.directory.snapshot();
        for hop in &circuit.hops {
            // release by address; the node record may be gone from the
            // directory after a refresh
            if let Some(node) = snapshot.nodes.iter().find(|node| node.saddr == hop.saddr) {
                self.handshake.release(node, hop.link_id).await;
            }
        }
        Ok(())
    }

    fn select_path(
        &self,
        hop_count: usize,
        exclude: &HashSet<OperatorId>,
    ) -> Result<Vec<RelayNode>, CircuitError> {
        let snapshot = self.directory.snapshot();
        let usable: Vec<&RelayNode> = snapshot
            .nodes
            .iter()
            .filter(|node| {
                self.health.is_healthy(node.saddr) && !exclude.contains(&node.operator)
            })
            .collect();
        if usable.len() < hop_count {
            return Err(CircuitError::InsufficientNodes {
                needed: hop_count,
                available: usable.len(),
            });
        }

        let mut rng = thread_rng();
        let mut path: Vec<RelayNode> = Vec::with_capacity(hop_count);
        let mut operators: HashSet<OperatorId> = HashSet::new();
        for position in 0..hop_count {
            let role = position_role(position, hop_count);
            let mut candidates: Vec<&&RelayNode> = usable
                .iter()
                .filter(|node| node.role == role && !operators.contains(&node.operator))
                .collect();
            if candidates.is_empty() {
                // the role is a preference; any distinct-operator node
                // still makes a usable hop
                candidates = usable
                    .iter()
                    .filter(|node| !operators.contains(&node.operator))
                    .collect();
            }
            candidates.shuffle(&mut rng);
            match candidates.first() {
                Some(node) => {
                    operators.insert(node.operator);
                    path.push((**node).clone());
                }
                None => {
                    return Err(CircuitError::InsufficientNodes {
                        needed: hop_count,
                        available: path.len(),
                    })
                }
            }
        }
        Ok(path)
    }
}

/// Role a hop at the given position must advertise.
fn position_role(position: usize, hop_count: usize) -> NodeRole {
    if position + 1 == hop_count {
        NodeRole::Exit
    } else if position == 0 {
        NodeRole::Entry
    } else {
        NodeRole::Middle
    }
}

struct LinkEntry {
    session_key: SessionKey,
    expires_at: u64,
}

/// Error that can happen when accepting a circuit request.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The encrypted payload can't be opened with our key.
    #[error("Invalid circuit request payload")]
    InvalidPayload,
    /// The link id is already taken by another circuit.
    #[error("Link id {} is already in use", link_id)]
    LinkInUse {
        /// The contested link id.
        link_id: u32,
    },
}

/// Relay-side table of accepted links.
#[derive(Default)]
pub struct LinkTable {
    links: RwLock<HashMap<u32, LinkEntry>>,
}

impl LinkTable {
    /// New empty `LinkTable`.
    pub fn new() -> Self {
        Default::default()
    }

    /** Accept a circuit request addressed to us.

    Opens the payload with our long-term key and the owner's ephemeral
    key, stores the link and returns the confirmation to send back.
    */
    pub fn accept(
        &self,
        request: &CircuitRequest,
        our_secret_key: &SecretKey,
    ) -> Result<CircuitResponse, AcceptError> {
        let shared_secret = SalsaBox::new(&request.temporary_pk, our_secret_key);
        let payload = request
            .get_payload(&shared_secret)
            .map_err(|_| AcceptError::InvalidPayload)?;

        let mut links = self.links.write().expect("link table lock poisoned");
        if links.contains_key(&request.link_id) {
            return Err(AcceptError::LinkInUse {
                link_id: request.link_id,
            });
        }
        let response = CircuitResponse::new(&payload.session_key, request.link_id);
        links.insert(
            request.link_id,
            LinkEntry {
                session_key: payload.session_key,
                expires_at: payload.expires_at,
            },
        );
        Ok(response)
    }

    /// Session key of a link, if the link is known.
    pub fn session_key(&self, link_id: u32) -> Option<SessionKey> {
        self.links
            .read()
            .expect("link table lock poisoned")
            .get(&link_id)
            .map(|entry| entry.session_key.clone())
    }

    /// Drop one link.
    pub fn release(&self, link_id: u32) {
        self.links
            .write()
            .expect("link table lock poisoned")
            .remove(&link_id);
    }

    /// Drop every link that expired before `now` (unix seconds).
    pub fn purge_expired(&self, now: u64) {
        self.links
            .write()
            .expect("link table lock poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }

    /// Number of open links.
    pub fn len(&self) -> usize {
        self.links.read().expect("link table lock poisoned").len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build the request that delivers a session key to one hop.
pub fn hop_request(
    hop_pk: &PublicKey,
    link_id: u32,
    session_key: &SessionKey,
    expires_at: u64,
) -> CircuitRequest {
    let temporary_sk = SecretKey::generate(&mut thread_rng());
    let temporary_pk = temporary_sk.public_key();
    let shared_secret = SalsaBox::new(hop_pk, &temporary_sk);
    let payload = CircuitRequestPayload {
        session_key: session_key.clone(),
        expires_at,
    };
    CircuitRequest::new(&shared_secret, link_id, temporary_pk, &payload)
}
