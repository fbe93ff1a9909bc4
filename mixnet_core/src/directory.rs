/*!
Local view of the relay node directory.

The directory is refreshed as a whole: a refresh installs a new
immutable snapshot and readers keep whatever snapshot they already
hold. Path selection therefore always works against one consistent
generation of the directory.
*/

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mixnet_crypto::PublicKey;
use mixnet_packet::relay_node::{NodeRole, RelayNode};

/// One immutable generation of the directory.
#[derive(Clone, Debug, Default)]
pub struct DirectorySnapshot {
    /// All known relay nodes.
    pub nodes: Vec<RelayNode>,
    /// Monotonic generation number, incremented on every refresh.
    pub generation: u64,
    /// Unix time in seconds the snapshot was installed at.
    pub refreshed_at: u64,
    by_pk: HashMap<PublicKey, usize>,
}

impl DirectorySnapshot {
    /// Look up a node by its public key.
    pub fn get(&self, pk: &PublicKey) -> Option<&RelayNode> {
        self.by_pk.get(pk).map(|&index| &self.nodes[index])
    }

    /// Nodes advertising the given role.
    pub fn with_role(&self, role: NodeRole) -> impl Iterator<Item = &RelayNode> {
        self.nodes.iter().filter(move |node| node.role == role)
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Shared handle to the current directory snapshot.
#[derive(Clone, Default)]
pub struct NodeDirectory {
    current: Arc<RwLock<Arc<DirectorySnapshot>>>,
}

impl NodeDirectory {
    /// New empty `NodeDirectory`.
    pub fn new() -> Self {
        Default::default()
    }

    /// Install a new snapshot built from the given nodes. A node that
    /// appears twice with the same public key keeps its last record.
    pub fn refresh(&self, nodes: Vec<RelayNode>, refreshed_at: u64) -> Arc<DirectorySnapshot> {
        let by_pk = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.pk.clone(), index))
            .collect();
        // written while holding the lock so generations stay monotonic
        let mut current = self.current.write().expect("directory lock poisoned");
        let snapshot = Arc::new(DirectorySnapshot {
            nodes,
            generation: current.generation + 1,
            refreshed_at,
            by_pk,
        });
        *current = snapshot.clone();
        snapshot
    }

    /// Get the current snapshot. Cheap, clones an `Arc`.
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.current.read().expect("directory lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::SecretKey;
    use mixnet_packet::relay_node::OperatorId;
    use rand::thread_rng;

    fn node(addr: &str, role: NodeRole) -> RelayNode {
        RelayNode::new(
            addr.parse().unwrap(),
            SecretKey::generate(&mut thread_rng()).public_key(),
            OperatorId([1; 32]),
            role,
            25_000,
        )
    }

    #[test]
    fn empty_directory() {
        let directory = NodeDirectory::new();
        let snapshot = directory.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation, 0);
    }

    #[test]
    fn refresh_replaces_snapshot() {
        let directory = NodeDirectory::new();
        directory.refresh(vec![node("1.2.3.4:33445", NodeRole::Entry)], 1700000000);
        let old_snapshot = directory.snapshot();
        directory.refresh(
            vec![
                node("1.2.3.4:33445", NodeRole::Entry),
                node("5.6.7.8:33445", NodeRole::Exit),
            ],
            1700000600,
        );
        let new_snapshot = directory.snapshot();

        // the old snapshot is untouched by the refresh
        assert_eq!(old_snapshot.len(), 1);
        assert_eq!(old_snapshot.generation, 1);
        assert_eq!(new_snapshot.len(), 2);
        assert_eq!(new_snapshot.generation, 2);
    }

    #[test]
    fn lookup_by_pk_and_role() {
        let directory = NodeDirectory::new();
        let entry = node("1.2.3.4:33445", NodeRole::Entry);
        let exit = node("5.6.7.8:33445", NodeRole::Exit);
        directory.refresh(vec![entry.clone(), exit.clone()], 1700000000);
        let snapshot = directory.snapshot();

        assert_eq!(snapshot.get(&entry.pk), Some(&entry));
        assert_eq!(snapshot.with_role(NodeRole::Exit).count(), 1);
        assert_eq!(snapshot.with_role(NodeRole::Middle).count(), 0);
    }
}
