//! SHA-256 Merkle tree for transaction and UTXO-set commitment.
//!
//! Uses domain-separated hashing to prevent second-preimage attacks:
//! - Leaf hash: `SHA-256(0x00 || data)`
//! - Internal node: `SHA-256(0x01 || left || right)`
//!
//! Odd-length layers are padded by duplicating the last element.
//! Empty trees produce [`Hash256::ZERO`]. Inclusion branches from
//! [`MerkleTree::proof`] let light clients verify membership against a root.

use sha2::{Digest, Sha256};

use crate::types::Hash256;

/// Domain separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for internal node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated internal node hash: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute the Merkle root from a slice of leaf values (typically txids).
///
/// Returns [`Hash256::ZERO`] for an empty slice. Cheaper than building a full
/// [`MerkleTree`] when proofs are not needed.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    current[0]
}

/// Compute the next layer of the tree from the current one.
fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(layer.len().div_ceil(2));
    let mut i = 0;
    while i < layer.len() {
        let left = &layer[i];
        let right = if i + 1 < layer.len() { &layer[i + 1] } else { left };
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

/// One step of an inclusion proof: a sibling hash and its side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofStep {
    /// The sibling hash to combine with.
    pub sibling: Hash256,
    /// Whether the sibling is on the right of the running hash.
    pub sibling_is_right: bool,
}

/// Full Merkle tree supporting root computation and inclusion proofs.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    /// `layers[0]` = leaf hashes, `layers[last]` = `[root]`.
    layers: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a Merkle tree from leaf values.
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        if leaves.is_empty() {
            return Self { layers: Vec::new() };
        }

        let mut layers = vec![leaves.iter().map(leaf_hash).collect::<Vec<_>>()];
        while layers.last().expect("non-empty").len() > 1 {
            let next = next_layer(layers.last().expect("non-empty"));
            layers.push(next);
        }
        Self { layers }
    }

    /// The Merkle root. [`Hash256::ZERO`] for an empty tree.
    pub fn root(&self) -> Hash256 {
        self.layers
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(Hash256::ZERO)
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }

        let mut steps = Vec::new();
        let mut pos = index;
        for layer in &self.layers[..self.layers.len() - 1] {
            let sibling_is_right = pos % 2 == 0;
            let sibling_pos = if sibling_is_right { pos + 1 } else { pos - 1 };
            // Odd layers duplicate the last element.
            let sibling = *layer.get(sibling_pos).unwrap_or(&layer[pos]);
            steps.push(ProofStep { sibling, sibling_is_right });
            pos /= 2;
        }
        Some(steps)
    }
}

/// Verify an inclusion proof for `leaf` against `root`.
pub fn verify_proof(leaf: &Hash256, proof: &[ProofStep], root: &Hash256) -> bool {
    let mut acc = leaf_hash(leaf);
    for step in proof {
        acc = if step.sibling_is_right {
            node_hash(&acc, &step.sibling)
        } else {
            node_hash(&step.sibling, &acc)
        };
    }
    acc == *root
}
