// crates/vnns-core/src/merkle.rs
//
// Binary Merkle inclusion paths for aggregated statements.
//
// Leaves are Keccak-256 of the statement hash; inner nodes are
// Keccak-256(left || right). When a level has an odd number of nodes the last
// one is promoted unchanged, so a path carries no sibling for that level.

use serde::{Deserialize, Serialize};

use crate::crypto::{keccak_bytes, Hash32};

/// Proof that a statement is a member of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerklePath {
    /// Aggregate root published on-chain.
    pub root: Hash32,
    /// Sibling hashes from leaf level upwards.
    pub proof: Vec<Hash32>,
    pub number_of_leaves: u64,
    pub leaf_index: u64,
    /// The statement this path proves.
    pub leaf: Hash32,
}

impl MerklePath {
    /// Recompute the root from the leaf and siblings.
    pub fn verify(&self) -> bool {
        if self.number_of_leaves == 0 || self.leaf_index >= self.number_of_leaves {
            return false;
        }

        let mut node = leaf_node(&self.leaf);
        let mut position = self.leaf_index;
        let mut width = self.number_of_leaves;
        let mut siblings = self.proof.iter();

        while width > 1 {
            let promoted = position == width - 1 && width % 2 == 1;
            if !promoted {
                let sibling = match siblings.next() {
                    Some(s) => s,
                    None => return false,
                };
                node = if position % 2 == 0 {
                    inner_node(&node, sibling)
                } else {
                    inner_node(sibling, &node)
                };
            }
            position /= 2;
            width = width.div_ceil(2);
        }

        siblings.next().is_none() && node == self.root
    }
}

/// A full tree over a list of statements.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaves: Vec<Hash32>,
    levels: Vec<Vec<Hash32>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<Hash32>) -> Self {
        let mut levels = Vec::new();
        let mut current: Vec<Hash32> = leaves.iter().map(leaf_node).collect();
        while current.len() > 1 {
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => inner_node(left, right),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two nodes"),
                })
                .collect();
            levels.push(current);
            current = next;
        }
        levels.push(current);
        Self { leaves, levels }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn root(&self) -> Hash32 {
        self.levels
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or(Hash32::ZERO)
    }

    pub fn path(&self, leaf_index: usize) -> Option<MerklePath> {
        let leaf = *self.leaves.get(leaf_index)?;
        let mut proof = Vec::new();
        let mut position = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = position ^ 1;
            if let Some(hash) = level.get(sibling) {
                proof.push(*hash);
            }
            position /= 2;
        }
        Some(MerklePath {
            root: self.root(),
            proof,
            number_of_leaves: self.leaves.len() as u64,
            leaf_index: leaf_index as u64,
            leaf,
        })
    }
}

fn leaf_node(leaf: &Hash32) -> Hash32 {
    keccak_bytes(leaf.as_bytes())
}

fn inner_node(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    keccak_bytes(&buf)
}
