//! Trie node variants and their canonical RLP encoding.
//!
//! Every node is persisted under `trie_<keccak256(encoding)>`; children are
//! always referenced by hash (no small-node inlining), matching the data
//! model's "persisted keyed by its Keccak-256 digest" contract.

use primitives::{keccak256, Hash};
use rlp::{Rlp, RlpStream};
use std::sync::Arc;

use crate::nibbles::{hex_prefix_decode, hex_prefix_encode, Nibbles};

/// A reference to a child node: either not yet loaded from the store, an
/// unmodified node already known in memory, or a freshly built node that
/// has not been assigned a hash yet.
#[derive(Clone)]
pub enum NodeRef {
    Empty,
    Hash(Hash),
    Clean(Hash, Arc<Node>),
    Dirty(Arc<Node>),
}

impl NodeRef {
    pub fn is_empty(&self) -> bool {
        matches!(self, NodeRef::Empty)
    }

    /// The node's hash, if already known without needing a commit.
    pub fn known_hash(&self) -> Option<Hash> {
        match self {
            NodeRef::Hash(h) | NodeRef::Clean(h, _) => Some(*h),
            NodeRef::Empty | NodeRef::Dirty(_) => None,
        }
    }
}

#[derive(Clone)]
pub enum Node {
    Leaf {
        key: Nibbles,
        value: Vec<u8>,
    },
    Extension {
        key: Nibbles,
        child: NodeRef,
    },
    Branch {
        children: [NodeRef; 16],
        value: Option<Vec<u8>>,
    },
}

impl Node {
    pub fn empty_branch() -> Node {
        Node::Branch {
            children: std::array::from_fn(|_| NodeRef::Empty),
            value: None,
        }
    }
}

fn push_child_hash(stream: &mut RlpStream, child: &NodeRef) {
    match child.known_hash() {
        Some(h) => {
            stream.append(&h.as_bytes().as_slice());
        }
        None => {
            // Dirty children must be committed (hashed) before their parent
            // is encoded; reaching this means a bug in the commit order.
            stream.append(&Hash::ZERO.as_bytes().as_slice());
        }
    }
}

/// Encodes a node into its canonical byte representation. Tag byte first
/// (0 = leaf, 1 = extension, 2 = branch) so decoding is unambiguous.
pub fn encode(node: &Node) -> Vec<u8> {
    let mut stream = RlpStream::new();
    match node {
        Node::Leaf { key, value } => {
            stream.begin_list(3);
            stream.append(&0u8);
            stream.append(&hex_prefix_encode(key, true));
            stream.append(value);
        }
        Node::Extension { key, child } => {
            stream.begin_list(3);
            stream.append(&1u8);
            stream.append(&hex_prefix_encode(key, false));
            push_child_hash(&mut stream, child);
        }
        Node::Branch { children, value } => {
            stream.begin_list(18);
            stream.append(&2u8);
            for child in children {
                push_child_hash(&mut stream, child);
            }
            match value {
                Some(v) => {
                    stream.append(v);
                }
                None => {
                    stream.append_empty_data();
                }
            }
        }
    }
    stream.out().to_vec()
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("corrupt trie node encoding")]
    Corrupt,
}

/// Decodes a node from its canonical bytes. Children decode as `NodeRef::Hash`
/// (or `Empty` for the all-zero marker); the caller resolves them lazily.
pub fn decode(bytes: &[u8]) -> Result<Node, DecodeError> {
    let rlp = Rlp::new(bytes);
    if !rlp.is_list() {
        return Err(DecodeError::Corrupt);
    }
    let tag: u8 = rlp.val_at(0).map_err(|_| DecodeError::Corrupt)?;
    match tag {
        0 => {
            let encoded_key: Vec<u8> = rlp.val_at(1).map_err(|_| DecodeError::Corrupt)?;
            let value: Vec<u8> = rlp.val_at(2).map_err(|_| DecodeError::Corrupt)?;
            let (key, is_leaf) = hex_prefix_decode(&encoded_key);
            if !is_leaf {
                return Err(DecodeError::Corrupt);
            }
            Ok(Node::Leaf { key, value })
        }
        1 => {
            let encoded_key: Vec<u8> = rlp.val_at(1).map_err(|_| DecodeError::Corrupt)?;
            let child_bytes: Vec<u8> = rlp.val_at(2).map_err(|_| DecodeError::Corrupt)?;
            let (key, is_leaf) = hex_prefix_decode(&encoded_key);
            if is_leaf {
                return Err(DecodeError::Corrupt);
            }
            let child = decode_child_ref(&child_bytes)?;
            Ok(Node::Extension { key, child })
        }
        2 => {
            if rlp.item_count().map_err(|_| DecodeError::Corrupt)? != 18 {
                return Err(DecodeError::Corrupt);
            }
            let mut children: [NodeRef; 16] = std::array::from_fn(|_| NodeRef::Empty);
            for i in 0..16 {
                let child_bytes: Vec<u8> = rlp.val_at(i + 1).map_err(|_| DecodeError::Corrupt)?;
                children[i] = decode_child_ref(&child_bytes)?;
            }
            let value_bytes: Vec<u8> = rlp.val_at(17).map_err(|_| DecodeError::Corrupt)?;
            let value = if value_bytes.is_empty() {
                None
            } else {
                Some(value_bytes)
            };
            Ok(Node::Branch { children, value })
        }
        _ => Err(DecodeError::Corrupt),
    }
}

fn decode_child_ref(bytes: &[u8]) -> Result<NodeRef, DecodeError> {
    if bytes.is_empty() {
        return Ok(NodeRef::Empty);
    }
    if bytes.len() != 32 {
        return Err(DecodeError::Corrupt);
    }
    let hash = Hash::from_slice(bytes);
    if hash.is_zero() {
        Ok(NodeRef::Empty)
    } else {
        Ok(NodeRef::Hash(hash))
    }
}

pub fn hash_of_encoding(bytes: &[u8]) -> Hash {
    keccak256(bytes)
}
