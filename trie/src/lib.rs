//! Authenticated key-value Merkle-Patricia trie.
//!
//! Maps arbitrary byte keys (consumed as nibbles, most-significant half of
//! each byte first) to arbitrary byte values, authenticated by a root hash.
//! Nodes are persisted under `trie_<keccak256(encoding)>` and are never
//! pruned once committed; historical roots stay loadable.

mod nibbles;
mod node;

pub use node::{DecodeError, Node, NodeRef};

use std::sync::Arc;

use kvstore::KvStore;
use primitives::Hash;
use thiserror::Error;

use nibbles::{bytes_to_nibbles, common_prefix_len};

const TRIE_KEY_PREFIX: &str = "trie_";

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("trie node {0:?} missing from the key-value store")]
    MissingNode(Hash),
    #[error("corrupt trie node encoding: {0}")]
    CorruptNode(#[from] DecodeError),
    #[error("key-value store error: {0}")]
    KvError(#[from] kvstore::KvError),
}

/// KV key for a persisted node: `trie_<hex digest>`.
fn trie_storage_key(hash: &Hash) -> Vec<u8> {
    let mut key = TRIE_KEY_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(hex::encode(hash.as_bytes()).as_bytes());
    key
}

/// An authenticated trie rooted at a particular state. Mutations
/// (`update`/`delete`) are in-memory only until `commit` persists them.
#[derive(Clone)]
pub struct Trie {
    root: NodeRef,
    kv: Arc<dyn KvStore>,
}

impl Trie {
    /// Opens a trie at `root_hash`. `Hash::ZERO` yields an empty trie; any
    /// other hash is resolved lazily on first access.
    pub fn open(root_hash: Hash, kv: Arc<dyn KvStore>) -> Trie {
        let root = if root_hash.is_zero() {
            NodeRef::Empty
        } else {
            NodeRef::Hash(root_hash)
        };
        Trie { root, kv }
    }

    /// The trie's current root hash without forcing a commit. Returns
    /// `Hash::ZERO` for an empty trie or one with uncommitted (dirty) writes
    /// whose hash is not yet known.
    pub fn root_hash(&self) -> Hash {
        self.root.known_hash().unwrap_or(Hash::ZERO)
    }

    fn load(&self, hash: Hash) -> Result<Arc<Node>, TrieError> {
        let bytes = self
            .kv
            .get(&trie_storage_key(&hash))?
            .ok_or(TrieError::MissingNode(hash))?;
        Ok(Arc::new(node::decode(&bytes)?))
    }

    fn resolve(&self, node_ref: &NodeRef) -> Result<Arc<Node>, TrieError> {
        match node_ref {
            NodeRef::Empty => unreachable!("caller must not resolve an empty ref"),
            NodeRef::Hash(h) => self.load(*h),
            NodeRef::Clean(_, n) | NodeRef::Dirty(n) => Ok(n.clone()),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        self.get_at(&self.root, &bytes_to_nibbles(key))
    }

    fn get_at(&self, node_ref: &NodeRef, path: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        if node_ref.is_empty() {
            return Ok(None);
        }
        let node = self.resolve(node_ref)?;
        match &*node {
            Node::Leaf { key, value } => {
                if key.as_slice() == path {
                    Ok(Some(value.clone()))
                } else {
                    Ok(None)
                }
            }
            Node::Extension { key, child } => {
                if path.starts_with(key.as_slice()) {
                    self.get_at(child, &path[key.len()..])
                } else {
                    Ok(None)
                }
            }
            Node::Branch { children, value } => {
                if path.is_empty() {
                    Ok(value.clone())
                } else {
                    self.get_at(&children[path[0] as usize], &path[1..])
                }
            }
        }
    }

    /// Inserts or updates `key`. An empty `value` deletes the key.
    pub fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        if value.is_empty() {
            return self.delete(key);
        }
        let nibbles = bytes_to_nibbles(key);
        self.root = self.insert_at(self.root.clone(), &nibbles, value)?;
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let nibbles = bytes_to_nibbles(key);
        self.root = self.delete_at(self.root.clone(), &nibbles)?;
        Ok(())
    }

    fn insert_at(
        &self,
        node_ref: NodeRef,
        path: &[u8],
        value: Vec<u8>,
    ) -> Result<NodeRef, TrieError> {
        if node_ref.is_empty() {
            return Ok(NodeRef::Dirty(Arc::new(Node::Leaf {
                key: path.to_vec(),
                value,
            })));
        }
        let node = self.resolve(&node_ref)?;
        match &*node {
            Node::Leaf {
                key: leaf_key,
                value: leaf_value,
            } => {
                if leaf_key.as_slice() == path {
                    return Ok(NodeRef::Dirty(Arc::new(Node::Leaf {
                        key: path.to_vec(),
                        value,
                    })));
                }
                let common = common_prefix_len(leaf_key, path);
                let mut branch = Node::empty_branch();
                self.place_remainder(&mut branch, leaf_key, common, leaf_value.clone());
                self.place_remainder(&mut branch, path, common, value);
                Ok(self.wrap_with_extension(&path[..common], branch))
            }
            Node::Extension {
                key: ext_key,
                child,
            } => {
                let common = common_prefix_len(ext_key, path);
                if common == ext_key.len() {
                    let new_child = self.insert_at(child.clone(), &path[common..], value)?;
                    return Ok(NodeRef::Dirty(Arc::new(Node::Extension {
                        key: ext_key.clone(),
                        child: new_child,
                    })));
                }
                let mut branch = Node::empty_branch();
                let remaining_ext_key = &ext_key[common + 1..];
                let ext_branch_slot = if remaining_ext_key.is_empty() {
                    child.clone()
                } else {
                    NodeRef::Dirty(Arc::new(Node::Extension {
                        key: remaining_ext_key.to_vec(),
                        child: child.clone(),
                    }))
                };
                branch_set(&mut branch, ext_key[common], ext_branch_slot);
                self.place_remainder(&mut branch, path, common, value);
                Ok(self.wrap_with_extension(&path[..common], branch))
            }
            Node::Branch {
                children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return Ok(NodeRef::Dirty(Arc::new(Node::Branch {
                        children: children.clone(),
                        value: Some(value),
                    })));
                }
                let idx = path[0] as usize;
                let mut new_children = children.clone();
                new_children[idx] = self.insert_at(children[idx].clone(), &path[1..], value)?;
                Ok(NodeRef::Dirty(Arc::new(Node::Branch {
                    children: new_children,
                    value: branch_value.clone(),
                })))
            }
        }
    }

    /// Places a leaf continuing at `path[common..]` into `branch`'s slot
    /// `path[common]`, or sets `branch.value` when `path` ends exactly at
    /// `common` (i.e. the key terminates at this branch).
    fn place_remainder(&self, branch: &mut Node, path: &[u8], common: usize, value: Vec<u8>) {
        if let Node::Branch {
            children: _,
            value: branch_value,
        } = branch
        {
            if common == path.len() {
                *branch_value = Some(value);
                return;
            }
        }
        let idx = path[common];
        let leaf = NodeRef::Dirty(Arc::new(Node::Leaf {
            key: path[common + 1..].to_vec(),
            value,
        }));
        branch_set(branch, idx, leaf);
    }

    fn wrap_with_extension(&self, prefix: &[u8], branch: Node) -> NodeRef {
        let branch_ref = NodeRef::Dirty(Arc::new(branch));
        if prefix.is_empty() {
            branch_ref
        } else {
            NodeRef::Dirty(Arc::new(Node::Extension {
                key: prefix.to_vec(),
                child: branch_ref,
            }))
        }
    }

    fn delete_at(&self, node_ref: NodeRef, path: &[u8]) -> Result<NodeRef, TrieError> {
        if node_ref.is_empty() {
            return Ok(NodeRef::Empty);
        }
        let node = self.resolve(&node_ref)?;
        match &*node {
            Node::Leaf { key, .. } => {
                if key.as_slice() == path {
                    Ok(NodeRef::Empty)
                } else {
                    Ok(node_ref)
                }
            }
            Node::Extension { key, child } => {
                if !path.starts_with(key.as_slice()) {
                    return Ok(node_ref);
                }
                let new_child = self.delete_at(child.clone(), &path[key.len()..])?;
                match new_child {
                    NodeRef::Empty => Ok(NodeRef::Empty),
                    _ => {
                        let resolved_child = self.resolve(&new_child)?;
                        match &*resolved_child {
                            Node::Leaf {
                                key: child_key,
                                value,
                            } => Ok(NodeRef::Dirty(Arc::new(Node::Leaf {
                                key: [key.as_slice(), child_key.as_slice()].concat(),
                                value: value.clone(),
                            }))),
                            Node::Extension {
                                key: child_key,
                                child: grandchild,
                            } => Ok(NodeRef::Dirty(Arc::new(Node::Extension {
                                key: [key.as_slice(), child_key.as_slice()].concat(),
                                child: grandchild.clone(),
                            }))),
                            Node::Branch { .. } => Ok(NodeRef::Dirty(Arc::new(Node::Extension {
                                key: key.clone(),
                                child: new_child,
                            }))),
                        }
                    }
                }
            }
            Node::Branch { children, value } => {
                let (new_children, new_value) = if path.is_empty() {
                    if value.is_none() {
                        return Ok(node_ref);
                    }
                    (children.clone(), None)
                } else {
                    let idx = path[0] as usize;
                    let mut new_children = children.clone();
                    new_children[idx] = self.delete_at(children[idx].clone(), &path[1..])?;
                    (new_children, value.clone())
                };
                self.collapse_branch(new_children, new_value)
            }
        }
    }

    fn collapse_branch(
        &self,
        children: [NodeRef; 16],
        value: Option<Vec<u8>>,
    ) -> Result<NodeRef, TrieError> {
        let remaining: Vec<usize> = (0..16).filter(|&i| !children[i].is_empty()).collect();
        if value.is_none() && remaining.is_empty() {
            return Ok(NodeRef::Empty);
        }
        if value.is_none() && remaining.len() == 1 {
            let idx = remaining[0];
            let child = self.resolve(&children[idx])?;
            return Ok(match &*child {
                Node::Leaf {
                    key: child_key,
                    value: leaf_value,
                } => NodeRef::Dirty(Arc::new(Node::Leaf {
                    key: [&[idx as u8][..], child_key.as_slice()].concat(),
                    value: leaf_value.clone(),
                })),
                Node::Extension {
                    key: child_key,
                    child: grandchild,
                } => NodeRef::Dirty(Arc::new(Node::Extension {
                    key: [&[idx as u8][..], child_key.as_slice()].concat(),
                    child: grandchild.clone(),
                })),
                Node::Branch { .. } => NodeRef::Dirty(Arc::new(Node::Extension {
                    key: vec![idx as u8],
                    child: children[idx].clone(),
                })),
            });
        }
        Ok(NodeRef::Dirty(Arc::new(Node::Branch { children, value })))
    }

    /// Recursively serializes dirty nodes and persists them under their
    /// content hash, returning the new root hash. Clean subtrees are
    /// skipped entirely (their hash is already known).
    pub fn commit(&mut self) -> Result<Hash, TrieError> {
        let mut writes = Vec::new();
        let new_root = self.commit_node(self.root.clone(), &mut writes)?;
        self.root = new_root;
        if !writes.is_empty() {
            let mut batch = kvstore::Batch::new();
            for (hash, bytes) in writes {
                batch.put(trie_storage_key(&hash), bytes);
            }
            self.kv.batch_write(batch)?;
        }
        Ok(self.root_hash())
    }

    fn commit_node(
        &self,
        node_ref: NodeRef,
        writes: &mut Vec<(Hash, Vec<u8>)>,
    ) -> Result<NodeRef, TrieError> {
        match node_ref {
            NodeRef::Empty | NodeRef::Hash(_) | NodeRef::Clean(_, _) => Ok(node_ref),
            NodeRef::Dirty(node) => {
                let committed = match &*node {
                    Node::Leaf { .. } => (*node).clone(),
                    Node::Extension { key, child } => Node::Extension {
                        key: key.clone(),
                        child: self.commit_node(child.clone(), writes)?,
                    },
                    Node::Branch { children, value } => {
                        let mut new_children: [NodeRef; 16] =
                            std::array::from_fn(|_| NodeRef::Empty);
                        for i in 0..16 {
                            new_children[i] = self.commit_node(children[i].clone(), writes)?;
                        }
                        Node::Branch {
                            children: new_children,
                            value: value.clone(),
                        }
                    }
                };
                let encoded = node::encode(&committed);
                let hash = node::hash_of_encoding(&encoded);
                writes.push((hash, encoded));
                Ok(NodeRef::Clean(hash, Arc::new(committed)))
            }
        }
    }

    /// Structurally shares unchanged subtrees with the returned copy;
    /// mutations against either trie never affect the other's view.
    pub fn snapshot(&self) -> Trie {
        Trie {
            root: self.root.clone(),
            kv: self.kv.clone(),
        }
    }
}

fn branch_set(branch: &mut Node, idx: u8, value: NodeRef) {
    if let Node::Branch { children, .. } = branch {
        children[idx as usize] = value;
    }
}
