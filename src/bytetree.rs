//! Byte-keyed radix memstore
//!
//! A Patricia tree over serialized dimension-tuple keys. Each leaf holds
//! one sequence per table field (same order as the schema). Iterators
//! consume nodes through a logical-removal protocol: walking or removing
//! under a context token marks the node removed *for that context only*,
//! so several passes with distinct tokens can drain the same tree copy
//! independently. Context 0 is the sentinel "no removal": walks under it
//! always see every node and never mark anything.

use crate::bytemap::ByteMap;
use crate::expr::Params;
use crate::sequence::Sequence;
use crate::table::Field;
use crate::types::Timestamp;
use std::collections::VecDeque;

/// A radix tree over byte keys with per-key sequence vectors
#[derive(Debug, Default)]
pub struct Tree {
    root: Node,
    bytes: usize,
    length: usize,
}

#[derive(Debug, Default)]
struct Node {
    key: Vec<u8>,
    data: Option<Vec<Sequence>>,
    edges: Vec<Edge>,
    removed_for: Vec<i64>,
}

#[derive(Debug)]
struct Edge {
    label: Vec<u8>,
    target: Box<Node>,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn was_removed(removed_for: &[i64], ctx: i64) -> bool {
    ctx != 0 && removed_for.contains(&ctx)
}

impl Node {
    fn remove_for(&mut self, ctx: i64) {
        if ctx != 0 {
            self.removed_for.push(ctx);
        }
    }

    /// Update every field's sequence at this node, growing the data vector
    /// to the schema length first. Returns the signed byte-size delta.
    fn update_data(
        &mut self,
        fields: &[Field],
        resolution: i64,
        truncate_before: Timestamp,
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> isize {
        let data = self.data.get_or_insert_with(Vec::new);
        if data.len() < fields.len() {
            data.resize_with(fields.len(), Sequence::new);
        }
        let mut delta = 0isize;
        for (i, field) in fields.iter().enumerate() {
            let current = std::mem::take(&mut data[i]);
            let previous = current.len();
            let updated = current.update(
                ts,
                params,
                metadata,
                field.expr(),
                resolution,
                truncate_before,
            );
            delta += updated.len() as isize - previous as isize;
            data[i] = updated;
        }
        delta
    }
}

impl Tree {
    /// Construct an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimate of the number of bytes stored in this tree
    pub fn bytes(&self) -> usize {
        self.bytes * 2
    }

    /// Number of keys in this tree
    pub fn length(&self) -> usize {
        self.length
    }

    /// Update all fields under `key` at the given timestamp. Returns the
    /// signed byte-size delta of the tree estimate.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        fields: &[Field],
        resolution: i64,
        truncate_before: Timestamp,
        key: &[u8],
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> isize {
        let (delta, new_node) = Self::update_node(
            &mut self.root,
            fields,
            resolution,
            truncate_before,
            key,
            key,
            ts,
            params,
            metadata,
        );
        self.bytes = (self.bytes as isize + delta).max(0) as usize;
        if new_node {
            self.length += 1;
        }
        delta
    }

    #[allow(clippy::too_many_arguments)]
    fn update_node(
        node: &mut Node,
        fields: &[Field],
        resolution: i64,
        truncate_before: Timestamp,
        full_key: &[u8],
        key: &[u8],
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> (isize, bool) {
        let mut matched = None;
        for (i, edge) in node.edges.iter().enumerate() {
            let common = common_prefix(&edge.label, key);
            if common > 0 {
                matched = Some((i, common));
                break;
            }
        }

        match matched {
            Some((i, common)) => {
                let edge = &mut node.edges[i];
                if common == edge.label.len() && common == key.len() {
                    // exact match: update in place
                    let delta = edge.target.update_data(
                        fields,
                        resolution,
                        truncate_before,
                        ts,
                        params,
                        metadata,
                    );
                    (delta, false)
                } else if common == edge.label.len() {
                    // label exhausted: descend with the key remainder
                    Self::update_node(
                        &mut edge.target,
                        fields,
                        resolution,
                        truncate_before,
                        full_key,
                        &key[common..],
                        ts,
                        params,
                        metadata,
                    )
                } else {
                    // common substring: split the edge on it
                    let delta = Self::split_edge(
                        edge,
                        common,
                        fields,
                        resolution,
                        truncate_before,
                        full_key,
                        key,
                        ts,
                        params,
                        metadata,
                    );
                    (delta, true)
                }
            }
            None => {
                // no shared prefix anywhere: append a new edge
                let mut target = Node {
                    key: full_key.to_vec(),
                    ..Default::default()
                };
                let delta =
                    target.update_data(fields, resolution, truncate_before, ts, params, metadata);
                node.edges.push(Edge {
                    label: key.to_vec(),
                    target: Box::new(target),
                });
                (delta + key.len() as isize, true)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_edge(
        edge: &mut Edge,
        split_on: usize,
        fields: &[Field],
        resolution: i64,
        truncate_before: Timestamp,
        full_key: &[u8],
        key: &[u8],
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
    ) -> isize {
        let old_target = std::mem::replace(&mut edge.target, Box::new(Node::default()));
        let mut fork = Node::default();
        fork.edges.push(Edge {
            label: edge.label[split_on..].to_vec(),
            target: old_target,
        });

        let delta = if split_on == key.len() {
            // the key ends exactly at the fork: the fork is the leaf
            fork.key = full_key.to_vec();
            fork.update_data(fields, resolution, truncate_before, ts, params, metadata)
        } else {
            let mut leaf = Node {
                key: full_key.to_vec(),
                ..Default::default()
            };
            let delta =
                leaf.update_data(fields, resolution, truncate_before, ts, params, metadata);
            fork.edges.push(Edge {
                label: key[split_on..].to_vec(),
                target: Box::new(leaf),
            });
            delta
        };

        edge.label.truncate(split_on);
        edge.target = Box::new(fork);
        delta + (key.len() - split_on) as isize
    }

    /// Walk the tree breadth-first, calling `f` with each data node's key
    /// and sequences. Returning `false` from `f` removes the node as seen
    /// under `ctx`; subsequent walks and removes under the same ctx skip
    /// it, while other contexts still see it.
    pub fn walk<F>(&mut self, ctx: i64, f: &mut F)
    where
        F: FnMut(&[u8], &[Sequence]) -> bool,
    {
        let mut queue: VecDeque<&mut Node> = VecDeque::new();
        queue.push_back(&mut self.root);
        while let Some(node) = queue.pop_front() {
            let consumed = match &node.data {
                Some(data) if !was_removed(&node.removed_for, ctx) => !f(&node.key, data),
                _ => false,
            };
            if consumed {
                node.remove_for(ctx);
            }
            for edge in node.edges.iter_mut() {
                queue.push_back(&mut edge.target);
            }
        }
    }

    /// Mark `full_key` removed under `ctx` and return its sequences, or
    /// `None` if absent or already removed under this ctx
    pub fn remove(&mut self, ctx: i64, full_key: &[u8]) -> Option<Vec<Sequence>> {
        let mut node = &mut self.root;
        let mut key = full_key;
        loop {
            let n = node;
            let mut exact = None;
            let mut descend = None;
            for (i, edge) in n.edges.iter().enumerate() {
                let common = common_prefix(&edge.label, key);
                if common == edge.label.len() {
                    if common == key.len() {
                        exact = Some(i);
                    } else {
                        descend = Some((i, common));
                    }
                    break;
                }
            }
            if let Some(i) = exact {
                let target = &mut n.edges[i].target;
                if was_removed(&target.removed_for, ctx) {
                    return None;
                }
                target.remove_for(ctx);
                return target.data.clone();
            }
            match descend {
                Some((i, common)) => {
                    key = &key[common..];
                    node = &mut n.edges[i].target;
                }
                None => return None,
            }
        }
    }

    /// Structural copy. Sequence data is cloned; removal marks are not
    /// carried over, so every context sees the whole copy.
    pub fn copy(&self) -> Tree {
        Tree {
            root: Self::copy_node(&self.root),
            bytes: self.bytes,
            length: self.length,
        }
    }

    fn copy_node(node: &Node) -> Node {
        Node {
            key: node.key.clone(),
            data: node.data.clone(),
            edges: node
                .edges
                .iter()
                .map(|edge| Edge {
                    label: edge.label.clone(),
                    target: Box::new(Self::copy_node(&edge.target)),
                })
                .collect(),
            removed_for: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{field, sum};
    use std::collections::BTreeMap;

    const RES: i64 = 60_000_000_000;
    const TS: Timestamp = 1_430_892_489_000_000_010;

    fn fields() -> Vec<Field> {
        vec![Field::new("total", sum(field("v"))).unwrap()]
    }

    fn insert(tree: &mut Tree, fields: &[Field], key: &[u8], v: f64) -> isize {
        let mut params = BTreeMap::new();
        params.insert("v".to_string(), v);
        tree.update(fields, RES, 0, key, TS, &params, None)
    }

    fn collect(tree: &mut Tree, ctx: i64, consume: bool) -> BTreeMap<Vec<u8>, f64> {
        let fields = fields();
        let mut seen = BTreeMap::new();
        tree.walk(ctx, &mut |key, data| {
            let (v, _) = data[0].value_at(0, fields[0].expr());
            seen.insert(key.to_vec(), v);
            !consume
        });
        seen
    }

    #[test]
    fn test_update_and_walk() {
        let mut tree = Tree::new();
        let fields = fields();
        insert(&mut tree, &fields, b"cat", 1.0);
        insert(&mut tree, &fields, b"car", 2.0);
        insert(&mut tree, &fields, b"cargo", 3.0);
        insert(&mut tree, &fields, b"dog", 4.0);
        insert(&mut tree, &fields, b"cat", 10.0);

        assert_eq!(tree.length(), 4);
        let seen = collect(&mut tree, 0, false);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[&b"cat".to_vec()], 11.0);
        assert_eq!(seen[&b"car".to_vec()], 2.0);
        assert_eq!(seen[&b"cargo".to_vec()], 3.0);
        assert_eq!(seen[&b"dog".to_vec()], 4.0);
    }

    #[test]
    fn test_split_makes_fork_a_leaf() {
        let mut tree = Tree::new();
        let fields = fields();
        insert(&mut tree, &fields, b"abcd", 1.0);
        insert(&mut tree, &fields, b"abxy", 2.0);
        insert(&mut tree, &fields, b"ab", 3.0);

        assert_eq!(tree.length(), 3);
        let seen = collect(&mut tree, 0, false);
        assert_eq!(seen[&b"ab".to_vec()], 3.0);
        assert_eq!(seen[&b"abcd".to_vec()], 1.0);
        assert_eq!(seen[&b"abxy".to_vec()], 2.0);
    }

    #[test]
    fn test_walk_consumes_per_ctx() {
        let mut tree = Tree::new();
        let fields = fields();
        insert(&mut tree, &fields, b"a", 1.0);
        insert(&mut tree, &fields, b"b", 2.0);

        assert_eq!(collect(&mut tree, 1, true).len(), 2);
        assert!(collect(&mut tree, 1, false).is_empty());
        // a different ctx still sees everything, and ctx 0 never consumes
        assert_eq!(collect(&mut tree, 2, false).len(), 2);
        assert_eq!(collect(&mut tree, 0, true).len(), 2);
        assert_eq!(collect(&mut tree, 0, false).len(), 2);
    }

    #[test]
    fn test_remove() {
        let mut tree = Tree::new();
        let fields = fields();
        insert(&mut tree, &fields, b"key1", 5.0);
        insert(&mut tree, &fields, b"key2", 6.0);

        let data = tree.remove(7, b"key1").unwrap();
        assert_eq!(data[0].value_at(0, fields[0].expr()).0, 5.0);
        assert!(tree.remove(7, b"key1").is_none());
        assert!(tree.remove(7, b"missing").is_none());

        let seen = collect(&mut tree, 7, false);
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key(&b"key2".to_vec()));
        // untouched under another ctx
        assert_eq!(collect(&mut tree, 8, false).len(), 2);
    }

    #[test]
    fn test_copy_is_independent() {
        let mut tree = Tree::new();
        let fields = fields();
        insert(&mut tree, &fields, b"k", 1.0);

        let mut copy = tree.copy();
        insert(&mut tree, &fields, b"k", 10.0);
        insert(&mut tree, &fields, b"other", 1.0);

        assert_eq!(copy.length(), 1);
        let seen = collect(&mut copy, 0, false);
        assert_eq!(seen[&b"k".to_vec()], 1.0);
        // removal marks do not survive a copy
        tree.remove(3, b"k");
        assert_eq!(collect(&mut tree.copy(), 3, false).len(), 2);
    }

    #[test]
    fn test_bytes_accounting() {
        let mut tree = Tree::new();
        let fields = fields();
        assert_eq!(tree.bytes(), 0);
        let added = insert(&mut tree, &fields, b"some-key", 1.0);
        assert!(added > 0);
        assert!(tree.bytes() > 0);
    }
}
