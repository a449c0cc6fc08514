//! The UP-Tree: a prefix tree over reorganized transactions.
//!
//! Nodes live in an arena and are addressed through [`NodeRef`] handles
//! that carry a generation counter. A handle is *weak*: once the node it
//! points at has been retired the generation no longer matches and any
//! dereference returns `None`. Pseudo-projections hold these handles, so
//! releasing a region of the tree implicitly invalidates every projection
//! (and cached projection) that still points into it.

use std::collections::HashMap;

use crate::{ItemId, Utility};

/// A weak handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    index: u32,
    generation: u32,
}

/// A node of the UP-Tree.
#[derive(Debug, Clone)]
pub struct UpNode {
    item: ItemId,
    count: u64,
    node_utility: Utility,
    /// `None` when the node hangs off the root.
    parent: Option<u32>,
    children: Vec<(ItemId, u32)>,
}

impl UpNode {
    pub fn item(&self) -> ItemId {
        self.item
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// The accumulated residual path utility of this node. An upper bound
    /// on the utility of any itemset ending at this node.
    pub fn node_utility(&self) -> Utility {
        self.node_utility
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<UpNode>,
}

/// The master UP-Tree.
///
/// Invariants:
/// - the children of any node are unique in their item label;
/// - a node's utility is the sum of residual path utilities inserted
///   through it (DGN reorganization happens at insertion);
/// - the header chain of item `i` reaches every live node labeled `i`,
///   in insertion order.
#[derive(Debug, Default)]
pub struct UpTree {
    slots: Vec<Slot>,
    root_children: Vec<(ItemId, u32)>,
    headers: HashMap<ItemId, Vec<NodeRef>>,
}

impl UpTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.node.is_none())
    }

    /// Inserts a reorganized transaction.
    ///
    /// `path` must already be filtered down to promising items and sorted
    /// in the global TWU order; each element carries the item's internal
    /// utility in the source transaction. The utility recorded at the
    /// node of position `k` is the residual path utility after dropping
    /// the items further along the path (DGN): the running prefix sum of
    /// the internal utilities up to and including `k`.
    pub fn insert_transaction(&mut self, path: &[(ItemId, Utility)]) {
        let mut residual = 0.0;
        let mut parent: Option<u32> = None;
        for &(item, utility) in path {
            residual += utility;
            let index = self.child_of(parent, item);
            let index = match index {
                Some(index) => {
                    let node = self.slots[index as usize]
                        .node
                        .as_mut()
                        .expect("child index points at a live node");
                    node.count += 1;
                    node.node_utility += residual;
                    index
                }
                None => self.attach(parent, item, residual),
            };
            parent = Some(index);
        }
    }

    /// The header chain of `item`: every live node with that label, in
    /// insertion order.
    pub fn header(&self, item: ItemId) -> &[NodeRef] {
        self.headers.get(&item).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dereferences a weak handle. Returns `None` once the node has been
    /// retired.
    pub fn node(&self, node_ref: NodeRef) -> Option<&UpNode> {
        let slot = self.slots.get(node_ref.index as usize)?;
        if slot.generation != node_ref.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// The parent handle of a node, or `None` at the root (or for a dead
    /// handle).
    pub fn parent(&self, node_ref: NodeRef) -> Option<NodeRef> {
        let parent = self.node(node_ref)?.parent?;
        Some(NodeRef {
            index: parent,
            generation: self.slots[parent as usize].generation,
        })
    }

    /// Walks from `node_ref` to the root, yielding the item labels of the
    /// strict ancestors (the prefix path, root-exclusive and
    /// `node_ref`-exclusive), nearest ancestor first.
    pub fn prefix_path(&self, node_ref: NodeRef) -> Vec<(ItemId, NodeRef)> {
        let mut path = Vec::new();
        let mut current = self.parent(node_ref);
        while let Some(ancestor) = current {
            let node = match self.node(ancestor) {
                Some(node) => node,
                None => break,
            };
            path.push((node.item(), ancestor));
            current = self.parent(ancestor);
        }
        path
    }

    /// Retires every node labeled `item`, bumping the slot generations so
    /// outstanding handles (and cached projections built from them) die.
    ///
    /// Mining processes items in reverse TWU order, so by the time an
    /// item is retired all its tree children have been retired already;
    /// each retired node is a leaf.
    pub fn retire_item(&mut self, item: ItemId) {
        let chain = match self.headers.remove(&item) {
            Some(chain) => chain,
            None => return,
        };
        for node_ref in chain {
            let slot = &mut self.slots[node_ref.index as usize];
            if slot.generation != node_ref.generation {
                continue;
            }
            let node = match slot.node.take() {
                Some(node) => node,
                None => continue,
            };
            slot.generation = slot.generation.wrapping_add(1);
            match node.parent {
                Some(parent) => {
                    let parent = self.slots[parent as usize]
                        .node
                        .as_mut()
                        .expect("parent outlives its children");
                    parent.children.retain(|&(_, child)| child != node_ref.index);
                }
                None => self.root_children.retain(|&(_, child)| child != node_ref.index),
            }
        }
    }

    fn child_of(&self, parent: Option<u32>, item: ItemId) -> Option<u32> {
        let children = match parent {
            Some(parent) => {
                &self.slots[parent as usize]
                    .node
                    .as_ref()
                    .expect("parent index points at a live node")
                    .children
            }
            None => &self.root_children,
        };
        children
            .iter()
            .find(|&&(label, _)| label == item)
            .map(|&(_, index)| index)
    }

    fn attach(&mut self, parent: Option<u32>, item: ItemId, residual: Utility) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(UpNode {
                item,
                count: 1,
                node_utility: residual,
                parent,
                children: Vec::new(),
            }),
        });
        match parent {
            Some(parent) => self.slots[parent as usize]
                .node
                .as_mut()
                .expect("parent index points at a live node")
                .children
                .push((item, index)),
            None => self.root_children.push((item, index)),
        }
        self.headers
            .entry(item)
            .or_insert_with(Vec::new)
            .push(NodeRef {
                index,
                generation: 0,
            });
        index
    }
}
