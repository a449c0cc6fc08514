//! Pseudo-projection of a conditional pattern base.

use crate::{
    mining::tree::{NodeRef, UpTree},
    Utility,
};

/// One path of a conditional pattern base: the base-item node on the
/// path, the residual utility credited to the path and the number of
/// transactions routed through it.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionEntry {
    pub node: NodeRef,
    pub path_utility: Utility,
    pub count: u64,
}

/// A conditional pattern base represented as a view over the master
/// UP-Tree.
///
/// A projection owns no subtree. It is a list of weak node handles with
/// parallel residual utilities; the prefix paths are read out of the
/// master tree on demand. Once the referenced tree region is released
/// the handles stop resolving and the projection (cached or not) is
/// dead.
#[derive(Debug, Clone, Default)]
pub struct PathProjection {
    pub entries: Vec<ProjectionEntry>,
    /// Sum of the residual path utilities: an upper bound on the utility
    /// of the suffix itemset extended with anything from this base.
    pub total_utility: Utility,
    /// Sum of the per-path transaction counts.
    pub support: u64,
}

impl PathProjection {
    /// Builds the top-level projection of a suffix item from its header
    /// chain. The residual utility of each path is the node utility of
    /// the chain node.
    pub fn from_header(tree: &UpTree, chain: &[NodeRef]) -> Self {
        let mut projection = Self::default();
        for &node_ref in chain {
            if let Some(node) = tree.node(node_ref) {
                projection.push(ProjectionEntry {
                    node: node_ref,
                    path_utility: node.node_utility(),
                    count: node.count(),
                });
            }
        }
        projection
    }

    pub fn push(&mut self, entry: ProjectionEntry) {
        self.total_utility += entry.path_utility;
        self.support += entry.count;
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every node handle still resolves against the master tree.
    pub fn is_valid(&self, tree: &UpTree) -> bool {
        self.entries.iter().all(|e| tree.node(e.node).is_some())
    }

    /// Narrows this projection to the paths that reach `item`, keeping
    /// the reached node as the new base and inheriting the residual
    /// utilities.
    pub fn narrow(&self, tree: &UpTree, item: crate::ItemId) -> Self {
        let mut narrowed = Self::default();
        for entry in &self.entries {
            let reached = tree
                .prefix_path(entry.node)
                .into_iter()
                .find(|&(label, _)| label == item);
            if let Some((_, node)) = reached {
                narrowed.push(ProjectionEntry {
                    node,
                    path_utility: entry.path_utility,
                    count: entry.count,
                });
            }
        }
        narrowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::tree::UpTree;

    fn sample_tree() -> UpTree {
        let mut tree = UpTree::new();
        tree.insert_transaction(&[(2, 10.0), (3, 3.0), (1, 6.0)]);
        tree.insert_transaction(&[(3, 2.0), (1, 3.0)]);
        tree.insert_transaction(&[(2, 20.0), (3, 4.0)]);
        tree
    }

    #[test]
    fn test_from_header_sums_bounds() {
        let tree = sample_tree();
        let projection = PathProjection::from_header(&tree, tree.header(1));
        assert_eq!(projection.entries.len(), 2);
        // A's nodes carry 19 (B C A path) and 5 (C A path).
        assert_eq!(projection.total_utility, 24.0);
        assert_eq!(projection.support, 2);
    }

    #[test]
    fn test_narrow_keeps_reaching_paths_and_inherits_utilities() {
        let tree = sample_tree();
        let projection = PathProjection::from_header(&tree, tree.header(1));
        let narrowed = projection.narrow(&tree, 2);
        // Only the B C A path reaches B.
        assert_eq!(narrowed.entries.len(), 1);
        assert_eq!(narrowed.entries[0].path_utility, 19.0);
        assert_eq!(narrowed.support, 1);
        let b2 = projection.narrow(&tree, 3);
        assert_eq!(b2.entries.len(), 2);
        assert_eq!(b2.total_utility, 24.0);
    }

    #[test]
    fn test_projection_dies_with_its_region() {
        let mut tree = sample_tree();
        let projection = PathProjection::from_header(&tree, tree.header(1));
        assert!(projection.is_valid(&tree));
        tree.retire_item(1);
        assert!(!projection.is_valid(&tree));
    }
}
