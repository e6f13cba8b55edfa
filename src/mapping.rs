//! Fused loop-tree mapping
//!
//! The mapping is a tree stored in an arena. Loops (`For`, `ParFor`) and
//! storage nodes have exactly one child, branch nodes (`Pipeline`,
//! `Sequential`) have one child per fused branch, and every leaf is a
//! `Compute` node. A path is the node sequence from the root to one leaf.

use crate::workload::{DataSpaceId, DimensionId, EinsumId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A loop over one problem dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loop {
    pub dim: DimensionId,
    /// Size of the tile one iteration covers, when statically known
    pub tile_size: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Storage {
    pub buffer: BufferId,
    pub dspace: DataSpaceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compute {
    pub einsum: EinsumId,
}

/// Node kinds of a fused mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingNode {
    /// Temporal loop
    For(Loop),
    /// Spatial loop
    ParFor(Loop),
    /// Buffer instantiation for one data space
    Storage(Storage),
    /// Leaf that runs one einsum
    Compute(Compute),
    /// Branches whose iterations are interleaved at this level
    Pipeline,
    /// Branches that run one after the other
    Sequential,
}

impl MappingNode {
    pub fn as_loop(&self) -> Option<&Loop> {
        match self {
            MappingNode::For(l) | MappingNode::ParFor(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_loop(&self) -> bool {
        self.as_loop().is_some()
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, MappingNode::Pipeline | MappingNode::Sequential)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping has no root")]
    NoRoot,

    #[error("mapping root is already set")]
    RootAlreadySet,

    #[error("unknown mapping node {0}")]
    UnknownNode(NodeId),

    #[error("{0} is not a compute node")]
    NotCompute(NodeId),

    #[error("compute node {0} cannot have children")]
    ChildOfCompute(NodeId),

    #[error("{0} is a leaf but not a compute node")]
    DanglingNode(NodeId),

    #[error("{0} has several children but is not a branch node")]
    MultipleChildren(NodeId),
}

/// Arena of mapping nodes plus buffer-name interning
#[derive(Debug, Clone, Default)]
pub struct FusedMapping {
    nodes: Vec<MappingNode>,
    children: Vec<Vec<NodeId>>,
    root: Option<NodeId>,
    buffer_names: Vec<String>,
    buffer_ids: BTreeMap<String, BufferId>,
}

impl FusedMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a buffer name
    pub fn buffer(&mut self, name: &str) -> BufferId {
        if let Some(&id) = self.buffer_ids.get(name) {
            return id;
        }
        let id = BufferId(self.buffer_names.len());
        self.buffer_names.push(name.to_string());
        self.buffer_ids.insert(name.to_string(), id);
        id
    }

    pub fn buffer_name(&self, id: BufferId) -> Option<&str> {
        self.buffer_names.get(id.0).map(String::as_str)
    }

    fn push(&mut self, node: MappingNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.children.push(Vec::new());
        id
    }

    pub fn set_root(&mut self, node: MappingNode) -> Result<NodeId, MappingError> {
        if self.root.is_some() {
            return Err(MappingError::RootAlreadySet);
        }
        let id = self.push(node);
        self.root = Some(id);
        Ok(id)
    }

    pub fn add_child(&mut self, parent: NodeId, node: MappingNode) -> Result<NodeId, MappingError> {
        if let MappingNode::Compute(_) = self.node_at(parent)? {
            return Err(MappingError::ChildOfCompute(parent));
        }
        let id = self.push(node);
        self.children[parent.0].push(id);
        Ok(id)
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node_at(&self, id: NodeId) -> Result<&MappingNode, MappingError> {
        self.nodes.get(id.0).ok_or(MappingError::UnknownNode(id))
    }

    pub fn compute_at(&self, id: NodeId) -> Result<&Compute, MappingError> {
        match self.node_at(id)? {
            MappingNode::Compute(c) => Ok(c),
            _ => Err(MappingError::NotCompute(id)),
        }
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], MappingError> {
        self.children
            .get(id.0)
            .map(Vec::as_slice)
            .ok_or(MappingError::UnknownNode(id))
    }

    /// Root-to-leaf paths in depth-first order
    ///
    /// # Errors
    /// Fails on a missing root, a leaf that is not a `Compute` node, or a
    /// non-branch node with more than one child.
    pub fn paths(&self) -> Result<Vec<Vec<NodeId>>, MappingError> {
        let root = self.root.ok_or(MappingError::NoRoot)?;
        let mut paths = Vec::new();
        let mut stack = vec![vec![root]];
        while let Some(path) = stack.pop() {
            let Some(&last) = path.last() else { continue };
            let node = self.node_at(last)?;
            let children = self.children(last)?;
            match (node, children.len()) {
                (MappingNode::Compute(_), 0) => paths.push(path),
                (MappingNode::Compute(_), _) => return Err(MappingError::ChildOfCompute(last)),
                (_, 0) => return Err(MappingError::DanglingNode(last)),
                (node, n) if n > 1 && !node.is_branch() => {
                    return Err(MappingError::MultipleChildren(last))
                }
                _ => {
                    for &child in children.iter().rev() {
                        let mut next = path.clone();
                        next.push(child);
                        stack.push(next);
                    }
                }
            }
        }
        Ok(paths)
    }

    /// Compute leaves in path order
    pub fn leaves(&self) -> Result<Vec<NodeId>, MappingError> {
        Ok(self
            .paths()?
            .iter()
            .filter_map(|path| path.last().copied())
            .collect())
    }
}
