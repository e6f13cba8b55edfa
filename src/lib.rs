//! LoopTree: affine lowering of fused loop-tree mappings
//!
//! This library turns a fused mapping of several einsums onto a buffer
//! hierarchy into integer relations and counts what the mapping costs:
//! 1. Build one tiling per compute leaf from the loops above it
//! 2. Tighten producer tilings from what consumers read (loop bound inference)
//! 3. Derive logical buffers, their space-time skews and occupancies
//! 4. Run a reuse analysis and count ops, fills and occupancy
//!
//! # Core Flow
//! ```text
//! config → workload + mapping → tilings → inference → occupancies → reuse → counts
//!                                   ↓                       ↓
//!                            per-leaf tiling          per-buffer skew
//! ```
//!
//! # Module Organization
//!
//! ## Relation Engine
//! - [`relation`]: Integer relations and sets backed by ISL
//! - [`count`]: Piecewise counts produced by cardinality
//! - [`relation_ops`]: Shifts, projections and dimension helpers
//!
//! ## Problem Description
//! - [`workload`]: Data spaces, einsums and affine accesses
//! - [`mapping`]: The fused mapping tree
//! - [`parse`]: JSON/TOML configuration files
//!
//! ## Lowering
//! - [`tiling`]: Per-branch tilings
//! - [`inference`]: Loop bound inference across fused einsums
//! - [`buffers`]: Logical buffers and skews
//! - [`analysis`]: Occupancy composition
//!
//! ## Results
//! - [`reuse`]: Fill, parent-read and link-transfer analysis
//! - [`pipeline`]: End-to-end model and result aggregation

// ============================================================================
// Relation Engine
// ============================================================================

pub mod count;
pub mod relation;
pub mod relation_ops;

// ============================================================================
// Problem Description
// ============================================================================

pub mod mapping;
pub mod parse;
pub mod workload;

// ============================================================================
// Lowering
// ============================================================================

pub mod analysis;
pub mod buffers;
pub mod inference;
pub mod tiling;

// ============================================================================
// Results
// ============================================================================

pub mod pipeline;
pub mod reuse;

pub use analysis::{occupancies_from_mapping, AnalysisError, LogicalComputeUnit, MappingAnalysisResult};
pub use buffers::{LogicalBuffer, SpaceTime, TaggedRelation};
pub use count::PwCount;
pub use inference::{InferenceOptions, InferenceReport};
pub use mapping::{BufferId, FusedMapping, MappingNode, NodeId};
pub use parse::{load_config, ModelConfig, ParseError};
pub use pipeline::{LooptreeModel, ModelError, ModelOptions, ModelResult, TaggedCount};
pub use relation::{Relation, RelationError, Set};
pub use reuse::{ReuseAnalysisOptions, ReuseAnalyzer, SlidingWindowReuse};
pub use workload::{DataSpaceId, EinsumId, FusedWorkload};
