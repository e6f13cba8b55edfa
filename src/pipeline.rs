//! End-to-end model: mapping in, counts out
//!
//! [`LooptreeModel`] owns a workload and a fused mapping and runs the whole
//! lowering:
//!
//! ```text
//! mapping -> branch tilings -> loop bound inference -> buffer skews
//!         -> occupancies -> reuse analysis -> counts
//! ```
//!
//! # Stages
//!
//! ## Stage 1: Lowering
//! - **Input**: workload + mapping
//! - **Output**: [`MappingAnalysisResult`] with per-buffer and per-leaf occupancies
//!
//! ## Stage 2: Reuse
//! - **Input**: per-buffer occupancies
//! - **Output**: fill, parent-read and link-transfer relations (any [`ReuseAnalyzer`])
//!
//! ## Stage 3: Counting
//! - **Input**: every relation above
//! - **Output**: [`ModelResult`], one piecewise count per einsum or buffer
//!
//! # Usage
//!
//! ```no_run
//! use looptree::parse::load_config;
//! use looptree::pipeline::LooptreeModel;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("conv_chain.toml"))?;
//! let model = LooptreeModel::from_config(&config)?;
//! let result = model.run()?;
//! println!("{}", result.render(&model));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::analysis::{occupancies_from_mapping, AnalysisError, MappingAnalysisResult};
use crate::buffers::{SpaceTime, TaggedRelation};
use crate::count::PwCount;
use crate::inference::InferenceOptions;
use crate::mapping::{BufferId, FusedMapping, NodeId};
use crate::parse::{ModelConfig, ParseError};
use crate::relation::RelationError;
use crate::relation_ops::dim_projector;
use crate::reuse::{ReuseAnalysisOptions, ReuseAnalyzer, SlidingWindowReuse};
use crate::workload::{DataSpaceId, EinsumId, FusedWorkload};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ModelError {
    /// Configuration could not be turned into a workload and mapping
    Config(ParseError),

    /// Lowering or reuse analysis failed
    Analysis(AnalysisError),

    /// A relation could not be counted
    Counting { what: String, source: RelationError },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Config(err) => write!(f, "Invalid configuration: {}", err),
            ModelError::Analysis(err) => write!(f, "Analysis failed: {}", err),
            ModelError::Counting { what, source } => write!(f, "Counting {} failed: {}", what, source),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Config(err) => Some(err),
            ModelError::Analysis(err) => Some(err),
            ModelError::Counting { source, .. } => Some(source),
        }
    }
}

impl From<ParseError> for ModelError {
    fn from(err: ParseError) -> Self {
        ModelError::Config(err)
    }
}

impl From<AnalysisError> for ModelError {
    fn from(err: AnalysisError) -> Self {
        ModelError::Analysis(err)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Model options
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Log every count at info level instead of debug
    pub verbose: bool,

    /// Loop bound inference settings
    pub inference: InferenceOptions,

    /// Link transfer settings for the default reuse analysis
    pub reuse: ReuseAnalysisOptions,
}

// ============================================================================
// Results
// ============================================================================

/// A piecewise count over tagged space-time coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedCount {
    pub dim_tags: Vec<SpaceTime>,
    /// Printed piecewise count, e.g. `{ [i0] -> 8 : 0 <= i0 <= 1 }`
    pub expression: String,
    /// Sum over all points; `None` when some coordinate is unbounded
    pub total: Option<u64>,
}

impl TaggedCount {
    fn new(dim_tags: Vec<SpaceTime>, count: &PwCount) -> Self {
        TaggedCount {
            dim_tags,
            expression: count.to_string(),
            total: count.total(),
        }
    }
}

impl fmt::Display for TaggedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<String> = self.dim_tags.iter().map(|t| t.to_string()).collect();
        write!(f, "[{}] {}", tags.join(", "), self.expression)?;
        if let Some(total) = self.total {
            write!(f, " (total {})", total)?;
        }
        Ok(())
    }
}

/// Buffer, data space held in it and the einsum whose leaf sees it
pub type BufferKey = (BufferId, DataSpaceId, EinsumId);

/// Counts produced by [`LooptreeModel::run`]
#[derive(Debug, Clone, Default)]
pub struct ModelResult {
    /// Operations per space-time point, per einsum
    pub ops: BTreeMap<EinsumId, TaggedCount>,
    /// Elements entering each buffer per space-time point
    pub fills: BTreeMap<BufferKey, TaggedCount>,
    /// Part of the fills read from the parent level
    pub fills_by_parent: BTreeMap<BufferKey, TaggedCount>,
    /// Part of the fills forwarded by a peer instance
    pub fills_by_peer: BTreeMap<BufferKey, TaggedCount>,
    /// Elements resident per space-time point
    pub occupancy: BTreeMap<BufferKey, TaggedCount>,
    /// Indicator of the temporal iterations of each einsum
    pub temporal_steps: BTreeMap<EinsumId, TaggedCount>,
    /// Leaves whose loop bounds inference could not bound; their counts have no total
    pub unresolved: Vec<NodeId>,
}

impl ModelResult {
    fn buffer_label(model: &LooptreeModel, key: &BufferKey) -> String {
        let (buffer, dspace, einsum) = *key;
        format!(
            "{}/{}/{}",
            model.mapping.buffer_name(buffer).unwrap_or("?"),
            model.workload.data_space_name(dspace).unwrap_or("?"),
            model.workload.einsum_name(einsum).unwrap_or("?"),
        )
    }

    fn einsum_label(model: &LooptreeModel, einsum: EinsumId) -> String {
        model.workload.einsum_name(einsum).unwrap_or("?").to_string()
    }

    fn leaf_label(model: &LooptreeModel, leaf: NodeId) -> String {
        match model.mapping.compute_at(leaf) {
            Ok(compute) => format!("{} ({})", leaf, ModelResult::einsum_label(model, compute.einsum)),
            Err(_) => leaf.to_string(),
        }
    }

    /// JSON object keyed by names instead of ids
    pub fn to_json(&self, model: &LooptreeModel) -> serde_json::Value {
        let by_einsum = |map: &BTreeMap<EinsumId, TaggedCount>| {
            map.iter()
                .map(|(e, c)| (ModelResult::einsum_label(model, *e), json!(c)))
                .collect::<serde_json::Map<_, _>>()
        };
        let by_buffer = |map: &BTreeMap<BufferKey, TaggedCount>| {
            map.iter()
                .map(|(k, c)| (ModelResult::buffer_label(model, k), json!(c)))
                .collect::<serde_json::Map<_, _>>()
        };
        json!({
            "ops": by_einsum(&self.ops),
            "fills": by_buffer(&self.fills),
            "fills_by_parent": by_buffer(&self.fills_by_parent),
            "fills_by_peer": by_buffer(&self.fills_by_peer),
            "occupancy": by_buffer(&self.occupancy),
            "temporal_steps": by_einsum(&self.temporal_steps),
            "unresolved": self
                .unresolved
                .iter()
                .map(|leaf| ModelResult::leaf_label(model, *leaf))
                .collect::<Vec<_>>(),
        })
    }

    /// Plain-text report, one section per quantity
    pub fn render(&self, model: &LooptreeModel) -> String {
        let mut out = String::from("ops:\n");
        for (einsum, count) in &self.ops {
            out.push_str(&format!("  {}: {}\n", ModelResult::einsum_label(model, *einsum), count));
        }
        out.push_str("temporal steps:\n");
        for (einsum, count) in &self.temporal_steps {
            out.push_str(&format!("  {}: {}\n", ModelResult::einsum_label(model, *einsum), count));
        }
        let sections = [
            ("occupancy", &self.occupancy),
            ("fills", &self.fills),
            ("fills by parent", &self.fills_by_parent),
            ("fills by peer", &self.fills_by_peer),
        ];
        for (title, map) in sections {
            out.push_str(&format!("{}:\n", title));
            for (key, count) in map {
                out.push_str(&format!("  {}: {}\n", ModelResult::buffer_label(model, key), count));
            }
        }
        if !self.unresolved.is_empty() {
            out.push_str("unresolved leaves:\n");
            for leaf in &self.unresolved {
                out.push_str(&format!("  {}\n", ModelResult::leaf_label(model, *leaf)));
            }
        }
        out
    }
}

// ============================================================================
// Model
// ============================================================================

pub struct LooptreeModel {
    workload: FusedWorkload,
    mapping: FusedMapping,
    options: ModelOptions,
}

struct BufferCounts {
    key: BufferKey,
    occupancy: TaggedCount,
    fill: TaggedCount,
    parent: TaggedCount,
    peer: TaggedCount,
}

fn count(what: impl FnOnce() -> String, tagged: &TaggedRelation) -> Result<TaggedCount, ModelError> {
    let pw = tagged.relation.card().map_err(|source| ModelError::Counting {
        what: what(),
        source,
    })?;
    Ok(TaggedCount::new(tagged.dim_in_tags.clone(), &pw))
}

impl LooptreeModel {
    pub fn new(workload: FusedWorkload, mapping: FusedMapping) -> Self {
        LooptreeModel::with_options(workload, mapping, ModelOptions::default())
    }

    pub fn with_options(workload: FusedWorkload, mapping: FusedMapping, options: ModelOptions) -> Self {
        LooptreeModel {
            workload,
            mapping,
            options,
        }
    }

    /// Builds workload, mapping and options from a loaded configuration
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let workload = config.build_workload()?;
        let mapping = config.build_mapping(&workload)?;
        Ok(LooptreeModel::with_options(workload, mapping, config.model_options()))
    }

    pub fn workload(&self) -> &FusedWorkload {
        &self.workload
    }

    pub fn mapping(&self) -> &FusedMapping {
        &self.mapping
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Stage 1 only: tilings, inference and occupancies
    pub fn analyze(&self) -> Result<MappingAnalysisResult, ModelError> {
        let result = occupancies_from_mapping(&self.mapping, &self.workload, &self.options.inference)?;
        info!(
            "Lowered {} buffers and {} leaves ({} inference rounds, {} updates)",
            result.lbuf_to_occupancy.len(),
            result.lcomp_to_occupancy.len(),
            result.inference.rounds,
            result.inference.updates
        );
        Ok(result)
    }

    /// Full run with [`SlidingWindowReuse`]
    pub fn run(&self) -> Result<ModelResult, ModelError> {
        self.run_with(&SlidingWindowReuse)
    }

    /// Full run with a caller-supplied reuse analysis
    pub fn run_with<R: ReuseAnalyzer + ?Sized>(&self, reuse: &R) -> Result<ModelResult, ModelError> {
        let analysis = self.analyze()?;
        let reuse_output = reuse.analyze(&analysis.lbuf_to_occupancy, &self.options.reuse)?;

        let buffer_counts: Vec<BufferCounts> = reuse_output
            .buf_to_stats
            .par_iter()
            .map(|(buf, stats)| -> Result<BufferCounts, ModelError> {
                let einsum = self
                    .mapping
                    .compute_at(buf.branch_leaf_id)
                    .map_err(AnalysisError::from)?
                    .einsum;
                let label = format!("{:?}", buf);
                let peer = TaggedRelation {
                    relation: stats
                        .link_transfer
                        .relation
                        .intersect_domain(&stats.fill.relation.domain())
                        .map_err(|source| ModelError::Counting {
                            what: format!("peer fills of {}", label),
                            source,
                        })?,
                    dim_in_tags: stats.link_transfer.dim_in_tags.clone(),
                };
                Ok(BufferCounts {
                    key: (buf.buffer_id, buf.dspace_id, einsum),
                    occupancy: count(|| format!("occupancy of {}", label), &stats.effective_occupancy)?,
                    fill: count(|| format!("fills of {}", label), &stats.fill)?,
                    parent: count(|| format!("parent reads of {}", label), &stats.parent_reads)?,
                    peer: count(|| format!("peer fills of {}", label), &peer)?,
                })
            })
            .collect::<Result<_, _>>()?;

        let mut result = ModelResult {
            unresolved: analysis.inference.unresolved.clone(),
            ..ModelResult::default()
        };
        for leaf in &result.unresolved {
            warn!(
                "counts at leaf {} are unbounded: loop bounds inference left it unresolved",
                ModelResult::leaf_label(self, *leaf)
            );
        }
        for counts in buffer_counts {
            let key = counts.key;
            if result.occupancy.contains_key(&key) {
                warn!(
                    "{} is reached from more than one leaf; keeping the last",
                    ModelResult::buffer_label(self, &key)
                );
            }
            self.log_count("occupancy", &ModelResult::buffer_label(self, &key), &counts.occupancy);
            result.occupancy.insert(key, counts.occupancy);
            result.fills.insert(key, counts.fill);
            result.fills_by_parent.insert(key, counts.parent);
            result.fills_by_peer.insert(key, counts.peer);
        }

        for (lcomp, occupancy) in &analysis.lcomp_to_occupancy {
            let einsum = self
                .mapping
                .compute_at(lcomp.branch_leaf_id)
                .map_err(AnalysisError::from)?
                .einsum;
            let name = ModelResult::einsum_label(self, einsum);
            if result.ops.contains_key(&einsum) {
                warn!("einsum {} is computed at more than one leaf; keeping the last", name);
            }

            let ops = count(|| format!("ops of {}", name), occupancy)?;
            self.log_count("ops", &name, &ops);
            result.ops.insert(einsum, ops);

            let steps = self.temporal_steps(occupancy).map_err(|source| ModelError::Counting {
                what: format!("temporal steps of {}", name),
                source,
            })?;
            result.temporal_steps.insert(einsum, steps);
        }

        Ok(result)
    }

    /// Drops the spatial coordinates and marks every remaining iteration with 1
    fn temporal_steps(&self, occupancy: &TaggedRelation) -> Result<TaggedCount, RelationError> {
        let spatial: Vec<bool> = occupancy
            .dim_in_tags
            .iter()
            .map(|&t| t == SpaceTime::Spatial)
            .collect();
        let temporal_tags: Vec<SpaceTime> = occupancy
            .dim_in_tags
            .iter()
            .copied()
            .filter(|&t| t == SpaceTime::Temporal)
            .collect();
        let steps = dim_projector(&spatial)?.apply_range(&occupancy.relation)?.domain();
        Ok(TaggedCount::new(temporal_tags, &steps.indicator()?))
    }

    fn log_count(&self, what: &str, name: &str, count: &TaggedCount) {
        if self.options.verbose {
            info!("{} {}: {}", what, name, count);
        } else {
            debug!("{} {}: {}", what, name, count);
        }
    }
}
