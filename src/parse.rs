//! Model configuration files
//!
//! A configuration holds the run options, named integer variables, the
//! problem (data spaces and einsums) and the fused mapping tree. It is read
//! from JSON or TOML depending on the file extension:
//!
//! ```toml
//! [model]
//! max_hops = 1
//!
//! [variables]
//! N = 8
//!
//! [[problem.data_spaces]]
//! name = "A"
//! dims = ["a0"]
//!
//! [[problem.einsums]]
//! name = "Copy"
//! dims = ["i"]
//! extents = ["N"]
//! writes = [{ data_space = "A", projection = ["i"] }]
//!
//! [mapping]
//! type = "for"
//! dim = "i"
//! tile_size = 1
//! child = { type = "compute", einsum = "Copy" }
//! ```

use crate::inference::InferenceOptions;
use crate::mapping::{Compute, FusedMapping, Loop, MappingError, MappingNode, NodeId, Storage};
use crate::pipeline::ModelOptions;
use crate::relation::Set;
use crate::reuse::ReuseAnalysisOptions;
use crate::workload::{FusedWorkload, WorkloadError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Extension is neither `.json` nor `.toml`
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    /// A mapping node names an einsum, data space or dimension that does not exist
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),
}

/// Integer literal or the name of an entry in `variables`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum IntOrVar {
    Int(i64),
    Var(String),
}

fn default_max_hops() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSection {
    #[serde(default)]
    pub verbose: bool,
    /// Prefix of the JSON stats file the CLI writes
    #[serde(default)]
    pub out_prefix: Option<String>,
    #[serde(default)]
    pub max_inference_rounds: Option<usize>,
    #[serde(default)]
    pub count_hops: bool,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        ModelSection {
            verbose: false,
            out_prefix: None,
            max_inference_rounds: None,
            count_hops: false,
            max_hops: default_max_hops(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataSpaceConfig {
    pub name: String,
    pub dims: Vec<String>,
    /// Explicit extents; derived from the accessing einsums when absent
    #[serde(default)]
    pub extents: Option<Vec<IntOrVar>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessConfig {
    pub data_space: String,
    /// One affine expression per data-space dimension, e.g. `"p + r"`
    pub projection: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EinsumConfig {
    pub name: String,
    pub dims: Vec<String>,
    pub extents: Vec<IntOrVar>,
    #[serde(default)]
    pub reads: Vec<AccessConfig>,
    #[serde(default)]
    pub writes: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProblemSection {
    #[serde(default)]
    pub data_spaces: Vec<DataSpaceConfig>,
    #[serde(default)]
    pub einsums: Vec<EinsumConfig>,
}

/// Mapping tree as written in a configuration
///
/// A `storage` node lists every data space the buffer holds at that point;
/// it expands into one storage node per data space.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MappingNodeConfig {
    For {
        dim: String,
        #[serde(default)]
        tile_size: Option<IntOrVar>,
        child: Box<MappingNodeConfig>,
    },
    ParFor {
        dim: String,
        #[serde(default)]
        tile_size: Option<IntOrVar>,
        child: Box<MappingNodeConfig>,
    },
    Storage {
        buffer: String,
        data_spaces: Vec<String>,
        child: Box<MappingNodeConfig>,
    },
    Compute {
        einsum: String,
    },
    Pipeline {
        branches: Vec<MappingNodeConfig>,
    },
    Sequential {
        branches: Vec<MappingNodeConfig>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub variables: BTreeMap<String, i64>,
    pub problem: ProblemSection,
    pub mapping: MappingNodeConfig,
}

/// Loads a configuration, choosing the format from the file extension
pub fn load_config(path: &Path) -> Result<ModelConfig, ParseError> {
    let text = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    debug!("Loading {} configuration from {}", ext, path.display());
    match ext.as_str() {
        "json" => parse_json(&text),
        "toml" => parse_toml(&text),
        other => Err(ParseError::UnsupportedFormat(other.to_string())),
    }
}

pub fn parse_json(text: &str) -> Result<ModelConfig, ParseError> {
    Ok(serde_json::from_str(text)?)
}

pub fn parse_toml(text: &str) -> Result<ModelConfig, ParseError> {
    Ok(toml::from_str(text)?)
}

impl ModelConfig {
    pub fn resolve(&self, value: &IntOrVar) -> Result<i64, ParseError> {
        match value {
            IntOrVar::Int(v) => Ok(*v),
            IntOrVar::Var(name) => self
                .variables
                .get(name)
                .copied()
                .ok_or_else(|| ParseError::UnknownVariable(name.clone())),
        }
    }

    pub fn model_options(&self) -> ModelOptions {
        ModelOptions {
            verbose: self.model.verbose,
            inference: InferenceOptions {
                max_rounds: self.model.max_inference_rounds,
            },
            reuse: ReuseAnalysisOptions {
                count_hops: self.model.count_hops,
                max_hops: self.model.max_hops,
            },
        }
    }

    pub fn build_workload(&self) -> Result<FusedWorkload, ParseError> {
        let mut workload = FusedWorkload::new();

        for entry in &self.problem.data_spaces {
            let dims: Vec<&str> = entry.dims.iter().map(String::as_str).collect();
            let id = workload.add_data_space(&entry.name, &dims)?;
            if let Some(extents) = &entry.extents {
                let bounds = extents
                    .iter()
                    .map(|e| self.resolve(e).map(|v| (0, v)))
                    .collect::<Result<Vec<_>, _>>()?;
                workload.set_data_space_bound(id, Set::from_box(&bounds))?;
            }
        }

        for entry in &self.problem.einsums {
            let dims: Vec<&str> = entry.dims.iter().map(String::as_str).collect();
            let extents = entry
                .extents
                .iter()
                .map(|e| self.resolve(e))
                .collect::<Result<Vec<_>, _>>()?;
            let einsum = workload.add_einsum(&entry.name, &dims, &extents)?;

            for (accesses, is_write) in [(&entry.reads, false), (&entry.writes, true)] {
                for access in accesses {
                    let dspace = *workload
                        .data_space_name_to_id()
                        .get(&access.data_space)
                        .ok_or_else(|| ParseError::UnknownName {
                            kind: "data space",
                            name: access.data_space.clone(),
                        })?;
                    let projection: Vec<&str> = access.projection.iter().map(String::as_str).collect();
                    if is_write {
                        workload.add_write(einsum, dspace, &projection)?;
                    } else {
                        workload.add_read(einsum, dspace, &projection)?;
                    }
                }
            }
        }

        Ok(workload)
    }

    pub fn build_mapping(&self, workload: &FusedWorkload) -> Result<FusedMapping, ParseError> {
        let mut mapping = FusedMapping::new();
        self.add_node(&mut mapping, workload, None, &self.mapping)?;
        Ok(mapping)
    }

    fn attach(mapping: &mut FusedMapping, parent: Option<NodeId>, node: MappingNode) -> Result<NodeId, ParseError> {
        Ok(match parent {
            Some(p) => mapping.add_child(p, node)?,
            None => mapping.set_root(node)?,
        })
    }

    fn add_node(
        &self,
        mapping: &mut FusedMapping,
        workload: &FusedWorkload,
        parent: Option<NodeId>,
        node: &MappingNodeConfig,
    ) -> Result<(), ParseError> {
        match node {
            MappingNodeConfig::For { dim, tile_size, child } | MappingNodeConfig::ParFor { dim, tile_size, child } => {
                let dim_id = workload.dimension_id(dim).ok_or_else(|| ParseError::UnknownName {
                    kind: "dimension",
                    name: dim.clone(),
                })?;
                let tile_size = tile_size.as_ref().map(|t| self.resolve(t)).transpose()?;
                if let Some(t) = tile_size {
                    if t <= 0 {
                        return Err(ParseError::Invalid(format!("tile size {} of loop over {}", t, dim)));
                    }
                }
                let l = Loop { dim: dim_id, tile_size };
                let node = if matches!(node, MappingNodeConfig::For { .. }) {
                    MappingNode::For(l)
                } else {
                    MappingNode::ParFor(l)
                };
                let id = ModelConfig::attach(mapping, parent, node)?;
                self.add_node(mapping, workload, Some(id), child)
            }
            MappingNodeConfig::Storage {
                buffer,
                data_spaces,
                child,
            } => {
                if data_spaces.is_empty() {
                    return Err(ParseError::Invalid(format!("storage node for {} holds no data space", buffer)));
                }
                let buffer_id = mapping.buffer(buffer);
                let mut last = parent;
                for name in data_spaces {
                    let dspace = *workload
                        .data_space_name_to_id()
                        .get(name)
                        .ok_or_else(|| ParseError::UnknownName {
                            kind: "data space",
                            name: name.clone(),
                        })?;
                    let node = MappingNode::Storage(Storage {
                        buffer: buffer_id,
                        dspace,
                    });
                    last = Some(ModelConfig::attach(mapping, last, node)?);
                }
                self.add_node(mapping, workload, last, child)
            }
            MappingNodeConfig::Compute { einsum } => {
                let einsum = *workload
                    .einsum_name_to_id()
                    .get(einsum)
                    .ok_or_else(|| ParseError::UnknownName {
                        kind: "einsum",
                        name: einsum.clone(),
                    })?;
                ModelConfig::attach(mapping, parent, MappingNode::Compute(Compute { einsum }))?;
                Ok(())
            }
            MappingNodeConfig::Pipeline { branches } | MappingNodeConfig::Sequential { branches } => {
                if branches.is_empty() {
                    return Err(ParseError::Invalid("branch node without branches".to_string()));
                }
                let node = if matches!(node, MappingNodeConfig::Pipeline { .. }) {
                    MappingNode::Pipeline
                } else {
                    MappingNode::Sequential
                };
                let id = ModelConfig::attach(mapping, parent, node)?;
                for branch in branches {
                    self.add_node(mapping, workload, Some(id), branch)?;
                }
                Ok(())
            }
        }
    }
}
