//! Fused workload: einsums, data spaces and their affine accesses
//!
//! Every einsum owns an output (iteration) space with one coordinate per
//! einsum dimension, bounded by a box `0 <= d < extent`. Accesses are affine
//! functions from that space to the coordinates of a data space. A data space
//! written by one einsum and read by another is an intermediate tensor; a data
//! space with no writer is a workload input.

use crate::relation::{AffineExpr, Relation, RelationError, Set};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EinsumId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DataSpaceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DimensionId(pub usize);

impl fmt::Display for EinsumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "einsum#{}", self.0)
    }
}

impl fmt::Display for DataSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dspace#{}", self.0)
    }
}

/// Errors raised while building or querying a workload
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("name '{0}' is already defined")]
    DuplicateName(String),

    #[error("unknown einsum '{0}'")]
    UnknownEinsum(String),

    #[error("unknown data space '{0}'")]
    UnknownDataSpace(String),

    #[error("einsum {einsum} has {expected} dimensions but {found} extents were given")]
    ExtentMismatch {
        einsum: String,
        expected: usize,
        found: usize,
    },

    #[error("access from '{einsum}' to '{dspace}' has {found} rows, data space rank is {expected}")]
    RankMismatch {
        einsum: String,
        dspace: String,
        expected: usize,
        found: usize,
    },

    #[error("cannot parse projection '{expr}': {reason}")]
    BadProjection { expr: String, reason: String },

    #[error("data space '{dspace}' already has writer '{writer}'")]
    MultipleWriters { dspace: String, writer: String },

    #[error("einsum '{einsum}' does not access data space '{dspace}'")]
    NotAccessed { einsum: String, dspace: String },

    #[error("relation error: {0}")]
    Relation(#[from] RelationError),
}

/// One affine expression over the einsum dimensions per data-space coordinate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessFunction {
    pub rows: Vec<AffineExpr>,
}

impl AccessFunction {
    /// Coefficient of einsum dimension `einsum_dim` in data-space coordinate `row`
    pub fn coefficient(&self, row: usize, einsum_dim: usize) -> i64 {
        self.rows
            .get(row)
            .map_or(0, |expr| expr.coefficient(einsum_dim))
    }
}

#[derive(Debug, Clone)]
struct DataSpace {
    name: String,
    dims: Vec<DimensionId>,
    bound: Option<Set>,
    writer: Option<EinsumId>,
}

#[derive(Debug, Clone)]
struct Einsum {
    name: String,
    dims: Vec<DimensionId>,
    ospace_bound: Set,
    reads: BTreeMap<DataSpaceId, AccessFunction>,
    writes: BTreeMap<DataSpaceId, AccessFunction>,
}

/// Workload description consumed by the mapping analyses
#[derive(Debug, Clone, Default)]
pub struct FusedWorkload {
    dimension_names: Vec<String>,
    dimension_ids: BTreeMap<String, DimensionId>,
    einsums: Vec<Einsum>,
    einsum_ids: BTreeMap<String, EinsumId>,
    data_spaces: Vec<DataSpace>,
    data_space_ids: BTreeMap<String, DataSpaceId>,
}

lazy_static! {
    /// `[sign] [coef [*]] [name]` at the start of the remaining input
    static ref TERM: Regex =
        Regex::new(r"^\s*([+-])?\s*(?:(\d+)\s*\*?\s*)?([A-Za-z_][A-Za-z0-9_]*)?\s*").unwrap();
}

/// Parses an affine projection such as `p + r`, `2*p - 1` over `dims`
pub fn parse_affine(text: &str, dims: &[String]) -> Result<AffineExpr, WorkloadError> {
    let bad = |reason: &str| WorkloadError::BadProjection {
        expr: text.to_string(),
        reason: reason.to_string(),
    };

    let mut expr = AffineExpr::zero(dims.len());
    let mut rest = text.trim();
    let mut first = true;
    if rest.is_empty() {
        return Err(bad("empty expression"));
    }

    while !rest.is_empty() {
        let caps = TERM.captures(rest).ok_or_else(|| bad("unexpected token"))?;
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let sign = caps.get(1).map(|m| m.as_str());
        let coef = caps.get(2).map(|m| m.as_str());
        let name = caps.get(3).map(|m| m.as_str());

        if coef.is_none() && name.is_none() {
            return Err(bad(&format!("unexpected token near '{}'", rest)));
        }
        if !first && sign.is_none() {
            return Err(bad("missing operator between terms"));
        }

        let magnitude: i64 = match coef {
            Some(digits) => digits
                .parse()
                .map_err(|_| bad(&format!("coefficient '{}' out of range", digits)))?,
            None => 1,
        };
        let value = if sign == Some("-") { -magnitude } else { magnitude };

        match name {
            Some(name) => {
                let idx = dims
                    .iter()
                    .position(|d| d == name)
                    .ok_or_else(|| bad(&format!("unknown dimension '{}'", name)))?;
                let current = expr.coefficient(idx);
                expr = expr.set_coefficient(idx, current + value);
            }
            None => {
                let current = expr.constant();
                expr = expr.set_constant(current + value);
            }
        }

        rest = &rest[whole.len()..];
        first = false;
    }
    Ok(expr)
}

impl FusedWorkload {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_dimensions(&mut self, names: &[&str]) -> Result<Vec<DimensionId>, WorkloadError> {
        let unique: BTreeSet<&&str> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(WorkloadError::DuplicateName(names.join(",")));
        }
        if let Some(taken) = names.iter().find(|n| self.dimension_ids.contains_key(**n)) {
            return Err(WorkloadError::DuplicateName(taken.to_string()));
        }
        Ok(names
            .iter()
            .map(|name| {
                let id = DimensionId(self.dimension_names.len());
                self.dimension_names.push(name.to_string());
                self.dimension_ids.insert(name.to_string(), id);
                id
            })
            .collect())
    }

    /// Declares a data space with one named coordinate per entry of `dims`
    pub fn add_data_space(&mut self, name: &str, dims: &[&str]) -> Result<DataSpaceId, WorkloadError> {
        if self.data_space_ids.contains_key(name) {
            return Err(WorkloadError::DuplicateName(name.to_string()));
        }
        let dims = self.register_dimensions(dims)?;
        let id = DataSpaceId(self.data_spaces.len());
        self.data_spaces.push(DataSpace {
            name: name.to_string(),
            dims,
            bound: None,
            writer: None,
        });
        self.data_space_ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Overrides the derived bound of a data space
    pub fn set_data_space_bound(&mut self, dspace: DataSpaceId, bound: Set) -> Result<(), WorkloadError> {
        let space = self.data_space_mut(dspace)?;
        if bound.dim() != space.dims.len() {
            return Err(RelationError::DimensionMismatch {
                op: "set_data_space_bound",
                expected: space.dims.len(),
                found: bound.dim(),
            }
            .into());
        }
        space.bound = Some(bound);
        Ok(())
    }

    /// Declares an einsum whose output space is `0 <= dims[k] < extents[k]`
    pub fn add_einsum(&mut self, name: &str, dims: &[&str], extents: &[i64]) -> Result<EinsumId, WorkloadError> {
        if self.einsum_ids.contains_key(name) {
            return Err(WorkloadError::DuplicateName(name.to_string()));
        }
        if dims.len() != extents.len() {
            return Err(WorkloadError::ExtentMismatch {
                einsum: name.to_string(),
                expected: dims.len(),
                found: extents.len(),
            });
        }
        let dims = self.register_dimensions(dims)?;
        let bounds: Vec<(i64, i64)> = extents.iter().map(|&e| (0, e)).collect();
        let id = EinsumId(self.einsums.len());
        self.einsums.push(Einsum {
            name: name.to_string(),
            dims,
            ospace_bound: Set::from_box(&bounds),
            reads: BTreeMap::new(),
            writes: BTreeMap::new(),
        });
        self.einsum_ids.insert(name.to_string(), id);
        Ok(id)
    }

    fn parse_projection(&self, einsum: EinsumId, projection: &[&str]) -> Result<AccessFunction, WorkloadError> {
        let names: Vec<String> = self
            .einsum(einsum)?
            .dims
            .iter()
            .map(|d| self.dimension_names[d.0].clone())
            .collect();
        let rows = projection
            .iter()
            .map(|text| parse_affine(text, &names))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AccessFunction { rows })
    }

    fn check_rank(&self, einsum: EinsumId, dspace: DataSpaceId, access: &AccessFunction) -> Result<(), WorkloadError> {
        let expected = self.data_space(dspace)?.dims.len();
        if access.rows.len() != expected {
            return Err(WorkloadError::RankMismatch {
                einsum: self.einsum(einsum)?.name.clone(),
                dspace: self.data_space(dspace)?.name.clone(),
                expected,
                found: access.rows.len(),
            });
        }
        Ok(())
    }

    /// Records that `einsum` reads `dspace` at the given per-coordinate projections
    pub fn add_read(&mut self, einsum: EinsumId, dspace: DataSpaceId, projection: &[&str]) -> Result<(), WorkloadError> {
        let access = self.parse_projection(einsum, projection)?;
        self.add_read_function(einsum, dspace, access)
    }

    pub fn add_read_function(&mut self, einsum: EinsumId, dspace: DataSpaceId, access: AccessFunction) -> Result<(), WorkloadError> {
        self.check_rank(einsum, dspace, &access)?;
        debug!("{} reads {}", self.einsum(einsum)?.name, self.data_space(dspace)?.name);
        self.einsum_mut(einsum)?.reads.insert(dspace, access);
        Ok(())
    }

    /// Records that `einsum` writes `dspace`; a data space has at most one writer
    pub fn add_write(&mut self, einsum: EinsumId, dspace: DataSpaceId, projection: &[&str]) -> Result<(), WorkloadError> {
        let access = self.parse_projection(einsum, projection)?;
        self.add_write_function(einsum, dspace, access)
    }

    pub fn add_write_function(&mut self, einsum: EinsumId, dspace: DataSpaceId, access: AccessFunction) -> Result<(), WorkloadError> {
        self.check_rank(einsum, dspace, &access)?;
        if let Some(writer) = self.data_space(dspace)?.writer {
            if writer != einsum {
                return Err(WorkloadError::MultipleWriters {
                    dspace: self.data_space(dspace)?.name.clone(),
                    writer: self.einsum(writer)?.name.clone(),
                });
            }
        }
        debug!("{} writes {}", self.einsum(einsum)?.name, self.data_space(dspace)?.name);
        self.data_space_mut(dspace)?.writer = Some(einsum);
        self.einsum_mut(einsum)?.writes.insert(dspace, access);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    fn einsum(&self, id: EinsumId) -> Result<&Einsum, WorkloadError> {
        self.einsums
            .get(id.0)
            .ok_or_else(|| WorkloadError::UnknownEinsum(id.to_string()))
    }

    fn einsum_mut(&mut self, id: EinsumId) -> Result<&mut Einsum, WorkloadError> {
        self.einsums
            .get_mut(id.0)
            .ok_or_else(|| WorkloadError::UnknownEinsum(id.to_string()))
    }

    fn data_space(&self, id: DataSpaceId) -> Result<&DataSpace, WorkloadError> {
        self.data_spaces
            .get(id.0)
            .ok_or_else(|| WorkloadError::UnknownDataSpace(id.to_string()))
    }

    fn data_space_mut(&mut self, id: DataSpaceId) -> Result<&mut DataSpace, WorkloadError> {
        self.data_spaces
            .get_mut(id.0)
            .ok_or_else(|| WorkloadError::UnknownDataSpace(id.to_string()))
    }

    pub fn einsum_name_to_id(&self) -> &BTreeMap<String, EinsumId> {
        &self.einsum_ids
    }

    pub fn data_space_name_to_id(&self) -> &BTreeMap<String, DataSpaceId> {
        &self.data_space_ids
    }

    pub fn einsums(&self) -> impl Iterator<Item = EinsumId> + '_ {
        (0..self.einsums.len()).map(EinsumId)
    }

    pub fn einsum_name(&self, id: EinsumId) -> Result<&str, WorkloadError> {
        Ok(&self.einsum(id)?.name)
    }

    pub fn data_space_name(&self, id: DataSpaceId) -> Result<&str, WorkloadError> {
        Ok(&self.data_space(id)?.name)
    }

    pub fn dimension_id(&self, name: &str) -> Option<DimensionId> {
        self.dimension_ids.get(name).copied()
    }

    pub fn dimension_name(&self, id: DimensionId) -> Option<&str> {
        self.dimension_names.get(id.0).map(String::as_str)
    }

    pub fn tensors_read_by_einsum(&self, einsum: EinsumId) -> Result<BTreeSet<DataSpaceId>, WorkloadError> {
        Ok(self.einsum(einsum)?.reads.keys().copied().collect())
    }

    pub fn tensors_written_by_einsum(&self, einsum: EinsumId) -> Result<BTreeSet<DataSpaceId>, WorkloadError> {
        Ok(self.einsum(einsum)?.writes.keys().copied().collect())
    }

    fn not_accessed(&self, einsum: EinsumId, dspace: DataSpaceId) -> WorkloadError {
        WorkloadError::NotAccessed {
            einsum: self.einsum_name(einsum).unwrap_or("?").to_string(),
            dspace: self.data_space_name(dspace).unwrap_or("?").to_string(),
        }
    }

    pub fn read_accesses_aff(&self, einsum: EinsumId, dspace: DataSpaceId) -> Result<&AccessFunction, WorkloadError> {
        self.einsum(einsum)?
            .reads
            .get(&dspace)
            .ok_or_else(|| self.not_accessed(einsum, dspace))
    }

    pub fn write_accesses_aff(&self, einsum: EinsumId, dspace: DataSpaceId) -> Result<&AccessFunction, WorkloadError> {
        self.einsum(einsum)?
            .writes
            .get(&dspace)
            .ok_or_else(|| self.not_accessed(einsum, dspace))
    }

    /// Read access relation: einsum output space to data-space coordinates
    pub fn read_accesses(&self, einsum: EinsumId, dspace: DataSpaceId) -> Result<Relation, WorkloadError> {
        let n = self.einsum(einsum)?.dims.len();
        Ok(Relation::from_affine(n, &self.read_accesses_aff(einsum, dspace)?.rows)?)
    }

    /// Write access relation: einsum output space to data-space coordinates
    pub fn write_accesses(&self, einsum: EinsumId, dspace: DataSpaceId) -> Result<Relation, WorkloadError> {
        let n = self.einsum(einsum)?.dims.len();
        Ok(Relation::from_affine(n, &self.write_accesses_aff(einsum, dspace)?.rows)?)
    }

    pub fn einsum_ospace_bound(&self, einsum: EinsumId) -> Result<&Set, WorkloadError> {
        Ok(&self.einsum(einsum)?.ospace_bound)
    }

    /// Bound of a data space
    ///
    /// Uses the explicit bound when one was set. Otherwise the bound is the
    /// union of the images of every accessing einsum's output space.
    ///
    /// # Errors
    /// Returns `WorkloadError::Relation` if an access image does not match the data space.
    pub fn data_space_bound(&self, dspace: DataSpaceId) -> Result<Set, WorkloadError> {
        let space = self.data_space(dspace)?;
        if let Some(bound) = &space.bound {
            return Ok(bound.clone());
        }

        let mut bound: Option<Set> = None;
        for (idx, einsum) in self.einsums.iter().enumerate() {
            let id = EinsumId(idx);
            let accesses = einsum
                .reads
                .contains_key(&dspace)
                .then(|| self.read_accesses(id, dspace))
                .into_iter()
                .chain(einsum.writes.contains_key(&dspace).then(|| self.write_accesses(id, dspace)));
            for access in accesses {
                let image = access?.intersect_domain(&einsum.ospace_bound)?.range();
                bound = Some(match bound {
                    Some(b) => b.union(&image)?,
                    None => image,
                });
            }
        }

        match bound {
            Some(b) => Ok(b.coalesce()?),
            None => Ok(Set::universe(space.dims.len())),
        }
    }

    pub fn writer_einsum(&self, dspace: DataSpaceId) -> Result<Option<EinsumId>, WorkloadError> {
        Ok(self.data_space(dspace)?.writer)
    }

    pub fn einsum_dim_to_idx(&self, einsum: EinsumId) -> Result<BTreeMap<DimensionId, usize>, WorkloadError> {
        Ok(self
            .einsum(einsum)?
            .dims
            .iter()
            .enumerate()
            .map(|(idx, &dim)| (dim, idx))
            .collect())
    }

    pub fn dspace_dim_to_idx(&self, dspace: DataSpaceId) -> Result<BTreeMap<DimensionId, usize>, WorkloadError> {
        Ok(self
            .data_space(dspace)?
            .dims
            .iter()
            .enumerate()
            .map(|(idx, &dim)| (dim, idx))
            .collect())
    }
}
