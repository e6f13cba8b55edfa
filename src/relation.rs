//! Integer relations backed by ISL
//!
//! A [`Relation`] maps `n_in` integer coordinates to `n_out` integer
//! coordinates; a [`Set`] is a union of integer polyhedra over `dim()`
//! coordinates. Both hold their dimensions and ISL's textual form of the
//! underlying `isl_map` / `isl_set`. Every operation reads its operands into
//! the calling thread's [`Context`], runs the ISL operation and prints the
//! result back, so ISL objects never leave the thread that created them and
//! relations stay `Send + Sync` for the parallel stages of the analysis.
//!
//! Constructors build the ISL text from affine constraints laid out over the
//! columns
//!
//! ```text
//! [ input (n_in) | output (n_out) ]
//! ```
//!
//! Counting goes through `isl_map_card` for the piecewise closed form and
//! `isl_set_count_val` for totals.

use crate::count::PwCount;
use isl_rs::{Context, Map, Set as IslSet};
use std::fmt;
use thiserror::Error;

thread_local! {
    static ISL_CONTEXT: Context = Context::alloc();
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by relation construction and evaluation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelationError {
    /// Operand spaces do not line up
    #[error("dimension mismatch in {op}: expected {expected}, found {found}")]
    DimensionMismatch {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    /// A coordinate index outside the space was requested
    #[error("coordinate {index} is out of range for a {dims}-dimensional space")]
    IndexOutOfRange { index: usize, dims: usize },

    /// A finite count was requested for an unbounded set
    #[error("cannot count the points of unbounded set {0}")]
    Unbounded(String),
}

pub type RelationResult<T> = Result<T, RelationError>;

fn check_dims(op: &'static str, expected: usize, found: usize) -> RelationResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(RelationError::DimensionMismatch {
            op,
            expected,
            found,
        })
    }
}

// ============================================================================
// Affine expressions and constraints
// ============================================================================

/// `sum(coeffs[k] * x[k]) + constant`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffineExpr {
    coeffs: Vec<i64>,
    constant: i64,
}

impl AffineExpr {
    pub fn zero(n_vars: usize) -> Self {
        AffineExpr {
            coeffs: vec![0; n_vars],
            constant: 0,
        }
    }

    /// The expression `x[idx]`
    pub fn var(n_vars: usize, idx: usize) -> Self {
        AffineExpr::zero(n_vars).set_coefficient(idx, 1)
    }

    pub fn n_vars(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coefficients(&self) -> &[i64] {
        &self.coeffs
    }

    /// Coefficient of `x[idx]`, zero when `idx` is out of range
    pub fn coefficient(&self, idx: usize) -> i64 {
        self.coeffs.get(idx).copied().unwrap_or(0)
    }

    pub fn constant(&self) -> i64 {
        self.constant
    }

    /// Overwrites the coefficient of `x[idx]`, growing the expression if needed
    pub fn set_coefficient(mut self, idx: usize, value: i64) -> Self {
        if idx >= self.coeffs.len() {
            self.coeffs.resize(idx + 1, 0);
        }
        self.coeffs[idx] = value;
        self
    }

    pub fn set_constant(mut self, value: i64) -> Self {
        self.constant = value;
        self
    }

    pub fn eval(&self, values: &[i64]) -> i64 {
        self.coeffs
            .iter()
            .zip(values)
            .map(|(a, x)| a * x)
            .sum::<i64>()
            + self.constant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintKind {
    /// `expr == 0`
    Equality,
    /// `expr >= 0`
    Inequality,
}

/// An affine constraint `coeffs · x + constant (== | >=) 0`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constraint {
    kind: ConstraintKind,
    coeffs: Vec<i64>,
    constant: i64,
}

impl Constraint {
    pub fn equality(coeffs: Vec<i64>, constant: i64) -> Self {
        Constraint {
            kind: ConstraintKind::Equality,
            coeffs,
            constant,
        }
    }

    pub fn inequality(coeffs: Vec<i64>, constant: i64) -> Self {
        Constraint {
            kind: ConstraintKind::Inequality,
            coeffs,
            constant,
        }
    }

    pub fn from_expr(kind: ConstraintKind, expr: &AffineExpr) -> Self {
        Constraint {
            kind,
            coeffs: expr.coeffs.clone(),
            constant: expr.constant,
        }
    }

    /// `x[idx] >= value`
    pub fn lower_bound(n_cols: usize, idx: usize, value: i64) -> Self {
        let mut coeffs = vec![0; n_cols];
        coeffs[idx] = 1;
        Constraint::inequality(coeffs, -value)
    }

    /// `x[idx] <= value`
    pub fn upper_bound(n_cols: usize, idx: usize, value: i64) -> Self {
        let mut coeffs = vec![0; n_cols];
        coeffs[idx] = -1;
        Constraint::inequality(coeffs, value)
    }

    /// `x[a] == x[b]`
    fn columns_equal(n_cols: usize, a: usize, b: usize) -> Self {
        let mut coeffs = vec![0; n_cols];
        coeffs[a] = 1;
        coeffs[b] = -1;
        Constraint::equality(coeffs, 0)
    }

    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    pub fn coefficients(&self) -> &[i64] {
        &self.coeffs
    }

    pub fn constant(&self) -> i64 {
        self.constant
    }

    /// ISL syntax, e.g. `2*i0 - o0 + 3 >= 0`
    fn to_isl(&self, names: &[String]) -> String {
        let mut text = String::new();
        for (&a, name) in self.coeffs.iter().zip(names) {
            if a == 0 {
                continue;
            }
            if text.is_empty() {
                if a < 0 {
                    text.push('-');
                }
            } else {
                text.push_str(if a < 0 { " - " } else { " + " });
            }
            if a.abs() != 1 {
                text.push_str(&format!("{}*", a.abs()));
            }
            text.push_str(name);
        }
        if text.is_empty() {
            text = self.constant.to_string();
        } else if self.constant > 0 {
            text.push_str(&format!(" + {}", self.constant));
        } else if self.constant < 0 {
            text.push_str(&format!(" - {}", -self.constant));
        }
        let op = match self.kind {
            ConstraintKind::Equality => "=",
            ConstraintKind::Inequality => ">=",
        };
        format!("{} {} 0", text, op)
    }
}

// ============================================================================
// ISL text
// ============================================================================

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|k| format!("{}{}", prefix, k)).collect()
}

fn tuple(items: &[String]) -> String {
    format!("[{}]", items.join(", "))
}

fn point_tuple(point: &[i64]) -> String {
    let items: Vec<String> = point.iter().map(|x| x.to_string()).collect();
    tuple(&items)
}

fn with_constraints(space: &str, constraints: &[Constraint], names: &[String]) -> String {
    if constraints.is_empty() {
        return format!("{{ {} }}", space);
    }
    let body: Vec<String> = constraints.iter().map(|c| c.to_isl(names)).collect();
    format!("{{ {} : {} }}", space, body.join(" and "))
}

fn map_space(n_in: usize, n_out: usize) -> (String, Vec<String>) {
    let ins = names("i", n_in);
    let outs = names("o", n_out);
    let space = format!("{} -> {}", tuple(&ins), tuple(&outs));
    (space, ins.into_iter().chain(outs).collect())
}

fn set_space(n: usize) -> (String, Vec<String>) {
    let coords = names("s", n);
    (tuple(&coords), coords)
}

/// Number of points of `set`, `None` when it is unbounded
fn bounded_count(set: &IslSet) -> Option<u64> {
    if !set.is_bounded() {
        return None;
    }
    let count = set.count_val();
    if count.is_int() {
        u64::try_from(count.get_num_si()).ok()
    } else {
        None
    }
}

// ============================================================================
// Relations
// ============================================================================

/// A relation from `n_in` to `n_out` integer coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    n_in: usize,
    n_out: usize,
    text: String,
}

impl Relation {
    fn from_constraints(n_in: usize, n_out: usize, constraints: &[Constraint]) -> Self {
        let (space, cols) = map_space(n_in, n_out);
        Relation {
            n_in,
            n_out,
            text: with_constraints(&space, constraints, &cols),
        }
    }

    fn isl_unary<F>(&self, n_in: usize, n_out: usize, op: F) -> Relation
    where
        F: FnOnce(Map) -> Map,
    {
        let text = ISL_CONTEXT.with(|ctx| op(Map::read_from_str(ctx, &self.text)).to_str().to_string());
        Relation { n_in, n_out, text }
    }

    fn isl_binary<F>(&self, other: &Relation, n_in: usize, n_out: usize, op: F) -> Relation
    where
        F: FnOnce(Map, Map) -> Map,
    {
        let text = ISL_CONTEXT.with(|ctx| {
            let a = Map::read_from_str(ctx, &self.text);
            let b = Map::read_from_str(ctx, &other.text);
            op(a, b).to_str().to_string()
        });
        Relation { n_in, n_out, text }
    }

    fn isl_with_set<F>(&self, set: &Set, op: F) -> Relation
    where
        F: FnOnce(Map, IslSet) -> Map,
    {
        let text = ISL_CONTEXT.with(|ctx| {
            let map = Map::read_from_str(ctx, &self.text);
            let set = IslSet::read_from_str(ctx, &set.text);
            op(map, set).to_str().to_string()
        });
        Relation {
            n_in: self.n_in,
            n_out: self.n_out,
            text,
        }
    }

    fn isl_to_set<F>(&self, dim: usize, op: F) -> Set
    where
        F: FnOnce(Map) -> IslSet,
    {
        let text = ISL_CONTEXT.with(|ctx| op(Map::read_from_str(ctx, &self.text)).to_str().to_string());
        Set { dim, text }
    }

    fn isl_test<F>(&self, other: &Relation, test: F) -> bool
    where
        F: FnOnce(&Map, &Map) -> bool,
    {
        ISL_CONTEXT.with(|ctx| {
            let a = Map::read_from_str(ctx, &self.text);
            let b = Map::read_from_str(ctx, &other.text);
            test(&a, &b)
        })
    }

    pub fn empty(n_in: usize, n_out: usize) -> Self {
        let (space, _) = map_space(n_in, n_out);
        Relation {
            n_in,
            n_out,
            text: format!("{{ {} : false }}", space),
        }
    }

    pub fn universe(n_in: usize, n_out: usize) -> Self {
        Relation::from_constraints(n_in, n_out, &[])
    }

    /// `{ [x] -> [x] }` over `n` coordinates
    pub fn identity(n: usize) -> Self {
        let constraints: Vec<Constraint> = (0..n)
            .map(|k| Constraint::columns_equal(2 * n, k, n + k))
            .collect();
        Relation::from_constraints(n, n, &constraints)
    }

    /// Multi-affine map: output coordinate `k` equals `exprs[k]` over the inputs
    pub fn from_affine(n_in: usize, exprs: &[AffineExpr]) -> RelationResult<Self> {
        let n_out = exprs.len();
        let mut constraints = Vec::with_capacity(n_out);
        for (k, expr) in exprs.iter().enumerate() {
            if expr.n_vars() > n_in {
                return Err(RelationError::DimensionMismatch {
                    op: "from_affine",
                    expected: n_in,
                    found: expr.n_vars(),
                });
            }
            let mut coeffs = vec![0; n_in + n_out];
            coeffs[..expr.n_vars()].copy_from_slice(&expr.coeffs);
            coeffs[n_in + k] = -1;
            constraints.push(Constraint::equality(coeffs, expr.constant));
        }
        Ok(Relation::from_constraints(n_in, n_out, &constraints))
    }

    /// Explicit relation from a list of pairs
    pub fn from_points<I>(n_in: usize, n_out: usize, points: I) -> Self
    where
        I: IntoIterator<Item = (Vec<i64>, Vec<i64>)>,
    {
        let pairs: Vec<String> = points
            .into_iter()
            .map(|(input, output)| format!("{} -> {}", point_tuple(&input), point_tuple(&output)))
            .collect();
        if pairs.is_empty() {
            return Relation::empty(n_in, n_out);
        }
        Relation {
            n_in,
            n_out,
            text: format!("{{ {} }}", pairs.join("; ")),
        }
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn union(&self, other: &Relation) -> RelationResult<Self> {
        check_dims("union", self.n_in, other.n_in)?;
        check_dims("union", self.n_out, other.n_out)?;
        Ok(self.isl_binary(other, self.n_in, self.n_out, |a, b| a.union(b)))
    }

    pub fn intersect(&self, other: &Relation) -> RelationResult<Self> {
        check_dims("intersect", self.n_in, other.n_in)?;
        check_dims("intersect", self.n_out, other.n_out)?;
        Ok(self.isl_binary(other, self.n_in, self.n_out, |a, b| a.intersect(b)))
    }

    pub fn intersect_domain(&self, set: &Set) -> RelationResult<Self> {
        check_dims("intersect_domain", self.n_in, set.dim())?;
        Ok(self.isl_with_set(set, |map, set| map.intersect_domain(set)))
    }

    pub fn intersect_range(&self, set: &Set) -> RelationResult<Self> {
        check_dims("intersect_range", self.n_out, set.dim())?;
        Ok(self.isl_with_set(set, |map, set| map.intersect_range(set)))
    }

    /// Composition: `x -> z` whenever `self` has `x -> y` and `other` has `y -> z`
    pub fn apply_range(&self, other: &Relation) -> RelationResult<Self> {
        check_dims("apply_range", self.n_out, other.n_in)?;
        Ok(self.isl_binary(other, self.n_in, other.n_out, |a, b| a.apply_range(b)))
    }

    pub fn reverse(&self) -> Self {
        self.isl_unary(self.n_out, self.n_in, |map| map.reverse())
    }

    pub fn domain(&self) -> Set {
        self.isl_to_set(self.n_in, |map| map.domain())
    }

    pub fn range(&self) -> Set {
        self.isl_to_set(self.n_out, |map| map.range())
    }

    /// Keeps the first `n` input coordinates and projects the rest out
    pub fn project_in_after(&self, n: usize) -> RelationResult<Self> {
        if n > self.n_in {
            return Err(RelationError::IndexOutOfRange {
                index: n,
                dims: self.n_in,
            });
        }
        let prefix = Relation::prefix_map(self.n_in, n)?;
        prefix.reverse().apply_range(self)
    }

    /// `{ [x0, .., x(n-1)] -> [x0, .., x(k-1)] }`
    fn prefix_map(n: usize, k: usize) -> RelationResult<Self> {
        let exprs: Vec<AffineExpr> = (0..k).map(|j| AffineExpr::var(n, j)).collect();
        Relation::from_affine(n, &exprs)
    }

    /// `{ [x0, .., x(n-1)] -> [x0, .., x(n-1), y0, ..] }` with `extra` free trailing outputs
    fn widen_map(n: usize, extra: usize) -> Self {
        let n_cols = 2 * n + extra;
        let constraints: Vec<Constraint> = (0..n)
            .map(|k| Constraint::columns_equal(n_cols, k, n + k))
            .collect();
        Relation::from_constraints(n, n + extra, &constraints)
    }

    /// Appends `count` coordinates to both sides, equal between input and output
    pub fn append_equal_dims(&self, count: usize) -> RelationResult<Self> {
        let n_in = self.n_in + count;
        let n_out = self.n_out + count;
        let widened = Relation::prefix_map(n_in, self.n_in)?
            .apply_range(self)?
            .apply_range(&Relation::widen_map(self.n_out, count))?;
        (0..count).try_fold(widened, |rel, j| {
            rel.add_constraint(&Constraint::columns_equal(
                n_in + n_out,
                self.n_in + j,
                n_in + self.n_out + j,
            ))
        })
    }

    /// Appends `count` input coordinates pinned to `value`
    pub fn append_fixed_in_dims(&self, count: usize, value: i64) -> RelationResult<Self> {
        let n_in = self.n_in + count;
        let n_cols = n_in + self.n_in;
        let pinned = (0..count).try_fold(Relation::prefix_map(n_in, self.n_in)?, |rel, j| {
            let mut coeffs = vec![0; n_cols];
            coeffs[self.n_in + j] = 1;
            rel.add_constraint(&Constraint::equality(coeffs, -value))
        })?;
        pinned.apply_range(self)
    }

    /// Appends the coordinates of `extra` to the output tuple
    pub fn extend_range(&self, extra: &Set) -> RelationResult<Self> {
        let n_out = self.n_out + extra.dim();
        let tail: Vec<AffineExpr> = (self.n_out..n_out).map(|k| AffineExpr::var(n_out, k)).collect();
        let allowed = Relation::from_affine(n_out, &tail)?
            .intersect_range(extra)?
            .domain();
        self.apply_range(&Relation::widen_map(self.n_out, extra.dim()))?
            .intersect_range(&allowed)
    }

    /// Equates input coordinate `k` with output coordinate `k` for `k < n`
    pub fn equate_prefix(&self, n: usize) -> RelationResult<Self> {
        let limit = self.n_in.min(self.n_out);
        if n > limit {
            return Err(RelationError::IndexOutOfRange {
                index: n,
                dims: limit,
            });
        }
        let n_cols = self.n_in + self.n_out;
        let constraints: Vec<Constraint> = (0..n)
            .map(|k| Constraint::columns_equal(n_cols, k, self.n_in + k))
            .collect();
        self.intersect(&Relation::from_constraints(self.n_in, self.n_out, &constraints))
    }

    /// Adds a constraint over the `[input | output]` columns
    pub fn add_constraint(&self, constraint: &Constraint) -> RelationResult<Self> {
        check_dims("add_constraint", self.n_in + self.n_out, constraint.coeffs.len())?;
        self.intersect(&Relation::from_constraints(
            self.n_in,
            self.n_out,
            std::slice::from_ref(constraint),
        ))
    }

    pub fn contains(&self, input: &[i64], output: &[i64]) -> RelationResult<bool> {
        check_dims("contains", self.n_in, input.len())?;
        check_dims("contains", self.n_out, output.len())?;
        let point = Relation::from_points(self.n_in, self.n_out, [(input.to_vec(), output.to_vec())]);
        point.is_subset(self)
    }

    pub fn is_empty(&self) -> RelationResult<bool> {
        Ok(ISL_CONTEXT.with(|ctx| Map::read_from_str(ctx, &self.text).is_empty()))
    }

    /// Pairs of `self` that are not in `other`
    pub fn subtract(&self, other: &Relation) -> RelationResult<Self> {
        check_dims("subtract", self.n_in, other.n_in)?;
        check_dims("subtract", self.n_out, other.n_out)?;
        Ok(self.isl_binary(other, self.n_in, self.n_out, |a, b| a.subtract(b)))
    }

    pub fn coalesce(&self) -> RelationResult<Self> {
        Ok(self.isl_unary(self.n_in, self.n_out, |map| map.coalesce()))
    }

    pub fn is_subset(&self, other: &Relation) -> RelationResult<bool> {
        check_dims("is_subset", self.n_in, other.n_in)?;
        check_dims("is_subset", self.n_out, other.n_out)?;
        Ok(self.isl_test(other, |a, b| a.is_subset(b)))
    }

    pub fn is_equal(&self, other: &Relation) -> RelationResult<bool> {
        if self.n_in != other.n_in || self.n_out != other.n_out {
            return Ok(false);
        }
        Ok(self.isl_test(other, |a, b| a.is_equal(b)))
    }

    /// Number of output points per input point, as a piecewise quasi-polynomial
    ///
    /// The total is the number of pairs, or `None` when the relation is unbounded.
    pub fn card(&self) -> RelationResult<PwCount> {
        let (expression, total) = ISL_CONTEXT.with(|ctx| {
            let map = Map::read_from_str(ctx, &self.text);
            let total = bounded_count(&map.copy().wrap());
            (map.card().to_str().to_string(), total)
        });
        Ok(PwCount::new(self.n_in, expression, total))
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

// ============================================================================
// Sets
// ============================================================================

/// A union of integer polyhedra over `dim()` coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set {
    dim: usize,
    text: String,
}

impl Set {
    fn isl_unary<F>(&self, op: F) -> Set
    where
        F: FnOnce(IslSet) -> IslSet,
    {
        let text = ISL_CONTEXT.with(|ctx| op(IslSet::read_from_str(ctx, &self.text)).to_str().to_string());
        Set { dim: self.dim, text }
    }

    fn isl_binary<F>(&self, other: &Set, op: F) -> Set
    where
        F: FnOnce(IslSet, IslSet) -> IslSet,
    {
        let text = ISL_CONTEXT.with(|ctx| {
            let a = IslSet::read_from_str(ctx, &self.text);
            let b = IslSet::read_from_str(ctx, &other.text);
            op(a, b).to_str().to_string()
        });
        Set { dim: self.dim, text }
    }

    fn isl_test<F>(&self, other: &Set, test: F) -> bool
    where
        F: FnOnce(&IslSet, &IslSet) -> bool,
    {
        ISL_CONTEXT.with(|ctx| {
            let a = IslSet::read_from_str(ctx, &self.text);
            let b = IslSet::read_from_str(ctx, &other.text);
            test(&a, &b)
        })
    }

    fn bounded_count(&self) -> Option<u64> {
        ISL_CONTEXT.with(|ctx| bounded_count(&IslSet::read_from_str(ctx, &self.text)))
    }

    pub fn universe(n: usize) -> Self {
        Set::from_constraints(n, Vec::new())
    }

    pub fn empty(n: usize) -> Self {
        let (space, _) = set_space(n);
        Set {
            dim: n,
            text: format!("{{ {} : false }}", space),
        }
    }

    /// `lo[k] <= x[k] < hi[k]` for every coordinate
    pub fn from_box(bounds: &[(i64, i64)]) -> Self {
        let n = bounds.len();
        let constraints = bounds
            .iter()
            .enumerate()
            .flat_map(|(k, &(lo, hi))| {
                vec![
                    Constraint::lower_bound(n, k, lo),
                    Constraint::upper_bound(n, k, hi - 1),
                ]
            })
            .collect();
        Set::from_constraints(n, constraints)
    }

    /// Conjunction of constraints over the set coordinates
    pub fn from_constraints(n: usize, constraints: Vec<Constraint>) -> Self {
        let (space, coords) = set_space(n);
        Set {
            dim: n,
            text: with_constraints(&space, &constraints, &coords),
        }
    }

    pub fn from_points<I>(n: usize, points: I) -> Self
    where
        I: IntoIterator<Item = Vec<i64>>,
    {
        let points: Vec<String> = points.into_iter().map(|p| point_tuple(&p)).collect();
        if points.is_empty() {
            return Set::empty(n);
        }
        Set {
            dim: n,
            text: format!("{{ {} }}", points.join("; ")),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn intersect(&self, other: &Set) -> RelationResult<Self> {
        check_dims("intersect", self.dim, other.dim)?;
        Ok(self.isl_binary(other, |a, b| a.intersect(b)))
    }

    pub fn union(&self, other: &Set) -> RelationResult<Self> {
        check_dims("union", self.dim, other.dim)?;
        Ok(self.isl_binary(other, |a, b| a.union(b)))
    }

    pub fn subtract(&self, other: &Set) -> RelationResult<Self> {
        check_dims("subtract", self.dim, other.dim)?;
        Ok(self.isl_binary(other, |a, b| a.subtract(b)))
    }

    pub fn add_constraint(&self, constraint: &Constraint) -> RelationResult<Self> {
        check_dims("add_constraint", self.dim, constraint.coeffs.len())?;
        self.intersect(&Set::from_constraints(self.dim, vec![constraint.clone()]))
    }

    pub fn coalesce(&self) -> RelationResult<Self> {
        Ok(self.isl_unary(|set| set.coalesce()))
    }

    pub fn is_empty(&self) -> RelationResult<bool> {
        Ok(ISL_CONTEXT.with(|ctx| IslSet::read_from_str(ctx, &self.text).is_empty()))
    }

    pub fn contains(&self, point: &[i64]) -> RelationResult<bool> {
        check_dims("contains", self.dim, point.len())?;
        Set::from_points(self.dim, [point.to_vec()]).is_subset(self)
    }

    pub fn is_subset(&self, other: &Set) -> RelationResult<bool> {
        check_dims("is_subset", self.dim, other.dim)?;
        Ok(self.isl_test(other, |a, b| a.is_subset(b)))
    }

    pub fn is_equal(&self, other: &Set) -> RelationResult<bool> {
        if self.dim != other.dim {
            return Ok(false);
        }
        Ok(self.isl_test(other, |a, b| a.is_equal(b)))
    }

    /// Number of integer points
    pub fn count(&self) -> RelationResult<u64> {
        self.bounded_count()
            .ok_or_else(|| RelationError::Unbounded(self.text.clone()))
    }

    /// Whether coordinate `i` is bounded from below (vacuously true when empty)
    pub fn dim_has_lower_bound(&self, i: usize) -> RelationResult<bool> {
        if i >= self.dim {
            return Err(RelationError::IndexOutOfRange {
                index: i,
                dims: self.dim,
            });
        }
        let values = Relation::from_affine(self.dim, &[AffineExpr::var(self.dim, i)])?
            .intersect_domain(self)?
            .range();
        if values.is_empty()? {
            return Ok(true);
        }
        // { [y] -> [x] : x > y }; a lower bound exists iff some value has nothing below it
        let above = Relation::from_constraints(1, 1, &[Constraint::inequality(vec![-1, 1], -1)])
            .intersect_domain(&values)?
            .range();
        Ok(!values.subtract(&above)?.is_empty()?)
    }

    /// `{ [x] -> [x] : x in self }`
    pub fn identity(&self) -> RelationResult<Relation> {
        Relation::identity(self.dim).intersect_domain(self)
    }

    /// One per point of the set, as a closed form over the set coordinates
    pub fn indicator(&self) -> RelationResult<PwCount> {
        let expression = self.identity()?.card()?.expression().to_string();
        Ok(PwCount::new(self.dim, expression, self.bounded_count()))
    }
}

impl fmt::Display for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tile_map() -> Relation {
        // [c0, c1] -> [4*c0 + c1] : c0 >= 0, 0 <= c1 < 4, 0 <= out < 10
        let expr = AffineExpr::zero(2).set_coefficient(0, 4).set_coefficient(1, 1);
        let domain = Set::from_constraints(
            2,
            vec![
                Constraint::lower_bound(2, 0, 0),
                Constraint::lower_bound(2, 1, 0),
                Constraint::upper_bound(2, 1, 3),
            ],
        );
        Relation::from_affine(2, &[expr])
            .unwrap()
            .intersect_domain(&domain)
            .unwrap()
            .intersect_range(&Set::from_box(&[(0, 10)]))
            .unwrap()
    }

    #[test]
    fn test_tile_map_points() {
        let map = tile_map();
        assert_eq!(map.card().unwrap().total(), Some(10));
        assert!(map.contains(&[2, 1], &[9]).unwrap());
        assert!(!map.contains(&[2, 2], &[10]).unwrap());
    }

    #[test]
    fn test_apply_range_and_reverse() {
        let map = tile_map();
        let shift = Relation::from_affine(1, &[AffineExpr::var(1, 0).set_constant(1)]).unwrap();
        let composed = map.apply_range(&shift).unwrap();
        assert!(composed.contains(&[0, 0], &[1]).unwrap());
        assert!(composed.reverse().contains(&[10], &[2, 1]).unwrap());
        assert_eq!(composed.range().count().unwrap(), 10);
    }

    #[test]
    fn test_projection_keeps_outer_coordinates() {
        let map = tile_map();
        let outer = map.project_in_after(1).unwrap();
        assert_eq!(outer.n_in(), 1);
        assert!(outer.contains(&[0], &[3]).unwrap());
        assert!(outer.contains(&[2], &[8]).unwrap());
        assert!(!outer.contains(&[2], &[3]).unwrap());
        assert_eq!(outer.card().unwrap().total(), Some(10));
    }

    #[test]
    fn test_strided_image_is_exact() {
        // [c] -> [2c] : 0 <= c < 4, then reverse keeps only even points
        let map = Relation::from_affine(1, &[AffineExpr::var(1, 0).set_coefficient(0, 2)])
            .unwrap()
            .intersect_domain(&Set::from_box(&[(0, 4)]))
            .unwrap();
        let evens = map.range();
        assert!(evens.contains(&[4]).unwrap());
        assert!(!evens.contains(&[5]).unwrap());
        assert_eq!(evens.count().unwrap(), 4);
    }

    #[test]
    fn test_subtract_and_equality() {
        let a = Set::from_box(&[(0, 6)]);
        let b = Set::from_box(&[(2, 4)]);
        let diff = a.subtract(&b).unwrap();
        assert!(diff
            .is_equal(&Set::from_points(1, [vec![0], vec![1], vec![4], vec![5]]))
            .unwrap());
        assert!(diff.union(&b).unwrap().is_equal(&a).unwrap());
        assert!(b.is_subset(&a).unwrap());
        assert!(!a.is_subset(&b).unwrap());
    }

    #[test]
    fn test_lower_bound_detection() {
        let half = Set::from_constraints(2, vec![Constraint::lower_bound(2, 1, 0)]);
        assert!(!half.dim_has_lower_bound(0).unwrap());
        assert!(half.dim_has_lower_bound(1).unwrap());
        assert!(Set::empty(1).dim_has_lower_bound(0).unwrap());
        assert!(matches!(half.count(), Err(RelationError::Unbounded(_))));
    }

    #[test]
    fn test_card_counts_outputs_per_input() {
        // [x] -> [y] : 0 <= x < 3, 0 <= y <= x
        let rel = Relation::universe(1, 1)
            .add_constraint(&Constraint::lower_bound(2, 0, 0))
            .unwrap()
            .add_constraint(&Constraint::upper_bound(2, 0, 2))
            .unwrap()
            .add_constraint(&Constraint::lower_bound(2, 1, 0))
            .unwrap()
            .add_constraint(&Constraint::inequality(vec![1, -1], 0))
            .unwrap();
        let at = |x: i64| {
            rel.intersect_domain(&Set::from_points(1, [vec![x]]))
                .unwrap()
                .card()
                .unwrap()
                .total()
        };
        assert_eq!(at(0), Some(1));
        assert_eq!(at(2), Some(3));
        assert_eq!(rel.card().unwrap().total(), Some(6));
    }

    #[test]
    fn test_card_leaves_free_inputs_symbolic() {
        // [c0, c1] -> [c1] : 0 <= c1 < 3 with c0 unconstrained
        let rel = Relation::from_affine(2, &[AffineExpr::var(2, 1)])
            .unwrap()
            .intersect_range(&Set::from_box(&[(0, 3)]))
            .unwrap();
        assert_eq!(rel.card().unwrap().total(), None);
        let pinned = rel
            .intersect_domain(&Set::from_points(2, [vec![100, 1]]))
            .unwrap();
        assert_eq!(pinned.card().unwrap().total(), Some(1));
    }

    #[test]
    fn test_subtract_keeps_free_columns_symbolic() {
        // [c0, c1] -> [c1] with c0 free, minus the same map restricted to c1 = 0
        let rel = Relation::from_affine(2, &[AffineExpr::var(2, 1)])
            .unwrap()
            .intersect_range(&Set::from_box(&[(0, 3)]))
            .unwrap();
        let first = rel.intersect_range(&Set::from_box(&[(0, 1)])).unwrap();
        let rest = rel.subtract(&first).unwrap();
        assert!(rest.contains(&[-7, 2], &[2]).unwrap());
        assert!(!rest.contains(&[-7, 0], &[0]).unwrap());
        assert!(rest.card().unwrap().total().is_none());
    }

    #[test]
    fn test_large_extents_count_without_enumeration() {
        // 2^20 x 2^20 points: counted in closed form
        let side = 1 << 20;
        let square = Set::from_box(&[(0, side), (0, side)]);
        assert_eq!(square.count().unwrap(), (side * side) as u64);
        let diagonal = square
            .add_constraint(&Constraint::equality(vec![1, -1], 0))
            .unwrap();
        assert_eq!(diagonal.count().unwrap(), side as u64);
    }

    #[test]
    fn test_dimension_mismatch_is_reported() {
        let err = Relation::identity(2)
            .apply_range(&Relation::identity(3))
            .unwrap_err();
        assert_eq!(
            err,
            RelationError::DimensionMismatch {
                op: "apply_range",
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn test_append_dims() {
        let skew = Relation::identity(0)
            .append_equal_dims(1)
            .unwrap()
            .append_fixed_in_dims(1, 0)
            .unwrap();
        assert_eq!((skew.n_in(), skew.n_out()), (2, 1));
        assert!(skew.contains(&[3, 0], &[3]).unwrap());
        assert!(!skew.contains(&[3, 1], &[3]).unwrap());
    }

    #[test]
    fn test_extend_range_appends_bounded_coordinates() {
        let rel = Relation::identity(1)
            .intersect_domain(&Set::from_box(&[(0, 2)]))
            .unwrap()
            .extend_range(&Set::from_box(&[(0, 3)]))
            .unwrap();
        assert_eq!(rel.n_out(), 2);
        assert!(rel.contains(&[1], &[1, 2]).unwrap());
        assert!(!rel.contains(&[1], &[0, 2]).unwrap());
        assert_eq!(rel.card().unwrap().total(), Some(6));
    }
}
