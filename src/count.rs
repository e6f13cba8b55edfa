//! Piecewise point counts
//!
//! [`PwCount`] is the result of counting a relation: ISL's piecewise
//! quasi-polynomial over the input coordinates (as printed by
//! `isl_pw_qpolynomial_to_str`), together with the total number of points when
//! the counted relation is bounded.

use std::fmt;

/// Number of output points per input point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PwCount {
    n_dims: usize,
    expression: String,
    total: Option<u64>,
}

impl PwCount {
    pub(crate) fn new(n_dims: usize, expression: String, total: Option<u64>) -> Self {
        PwCount {
            n_dims,
            expression,
            total,
        }
    }

    /// The zero count over `n_dims` coordinates
    pub fn zero(n_dims: usize) -> Self {
        PwCount::new(n_dims, "{ 0 }".to_string(), Some(0))
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    /// ISL's textual form of the piecewise count
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn is_zero(&self) -> bool {
        self.total == Some(0)
    }

    /// Sum over every point, or `None` when an unbounded coordinate makes it infinite
    pub fn total(&self) -> Option<u64> {
        self.total
    }
}

impl fmt::Display for PwCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}
