use std::fmt;

use crate::error::OptResult;
use crate::expr::{BinaryOp, ColumnRef, Expr};
use crate::operator::OperatorTrait;

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum SubqueryKind {
    Exists,
    /// `expr IN (subquery)`.
    In { expr: Expr },
    /// `expr <op> (scalar subquery)`.
    Compare { expr: Expr, op: BinaryOp },
    /// Scalar subquery appended to the outer row as `alias`.
    Scalar { alias: ColumnRef },
}

/// Subquery evaluated against every outer row. Inputs are `[outer, inner]`; the inner plan
/// may reference outer columns, which makes it correlated.
///
/// As a physical operator it is the dependent select (filter kinds) or dependent project
/// (scalar kind) node: the inner plan is re-instantiated for every distinct correlation key.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Subquery {
    kind: SubqueryKind,
    negated: bool,
}

impl Subquery {
    pub fn new(kind: SubqueryKind) -> Self {
        Self {
            kind,
            negated: false,
        }
    }

    /// `NOT EXISTS`, `NOT IN` and negated comparisons.
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    pub fn kind(&self) -> &SubqueryKind {
        &self.kind
    }

    pub fn negated(&self) -> bool {
        self.negated
    }

    pub fn is_filter(&self) -> bool {
        !matches!(self.kind, SubqueryKind::Scalar { .. })
    }

    /// Expressions evaluated over the outer row.
    pub fn outer_exprs(&self) -> Vec<&Expr> {
        match &self.kind {
            SubqueryKind::In { expr } | SubqueryKind::Compare { expr, .. } => vec![expr],
            SubqueryKind::Exists | SubqueryKind::Scalar { .. } => vec![],
        }
    }
}

impl OperatorTrait for Subquery {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        let mut schema = inputs[0].to_vec();
        if let SubqueryKind::Scalar { alias } = &self.kind {
            schema.push(alias.clone());
        }
        Ok(schema)
    }
}

impl fmt::Display for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = if self.negated { "NOT " } else { "" };
        match &self.kind {
            SubqueryKind::Exists => write!(f, "{}EXISTS", not),
            SubqueryKind::In { expr } => write!(f, "{} {}IN", expr, not),
            SubqueryKind::Compare { expr, op } => {
                write!(f, "{}{} {} scalar", not, expr, op.symbol())
            }
            SubqueryKind::Scalar { alias } => write!(f, "scalar AS {}", alias),
        }
    }
}
