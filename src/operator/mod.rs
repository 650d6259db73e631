//! Relational operators.
//!
//! The same operator structs are shared by logical and physical variants where the payload is
//! identical, e.g. [`Sort`] is both a logical sort and the in-process sort node.

use std::fmt;

use anyhow::bail;
use enum_as_inner::EnumAsInner;

use crate::error::OptResult;
use crate::expr::ColumnRef;

mod access;
pub use access::*;
mod group;
pub use group::*;
mod join;
pub use join::*;
mod limit;
pub use limit::*;
mod logical;
pub use logical::*;
mod physical;
pub use physical::*;
mod projection;
pub use projection::*;
mod select;
pub use select::*;
mod sort;
pub use sort::*;
mod source;
pub use source::*;
mod subquery;
pub use subquery::*;
mod union;
pub use union::*;

/// Output schema derivation shared by all operators.
pub trait OperatorTrait {
    /// Number of inputs the operator accepts, `None` for n-ary operators.
    fn arity(&self) -> Option<usize>;

    /// Output columns given the output columns of the inputs.
    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>>;
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, EnumAsInner)]
pub enum Operator {
    Logical(LogicalOperator),
    Physical(PhysicalOperator),
}

impl Operator {
    pub fn is_logical(&self) -> bool {
        matches!(self, Operator::Logical(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operator::Logical(op) => op.name(),
            Operator::Physical(op) => op.name(),
        }
    }

    fn as_trait(&self) -> &dyn OperatorTrait {
        match self {
            Operator::Logical(op) => op.as_trait(),
            Operator::Physical(op) => op.as_trait(),
        }
    }

    /// Checks the number of inputs and derives the output schema.
    pub fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        let op = self.as_trait();
        match op.arity() {
            Some(arity) if arity != inputs.len() => {
                bail!(
                    "{} expects {} inputs, got {}",
                    self.name(),
                    arity,
                    inputs.len()
                )
            }
            None if inputs.is_empty() => bail!("{} expects at least one input", self.name()),
            _ => op.derive_schema(inputs),
        }
    }
}

impl From<LogicalOperator> for Operator {
    fn from(op: LogicalOperator) -> Self {
        Operator::Logical(op)
    }
}

impl From<PhysicalOperator> for Operator {
    fn from(op: PhysicalOperator) -> Self {
        Operator::Physical(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Logical(op) => write!(f, "{}", op),
            Operator::Physical(op) => write!(f, "{}", op),
        }
    }
}

/// Schema of an operator passing its single input through unchanged.
pub(crate) fn passthrough(inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
    Ok(inputs[0].to_vec())
}

/// Renders `name(detail)`, or just `name` when the detail is empty.
pub(crate) fn fmt_operator(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    detail: &dyn fmt::Display,
) -> fmt::Result {
    let detail = detail.to_string();
    if detail.is_empty() {
        write!(f, "{}", name)
    } else {
        write!(f, "{}({})", name, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;

    #[test]
    fn test_join_schema_concatenates_inputs() {
        let left = vec![ColumnRef::new("a", "id")];
        let right = vec![ColumnRef::new("b", "id"), ColumnRef::new("b", "v")];
        let join = Operator::Logical(LogicalOperator::LogicalJoin(Join::new(
            JoinKind::Inner,
            vec![col("a", "id").eq(col("b", "id"))],
        )));
        let schema = join.derive_schema(&[left.as_slice(), right.as_slice()]).unwrap();
        assert_eq!(schema.len(), 3);
        assert!(join.derive_schema(&[left.as_slice()]).is_err());
        assert_eq!(join.to_string(), "Join(INNER JOIN ON a.id = b.id)");
    }

    #[test]
    fn test_virtual_group_renames_positionally() {
        let input = vec![ColumnRef::new("a", "id"), ColumnRef::new("a", "x")];
        let vg = Operator::Logical(LogicalOperator::LogicalVirtualGroup(VirtualGroup::new(
            "v",
            &["k", "y"],
        )));
        assert_eq!(
            vg.derive_schema(&[input.as_slice()]).unwrap(),
            vec![ColumnRef::new("v", "k"), ColumnRef::new("v", "y")]
        );
        let union_all = Operator::Physical(PhysicalOperator::PhysicalUnionAll(UnionAll));
        assert_eq!(union_all.to_string(), "UnionAll");
    }
}
