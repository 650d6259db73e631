use std::fmt;

use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};
use crate::operator::{passthrough, OperatorTrait};

/// Filter keeping the rows for which `criteria` is true.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Select {
    criteria: Expr,
}

impl Select {
    pub fn new(criteria: Expr) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &Expr {
        &self.criteria
    }
}

impl OperatorTrait for Select {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        passthrough(inputs)
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.criteria)
    }
}
