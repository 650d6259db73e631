use std::fmt;

use itertools::Itertools;

use crate::command::SortKey;
use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::{passthrough, OperatorTrait};

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Sort {
    keys: Vec<SortKey>,
}

impl Sort {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }
}

impl OperatorTrait for Sort {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        passthrough(inputs)
    }
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keys.iter().join(", "))
    }
}
