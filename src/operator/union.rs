use std::fmt;

use anyhow::ensure;

use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::{passthrough, OperatorTrait};

/// N-ary logical union. Output columns are named after the first branch.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Union {
    all: bool,
}

impl Union {
    pub fn new(all: bool) -> Self {
        Self { all }
    }

    pub fn all(&self) -> bool {
        self.all
    }
}

fn union_schema(inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
    let width = inputs[0].len();
    ensure!(
        inputs.iter().all(|cols| cols.len() == width),
        "union branches have different widths"
    );
    Ok(inputs[0].to_vec())
}

impl OperatorTrait for Union {
    fn arity(&self) -> Option<usize> {
        None
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        union_schema(inputs)
    }
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            write!(f, "ALL")
        } else {
            write!(f, "DISTINCT")
        }
    }
}

/// Concatenates its inputs in order.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Default)]
pub struct UnionAll;

impl OperatorTrait for UnionAll {
    fn arity(&self) -> Option<usize> {
        None
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        union_schema(inputs)
    }
}

impl fmt::Display for UnionAll {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

/// Removes duplicate rows, keeping first occurrences in input order.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Default)]
pub struct DupRemove;

impl OperatorTrait for DupRemove {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        passthrough(inputs)
    }
}

impl fmt::Display for DupRemove {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}
