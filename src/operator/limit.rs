use std::fmt;

use crate::command::LimitClause;
use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::{passthrough, OperatorTrait};

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Limit {
    clause: LimitClause,
}

impl Limit {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self {
            clause: LimitClause::new(offset, count),
        }
    }

    pub fn offset(&self) -> u64 {
        self.clause.offset
    }

    pub fn count(&self) -> Option<u64> {
        self.clause.count
    }

    pub fn clause(&self) -> LimitClause {
        self.clause
    }
}

impl From<LimitClause> for Limit {
    fn from(clause: LimitClause) -> Self {
        Self { clause }
    }
}

impl OperatorTrait for Limit {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        passthrough(inputs)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clause)
    }
}
