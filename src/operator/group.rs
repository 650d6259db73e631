use std::fmt;

use itertools::Itertools;

use crate::command::SelectItem;
use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::OperatorTrait;

/// Grouping: output is the key columns followed by the aggregate columns. As a physical node
/// its input arrives sorted on the keys.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Group {
    keys: Vec<SelectItem>,
    aggregates: Vec<SelectItem>,
}

impl Group {
    pub fn new(keys: Vec<SelectItem>, aggregates: Vec<SelectItem>) -> Self {
        Self { keys, aggregates }
    }

    pub fn keys(&self) -> &[SelectItem] {
        &self.keys
    }

    pub fn aggregates(&self) -> &[SelectItem] {
        &self.aggregates
    }
}

impl OperatorTrait for Group {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, _inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(self
            .keys
            .iter()
            .chain(&self.aggregates)
            .map(|item| item.alias.clone())
            .collect())
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "by [{}], {}",
            self.keys.iter().join(", "),
            self.aggregates.iter().join(", ")
        )
    }
}
