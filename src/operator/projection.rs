use std::fmt;

use anyhow::ensure;
use itertools::Itertools;

use crate::command::SelectItem;
use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};
use crate::operator::OperatorTrait;

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Project {
    items: Vec<SelectItem>,
    distinct: bool,
}

impl Project {
    pub fn new(items: Vec<SelectItem>, distinct: bool) -> Self {
        Self { items, distinct }
    }

    pub fn items(&self) -> &[SelectItem] {
        &self.items
    }

    pub fn distinct(&self) -> bool {
        self.distinct
    }

    /// Whether every item is a bare column of the input.
    pub fn is_column_only(&self) -> bool {
        self.items.iter().all(|item| item.expr.as_column().is_some())
    }
}

impl OperatorTrait for Project {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, _inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(self.items.iter().map(|item| item.alias.clone()).collect())
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let distinct = if self.distinct { "DISTINCT " } else { "" };
        write!(f, "{}{}", distinct, self.items.iter().join(", "))
    }
}

/// Named query block boundary: exposes the input's columns, positionally, under the group
/// `name`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct VirtualGroup {
    name: String,
    columns: Vec<String>,
}

impl VirtualGroup {
    pub fn new<S: Into<String>>(name: S, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_columns(&self) -> Vec<ColumnRef> {
        self.columns
            .iter()
            .map(|c| ColumnRef::new(self.name.clone(), c.clone()))
            .collect()
    }

    /// The equivalent renaming projection over `input`.
    pub fn as_projection(&self, input: &[ColumnRef]) -> Project {
        Project::new(
            input
                .iter()
                .zip(self.output_columns())
                .map(|(c, alias)| SelectItem::new(Expr::Column(c.clone()), alias))
                .collect(),
            false,
        )
    }
}

impl OperatorTrait for VirtualGroup {
    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        ensure!(
            inputs[0].len() == self.columns.len(),
            "virtual group {} declares {} columns, its input has {}",
            self.name,
            self.columns.len(),
            inputs[0].len()
        );
        Ok(self.output_columns())
    }
}

impl fmt::Display for VirtualGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.columns.iter().join(", "))
    }
}
