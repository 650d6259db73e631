use std::fmt;

use itertools::Itertools;

use crate::capability::SourceId;
use crate::command::GroupSymbol;
use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::OperatorTrait;

/// Columns a source requires to be constrained by equality or IN before it accepts a query.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct AccessPattern {
    columns: Vec<ColumnRef>,
}

impl AccessPattern {
    pub fn new(columns: Vec<ColumnRef>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnRef] {
        &self.columns
    }
}

impl fmt::Display for AccessPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.columns.iter().join(", "))
    }
}

/// Leaf reading one physical group of a declared source.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Source {
    source: SourceId,
    group: GroupSymbol,
    columns: Vec<String>,
    access_patterns: Vec<AccessPattern>,
}

impl Source {
    pub fn new<S, A, T>(source: S, alias: A, table: T, columns: &[&str]) -> Self
    where
        S: Into<SourceId>,
        A: Into<String>,
        T: Into<String>,
    {
        Self {
            source: source.into(),
            group: GroupSymbol::new(alias, table),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            access_patterns: vec![],
        }
    }

    /// Declares that `columns` must be bound before this group can be queried. When several
    /// patterns are declared, satisfying any one of them suffices.
    pub fn with_access_pattern(mut self, columns: &[&str]) -> Self {
        let alias = self.group.alias.clone();
        self.access_patterns.push(AccessPattern::new(
            columns
                .iter()
                .map(|c| ColumnRef::new(alias.clone(), *c))
                .collect(),
        ));
        self
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn group(&self) -> &GroupSymbol {
        &self.group
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn access_patterns(&self) -> &[AccessPattern] {
        &self.access_patterns
    }
}

impl OperatorTrait for Source {
    fn arity(&self) -> Option<usize> {
        Some(0)
    }

    fn derive_schema(&self, _inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(self
            .columns
            .iter()
            .map(|c| ColumnRef::new(self.group.alias.clone(), c.clone()))
            .collect())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.group)?;
        if !self.access_patterns.is_empty() {
            write!(f, " access patterns {}", self.access_patterns.iter().join(" | "))?;
        }
        Ok(())
    }
}
