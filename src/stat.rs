//! Cardinality statistics.
//!
//! Catalog statistics describe physical tables and come from an external metadata source
//! through [`CardinalityHints`]. [`Statistics`] is what the cost estimator derives for a plan
//! node: an optional row count and the distinct-value counts it knows for output columns.

use std::collections::HashMap;

use crate::capability::SourceId;
use crate::expr::ColumnRef;

/// Statistics of one physical table, as provided by the catalog.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableStatistics {
    row_count: Option<f64>,
    /// Distinct value counts keyed by column name.
    column_ndv: HashMap<String, f64>,
}

impl TableStatistics {
    pub fn new(row_count: f64) -> Self {
        Self {
            row_count: Some(row_count),
            column_ndv: HashMap::new(),
        }
    }

    /// Statistics with distinct-value counts but no row count.
    pub fn unknown_rows() -> Self {
        Self::default()
    }

    pub fn with_column_ndv<S: Into<String>>(mut self, column: S, ndv: f64) -> Self {
        self.column_ndv.insert(column.into(), ndv);
        self
    }

    pub fn row_count(&self) -> Option<f64> {
        self.row_count
    }

    pub fn column_ndv(&self, column: &str) -> Option<f64> {
        self.column_ndv.get(column).copied()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.column_ndv.iter().map(|(c, n)| (c.as_str(), *n))
    }
}

/// Catalog-provided cardinality hints.
pub trait CardinalityHints: Send + Sync {
    fn table_statistics(&self, source: &SourceId, table: &str) -> Option<TableStatistics>;
}

/// Hints populated programmatically, keyed by source and table name.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatistics {
    tables: HashMap<(SourceId, String), TableStatistics>,
}

impl InMemoryStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table<S, T>(mut self, source: S, table: T, stats: TableStatistics) -> Self
    where
        S: Into<SourceId>,
        T: Into<String>,
    {
        self.tables.insert((source.into(), table.into()), stats);
        self
    }
}

impl CardinalityHints for InMemoryStatistics {
    fn table_statistics(&self, source: &SourceId, table: &str) -> Option<TableStatistics> {
        self.tables
            .get(&(source.clone(), table.to_string()))
            .cloned()
    }
}

/// Hints source that knows nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatistics;

impl CardinalityHints for NoStatistics {
    fn table_statistics(&self, _source: &SourceId, _table: &str) -> Option<TableStatistics> {
        None
    }
}

/// Statistics derived for a plan node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statistics {
    row_count: Option<f64>,
    column_ndv: HashMap<ColumnRef, f64>,
}

impl Statistics {
    pub fn new(row_count: Option<f64>) -> Self {
        Self {
            row_count,
            column_ndv: HashMap::new(),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn with_column_ndv(mut self, column: ColumnRef, ndv: f64) -> Self {
        self.column_ndv.insert(column, ndv);
        self
    }

    pub fn row_count(&self) -> Option<f64> {
        self.row_count
    }

    /// Distinct values of `column`, never more than the row count.
    pub fn ndv(&self, column: &ColumnRef) -> Option<f64> {
        let ndv = self.column_ndv.get(column).copied()?;
        Some(match self.row_count {
            Some(rows) => ndv.min(rows.max(1.0)),
            None => ndv,
        })
    }

    /// Same column statistics with a different row count.
    pub fn with_row_count(mut self, row_count: Option<f64>) -> Self {
        self.row_count = row_count;
        self
    }

    pub(crate) fn merge_columns(&mut self, other: &Statistics) {
        self.column_ndv
            .extend(other.column_ndv.iter().map(|(c, n)| (c.clone(), *n)));
    }

    /// Keeps the statistics of `from` columns under the `to` names.
    pub(crate) fn rename<'a, I>(&self, renames: I) -> Statistics
    where
        I: IntoIterator<Item = (&'a ColumnRef, &'a ColumnRef)>,
    {
        let column_ndv = renames
            .into_iter()
            .filter_map(|(from, to)| self.column_ndv.get(from).map(|n| (to.clone(), *n)))
            .collect();
        Statistics {
            row_count: self.row_count,
            column_ndv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_lookup() {
        let hints = InMemoryStatistics::new().with_table(
            "s1",
            "orders",
            TableStatistics::new(10_000.0).with_column_ndv("customer", 500.0),
        );
        let stats = hints
            .table_statistics(&SourceId::from("s1"), "orders")
            .unwrap();
        assert_eq!(stats.row_count(), Some(10_000.0));
        assert_eq!(stats.column_ndv("customer"), Some(500.0));
        assert!(hints
            .table_statistics(&SourceId::from("s2"), "orders")
            .is_none());
    }

    #[test]
    fn test_ndv_capped_by_rows() {
        let stats = Statistics::new(Some(10.0)).with_column_ndv(ColumnRef::new("a", "k"), 50.0);
        assert_eq!(stats.ndv(&ColumnRef::new("a", "k")), Some(10.0));
    }
}
