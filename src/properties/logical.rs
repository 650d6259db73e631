use std::sync::Arc;

use crate::expr::ColumnRef;

#[derive(Clone, PartialEq, Debug)]
pub struct LogicalProperty {
    schema: Arc<Vec<ColumnRef>>,
}

impl LogicalProperty {
    pub fn new(schema: Vec<ColumnRef>) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    /// Output columns, in order.
    pub fn schema(&self) -> &[ColumnRef] {
        &self.schema
    }

    pub fn index_of(&self, column: &ColumnRef) -> Option<usize> {
        self.schema.iter().position(|c| c == column)
    }
}
