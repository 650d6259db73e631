use std::fmt;

use enum_as_inner::EnumAsInner;

use crate::operator::{
    fmt_operator, Group, Join, Limit, OperatorTrait, Project, Select, Sort, Source, Subquery,
    Union, VirtualGroup,
};

/// Logical relational operator.
#[derive(Clone, Debug, Hash, Eq, PartialEq, EnumAsInner)]
pub enum LogicalOperator {
    LogicalSource(Source),
    LogicalSelect(Select),
    LogicalProject(Project),
    LogicalJoin(Join),
    LogicalGroup(Group),
    LogicalSort(Sort),
    LogicalLimit(Limit),
    LogicalUnion(Union),
    LogicalSubquery(Subquery),
    LogicalVirtualGroup(VirtualGroup),
}

impl LogicalOperator {
    pub fn name(&self) -> &'static str {
        match self {
            LogicalOperator::LogicalSource(_) => "Source",
            LogicalOperator::LogicalSelect(_) => "Select",
            LogicalOperator::LogicalProject(_) => "Project",
            LogicalOperator::LogicalJoin(_) => "Join",
            LogicalOperator::LogicalGroup(_) => "Group",
            LogicalOperator::LogicalSort(_) => "Sort",
            LogicalOperator::LogicalLimit(_) => "Limit",
            LogicalOperator::LogicalUnion(_) => "Union",
            LogicalOperator::LogicalSubquery(_) => "Subquery",
            LogicalOperator::LogicalVirtualGroup(_) => "VirtualGroup",
        }
    }

    pub(super) fn as_trait(&self) -> &dyn OperatorTrait {
        match self {
            LogicalOperator::LogicalSource(op) => op,
            LogicalOperator::LogicalSelect(op) => op,
            LogicalOperator::LogicalProject(op) => op,
            LogicalOperator::LogicalJoin(op) => op,
            LogicalOperator::LogicalGroup(op) => op,
            LogicalOperator::LogicalSort(op) => op,
            LogicalOperator::LogicalLimit(op) => op,
            LogicalOperator::LogicalUnion(op) => op,
            LogicalOperator::LogicalSubquery(op) => op,
            LogicalOperator::LogicalVirtualGroup(op) => op,
        }
    }
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOperator::LogicalSource(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalSelect(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalProject(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalJoin(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalGroup(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalSort(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalLimit(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalUnion(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalSubquery(op) => fmt_operator(f, self.name(), op),
            LogicalOperator::LogicalVirtualGroup(op) => fmt_operator(f, self.name(), op),
        }
    }
}
