use std::fmt;

use enum_as_inner::EnumAsInner;

use crate::expr::Expr;
use crate::operator::{
    fmt_operator, Access, DependentAccess, DupRemove, Group, JoinAlgorithm, JoinStrategy, Limit,
    OperatorTrait, Project, Select, Sort, Subquery, UnionAll,
};

/// Physical operator: one node of the executable plan.
#[derive(Clone, Debug, Hash, Eq, PartialEq, EnumAsInner)]
pub enum PhysicalOperator {
    PhysicalAccess(Access),
    PhysicalDependentAccess(DependentAccess),
    PhysicalJoinStrategy(JoinStrategy),
    PhysicalGrouping(Group),
    PhysicalSort(Sort),
    PhysicalProject(Project),
    PhysicalSelect(Select),
    PhysicalUnionAll(UnionAll),
    PhysicalDupRemove(DupRemove),
    PhysicalLimit(Limit),
    /// Filter by a subquery evaluated per distinct correlation key.
    PhysicalDependentSelect(Subquery),
    /// Scalar subquery projection evaluated per distinct correlation key.
    PhysicalDependentProject(Subquery),
}

impl PhysicalOperator {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOperator::PhysicalAccess(_) => "Access",
            PhysicalOperator::PhysicalDependentAccess(_) => "DependentAccess",
            PhysicalOperator::PhysicalJoinStrategy(_) => "JoinStrategy",
            PhysicalOperator::PhysicalGrouping(_) => "Grouping",
            PhysicalOperator::PhysicalSort(_) => "Sort",
            PhysicalOperator::PhysicalProject(_) => "Project",
            PhysicalOperator::PhysicalSelect(_) => "Select",
            PhysicalOperator::PhysicalUnionAll(_) => "UnionAll",
            PhysicalOperator::PhysicalDupRemove(_) => "DupRemove",
            PhysicalOperator::PhysicalLimit(_) => "Limit",
            PhysicalOperator::PhysicalDependentSelect(_) => "DependentSelect",
            PhysicalOperator::PhysicalDependentProject(_) => "DependentProject",
        }
    }

    pub(super) fn as_trait(&self) -> &dyn OperatorTrait {
        match self {
            PhysicalOperator::PhysicalAccess(op) => op,
            PhysicalOperator::PhysicalDependentAccess(op) => op,
            PhysicalOperator::PhysicalJoinStrategy(op) => op,
            PhysicalOperator::PhysicalGrouping(op) => op,
            PhysicalOperator::PhysicalSort(op) => op,
            PhysicalOperator::PhysicalProject(op) => op,
            PhysicalOperator::PhysicalSelect(op) => op,
            PhysicalOperator::PhysicalUnionAll(op) => op,
            PhysicalOperator::PhysicalDupRemove(op) => op,
            PhysicalOperator::PhysicalLimit(op) => op,
            PhysicalOperator::PhysicalDependentSelect(op) => op,
            PhysicalOperator::PhysicalDependentProject(op) => op,
        }
    }

    /// The pushed access of an access or dependent access node.
    pub fn access(&self) -> Option<&Access> {
        match self {
            PhysicalOperator::PhysicalAccess(access) => Some(access),
            PhysicalOperator::PhysicalDependentAccess(dep) => Some(dep.access()),
            _ => None,
        }
    }

    /// Expressions the engine evaluates itself for this node.
    pub fn local_exprs(&self) -> Vec<&Expr> {
        match self {
            PhysicalOperator::PhysicalSelect(select) => vec![select.criteria()],
            PhysicalOperator::PhysicalProject(project) => {
                project.items().iter().map(|item| &item.expr).collect()
            }
            PhysicalOperator::PhysicalGrouping(group) => group
                .keys()
                .iter()
                .chain(group.aggregates())
                .map(|item| &item.expr)
                .collect(),
            PhysicalOperator::PhysicalSort(sort) => sort.keys().iter().map(|k| &k.expr).collect(),
            PhysicalOperator::PhysicalJoinStrategy(join) => {
                let mut exprs: Vec<&Expr> = join.criteria().iter().collect();
                if let JoinAlgorithm::Merge {
                    left_keys,
                    right_keys,
                } = join.algorithm()
                {
                    exprs.extend(left_keys.iter().chain(right_keys));
                }
                exprs.extend(join.dependent().map(|d| &d.driving_key));
                exprs
            }
            PhysicalOperator::PhysicalDependentSelect(subquery)
            | PhysicalOperator::PhysicalDependentProject(subquery) => subquery.outer_exprs(),
            PhysicalOperator::PhysicalAccess(_)
            | PhysicalOperator::PhysicalDependentAccess(_)
            | PhysicalOperator::PhysicalUnionAll(_)
            | PhysicalOperator::PhysicalDupRemove(_)
            | PhysicalOperator::PhysicalLimit(_) => vec![],
        }
    }
}

impl fmt::Display for PhysicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalOperator::PhysicalAccess(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalDependentAccess(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalJoinStrategy(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalGrouping(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalSort(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalProject(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalSelect(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalUnionAll(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalDupRemove(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalLimit(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalDependentSelect(op) => fmt_operator(f, self.name(), op),
            PhysicalOperator::PhysicalDependentProject(op) => fmt_operator(f, self.name(), op),
        }
    }
}
