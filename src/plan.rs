use std::collections::HashSet;
use std::mem::swap;
use std::sync::Arc;

use anyhow::anyhow;

use crate::command::{SelectItem, SortKey};
use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};
use crate::operator::LogicalOperator::{
    LogicalGroup, LogicalJoin, LogicalLimit, LogicalProject, LogicalSelect, LogicalSort,
    LogicalSource, LogicalSubquery, LogicalUnion, LogicalVirtualGroup,
};
use crate::operator::Operator::Logical;
use crate::operator::{
    Group, Join, JoinKind, Limit, Operator, Project, Select, Sort, Source, Subquery, Union,
    VirtualGroup,
};
use crate::properties::LogicalProperty;
use crate::stat::Statistics;

pub type PlanNodeId = u32;

pub type PlanNodeRef = Arc<PlanNode>;

/// One node in a plan.
///
/// This is used in both input and output of the planner: the logical command tree handed in
/// and the physical plan node tree handed to execution share this representation.
#[derive(Debug)]
pub struct PlanNode {
    id: PlanNodeId,
    operator: Operator,
    inputs: Vec<PlanNodeRef>,
    logical_prop: LogicalProperty,
    stat: Option<Statistics>,
}

/// The `eq` should ignore `id`.
impl PartialEq for PlanNode {
    fn eq(&self, other: &Self) -> bool {
        self.operator == other.operator
            && self.inputs == other.inputs
            && self.logical_prop == other.logical_prop
            && self.stat == other.stat
    }
}

/// A query plan.
///
/// A plan is a single root tree: every node is owned by exactly one parent.
#[derive(PartialEq, Debug, Clone)]
pub struct Plan {
    root: PlanNodeRef,
}

/// Breath first iterator of a single root plan.
struct BFSPlanNodeIter {
    visited: HashSet<PlanNodeId>,
    cur_level: Vec<PlanNodeRef>,
    next_level: Vec<PlanNodeRef>,
}

impl Iterator for BFSPlanNodeIter {
    type Item = PlanNodeRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_level.is_empty() {
            swap(&mut self.cur_level, &mut self.next_level);
            self.cur_level.reverse();
        }

        if let Some(p) = self.cur_level.pop() {
            for input in &p.inputs {
                if self.visited.insert(input.id) {
                    self.next_level.push(input.clone());
                }
            }

            Some(p)
        } else {
            None
        }
    }
}

impl Plan {
    pub fn new(root: PlanNodeRef) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PlanNodeRef {
        self.root.clone()
    }

    pub fn bfs_iterator(&self) -> impl Iterator<Item = PlanNodeRef> {
        let mut visited = HashSet::new();
        visited.insert(self.root.id);

        BFSPlanNodeIter {
            cur_level: vec![self.root.clone()],
            next_level: vec![],
            visited,
        }
    }

    /// Operators of all nodes matching `f`, in breadth first order.
    pub fn find_all<F>(&self, mut f: F) -> Vec<PlanNodeRef>
    where
        F: FnMut(&Operator) -> bool,
    {
        self.bfs_iterator().filter(|n| f(n.operator())).collect()
    }
}

impl PlanNode {
    /// Creates a node, deriving its output schema from its inputs.
    pub fn new(id: PlanNodeId, operator: Operator, inputs: Vec<PlanNodeRef>) -> OptResult<Self> {
        PlanNodeBuilder::new(id, &operator).add_inputs(inputs).build()
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn id(&self) -> PlanNodeId {
        self.id
    }

    pub fn inputs(&self) -> &[PlanNodeRef] {
        &self.inputs
    }

    pub fn logical_prop(&self) -> &LogicalProperty {
        &self.logical_prop
    }

    pub fn schema(&self) -> &[ColumnRef] {
        self.logical_prop.schema()
    }

    pub fn stat(&self) -> Option<&Statistics> {
        self.stat.as_ref()
    }
}

pub struct PlanNodeBuilder {
    id: PlanNodeId,
    operator: Operator,
    inputs: Vec<PlanNodeRef>,
    logical_prop: Option<LogicalProperty>,
    stat: Option<Statistics>,
}

impl PlanNodeBuilder {
    pub fn new(id: PlanNodeId, operator: &Operator) -> Self {
        Self {
            id,
            operator: operator.clone(),
            inputs: vec![],
            logical_prop: None,
            stat: None,
        }
    }

    pub fn add_inputs<I>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = PlanNodeRef>,
    {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_logical_prop(mut self, logical_prop: Option<LogicalProperty>) -> Self {
        self.logical_prop = logical_prop;
        self
    }

    pub fn with_statistics(mut self, stat: Option<Statistics>) -> Self {
        self.stat = stat;
        self
    }

    pub fn build(self) -> OptResult<PlanNode> {
        let logical_prop = match self.logical_prop {
            Some(prop) => prop,
            None => {
                let input_schemas: Vec<&[ColumnRef]> =
                    self.inputs.iter().map(|i| i.schema()).collect();
                LogicalProperty::new(self.operator.derive_schema(&input_schemas)?)
            }
        };
        Ok(PlanNode {
            id: self.id,
            operator: self.operator,
            inputs: self.inputs,
            logical_prop,
            stat: self.stat,
        })
    }
}

/// Builds logical plans bottom up. Every operator method wraps the current root.
///
/// The first failure (an operator without input, or a schema mismatch) is kept and returned
/// by [`LogicalPlanBuilder::build`].
#[derive(Default)]
pub struct LogicalPlanBuilder {
    root: Option<PlanNodeRef>,
    next_plan_node_id: PlanNodeId,
    error: Option<anyhow::Error>,
}

impl LogicalPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset_root(&mut self, operator: Operator, extra_inputs: Vec<PlanNodeRef>) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        let mut inputs = vec![];
        if !matches!(operator, Logical(LogicalSource(_))) {
            match self.root.take() {
                Some(root) => inputs.push(root),
                None => {
                    self.error = Some(anyhow!("{} requires an input", operator.name()));
                    return self;
                }
            }
        }
        inputs.extend(extra_inputs);
        match PlanNode::new(self.next_plan_node_id, operator, inputs) {
            Ok(node) => self.root = Some(Arc::new(node)),
            Err(e) => self.error = Some(e),
        }
        self.next_plan_node_id += 1;
        self
    }

    pub fn source(&mut self, source: Source) -> &mut Self {
        self.reset_root(Logical(LogicalSource(source)), vec![])
    }

    pub fn select(&mut self, criteria: Expr) -> &mut Self {
        self.reset_root(Logical(LogicalSelect(Select::new(criteria))), vec![])
    }

    pub fn project(&mut self, items: Vec<SelectItem>) -> &mut Self {
        self.reset_root(Logical(LogicalProject(Project::new(items, false))), vec![])
    }

    pub fn project_distinct(&mut self, items: Vec<SelectItem>) -> &mut Self {
        self.reset_root(Logical(LogicalProject(Project::new(items, true))), vec![])
    }

    pub fn join(&mut self, kind: JoinKind, criteria: Vec<Expr>, right: PlanNodeRef) -> &mut Self {
        self.join_with(Join::new(kind, criteria), right)
    }

    /// Joins with an explicitly constructed join, e.g. one carrying dependency hints.
    pub fn join_with(&mut self, join: Join, right: PlanNodeRef) -> &mut Self {
        self.reset_root(Logical(LogicalJoin(join)), vec![right])
    }

    pub fn group(&mut self, keys: Vec<SelectItem>, aggregates: Vec<SelectItem>) -> &mut Self {
        self.reset_root(Logical(LogicalGroup(Group::new(keys, aggregates))), vec![])
    }

    pub fn sort(&mut self, keys: Vec<SortKey>) -> &mut Self {
        self.reset_root(Logical(LogicalSort(Sort::new(keys))), vec![])
    }

    pub fn limit(&mut self, offset: u64, count: Option<u64>) -> &mut Self {
        self.reset_root(Logical(LogicalLimit(Limit::new(offset, count))), vec![])
    }

    /// Unions the current root with `others`, the current root being the first branch.
    pub fn union(&mut self, all: bool, others: Vec<PlanNodeRef>) -> &mut Self {
        self.reset_root(Logical(LogicalUnion(Union::new(all))), others)
    }

    /// Filters or extends the current root by a subquery over `inner`.
    pub fn subquery(&mut self, subquery: Subquery, inner: PlanNodeRef) -> &mut Self {
        self.reset_root(Logical(LogicalSubquery(subquery)), vec![inner])
    }

    pub fn virtual_group<S: Into<String>>(&mut self, name: S, columns: &[&str]) -> &mut Self {
        self.reset_root(
            Logical(LogicalVirtualGroup(VirtualGroup::new(name, columns))),
            vec![],
        )
    }

    /// Consume current plan, but not rest state, e.g. plan node id.
    ///
    /// This is useful for building multi child plan, e.g. join.
    pub fn build(&mut self) -> OptResult<Plan> {
        if let Some(e) = self.error.take() {
            self.root = None;
            return Err(e);
        }
        let root = self
            .root
            .take()
            .ok_or_else(|| anyhow!("empty logical plan"))?;
        Ok(Plan { root })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};

    #[test]
    fn test_builder_derives_schema() {
        let mut builder = LogicalPlanBuilder::new();
        let right = builder
            .source(Source::new("s2", "b", "t2", &["k", "w"]))
            .build()
            .unwrap()
            .root();
        let plan = builder
            .source(Source::new("s1", "a", "t1", &["k", "v"]))
            .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
            .select(col("a", "v").gt(lit(1)))
            .build()
            .unwrap();

        let root = plan.root();
        assert_eq!(root.schema().len(), 4);
        assert_eq!(root.id(), 3);
        let ids: Vec<PlanNodeId> = plan.bfs_iterator().map(|n| n.id()).collect();
        assert_eq!(ids, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_builder_reports_missing_input() {
        let mut builder = LogicalPlanBuilder::new();
        assert!(builder.select(lit(true)).build().is_err());
        // The error is consumed, the builder can be reused.
        assert!(builder
            .source(Source::new("s1", "a", "t1", &["k"]))
            .build()
            .is_ok());
    }

    #[test]
    fn test_plan_eq_ignores_ids() {
        let build = |skip: u32| {
            let mut builder = LogicalPlanBuilder::new();
            builder.next_plan_node_id = skip;
            builder
                .source(Source::new("s1", "a", "t1", &["k"]))
                .limit(0, Some(1))
                .build()
                .unwrap()
        };
        assert_eq!(build(0), build(10));
    }
}
