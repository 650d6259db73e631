//! Rewrite rules.
//!
//! A rule matches a [`Pattern`] rooted at one plan node and may emit one replacement
//! expression. Rules never mutate the plan themselves; the optimizer splices the result in.

use enum_dispatch::enum_dispatch;
use strum_macros::IntoStaticStr;

use crate::error::OptResult;
use crate::operator::Operator;
use crate::optimizer::Optimizer;

mod assign_access;
pub use assign_access::*;
mod dependent_join;
pub use dependent_join::*;
mod implement;
pub use implement::*;
mod join_strategy;
pub use join_strategy::*;
mod limit_sort;
pub use limit_sort::*;
mod merge_virtual;
pub use merge_virtual::*;
mod push_select;
pub use push_select::*;
mod subquery_pushdown;
pub use subquery_pushdown::*;

pub enum OptExprNode<O: Optimizer> {
    /// A new operator, or a copy of a matched one.
    OperatorNode(Operator),
    /// An existing node, reused as is.
    ExprHandleNode(O::ExprHandle),
}

/// Expression tree produced by pattern binding and by rules.
pub struct OptExpression<O: Optimizer> {
    node: OptExprNode<O>,
    /// The plan node this expression was bound from, if any.
    origin: Option<O::ExprHandle>,
    inputs: Vec<OptExpression<O>>,
}

impl<O: Optimizer> OptExpression<O> {
    pub fn with_operator<P, I>(operator: P, inputs: I) -> Self
    where
        P: Into<Operator>,
        I: IntoIterator<Item = OptExpression<O>>,
    {
        Self {
            node: OptExprNode::OperatorNode(operator.into()),
            origin: None,
            inputs: inputs.into_iter().collect(),
        }
    }

    pub fn from_handle(handle: O::ExprHandle) -> Self {
        Self {
            node: OptExprNode::ExprHandleNode(handle),
            origin: Some(handle),
            inputs: vec![],
        }
    }

    pub(crate) fn matched(handle: O::ExprHandle, operator: Operator, inputs: Vec<Self>) -> Self {
        Self {
            node: OptExprNode::OperatorNode(operator),
            origin: Some(handle),
            inputs,
        }
    }

    pub fn node(&self) -> &OptExprNode<O> {
        &self.node
    }

    pub fn inputs(&self) -> &[OptExpression<O>] {
        &self.inputs
    }

    pub fn input(&self, idx: usize) -> &OptExpression<O> {
        &self.inputs[idx]
    }

    pub fn into_inputs(self) -> Vec<OptExpression<O>> {
        self.inputs
    }

    /// Handle of the plan node this expression stands for.
    pub fn handle(&self) -> Option<O::ExprHandle> {
        self.origin
    }

    pub fn operator<'a>(&'a self, opt: &'a O) -> &'a Operator {
        match &self.node {
            OptExprNode::OperatorNode(operator) => operator,
            OptExprNode::ExprHandleNode(handle) => opt.operator_at(*handle),
        }
    }

    /// The same plan node, reused without copying. Falls back to a copy of the operator for
    /// expressions built by rules.
    pub fn reuse(&self) -> OptExpression<O> {
        match self.origin {
            Some(handle) => Self::from_handle(handle),
            None => match &self.node {
                OptExprNode::OperatorNode(operator) => Self {
                    node: OptExprNode::OperatorNode(operator.clone()),
                    origin: None,
                    inputs: self.inputs.iter().map(|i| i.reuse()).collect(),
                },
                OptExprNode::ExprHandleNode(handle) => Self::from_handle(*handle),
            },
        }
    }
}

pub enum PatternChildrenPredicate {
    /// Inputs are not matched; they are bound as handles.
    None,
    /// One pattern per input.
    Predicate(Vec<Pattern>),
}

pub struct Pattern {
    pub predicate: fn(&Operator) -> bool,
    pub children: PatternChildrenPredicate,
}

impl Pattern {
    pub fn leaf(predicate: fn(&Operator) -> bool) -> Self {
        Self {
            predicate,
            children: PatternChildrenPredicate::None,
        }
    }

    pub fn with_children(predicate: fn(&Operator) -> bool, children: Vec<Pattern>) -> Self {
        Self {
            predicate,
            children: PatternChildrenPredicate::Predicate(children),
        }
    }
}

pub struct RuleResult<O: Optimizer> {
    results: Vec<OptExpression<O>>,
}

impl<O: Optimizer> Default for RuleResult<O> {
    fn default() -> Self {
        Self { results: vec![] }
    }
}

impl<O: Optimizer> RuleResult<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, expr: OptExpression<O>) {
        self.results.push(expr);
    }

    pub fn results(&self) -> impl Iterator<Item = &OptExpression<O>> {
        self.results.iter()
    }

    pub fn into_results(self) -> Vec<OptExpression<O>> {
        self.results
    }
}

#[enum_dispatch]
pub trait Rule {
    /// Emits at most one replacement for `input` into `result`. Emitting nothing means the
    /// rule does not apply.
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()>;

    fn pattern(&self) -> &Pattern;
}

#[enum_dispatch(Rule)]
#[derive(Clone, Debug, IntoStaticStr)]
pub enum RuleImpl {
    PushSelectCriteria,
    AssignAccess,
    MergeVirtual,
    SubqueryPushdown,
    DependentJoinRule,
    JoinStrategyRule,
    LimitSortPushdown,
    ImplementLocal,
}

/// Rules of the criteria placement phase, matched top down.
pub fn criteria_placement_rules() -> Vec<RuleImpl> {
    vec![PushSelectCriteria.into()]
}

/// Rules of the physical planning phase, matched bottom up, in priority order.
pub fn physical_rules() -> Vec<RuleImpl> {
    vec![
        AssignAccess.into(),
        MergeVirtual.into(),
        SubqueryPushdown.into(),
        DependentJoinRule.into(),
        JoinStrategyRule.into(),
        LimitSortPushdown.into(),
        ImplementLocal.into(),
    ]
}
