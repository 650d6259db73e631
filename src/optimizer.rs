//! The optimizer abstraction shared by rules and the cost estimator.

use std::cell::Cell;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::config::OptimizerConfig;
use crate::cost::CostEstimate;
use crate::error::OptResult;
use crate::expr::ColumnRef;
use crate::operator::Operator;
use crate::plan::Plan;
use crate::properties::LogicalProperty;
use crate::stat::CardinalityHints;

/// One planning session's read-only inputs, plus the name generators of the session.
pub struct OptimizerContext {
    registry: Arc<CapabilityRegistry>,
    hints: Arc<dyn CardinalityHints>,
    config: OptimizerConfig,
    next_value_set: Cell<usize>,
    next_inline_view: Cell<usize>,
}

impl OptimizerContext {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        hints: Arc<dyn CardinalityHints>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            registry,
            hints,
            config,
            next_value_set: Cell::new(0),
            next_inline_view: Cell::new(0),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn hints(&self) -> &dyn CardinalityHints {
        self.hints.as_ref()
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Fresh dependent value set name, `dvs_0`, `dvs_1`, ...
    pub fn next_value_set_name(&self) -> String {
        let id = self.next_value_set.get();
        self.next_value_set.set(id + 1);
        format!("dvs_{}", id)
    }

    /// Fresh derived table alias, `v_0`, `v_1`, ...
    pub fn next_inline_view_alias(&self) -> String {
        let id = self.next_inline_view.get();
        self.next_inline_view.set(id + 1);
        format!("v_{}", id)
    }
}

pub trait OptExpr {
    type InputHandle;
    type O: Optimizer;

    fn operator(&self) -> &Operator;

    fn logical_prop(&self) -> &LogicalProperty;

    fn inputs_len(&self, opt: &Self::O) -> usize;

    fn input_at(&self, idx: usize, opt: &Self::O) -> Self::InputHandle;
}

pub trait OptExprHandle: Copy + Eq + Hash + Debug {
    type O: Optimizer;
}

pub trait Optimizer: Sized {
    type Expr: OptExpr<O = Self, InputHandle = Self::ExprHandle>;
    type ExprHandle: OptExprHandle<O = Self>;

    fn context(&self) -> &OptimizerContext;

    fn expr_at(&self, expr_handle: Self::ExprHandle) -> &Self::Expr;

    /// Cost estimate of the sub-tree rooted at `expr_handle`.
    fn estimate(&self, expr_handle: Self::ExprHandle) -> CostEstimate;

    fn find_best_plan(self) -> OptResult<Plan>;

    fn operator_at(&self, expr_handle: Self::ExprHandle) -> &Operator {
        self.expr_at(expr_handle).operator()
    }

    fn schema_at(&self, expr_handle: Self::ExprHandle) -> &[ColumnRef] {
        self.expr_at(expr_handle).logical_prop().schema()
    }

    fn inputs_of(&self, expr_handle: Self::ExprHandle) -> Vec<Self::ExprHandle> {
        let expr = self.expr_at(expr_handle);
        (0..expr.inputs_len(self))
            .map(|idx| expr.input_at(idx, self))
            .collect()
    }
}
