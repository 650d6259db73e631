use crate::heuristic::{HepNodeId, HepOptimizer};
use crate::optimizer::Optimizer;
use crate::rules::{OptExpression, Pattern, PatternChildrenPredicate};

/// Binds a rule pattern to the sub-tree rooted at one node.
///
/// A heuristic plan holds exactly one expression per node, so there is at most one binding.
pub(super) struct Binding<'a, 'b> {
    expr_handle: HepNodeId,
    pattern: &'a Pattern,
    optimizer: &'b HepOptimizer,
    done: bool,
}

impl<'a, 'b> Binding<'a, 'b> {
    pub(super) fn new(
        expr_handle: HepNodeId,
        pattern: &'a Pattern,
        optimizer: &'b HepOptimizer,
    ) -> Self {
        Self {
            expr_handle,
            pattern,
            optimizer,
            done: false,
        }
    }

    fn bind(&self, expr_handle: HepNodeId, pattern: &Pattern) -> Option<OptExpression<HepOptimizer>> {
        let operator = self.optimizer.operator_at(expr_handle);
        if !(pattern.predicate)(operator) {
            return None;
        }
        let inputs = self.optimizer.inputs_of(expr_handle);
        let input_exprs = match &pattern.children {
            PatternChildrenPredicate::None => {
                inputs.into_iter().map(OptExpression::from_handle).collect()
            }
            PatternChildrenPredicate::Predicate(children) => {
                if children.len() != inputs.len() {
                    return None;
                }
                inputs
                    .into_iter()
                    .zip(children)
                    .map(|(input, child)| self.bind(input, child))
                    .collect::<Option<Vec<_>>>()?
            }
        };
        Some(OptExpression::matched(
            expr_handle,
            operator.clone(),
            input_exprs,
        ))
    }
}

impl<'a, 'b> Iterator for Binding<'a, 'b> {
    type Item = OptExpression<HepOptimizer>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.done = true;
        self.bind(self.expr_handle, self.pattern)
    }
}
