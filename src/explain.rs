//! Human readable rendering of plans.

use prettytable::format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR;
use prettytable::Table;

use crate::plan::{Plan, PlanNodeRef};

/// Nodes in depth first pre-order with their depth.
fn preorder(plan: &Plan) -> Vec<(usize, PlanNodeRef)> {
    let mut out = vec![];
    let mut stack = vec![(0, plan.root())];
    while let Some((depth, node)) = stack.pop() {
        stack.extend(node.inputs().iter().rev().map(|i| (depth + 1, i.clone())));
        out.push((depth, node));
    }
    out
}

fn rows(node: &PlanNodeRef) -> String {
    node.stat()
        .and_then(|s| s.row_count())
        .map_or_else(|| "?".to_string(), |r| format!("{:.0}", r))
}

/// One node per line, inputs indented under their parent.
///
/// ```text
/// JoinStrategy(INNER JOIN ON a.k = b.k, nested loop, dependent on dvs_0) rows=10
///   Access(x: SELECT a.k AS k FROM t1 AS a) rows=10
///   DependentAccess(...) rows=?
/// ```
pub fn explain(plan: &Plan) -> String {
    preorder(plan)
        .into_iter()
        .map(|(depth, node)| {
            format!(
                "{}{} rows={}\n",
                "  ".repeat(depth),
                node.operator(),
                rows(&node)
            )
        })
        .collect()
}

/// Tabular rendering with one row per node.
pub fn explain_table(plan: &Plan) -> Table {
    let mut table = table!(["Id", "Node", "Rows", "Inputs", "Detail"]);
    table.set_format(*FORMAT_NO_BORDER_LINE_SEPARATOR);
    for (depth, node) in preorder(plan) {
        let inputs = node
            .inputs()
            .iter()
            .map(|i| i.id().to_string())
            .collect::<Vec<_>>()
            .join(",");
        table.add_row(row![
            node.id(),
            format!("{}{}", "  ".repeat(depth), node.operator().name()),
            rows(&node),
            inputs,
            node.operator()
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};
    use crate::operator::Source;
    use crate::plan::LogicalPlanBuilder;

    fn plan() -> Plan {
        LogicalPlanBuilder::new()
            .source(Source::new("x", "a", "t", &["k"]))
            .select(col("a", "k").eq(lit(1)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_explain_indents_inputs() {
        let text = explain(&plan());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Select("));
        assert!(lines[1].starts_with("  Source("));
        assert!(lines[1].ends_with("rows=?"));
    }

    #[test]
    fn test_explain_table_has_row_per_node() {
        let table = explain_table(&plan());
        assert_eq!(table.len(), 3);
    }
}
