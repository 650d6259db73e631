use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::command::{Command, SelectItem};
use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};
use crate::operator::LogicalOperator::LogicalSubquery;
use crate::operator::PhysicalOperator::PhysicalAccess;
use crate::operator::{Access, Operator, Subquery, SubqueryKind};
use crate::optimizer::Optimizer;
use crate::rules::assign_access::access_of;
use crate::rules::{OptExpression, Pattern, Rule, RuleResult};

lazy_static! {
    static ref PATTERN: Pattern =
        Pattern::leaf(|op| matches!(op, Operator::Logical(LogicalSubquery(_))));
}

/// Nests a subquery into the command of its outer access when both run on the same source
/// and the source validates the nested form.
///
/// Correlated references are rewritten to the outer command's FROM-level columns. Subqueries
/// which cannot be nested are left to the dependent select and project operators.
#[derive(Clone, Debug)]
pub struct SubqueryPushdown;

impl Rule for SubqueryPushdown {
    fn apply<O: Optimizer>(
        &self,
        input: OptExpression<O>,
        opt: &O,
        result: &mut RuleResult<O>,
    ) -> OptResult<()> {
        let subquery = match input.operator(opt) {
            Operator::Logical(LogicalSubquery(subquery)) => subquery,
            _ => return Ok(()),
        };
        let (outer, inner) = match (
            access_of(input.input(0), opt),
            access_of(input.input(1), opt),
        ) {
            (Some(outer), Some(inner)) if outer.source() == inner.source() => (outer, inner),
            _ => return Ok(()),
        };
        let command = match nest(subquery, outer, inner) {
            Some(command) => command,
            None => return Ok(()),
        };
        match opt.context().registry().validate(outer.source(), &command) {
            Ok(()) => {
                result.add(OptExpression::with_operator(
                    PhysicalAccess(outer.merge(inner, command)),
                    [],
                ));
            }
            Err(e) => debug!("Subquery {} stays dependent: {}", subquery, e),
        }
        Ok(())
    }

    fn pattern(&self) -> &Pattern {
        &PATTERN
    }
}

/// The outer command with the inner command nested as a predicate or select item.
fn nest(subquery: &Subquery, outer: &Access, inner: &Access) -> Option<Command> {
    let free = inner.command().free_columns();
    if !free.is_empty() {
        let grouped = inner.command().as_query().map_or(false, |q| q.is_grouped());
        if grouped || outer.command().as_query().is_none() {
            return None;
        }
    }
    if !from_aliases(outer.command())
        .is_disjoint(&from_aliases(inner.command()))
    {
        return None;
    }

    // Correlated columns name outer output columns; inside the outer command they must name
    // what those columns are computed from.
    let mut rewrites: HashMap<ColumnRef, Expr> = HashMap::new();
    if let Some(query) = outer.command().as_query() {
        let output = query.output_map();
        for column in &free {
            match output.get(column) {
                Some(e @ Expr::Column(_)) => {
                    rewrites.insert(column.clone(), e.clone());
                }
                _ => return None,
            }
        }
    }
    let nested = Box::new(inner.command().transform_exprs(&mut |e| match e {
        Expr::Column(c) => rewrites.get(c).cloned(),
        _ => None,
    }));

    let predicate = match subquery.kind() {
        SubqueryKind::Exists => Expr::Exists(nested),
        SubqueryKind::In { expr } => Expr::InSubquery {
            expr: Box::new(expr.clone()),
            subquery: nested,
        },
        SubqueryKind::Compare { expr, op } => Expr::Binary {
            op: *op,
            left: Box::new(expr.clone()),
            right: Box::new(Expr::ScalarSubquery(nested)),
        },
        SubqueryKind::Scalar { alias } => {
            let mut items: Vec<SelectItem> = outer
                .command()
                .output_columns()
                .into_iter()
                .map(SelectItem::column)
                .collect();
            items.push(SelectItem::new(Expr::ScalarSubquery(nested), alias.clone()));
            return outer.command().push_projection(&items, false);
        }
    };
    let predicate = if subquery.negated() {
        predicate.not()
    } else {
        predicate
    };
    outer.command().push_criteria(&predicate)
}

fn from_aliases(command: &Command) -> BTreeSet<String> {
    match command {
        Command::Query(q) => q.from.aliases(),
        Command::SetQuery(s) => s.branches.iter().flat_map(from_aliases).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scan_command;
    use crate::expr::{col, lit};

    fn access(alias: &str, table: &str) -> Access {
        Access::new("s1".into(), scan_command(alias, table, &["k", "v"]), vec![])
    }

    #[test]
    fn test_correlated_exists_rewrites_outer_reference() {
        let outer = access("a", "t1");
        let inner_command = scan_command("b", "t2", &["k"])
            .push_criteria(&col("b", "k").eq(col("a", "k")))
            .unwrap();
        let inner = outer.with_command(inner_command);
        let command = nest(&Subquery::new(SubqueryKind::Exists).negate(), &outer, &inner).unwrap();
        assert_eq!(
            command.to_string(),
            "SELECT a.k, a.v FROM t1 AS a WHERE NOT (EXISTS (SELECT b.k FROM t2 AS b WHERE b.k = a.k))"
        );
    }

    #[test]
    fn test_alias_collision_declines() {
        let outer = access("a", "t1");
        let inner = access("a", "t2");
        let kind = SubqueryKind::In {
            expr: col("a", "k"),
        };
        assert!(nest(&Subquery::new(kind), &outer, &inner).is_none());
    }

    #[test]
    fn test_correlated_grouped_inner_declines() {
        let outer = access("a", "t1");
        let grouped = scan_command("b", "t2", &["k", "v"])
            .push_criteria(&col("b", "k").eq(col("a", "k")))
            .and_then(|c| {
                c.push_group(
                    &[],
                    &[SelectItem::new(crate::expr::count_star(), ColumnRef::new("b", "n"))],
                )
            })
            .unwrap();
        let inner = outer.with_command(grouped);
        let kind = SubqueryKind::Compare {
            expr: lit(1),
            op: crate::expr::BinaryOp::Lt,
        };
        assert!(nest(&Subquery::new(kind), &outer, &inner).is_none());
    }
}
