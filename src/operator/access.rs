use std::fmt;

use itertools::Itertools;

use crate::capability::SourceId;
use crate::command::{Command, FromClause};
use crate::error::OptResult;
use crate::expr::{ColumnRef, Expr};
use crate::operator::{AccessPattern, OperatorTrait};

/// A region pushed to one source as a single command.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Access {
    source: SourceId,
    command: Command,
    access_patterns: Vec<AccessPattern>,
}

impl Access {
    pub fn new(source: SourceId, command: Command, access_patterns: Vec<AccessPattern>) -> Self {
        Self {
            source,
            command,
            access_patterns,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn access_patterns(&self) -> &[AccessPattern] {
        &self.access_patterns
    }

    /// Same source and patterns, different command.
    pub fn with_command(&self, command: Command) -> Self {
        Self {
            source: self.source.clone(),
            command,
            access_patterns: self.access_patterns.clone(),
        }
    }

    /// Access over the combined command of `self` and `other`.
    pub fn merge(&self, other: &Access, command: Command) -> Self {
        let mut access_patterns = self.access_patterns.clone();
        access_patterns.extend(other.access_patterns.iter().cloned());
        Self {
            source: self.source.clone(),
            command,
            access_patterns,
        }
    }

    /// True when, for every group declaring access patterns, at least one of its patterns is
    /// fully bound by the command's criteria.
    pub fn is_satisfied(&self) -> bool {
        let conjuncts = criteria_conjuncts(&self.command);
        let bound = |pattern: &AccessPattern| {
            pattern
                .columns()
                .iter()
                .all(|c| conjuncts.iter().any(|e| binds(e, c)))
        };
        self.access_patterns
            .iter()
            .into_group_map_by(|p| p.columns().first().map(|c| c.group.clone()))
            .values()
            .all(|patterns| patterns.iter().any(|p| bound(p)))
    }
}

/// Every conjunct of every WHERE and ON clause of `command`, nested derived tables, set
/// branches and subqueries included.
fn criteria_conjuncts(command: &Command) -> Vec<Expr> {
    let mut out = vec![];
    let mut commands = vec![command];
    while let Some(command) = commands.pop() {
        match command {
            Command::SetQuery(s) => commands.extend(s.branches.iter()),
            Command::Query(q) => {
                out.extend(q.criteria.iter().flat_map(|c| c.conjuncts()));
                for expr in q.expressions() {
                    commands.extend(expr.subqueries());
                }
                let mut clauses = vec![&q.from];
                while let Some(clause) = clauses.pop() {
                    match clause {
                        FromClause::Group(_) => {}
                        FromClause::Derived { command, .. } => commands.push(command),
                        FromClause::Join {
                            left,
                            right,
                            criteria,
                            ..
                        } => {
                            out.extend(criteria.iter().flat_map(|c| c.conjuncts()));
                            clauses.push(left);
                            clauses.push(right);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Whether `conjunct` constrains `column` to values supplied from outside its group.
fn binds(conjunct: &Expr, column: &ColumnRef) -> bool {
    let is_column = |e: &Expr| e.as_column() == Some(column);
    let independent = |e: &Expr| e.columns().iter().all(|c| c.group != column.group);
    match conjunct {
        Expr::Binary { .. } => match conjunct.as_equality() {
            Some((l, r)) => (is_column(l) && independent(r)) || (is_column(r) && independent(l)),
            None => false,
        },
        Expr::InList { expr, list } => is_column(expr) && list.iter().all(independent),
        Expr::DependentSet { expr, .. } => is_column(expr),
        Expr::InSubquery { expr, .. } => is_column(expr),
        _ => false,
    }
}

impl OperatorTrait for Access {
    fn arity(&self) -> Option<usize> {
        Some(0)
    }

    fn derive_schema(&self, _inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(self.command.output_columns())
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.command)
    }
}

/// An access whose command is constrained by the values of a dependent value set populated
/// at run time by the driving side of a join.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct DependentAccess {
    access: Access,
    value_set: String,
}

impl DependentAccess {
    /// `access`'s command must contain exactly one placeholder of `value_set`.
    pub fn new(access: Access, value_set: String) -> Self {
        Self { access, value_set }
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn value_set(&self) -> &str {
        &self.value_set
    }
}

impl OperatorTrait for DependentAccess {
    fn arity(&self) -> Option<usize> {
        Some(0)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        self.access.derive_schema(inputs)
    }
}

impl fmt::Display for DependentAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <- {}: {}",
            self.access.source(),
            self.value_set,
            self.access.command()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scan_command;
    use crate::expr::{col, lit};

    fn pattern() -> Vec<AccessPattern> {
        vec![AccessPattern::new(vec![ColumnRef::new("b", "k")])]
    }

    #[test]
    fn test_pattern_bound_by_literal_or_value_set() {
        let scan = scan_command("b", "t2", &["k", "v"]);
        let unbound = Access::new("s2".into(), scan.clone(), pattern());
        assert!(!unbound.is_satisfied());

        let literal = scan.push_criteria(&col("b", "k").eq(lit(3))).unwrap();
        assert!(unbound.with_command(literal).is_satisfied());

        let dependent = scan.with_dependent_set(&col("b", "k"), "dvs_0").unwrap();
        assert!(unbound.with_command(dependent).is_satisfied());
    }

    #[test]
    fn test_pattern_not_bound_by_own_group() {
        let scan = scan_command("b", "t2", &["k", "v"]);
        let access = Access::new("s2".into(), scan.clone(), pattern());
        let self_join = scan.push_criteria(&col("b", "k").eq(col("b", "v"))).unwrap();
        assert!(!access.with_command(self_join).is_satisfied());
        let ranged = scan.push_criteria(&col("b", "k").gt(lit(3))).unwrap();
        assert!(!access.with_command(ranged).is_satisfied());
    }

    #[test]
    fn test_every_group_needs_a_bound_pattern() {
        let left = Access::new(
            "s2".into(),
            scan_command("a", "t1", &["k"]),
            vec![AccessPattern::new(vec![ColumnRef::new("a", "k")])],
        );
        let right = Access::new("s2".into(), scan_command("b", "t2", &["k", "v"]), pattern());
        let bound_right = scan_command("b", "t2", &["k", "v"])
            .push_criteria(&col("b", "k").eq(lit(3)))
            .unwrap();
        assert!(right.with_command(bound_right.clone()).is_satisfied());
        assert!(!left.merge(&right, bound_right).is_satisfied());
    }
}
