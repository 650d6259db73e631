//! Pushed sub-commands.
//!
//! A [`Command`] is the shape handed to a source's dialect translator. The planner only ever
//! builds commands through the structural `push_*` operations below and then validates the
//! result against the source's capabilities; the translator never sees a command the
//! planner did not validate.
//!
//! Invariant: expressions stored in a command reference only columns of groups defined in
//! its own FROM clause, or columns of an enclosing scope (correlated references and, for
//! commands executed per outer row, run-time parameters). Select item aliases are the
//! identities under which the access node exposes its output.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use itertools::Itertools;

use crate::expr::{conjunction, ColumnRef, Expr, ScalarValue};
use crate::operator::JoinKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: ColumnRef,
}

impl SelectItem {
    pub fn new(expr: Expr, alias: ColumnRef) -> Self {
        Self { expr, alias }
    }

    /// Projects a column under its own name.
    pub fn column(column: ColumnRef) -> Self {
        Self {
            expr: Expr::Column(column.clone()),
            alias: column,
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expr {
            Expr::Column(c) if *c == self.alias => write!(f, "{}", c),
            expr => write!(f, "{} AS {}", expr, self.alias.name),
        }
    }
}

/// A physical table under a query alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupSymbol {
    pub alias: String,
    pub table: String,
}

impl GroupSymbol {
    pub fn new<A: Into<String>, T: Into<String>>(alias: A, table: T) -> Self {
        Self {
            alias: alias.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for GroupSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alias == self.table {
            write!(f, "{}", self.table)
        } else {
            write!(f, "{} AS {}", self.table, self.alias)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FromClause {
    Group(GroupSymbol),
    Join {
        kind: JoinKind,
        left: Box<FromClause>,
        right: Box<FromClause>,
        criteria: Vec<Expr>,
    },
    Derived {
        alias: String,
        command: Box<Command>,
    },
}

impl FromClause {
    /// Aliases of all groups defined by this clause.
    pub fn aliases(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(clause) = stack.pop() {
            match clause {
                FromClause::Group(g) => {
                    out.insert(g.alias.clone());
                }
                FromClause::Derived { alias, .. } => {
                    out.insert(alias.clone());
                }
                FromClause::Join { left, right, .. } => {
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
        out
    }

    /// Physical groups referenced by this clause, in clause order. Derived tables are not
    /// descended into.
    pub fn groups(&self) -> Vec<&GroupSymbol> {
        let mut out = vec![];
        let mut stack = vec![self];
        while let Some(clause) = stack.pop() {
            match clause {
                FromClause::Group(g) => out.push(g),
                FromClause::Derived { .. } => {}
                FromClause::Join { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        out
    }

    fn transform_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> FromClause {
        match self {
            FromClause::Group(_) => self.clone(),
            FromClause::Join {
                kind,
                left,
                right,
                criteria,
            } => FromClause::Join {
                kind: *kind,
                left: Box::new(left.transform_exprs(&mut *f)),
                right: Box::new(right.transform_exprs(&mut *f)),
                criteria: criteria.iter().map(|e| transform_deep(e, &mut *f)).collect(),
            },
            FromClause::Derived { alias, command } => FromClause::Derived {
                alias: alias.clone(),
                command: Box::new(command.transform_exprs(f)),
            },
        }
    }
}

impl fmt::Display for FromClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FromClause::Group(g) => write!(f, "{}", g),
            FromClause::Join {
                kind,
                left,
                right,
                criteria,
            } => {
                write!(f, "{} {} {}", left, kind.sql_keyword(), right)?;
                if let Some(on) = conjunction(criteria.iter().cloned()) {
                    write!(f, " ON {}", on)?;
                }
                Ok(())
            }
            FromClause::Derived { alias, command } => write!(f, "({}) AS {}", command, alias),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: true,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            ascending: false,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ascending {
            write!(f, "{}", self.expr)
        } else {
            write!(f, "{} DESC", self.expr)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LimitClause {
    pub offset: u64,
    pub count: Option<u64>,
}

impl LimitClause {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    /// The limit equivalent to applying `self` and then `outer`.
    pub fn then(self, outer: LimitClause) -> LimitClause {
        let remaining = self.count.map(|c| c.saturating_sub(outer.offset));
        let count = match (remaining, outer.count) {
            (Some(r), Some(c)) => Some(r.min(c)),
            (Some(r), None) => Some(r),
            (None, c) => c,
        };
        LimitClause {
            offset: self.offset + outer.offset,
            count,
        }
    }
}

impl fmt::Display for LimitClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.count, self.offset) {
            (Some(c), 0) => write!(f, "LIMIT {}", c),
            (Some(c), o) => write!(f, "LIMIT {} OFFSET {}", c, o),
            (None, o) => write!(f, "OFFSET {}", o),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub select: Vec<SelectItem>,
    pub distinct: bool,
    pub from: FromClause,
    pub criteria: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<SortKey>,
    pub limit: Option<LimitClause>,
}

impl Query {
    pub fn new(select: Vec<SelectItem>, from: FromClause) -> Self {
        Self {
            select,
            distinct: false,
            from,
            criteria: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
        }
    }

    /// `SELECT <columns> FROM <group>`.
    pub fn scan(group: &GroupSymbol, columns: &[String]) -> Self {
        let select = columns
            .iter()
            .map(|c| SelectItem::column(ColumnRef::new(group.alias.clone(), c.clone())))
            .collect();
        Self::new(select, FromClause::Group(group.clone()))
    }

    pub fn output_map(&self) -> HashMap<ColumnRef, Expr> {
        self.select
            .iter()
            .map(|item| (item.alias.clone(), item.expr.clone()))
            .collect()
    }

    /// Rewrites an expression over this query's output into one over its FROM clause.
    pub fn resolve(&self, expr: &Expr) -> Expr {
        expr.substitute(&self.output_map())
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.select.iter().any(|item| item.expr.contains_aggregate())
    }

    /// No grouping, distinct, ordering or limit on top of the FROM/WHERE core.
    pub fn is_simple(&self) -> bool {
        !self.is_grouped() && !self.distinct && self.order_by.is_empty() && self.limit.is_none()
    }

    /// Every expression of this scope, including join criteria.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut exprs: Vec<&Expr> = self.select.iter().map(|item| &item.expr).collect();
        exprs.extend(self.criteria.iter());
        exprs.extend(self.group_by.iter());
        exprs.extend(self.having.iter());
        exprs.extend(self.order_by.iter().map(|k| &k.expr));
        let mut stack = vec![&self.from];
        while let Some(clause) = stack.pop() {
            if let FromClause::Join {
                left,
                right,
                criteria,
                ..
            } = clause
            {
                exprs.extend(criteria.iter());
                stack.push(left);
                stack.push(right);
            }
        }
        exprs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetQuery {
    pub all: bool,
    pub branches: Vec<Command>,
    /// Keys over the output columns of the first branch.
    pub order_by: Vec<SortKey>,
    pub limit: Option<LimitClause>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Query(Query),
    SetQuery(SetQuery),
}

impl From<Query> for Command {
    fn from(q: Query) -> Self {
        Command::Query(q)
    }
}

impl Command {
    pub fn output_columns(&self) -> Vec<ColumnRef> {
        match self {
            Command::Query(q) => q.select.iter().map(|item| item.alias.clone()).collect(),
            Command::SetQuery(s) => s
                .branches
                .first()
                .map(|b| b.output_columns())
                .unwrap_or_default(),
        }
    }

    pub fn as_query(&self) -> Option<&Query> {
        match self {
            Command::Query(q) => Some(q),
            Command::SetQuery(_) => None,
        }
    }

    pub fn limit(&self) -> Option<LimitClause> {
        match self {
            Command::Query(q) => q.limit,
            Command::SetQuery(s) => s.limit,
        }
    }

    /// Columns this command references from enclosing scopes.
    pub fn free_columns(&self) -> BTreeSet<ColumnRef> {
        match self {
            Command::SetQuery(s) => s.branches.iter().flat_map(|b| b.free_columns()).collect(),
            Command::Query(q) => {
                let defined = q.from.aliases();
                let mut referenced = BTreeSet::new();
                for expr in q.expressions() {
                    referenced.extend(expr.columns());
                    for sub in expr.subqueries() {
                        referenced.extend(sub.free_columns());
                    }
                }
                let mut stack = vec![&q.from];
                while let Some(clause) = stack.pop() {
                    match clause {
                        FromClause::Derived { command, .. } => {
                            referenced.extend(command.free_columns())
                        }
                        FromClause::Join { left, right, .. } => {
                            stack.push(left);
                            stack.push(right);
                        }
                        FromClause::Group(_) => {}
                    }
                }
                referenced
                    .into_iter()
                    .filter(|c| !defined.contains(&c.group))
                    .collect()
            }
        }
    }

    /// Names of the dependent value sets this command is bound to.
    pub fn dependent_sets(&self) -> Vec<String> {
        let mut sets = vec![];
        self.transform_exprs(&mut |e| {
            if let Expr::DependentSet { set, .. } = e {
                sets.push(set.clone());
            }
            None
        });
        sets
    }

    /// Applies `f` to every expression, descending into nested commands.
    pub fn transform_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Command {
        match self {
            Command::Query(q) => Command::Query(Query {
                select: q
                    .select
                    .iter()
                    .map(|item| SelectItem::new(transform_deep(&item.expr, &mut *f), item.alias.clone()))
                    .collect(),
                distinct: q.distinct,
                from: q.from.transform_exprs(&mut *f),
                criteria: q.criteria.as_ref().map(|e| transform_deep(e, &mut *f)),
                group_by: q.group_by.iter().map(|e| transform_deep(e, &mut *f)).collect(),
                having: q.having.as_ref().map(|e| transform_deep(e, &mut *f)),
                order_by: q
                    .order_by
                    .iter()
                    .map(|k| SortKey {
                        expr: transform_deep(&k.expr, &mut *f),
                        ascending: k.ascending,
                    })
                    .collect(),
                limit: q.limit,
            }),
            Command::SetQuery(s) => Command::SetQuery(SetQuery {
                all: s.all,
                branches: s.branches.iter().map(|b| b.transform_exprs(&mut *f)).collect(),
                order_by: s.order_by.clone(),
                limit: s.limit,
            }),
        }
    }

    /// Adds a filter over this command's output.
    pub fn push_criteria(&self, criteria: &Expr) -> Option<Command> {
        let q = self.as_query()?;
        if q.limit.is_some() {
            return None;
        }
        let resolved = q.resolve(criteria);
        let mut out = q.clone();
        if q.is_grouped() {
            out.having = conjunction(q.having.clone().into_iter().chain([resolved]));
        } else {
            if resolved.contains_aggregate() {
                return None;
            }
            out.criteria = conjunction(q.criteria.clone().into_iter().chain([resolved]));
        }
        Some(out.into())
    }

    /// Replaces the select list by `items`, expressed over this command's output.
    pub fn push_projection(&self, items: &[SelectItem], distinct: bool) -> Option<Command> {
        let q = match self {
            Command::Query(q) => q,
            Command::SetQuery(_) => {
                // Only a pure rename of the set query's columns can be layered on top of it.
                let outputs = self.output_columns();
                let same_columns = items.len() == outputs.len()
                    && items
                        .iter()
                        .zip(&outputs)
                        .all(|(item, out)| item.expr.as_column() == Some(out));
                return if same_columns && !distinct {
                    let names: Vec<ColumnRef> = items.iter().map(|i| i.alias.clone()).collect();
                    Some(self.rename_outputs(&names))
                } else {
                    None
                };
            }
        };
        if q.distinct {
            let outputs: BTreeSet<ColumnRef> = self.output_columns().into_iter().collect();
            let projected: BTreeSet<ColumnRef> = items
                .iter()
                .filter_map(|i| i.expr.as_column().cloned())
                .collect();
            if projected.len() != items.len() || projected != outputs {
                return None;
            }
        }
        if distinct && !q.distinct && q.limit.is_some() {
            return None;
        }
        let grouped = q.is_grouped();
        let mut select = Vec::with_capacity(items.len());
        for item in items {
            if item.expr.contains_aggregate() {
                return None;
            }
            select.push(SelectItem::new(q.resolve(&item.expr), item.alias.clone()));
        }
        let distinct = distinct || q.distinct;
        if (distinct || grouped)
            && !q
                .order_by
                .iter()
                .all(|k| select.iter().any(|item| item.expr == k.expr))
        {
            return None;
        }
        let mut out = q.clone();
        out.select = select;
        out.distinct = distinct;
        Some(out.into())
    }

    /// Groups this command's output by `keys`, computing `aggregates`.
    pub fn push_group(&self, keys: &[SelectItem], aggregates: &[SelectItem]) -> Option<Command> {
        let q = self.as_query()?;
        if q.is_grouped() || q.distinct || q.limit.is_some() {
            return None;
        }
        if keys.is_empty() && aggregates.is_empty() {
            return None;
        }
        let mut out = q.clone();
        out.order_by.clear();
        out.group_by = keys.iter().map(|k| q.resolve(&k.expr)).collect();
        out.select = keys
            .iter()
            .chain(aggregates)
            .map(|item| SelectItem::new(q.resolve(&item.expr), item.alias.clone()))
            .collect();
        Some(out.into())
    }

    pub fn push_sort(&self, keys: &[SortKey]) -> Option<Command> {
        match self {
            Command::Query(q) => {
                if q.limit.is_some() {
                    return None;
                }
                let resolved: Vec<SortKey> = keys
                    .iter()
                    .map(|k| SortKey {
                        expr: q.resolve(&k.expr),
                        ascending: k.ascending,
                    })
                    .collect();
                if (q.distinct || q.is_grouped())
                    && !resolved
                        .iter()
                        .all(|k| q.select.iter().any(|item| item.expr == k.expr))
                {
                    return None;
                }
                let mut out = q.clone();
                out.order_by = resolved;
                Some(out.into())
            }
            Command::SetQuery(s) => {
                if s.limit.is_some() {
                    return None;
                }
                let outputs = self.output_columns();
                if !keys
                    .iter()
                    .all(|k| k.expr.as_column().map_or(false, |c| outputs.contains(c)))
                {
                    return None;
                }
                let mut out = s.clone();
                out.order_by = keys.to_vec();
                Some(Command::SetQuery(out))
            }
        }
    }

    pub fn push_limit(&self, limit: LimitClause) -> Command {
        let combined = match self.limit() {
            Some(existing) => existing.then(limit),
            None => limit,
        };
        match self {
            Command::Query(q) => {
                let mut out = q.clone();
                out.limit = Some(combined);
                Command::Query(out)
            }
            Command::SetQuery(s) => {
                let mut out = s.clone();
                out.limit = Some(combined);
                Command::SetQuery(out)
            }
        }
    }

    /// Joins two commands of the same source into one. Criteria are expressed over the
    /// outputs of both sides.
    pub fn join(
        left: &Command,
        right: &Command,
        kind: JoinKind,
        criteria: &[Expr],
    ) -> Option<Command> {
        let (l, r) = (left.as_query()?, right.as_query()?);
        if !l.is_simple() || !r.is_simple() {
            return None;
        }
        let mut map = l.output_map();
        map.extend(r.output_map());
        let mut on: Vec<Expr> = criteria.iter().map(|c| c.substitute(&map)).collect();
        let criteria = match kind {
            JoinKind::Inner | JoinKind::Cross => {
                conjunction(l.criteria.clone().into_iter().chain(r.criteria.clone()))
            }
            JoinKind::LeftOuter => {
                on.extend(r.criteria.clone().into_iter().flat_map(|c| c.into_conjuncts()));
                l.criteria.clone()
            }
            JoinKind::RightOuter => {
                on.extend(l.criteria.clone().into_iter().flat_map(|c| c.into_conjuncts()));
                r.criteria.clone()
            }
            JoinKind::FullOuter => {
                if l.criteria.is_some() || r.criteria.is_some() {
                    return None;
                }
                None
            }
        };
        let kind = match kind {
            JoinKind::Inner if on.is_empty() => JoinKind::Cross,
            JoinKind::Cross if !on.is_empty() => JoinKind::Inner,
            k => k,
        };
        if kind != JoinKind::Cross && on.is_empty() {
            return None;
        }
        let mut out = Query::new(
            l.select.iter().chain(&r.select).cloned().collect(),
            FromClause::Join {
                kind,
                left: Box::new(l.from.clone()),
                right: Box::new(r.from.clone()),
                criteria: on,
            },
        );
        out.criteria = criteria;
        Some(out.into())
    }

    /// Combines commands of the same source into one set query. Nested set queries without
    /// ordering or limit are spliced in when that keeps the semantics.
    pub fn union(branches: Vec<Command>, all: bool) -> Command {
        let mut flat = vec![];
        for branch in branches {
            match branch {
                Command::SetQuery(s)
                    if s.order_by.is_empty() && s.limit.is_none() && (s.all == all || !all) =>
                {
                    flat.extend(s.branches)
                }
                other => flat.push(other),
            }
        }
        Command::SetQuery(SetQuery {
            all,
            branches: flat,
            order_by: vec![],
            limit: None,
        })
    }

    /// Wraps this command as a derived table so that further operations layer on top of it.
    pub fn into_inline_view(&self, alias: &str) -> Command {
        let outputs = self.output_columns();
        let inner_names: Vec<ColumnRef> = (0..outputs.len())
            .map(|i| ColumnRef::new(alias, format!("c_{}", i)))
            .collect();
        let select = outputs
            .into_iter()
            .zip(&inner_names)
            .map(|(out, inner)| SelectItem::new(Expr::Column(inner.clone()), out))
            .collect();
        Query::new(
            select,
            FromClause::Derived {
                alias: alias.to_string(),
                command: Box::new(self.rename_outputs(&inner_names)),
            },
        )
        .into()
    }

    /// Renames the output columns positionally.
    pub fn rename_outputs(&self, names: &[ColumnRef]) -> Command {
        match self {
            Command::Query(q) => {
                let mut out = q.clone();
                for (item, name) in out.select.iter_mut().zip(names) {
                    item.alias = name.clone();
                }
                Command::Query(out)
            }
            Command::SetQuery(s) => {
                let old = self.output_columns();
                let map: HashMap<ColumnRef, Expr> = old
                    .into_iter()
                    .zip(names)
                    .map(|(o, n)| (o, Expr::Column(n.clone())))
                    .collect();
                let mut out = s.clone();
                if let Some(first) = out.branches.first_mut() {
                    *first = first.rename_outputs(names);
                }
                out.order_by = s
                    .order_by
                    .iter()
                    .map(|k| SortKey {
                        expr: k.expr.substitute(&map),
                        ascending: k.ascending,
                    })
                    .collect();
                Command::SetQuery(out)
            }
        }
    }

    /// Constrains `key` (over this command's output) by the values of a dependent set.
    pub fn with_dependent_set(&self, key: &Expr, set: &str) -> Option<Command> {
        let q = self.as_query()?;
        if q.is_grouped() || q.limit.is_some() {
            return None;
        }
        let placeholder = Expr::DependentSet {
            expr: Box::new(q.resolve(key)),
            set: set.to_string(),
        };
        let mut out = q.clone();
        out.criteria = conjunction(q.criteria.clone().into_iter().chain([placeholder]));
        Some(out.into())
    }

    /// Replaces references to enclosing scopes by their run-time values.
    pub fn bind(&self, bindings: &HashMap<ColumnRef, ScalarValue>) -> Command {
        if bindings.is_empty() {
            return self.clone();
        }
        let free = self.free_columns();
        self.transform_exprs(&mut |e| match e {
            Expr::Column(c) if free.contains(c) => {
                bindings.get(c).map(|v| Expr::Literal(v.clone()))
            }
            _ => None,
        })
    }

    /// Replaces the placeholder of `set` by an IN list of `values`.
    pub fn bind_dependent_values(&self, set: &str, values: &[ScalarValue]) -> Command {
        self.transform_exprs(&mut |e| match e {
            Expr::DependentSet { expr, set: name } if name == set => Some(Expr::InList {
                expr: expr.clone(),
                list: values.iter().cloned().map(Expr::Literal).collect(),
            }),
            _ => None,
        })
    }
}

fn transform_deep(expr: &Expr, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
    expr.transform(&mut |e| {
        if let Some(replaced) = f(e) {
            return Some(replaced);
        }
        match e {
            Expr::Exists(c) => Some(Expr::Exists(Box::new(c.transform_exprs(&mut *f)))),
            Expr::ScalarSubquery(c) => {
                Some(Expr::ScalarSubquery(Box::new(c.transform_exprs(&mut *f))))
            }
            Expr::InSubquery { expr, subquery } => Some(Expr::InSubquery {
                expr: Box::new(transform_deep(expr, &mut *f)),
                subquery: Box::new(subquery.transform_exprs(&mut *f)),
            }),
            _ => None,
        }
    })
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        write!(f, "{} FROM {}", self.select.iter().join(", "), self.from)?;
        if let Some(criteria) = &self.criteria {
            write!(f, " WHERE {}", criteria)?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.iter().join(", "))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {}", having)?;
        }
        if !self.order_by.is_empty() {
            write!(f, " ORDER BY {}", self.order_by.iter().join(", "))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " {}", limit)?;
        }
        Ok(())
    }
}

impl fmt::Display for SetQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.all { " UNION ALL " } else { " UNION " };
        for (idx, branch) in self.branches.iter().enumerate() {
            if idx > 0 {
                write!(f, "{}", op)?;
            }
            let bare = matches!(branch, Command::Query(q) if q.order_by.is_empty() && q.limit.is_none());
            if bare {
                write!(f, "{}", branch)?;
            } else {
                write!(f, "({})", branch)?;
            }
        }
        if !self.order_by.is_empty() {
            let keys = self.order_by.iter().map(|k| {
                let name = match &k.expr {
                    Expr::Column(c) => c.name.clone(),
                    other => other.to_string(),
                };
                if k.ascending {
                    name
                } else {
                    format!("{} DESC", name)
                }
            });
            write!(f, " ORDER BY {}", keys.format(", "))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " {}", limit)?;
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Query(q) => write!(f, "{}", q),
            Command::SetQuery(s) => write!(f, "{}", s),
        }
    }
}

/// Shorthand used by rules and tests: `SELECT <group columns> FROM <table> AS <alias>`.
pub fn scan_command(alias: &str, table: &str, columns: &[&str]) -> Command {
    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    Query::scan(&GroupSymbol::new(alias, table), &columns).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{aggregate, col, count_star, lit, AggregateFunction};

    #[test]
    fn test_scan_render() {
        let cmd = scan_command("a", "db.t1", &["id", "x"]);
        assert_eq!(cmd.to_string(), "SELECT a.id, a.x FROM db.t1 AS a");
        assert_eq!(
            scan_command("t1", "t1", &["id"]).to_string(),
            "SELECT t1.id FROM t1"
        );
    }

    #[test]
    fn test_join_places_outer_criteria_in_on_clause() {
        let a = scan_command("a", "t1", &["id"])
            .push_criteria(&col("a", "id").gt(lit(1)))
            .unwrap();
        let b = scan_command("b", "t2", &["id", "v"])
            .push_criteria(&col("b", "v").eq(lit("x")))
            .unwrap();
        let joined = Command::join(
            &a,
            &b,
            JoinKind::LeftOuter,
            &[col("a", "id").eq(col("b", "id"))],
        )
        .unwrap();
        assert_eq!(
            joined.to_string(),
            "SELECT a.id, b.id, b.v FROM t1 AS a LEFT OUTER JOIN t2 AS b \
             ON a.id = b.id AND b.v = 'x' WHERE a.id > 1"
        );
    }

    #[test]
    fn test_criteria_over_aggregate_goes_to_having() {
        let grouped = scan_command("a", "t1", &["k", "v"])
            .push_group(
                &[SelectItem::column(ColumnRef::new("a", "k"))],
                &[SelectItem::new(
                    aggregate(AggregateFunction::Sum, col("a", "v")),
                    ColumnRef::new("g", "total"),
                )],
            )
            .unwrap();
        let filtered = grouped.push_criteria(&col("g", "total").gt(lit(10))).unwrap();
        assert_eq!(
            filtered.to_string(),
            "SELECT a.k, SUM(a.v) AS total FROM t1 AS a GROUP BY a.k HAVING SUM(a.v) > 10"
        );
        // A second grouping cannot be layered directly.
        assert!(filtered
            .push_group(&[], &[SelectItem::new(count_star(), ColumnRef::new("h", "n"))])
            .is_none());
    }

    #[test]
    fn test_inline_view_allows_layering() {
        let grouped = scan_command("a", "t1", &["k"])
            .push_group(&[SelectItem::column(ColumnRef::new("a", "k"))], &[])
            .unwrap();
        let wrapped = grouped.into_inline_view("v_0");
        let counted = wrapped
            .push_group(&[], &[SelectItem::new(count_star(), ColumnRef::new("h", "n"))])
            .unwrap();
        assert_eq!(
            counted.to_string(),
            "SELECT COUNT(*) AS n FROM (SELECT a.k AS c_0 FROM t1 AS a GROUP BY a.k) AS v_0"
        );
        assert!(counted.free_columns().is_empty());
    }

    #[test]
    fn test_limit_composition() {
        let cmd = scan_command("a", "t1", &["id"])
            .push_limit(LimitClause::new(0, Some(10)))
            .push_limit(LimitClause::new(2, Some(5)));
        assert_eq!(cmd.limit(), Some(LimitClause::new(2, Some(5))));
        let cmd = scan_command("a", "t1", &["id"])
            .push_limit(LimitClause::new(0, Some(3)))
            .push_limit(LimitClause::new(2, Some(5)));
        assert_eq!(cmd.limit(), Some(LimitClause::new(2, Some(1))));
        assert!(cmd.push_criteria(&col("a", "id").eq(lit(1))).is_none());
    }

    #[test]
    fn test_bind_replaces_only_free_columns() {
        let cmd = scan_command("b", "t2", &["id", "v"])
            .push_criteria(&col("b", "v").eq(col("a", "x")))
            .unwrap();
        assert_eq!(
            cmd.free_columns().into_iter().collect::<Vec<_>>(),
            vec![ColumnRef::new("a", "x")]
        );
        let mut bindings = HashMap::new();
        bindings.insert(ColumnRef::new("a", "x"), ScalarValue::Int64(7));
        assert_eq!(
            cmd.bind(&bindings).to_string(),
            "SELECT b.id, b.v FROM t2 AS b WHERE b.v = 7"
        );
    }

    #[test]
    fn test_dependent_placeholder_binding() {
        let cmd = scan_command("b", "t2", &["k"])
            .with_dependent_set(&col("b", "k"), "dvs_0")
            .unwrap();
        assert_eq!(cmd.to_string(), "SELECT b.k FROM t2 AS b WHERE b.k IN (<dvs_0>)");
        assert_eq!(cmd.dependent_sets(), vec!["dvs_0".to_string()]);
        let bound = cmd.bind_dependent_values("dvs_0", &[1.into(), 2.into()]);
        assert_eq!(bound.to_string(), "SELECT b.k FROM t2 AS b WHERE b.k IN (1, 2)");
    }

    #[test]
    fn test_union_render_and_flatten() {
        let a = scan_command("a", "t1", &["id"]);
        let b = scan_command("b", "t2", &["id"]);
        let c = scan_command("c", "t3", &["id"]);
        let inner = Command::union(vec![a, b], true);
        let outer = Command::union(vec![inner, c], true);
        assert_eq!(
            outer.to_string(),
            "SELECT a.id FROM t1 AS a UNION ALL SELECT b.id FROM t2 AS b UNION ALL SELECT c.id FROM t3 AS c"
        );
        let sorted = outer.push_sort(&[SortKey::desc(col("a", "id"))]).unwrap();
        assert!(sorted.to_string().ends_with("ORDER BY id DESC"));
    }
}
