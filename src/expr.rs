//! Scalar expressions shared by logical operators, pushed commands and in-process nodes.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum_macros::{Display, EnumString};

use crate::command::Command;

/// A literal value.
///
/// `Float64` compares and hashes by its bit pattern, so values can be used as keys of
/// dependent value sets and of subquery result caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Bool(_) => 1,
            ScalarValue::Int64(_) | ScalarValue::Float64(_) => 2,
            ScalarValue::Utf8(_) => 3,
        }
    }

    /// SQL comparison: `None` when either side is NULL or the types are incomparable.
    pub fn sql_cmp(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Null, _) | (_, ScalarValue::Null) => None,
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => Some(a.cmp(b)),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => Some(a.cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => Some(a.total_cmp(b)),
            (ScalarValue::Int64(a), ScalarValue::Float64(b)) => Some((*a as f64).total_cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Int64(b)) => Some(a.total_cmp(&(*b as f64))),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScalarValue::Null, ScalarValue::Null) => true,
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a == b,
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => a.to_bits() == b.to_bits(),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ScalarValue::Null => {}
            ScalarValue::Bool(v) => v.hash(state),
            ScalarValue::Int64(v) => v.hash(state),
            ScalarValue::Float64(v) => v.to_bits().hash(state),
            ScalarValue::Utf8(v) => v.hash(state),
        }
    }
}

/// Total order used for sorting: NULL first, then by type, then by value.
impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sql_cmp(other)
            .unwrap_or_else(|| self.type_rank().cmp(&other.type_rank()))
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(true) => write!(f, "TRUE"),
            ScalarValue::Bool(false) => write!(f, "FALSE"),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{:?}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int64(v as i64)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

/// A column of a group (table alias, virtual group or derived table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub group: String,
    pub name: String,
}

impl ColumnRef {
    pub fn new<G: Into<String>, N: Into<String>>(group: G, name: N) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}.{}", self.group, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        !self.is_arithmetic()
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }

    /// The comparison obtained by swapping operands.
    pub fn swap(self) -> Self {
        match self {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            op => op,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Column(ColumnRef),
    Literal(ScalarValue),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
    },
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// `arg: None` is `COUNT(*)`.
    Aggregate {
        func: AggregateFunction,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    /// `expr IN (<values of set>)`, bound at execution time.
    DependentSet {
        expr: Box<Expr>,
        set: String,
    },
    Exists(Box<Command>),
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Command>,
    },
    ScalarSubquery(Box<Command>),
}

pub fn col<G: Into<String>, N: Into<String>>(group: G, name: N) -> Expr {
    Expr::Column(ColumnRef::new(group, name))
}

pub fn lit<V: Into<ScalarValue>>(value: V) -> Expr {
    Expr::Literal(value.into())
}

pub fn func<S: Into<String>>(name: S, args: Vec<Expr>) -> Expr {
    Expr::Function {
        name: name.into(),
        args,
    }
}

pub fn count_star() -> Expr {
    Expr::Aggregate {
        func: AggregateFunction::Count,
        arg: None,
        distinct: false,
    }
}

pub fn aggregate(func: AggregateFunction, arg: Expr) -> Expr {
    Expr::Aggregate {
        func,
        arg: Some(Box::new(arg)),
        distinct: false,
    }
}

/// Conjunction of `exprs`, flattening nested ANDs. `None` for an empty input.
pub fn conjunction<I: IntoIterator<Item = Expr>>(exprs: I) -> Option<Expr> {
    let mut conjuncts: Vec<Expr> = exprs.into_iter().flat_map(|e| e.into_conjuncts()).collect();
    match conjuncts.len() {
        0 => None,
        1 => conjuncts.pop(),
        _ => Some(Expr::And(conjuncts)),
    }
}

impl Expr {
    fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::NotEq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GtEq, other)
    }

    pub fn plus(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Plus, other)
    }

    pub fn in_list(self, list: Vec<Expr>) -> Expr {
        Expr::InList {
            expr: Box::new(self),
            list,
        }
    }

    pub fn like(self, pattern: Expr) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
        }
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Expr::Column(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_conjuncts(self) -> Vec<Expr> {
        let mut out = vec![];
        let mut stack = vec![self];
        while let Some(e) = stack.pop() {
            match e {
                Expr::And(items) => stack.extend(items.into_iter().rev()),
                other => out.push(other),
            }
        }
        out
    }

    pub fn conjuncts(&self) -> Vec<Expr> {
        self.clone().into_conjuncts()
    }

    /// Direct sub-expressions. Nested commands are a separate scope and are not children.
    pub fn children(&self) -> SmallVec<[&Expr; 4]> {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Exists(_) | Expr::ScalarSubquery(_) => {
                SmallVec::new()
            }
            Expr::Binary { left, right, .. } => smallvec::smallvec![left.as_ref(), right.as_ref()],
            Expr::And(items) | Expr::Or(items) => items.iter().collect(),
            Expr::Not(e) | Expr::IsNull(e) => smallvec::smallvec![e.as_ref()],
            Expr::Like { expr, pattern } => smallvec::smallvec![expr.as_ref(), pattern.as_ref()],
            Expr::InList { expr, list } => std::iter::once(expr.as_ref()).chain(list).collect(),
            Expr::Function { args, .. } => args.iter().collect(),
            Expr::Aggregate { arg, .. } => arg.iter().map(|a| a.as_ref()).collect(),
            Expr::DependentSet { expr, .. } => smallvec::smallvec![expr.as_ref()],
            Expr::InSubquery { expr, .. } => smallvec::smallvec![expr.as_ref()],
        }
    }

    /// Pre-order walk over this expression and its sub-expressions, without recursion.
    pub fn walk(&self) -> ExprWalk<'_> {
        ExprWalk { stack: vec![self] }
    }

    /// Columns referenced in this scope.
    pub fn columns(&self) -> BTreeSet<ColumnRef> {
        self.walk()
            .filter_map(|e| e.as_column().cloned())
            .collect()
    }

    pub fn contains_aggregate(&self) -> bool {
        self.walk().any(|e| matches!(e, Expr::Aggregate { .. }))
    }

    pub fn contains_subquery(&self) -> bool {
        self.walk().any(|e| {
            matches!(
                e,
                Expr::Exists(_) | Expr::InSubquery { .. } | Expr::ScalarSubquery(_)
            )
        })
    }

    /// Nested commands directly reachable from this scope.
    pub fn subqueries(&self) -> Vec<&Command> {
        self.walk()
            .filter_map(|e| match e {
                Expr::Exists(c) | Expr::ScalarSubquery(c) => Some(c.as_ref()),
                Expr::InSubquery { subquery, .. } => Some(subquery.as_ref()),
                _ => None,
            })
            .collect()
    }

    /// Rebuilds the expression top-down. When `f` returns `Some`, the returned expression
    /// replaces the node and its children are not visited.
    pub fn transform<F>(&self, f: &mut F) -> Expr
    where
        F: FnMut(&Expr) -> Option<Expr>,
    {
        if let Some(replaced) = f(self) {
            return replaced;
        }
        match self {
            Expr::Column(_)
            | Expr::Literal(_)
            | Expr::Exists(_)
            | Expr::ScalarSubquery(_) => self.clone(),
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(left.transform(f)),
                right: Box::new(right.transform(f)),
            },
            Expr::And(items) => Expr::And(items.iter().map(|e| e.transform(f)).collect()),
            Expr::Or(items) => Expr::Or(items.iter().map(|e| e.transform(f)).collect()),
            Expr::Not(e) => Expr::Not(Box::new(e.transform(f))),
            Expr::IsNull(e) => Expr::IsNull(Box::new(e.transform(f))),
            Expr::Like { expr, pattern } => Expr::Like {
                expr: Box::new(expr.transform(f)),
                pattern: Box::new(pattern.transform(f)),
            },
            Expr::InList { expr, list } => Expr::InList {
                expr: Box::new(expr.transform(f)),
                list: list.iter().map(|e| e.transform(f)).collect(),
            },
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|e| e.transform(f)).collect(),
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => Expr::Aggregate {
                func: *func,
                arg: arg.as_ref().map(|a| Box::new(a.transform(f))),
                distinct: *distinct,
            },
            Expr::DependentSet { expr, set } => Expr::DependentSet {
                expr: Box::new(expr.transform(f)),
                set: set.clone(),
            },
            Expr::InSubquery { expr, subquery } => Expr::InSubquery {
                expr: Box::new(expr.transform(f)),
                subquery: subquery.clone(),
            },
        }
    }

    /// Replaces column references found in `map`. Nested commands are left untouched.
    pub fn substitute(&self, map: &HashMap<ColumnRef, Expr>) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Column(c) => map.get(c).cloned(),
            _ => None,
        })
    }

    /// `(left, right)` operands of an equality predicate.
    pub fn as_equality(&self) -> Option<(&Expr, &Expr)> {
        match self {
            Expr::Binary {
                op: BinaryOp::Eq,
                left,
                right,
            } => Some((left.as_ref(), right.as_ref())),
            _ => None,
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::And(_) | Expr::Or(_) => write!(f, "({})", self),
            Expr::Binary { op, .. } if op.is_comparison() => write!(f, "({})", self),
            _ => write!(f, "{}", self),
        }
    }
}

pub struct ExprWalk<'a> {
    stack: Vec<&'a Expr>,
}

impl<'a> Iterator for ExprWalk<'a> {
    type Item = &'a Expr;

    fn next(&mut self) -> Option<Self::Item> {
        let e = self.stack.pop()?;
        self.stack.extend(e.children().into_iter().rev());
        Some(e)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => write!(f, "{}", c),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Binary { op, left, right } if op.is_arithmetic() => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Binary { op, left, right } => {
                left.fmt_nested(f)?;
                write!(f, " {} ", op.symbol())?;
                right.fmt_nested(f)
            }
            Expr::And(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " AND ")?;
                    }
                    match item {
                        Expr::Or(_) => write!(f, "({})", item)?,
                        _ => write!(f, "{}", item)?,
                    }
                }
                Ok(())
            }
            Expr::Or(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " OR ")?;
                    }
                    match item {
                        Expr::And(_) => write!(f, "({})", item)?,
                        _ => write!(f, "{}", item)?,
                    }
                }
                Ok(())
            }
            Expr::Not(e) => write!(f, "NOT ({})", e),
            Expr::IsNull(e) => {
                e.fmt_nested(f)?;
                write!(f, " IS NULL")
            }
            Expr::Like { expr, pattern } => {
                expr.fmt_nested(f)?;
                write!(f, " LIKE {}", pattern)
            }
            Expr::InList { expr, list } => {
                expr.fmt_nested(f)?;
                write!(f, " IN ({})", list.iter().join(", "))
            }
            Expr::Function { name, args } => {
                write!(f, "{}({})", name.to_uppercase(), args.iter().join(", "))
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => match arg {
                None => write!(f, "{}(*)", func),
                Some(arg) if *distinct => write!(f, "{}(DISTINCT {})", func, arg),
                Some(arg) => write!(f, "{}({})", func, arg),
            },
            Expr::DependentSet { expr, set } => {
                expr.fmt_nested(f)?;
                write!(f, " IN (<{}>)", set)
            }
            Expr::Exists(c) => write!(f, "EXISTS ({})", c),
            Expr::InSubquery { expr, subquery } => {
                expr.fmt_nested(f)?;
                write!(f, " IN ({})", subquery)
            }
            Expr::ScalarSubquery(c) => write!(f, "({})", c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conjunction_flattens() {
        let a = col("a", "x").eq(lit(1));
        let b = col("a", "y").gt(lit(2));
        let c = col("a", "z").is_null();
        let nested = conjunction(vec![a.clone(), conjunction(vec![b.clone(), c.clone()]).unwrap()]);
        assert_eq!(nested, Some(Expr::And(vec![a, b, c])));
        assert_eq!(conjunction(vec![]), None);
    }

    #[test]
    fn test_render() {
        let e = conjunction(vec![
            col("a", "x").eq(col("b", "y")),
            Expr::Or(vec![col("a", "z").lt(lit(3)), col("a", "n").like(lit("ab%"))]),
            func("upper", vec![col("a", "s")]).not_eq(lit("it's")),
        ])
        .unwrap();
        assert_eq!(
            e.to_string(),
            "a.x = b.y AND (a.z < 3 OR a.n LIKE 'ab%') AND UPPER(a.s) <> 'it''s'"
        );
        assert_eq!(count_star().to_string(), "COUNT(*)");
        assert_eq!(
            (col("a", "x").plus(lit(1))).gt(lit(2)).to_string(),
            "(a.x + 1) > 2"
        );
    }

    #[test]
    fn test_columns_and_substitute() {
        let e = func("concat", vec![col("v", "a"), col("w", "b")]).eq(lit("x"));
        let cols: Vec<String> = e.columns().iter().map(|c| c.to_string()).collect();
        assert_eq!(cols, vec!["v.a", "w.b"]);

        let mut map = HashMap::new();
        map.insert(ColumnRef::new("v", "a"), col("t", "a1"));
        let replaced = e.substitute(&map);
        assert_eq!(replaced.to_string(), "CONCAT(t.a1, w.b) = 'x'");
    }

    #[test]
    fn test_scalar_ordering() {
        let mut values = vec![
            ScalarValue::Utf8("b".into()),
            ScalarValue::Int64(3),
            ScalarValue::Null,
            ScalarValue::Float64(2.5),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                ScalarValue::Null,
                ScalarValue::Float64(2.5),
                ScalarValue::Int64(3),
                ScalarValue::Utf8("b".into()),
            ]
        );
        assert_eq!(ScalarValue::Null.sql_cmp(&ScalarValue::Null), None);
    }
}
