//! In-process expression evaluation with SQL three-valued logic.

use std::cmp::Ordering;
use std::collections::HashSet;

use anyhow::bail;

use crate::error::{OptResult, OptimizerError};
use crate::expr::{BinaryOp, ColumnRef, Expr, ScalarValue};

use super::Row;

lazy_static! {
    /// Functions and operators the engine evaluates itself. Arithmetic operators are listed
    /// by symbol.
    pub static ref LOCAL_FUNCTIONS: HashSet<&'static str> = [
        "upper", "lower", "concat", "length", "abs", "coalesce", "+", "-", "*", "/",
    ]
    .into_iter()
    .collect();
}

/// Evaluates expressions over rows of one schema.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    schema: &'a [ColumnRef],
}

impl<'a> Evaluator<'a> {
    pub fn new(schema: &'a [ColumnRef]) -> Self {
        Self { schema }
    }

    pub fn eval(&self, expr: &Expr, row: &Row) -> OptResult<ScalarValue> {
        Ok(match expr {
            Expr::Column(c) => match self.schema.iter().position(|s| s == c) {
                Some(idx) => row[idx].clone(),
                None => bail!(OptimizerError::Execution(format!("unbound column {}", c))),
            },
            Expr::Literal(v) => v.clone(),
            Expr::Binary { op, left, right } => {
                let (l, r) = (self.eval(left, row)?, self.eval(right, row)?);
                if op.is_arithmetic() {
                    arithmetic(*op, &l, &r)?
                } else {
                    bool_value(compare(*op, &l, &r))
                }
            }
            Expr::And(items) => {
                let mut out = Some(true);
                for item in items {
                    match self.predicate(item, row)? {
                        Some(false) => return Ok(ScalarValue::Bool(false)),
                        None => out = None,
                        Some(true) => {}
                    }
                }
                bool_value(out)
            }
            Expr::Or(items) => {
                let mut out = Some(false);
                for item in items {
                    match self.predicate(item, row)? {
                        Some(true) => return Ok(ScalarValue::Bool(true)),
                        None => out = None,
                        Some(false) => {}
                    }
                }
                bool_value(out)
            }
            Expr::Not(e) => bool_value(self.predicate(e, row)?.map(|b| !b)),
            Expr::IsNull(e) => ScalarValue::Bool(self.eval(e, row)?.is_null()),
            Expr::Like { expr, pattern } => {
                match (self.eval(expr, row)?, self.eval(pattern, row)?) {
                    (ScalarValue::Utf8(s), ScalarValue::Utf8(p)) => {
                        ScalarValue::Bool(like(&s, &p))
                    }
                    (l, p) if l.is_null() || p.is_null() => ScalarValue::Null,
                    (l, p) => bail!(OptimizerError::Execution(format!(
                        "LIKE over non-string values {} and {}",
                        l, p
                    ))),
                }
            }
            Expr::InList { expr, list } => {
                let value = self.eval(expr, row)?;
                let list = list
                    .iter()
                    .map(|e| self.eval(e, row))
                    .collect::<OptResult<Vec<_>>>()?;
                bool_value(in_values(&value, &list))
            }
            Expr::Function { name, args } => {
                let args = args
                    .iter()
                    .map(|e| self.eval(e, row))
                    .collect::<OptResult<Vec<_>>>()?;
                function(name, args)?
            }
            Expr::Aggregate { .. }
            | Expr::DependentSet { .. }
            | Expr::Exists(_)
            | Expr::InSubquery { .. }
            | Expr::ScalarSubquery(_) => bail!(OptimizerError::Execution(format!(
                "{} cannot be evaluated in a row context",
                expr
            ))),
        })
    }

    /// Truth value of a predicate; `None` is UNKNOWN.
    pub fn predicate(&self, expr: &Expr, row: &Row) -> OptResult<Option<bool>> {
        match self.eval(expr, row)? {
            ScalarValue::Bool(b) => Ok(Some(b)),
            ScalarValue::Null => Ok(None),
            other => bail!(OptimizerError::Execution(format!(
                "predicate {} evaluated to non-boolean {}",
                expr, other
            ))),
        }
    }

    /// Whether `row` passes `expr`. UNKNOWN filters the row out.
    pub fn matches(&self, expr: &Expr, row: &Row) -> OptResult<bool> {
        Ok(self.predicate(expr, row)? == Some(true))
    }
}

fn bool_value(b: Option<bool>) -> ScalarValue {
    b.map_or(ScalarValue::Null, ScalarValue::Bool)
}

/// SQL comparison, UNKNOWN when either side is NULL.
pub fn compare(op: BinaryOp, l: &ScalarValue, r: &ScalarValue) -> Option<bool> {
    let ord = l.sql_cmp(r)?;
    Some(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::NotEq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        _ => return None,
    })
}

/// `value IN (values)`: true on a match, UNKNOWN when no match but a NULL is involved.
pub fn in_values(value: &ScalarValue, values: &[ScalarValue]) -> Option<bool> {
    if value.is_null() {
        return if values.is_empty() { Some(false) } else { None };
    }
    let mut unknown = false;
    for v in values {
        match compare(BinaryOp::Eq, value, v) {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    if unknown {
        None
    } else {
        Some(false)
    }
}

fn arithmetic(op: BinaryOp, l: &ScalarValue, r: &ScalarValue) -> OptResult<ScalarValue> {
    use ScalarValue::*;
    Ok(match (l, r) {
        (Null, _) | (_, Null) => Null,
        (Int64(a), Int64(b)) => match op {
            BinaryOp::Plus => Int64(a.wrapping_add(*b)),
            BinaryOp::Minus => Int64(a.wrapping_sub(*b)),
            BinaryOp::Multiply => Int64(a.wrapping_mul(*b)),
            BinaryOp::Divide if *b == 0 => {
                bail!(OptimizerError::Execution("division by zero".to_string()))
            }
            _ => Int64(a / b),
        },
        (Int64(_) | Float64(_), Int64(_) | Float64(_)) => {
            let (a, b) = (as_f64(l), as_f64(r));
            Float64(match op {
                BinaryOp::Plus => a + b,
                BinaryOp::Minus => a - b,
                BinaryOp::Multiply => a * b,
                _ if b == 0.0 => {
                    bail!(OptimizerError::Execution("division by zero".to_string()))
                }
                _ => a / b,
            })
        }
        _ => bail!(OptimizerError::Execution(format!(
            "{} {} {} is not numeric",
            l,
            op.symbol(),
            r
        ))),
    })
}

pub(crate) fn as_f64(v: &ScalarValue) -> f64 {
    match v {
        ScalarValue::Int64(i) => *i as f64,
        ScalarValue::Float64(f) => *f,
        _ => f64::NAN,
    }
}

fn function(name: &str, args: Vec<ScalarValue>) -> OptResult<ScalarValue> {
    use ScalarValue::*;
    let name = name.to_lowercase();
    if name == "coalesce" {
        return Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Null));
    }
    if args.iter().any(|a| a.is_null()) {
        return Ok(Null);
    }
    Ok(match (name.as_str(), args.as_slice()) {
        ("upper", [Utf8(s)]) => Utf8(s.to_uppercase()),
        ("lower", [Utf8(s)]) => Utf8(s.to_lowercase()),
        ("length", [Utf8(s)]) => Int64(s.chars().count() as i64),
        ("abs", [Int64(i)]) => Int64(i.wrapping_abs()),
        ("abs", [Float64(f)]) => Float64(f.abs()),
        ("concat", parts) => Utf8(
            parts
                .iter()
                .map(|p| match p {
                    Utf8(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        _ => bail!(OptimizerError::Execution(format!(
            "function {} is not supported for arguments ({})",
            name,
            args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
        ))),
    })
}

/// SQL LIKE with `%` and `_` wildcards.
pub fn like(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = value.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    // matched[j]: the first i chars of the value match the first j chars of the pattern.
    let mut matched = vec![false; p.len() + 1];
    matched[0] = true;
    for j in 1..=p.len() {
        matched[j] = matched[j - 1] && p[j - 1] == '%';
    }
    for c in &v {
        let mut next = vec![false; p.len() + 1];
        for j in 1..=p.len() {
            next[j] = match p[j - 1] {
                '%' => next[j - 1] || matched[j],
                '_' => matched[j - 1],
                pc => matched[j - 1] && pc == *c,
            };
        }
        matched = next;
    }
    matched[p.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, func, lit};

    fn schema() -> Vec<ColumnRef> {
        vec![ColumnRef::new("a", "x"), ColumnRef::new("a", "s")]
    }

    #[test]
    fn test_three_valued_logic() {
        let schema = schema();
        let eval = Evaluator::new(&schema);
        let row = vec![ScalarValue::Null, ScalarValue::from("ab")];

        let unknown = col("a", "x").eq(lit(1));
        assert_eq!(eval.predicate(&unknown, &row).unwrap(), None);
        assert_eq!(eval.predicate(&unknown.clone().not(), &row).unwrap(), None);
        let or = Expr::Or(vec![unknown.clone(), col("a", "s").eq(lit("ab"))]);
        assert_eq!(eval.predicate(&or, &row).unwrap(), Some(true));
        let and = Expr::And(vec![unknown, col("a", "s").eq(lit("zz"))]);
        assert_eq!(eval.predicate(&and, &row).unwrap(), Some(false));
        assert!(!eval.matches(&col("a", "x").in_list(vec![lit(1), lit(2)]), &row).unwrap());
    }

    #[test]
    fn test_in_list_with_null_member() {
        let v = ScalarValue::from(3);
        assert_eq!(in_values(&v, &[ScalarValue::from(3), ScalarValue::Null]), Some(true));
        assert_eq!(in_values(&v, &[ScalarValue::from(4), ScalarValue::Null]), None);
        assert_eq!(in_values(&v, &[ScalarValue::from(4)]), Some(false));
        assert_eq!(in_values(&ScalarValue::Null, &[]), Some(false));
    }

    #[test]
    fn test_like() {
        assert!(like("federated", "fed%"));
        assert!(like("federated", "%rat_d"));
        assert!(like("", "%"));
        assert!(!like("fed", "fed_"));
        assert!(!like("abc", "a%d"));
    }

    #[test]
    fn test_functions_and_arithmetic() {
        let schema = schema();
        let eval = Evaluator::new(&schema);
        let row = vec![ScalarValue::from(-4), ScalarValue::from("ab")];
        let upper = func("upper", vec![col("a", "s")]);
        assert_eq!(eval.eval(&upper, &row).unwrap(), ScalarValue::from("AB"));
        let abs = func("abs", vec![col("a", "x").plus(lit(1))]);
        assert_eq!(eval.eval(&abs, &row).unwrap(), ScalarValue::from(3));
        let mixed = col("a", "x").plus(lit(0.5));
        assert_eq!(eval.eval(&mixed, &row).unwrap(), ScalarValue::from(-3.5));
        let coalesce = func("coalesce", vec![lit(ScalarValue::Null), lit(7)]);
        assert_eq!(eval.eval(&coalesce, &row).unwrap(), ScalarValue::from(7));
        assert!(eval.eval(&col("b", "y"), &row).is_err());
    }
}
