//! Capability registry.
//!
//! Every source declares which relational operations and functions it can execute natively.
//! The registry is a read-only snapshot built once per planning session and borrowed by every
//! rule and by the cost estimator. A missing entry means "unsupported", never "unknown".

use std::collections::{BTreeMap, BTreeSet};

use derive_more::{Display, From};
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};
use strum_macros::{EnumIter, EnumString};

use crate::command::{Command, FromClause, Query};
use crate::error::{OptResult, OptimizerError};
use crate::expr::{AggregateFunction, BinaryOp, Expr};
use crate::operator::JoinKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Serialize, Deserialize)]
pub struct SourceId(String);

impl SourceId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Hash, PartialOrd, Ord, EnumSetType, EnumIter, EnumString, strum_macros::Display, Serialize, Deserialize)]
pub enum Capability {
    /// Non-column expressions in the select list.
    SelectExpression,
    SelectDistinct,
    CompareEq,
    CompareNe,
    /// `<`, `<=`, `>`, `>=`.
    CompareOrdered,
    Like,
    InCriteria,
    IsNull,
    Not,
    Or,
    Exists,
    InSubquery,
    /// Scalar subquery in criteria.
    ScalarSubquery,
    /// Scalar subquery in the select list.
    ScalarSubqueryProjection,
    CorrelatedSubquery,
    SubqueryCorrelatedLimit,
    InnerJoin,
    OuterJoin,
    FullOuterJoin,
    CrossJoin,
    InlineViews,
    GroupBy,
    Having,
    AggregateCount,
    AggregateCountStar,
    AggregateSum,
    AggregateAvg,
    AggregateMinMax,
    AggregateDistinct,
    OrderBy,
    /// Ordering by expressions absent from the select list.
    OrderByUnrelated,
    RowLimit,
    RowOffset,
    Union,
    UnionAll,
}

/// What one source can execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "CapabilityDescriptor", into = "CapabilityDescriptor")]
pub struct SourceCapabilities {
    capabilities: EnumSet<Capability>,
    /// Lower-case function names; arithmetic operators are listed by symbol.
    functions: BTreeSet<String>,
    max_in_size: Option<u32>,
}

/// Serialized form of [`SourceCapabilities`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CapabilityDescriptor {
    capabilities: Vec<Capability>,
    functions: Vec<String>,
    max_in_size: Option<u32>,
}

impl From<CapabilityDescriptor> for SourceCapabilities {
    fn from(d: CapabilityDescriptor) -> Self {
        Self {
            capabilities: d.capabilities.into_iter().collect(),
            functions: d.functions.into_iter().map(|f| f.to_lowercase()).collect(),
            max_in_size: d.max_in_size,
        }
    }
}

impl From<SourceCapabilities> for CapabilityDescriptor {
    fn from(c: SourceCapabilities) -> Self {
        Self {
            capabilities: c.capabilities.iter().collect(),
            functions: c.functions.into_iter().collect(),
            max_in_size: c.max_in_size,
        }
    }
}

impl SourceCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capability, no functions, no IN-list bound.
    pub fn full() -> Self {
        Self {
            capabilities: EnumSet::all(),
            functions: BTreeSet::new(),
            max_in_size: None,
        }
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_all<I: IntoIterator<Item = Capability>>(mut self, capabilities: I) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.capabilities.remove(capability);
        self
    }

    pub fn with_function<S: AsRef<str>>(mut self, name: S) -> Self {
        self.functions.insert(name.as_ref().to_lowercase());
        self
    }

    pub fn with_max_in_size(mut self, max: u32) -> Self {
        self.max_in_size = Some(max);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn supports_function(&self, name: &str) -> bool {
        self.functions.contains(&name.to_lowercase())
    }

    pub fn max_in_size(&self) -> Option<u32> {
        self.max_in_size
    }
}

/// Read-only snapshot of the capabilities of all sources of one planning session.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    sources: BTreeMap<SourceId, SourceCapabilities>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: Into<SourceId>>(mut self, source: S, capabilities: SourceCapabilities) -> Self {
        self.sources.insert(source.into(), capabilities);
        self
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        self.sources.contains_key(source)
    }

    pub fn capabilities(&self, source: &SourceId) -> Option<&SourceCapabilities> {
        self.sources.get(source)
    }

    pub fn supports(&self, source: &SourceId, capability: Capability) -> bool {
        self.sources
            .get(source)
            .map_or(false, |c| c.supports(capability))
    }

    pub fn supports_function(&self, source: &SourceId, name: &str) -> bool {
        self.sources
            .get(source)
            .map_or(false, |c| c.supports_function(name))
    }

    pub fn max_in_predicate_size(&self, source: &SourceId) -> Option<u32> {
        self.sources.get(source).and_then(|c| c.max_in_size())
    }

    /// Checks that `source` can execute every construct `command` uses.
    pub fn validate(&self, source: &SourceId, command: &Command) -> OptResult<()> {
        let caps = self.sources.get(source).ok_or_else(|| {
            OptimizerError::CapabilityUnsupported(format!("source {} is not registered", source))
        })?;
        CommandValidator { caps }
            .command(command)
            .map_err(|missing| {
                OptimizerError::CapabilityUnsupported(format!(
                    "source {} does not support {} required by [{}]",
                    source, missing, command
                ))
                .into()
            })
    }
}

struct CommandValidator<'a> {
    caps: &'a SourceCapabilities,
}

type Missing = String;

impl<'a> CommandValidator<'a> {
    fn require(&self, capability: Capability) -> Result<(), Missing> {
        if self.caps.supports(capability) {
            Ok(())
        } else {
            Err(capability.to_string())
        }
    }

    fn command(&self, command: &Command) -> Result<(), Missing> {
        match command {
            Command::Query(q) => self.query(q),
            Command::SetQuery(s) => {
                self.require(if s.all {
                    Capability::UnionAll
                } else {
                    Capability::Union
                })?;
                if !s.order_by.is_empty() {
                    self.require(Capability::OrderBy)?;
                }
                if let Some(limit) = s.limit {
                    self.limit(limit.offset, limit.count)?;
                }
                s.branches.iter().try_for_each(|b| self.command(b))
            }
        }
    }

    fn limit(&self, offset: u64, count: Option<u64>) -> Result<(), Missing> {
        if count.is_some() {
            self.require(Capability::RowLimit)?;
        }
        if offset > 0 {
            self.require(Capability::RowOffset)?;
        }
        Ok(())
    }

    fn query(&self, q: &Query) -> Result<(), Missing> {
        let scope = q.from.aliases();
        if q.distinct {
            self.require(Capability::SelectDistinct)?;
        }
        for item in &q.select {
            match &item.expr {
                Expr::Column(_) => {}
                Expr::Aggregate { arg, .. }
                    if arg.as_ref().map_or(true, |a| a.as_column().is_some()) => {}
                Expr::ScalarSubquery(_) => {}
                _ => self.require(Capability::SelectExpression)?,
            }
            self.expr(&item.expr, true, &scope)?;
        }
        self.from(&q.from, &scope)?;
        if let Some(criteria) = &q.criteria {
            self.expr(criteria, false, &scope)?;
        }
        if !q.group_by.is_empty() {
            self.require(Capability::GroupBy)?;
            for key in &q.group_by {
                if key.as_column().is_none() {
                    self.require(Capability::SelectExpression)?;
                }
                self.expr(key, false, &scope)?;
            }
        }
        if let Some(having) = &q.having {
            self.require(Capability::Having)?;
            self.expr(having, false, &scope)?;
        }
        if !q.order_by.is_empty() {
            self.require(Capability::OrderBy)?;
            for key in &q.order_by {
                if !q.select.iter().any(|item| item.expr == key.expr) {
                    self.require(Capability::OrderByUnrelated)?;
                }
                self.expr(&key.expr, false, &scope)?;
            }
        }
        if let Some(limit) = q.limit {
            self.limit(limit.offset, limit.count)?;
        }
        Ok(())
    }

    fn from(&self, clause: &FromClause, scope: &BTreeSet<String>) -> Result<(), Missing> {
        let mut stack = vec![clause];
        while let Some(clause) = stack.pop() {
            match clause {
                FromClause::Group(_) => {}
                FromClause::Derived { command, .. } => {
                    self.require(Capability::InlineViews)?;
                    self.command(command)?;
                }
                FromClause::Join {
                    kind,
                    left,
                    right,
                    criteria,
                } => {
                    self.require(match kind {
                        JoinKind::Inner => Capability::InnerJoin,
                        JoinKind::LeftOuter | JoinKind::RightOuter => Capability::OuterJoin,
                        JoinKind::FullOuter => Capability::FullOuterJoin,
                        JoinKind::Cross => Capability::CrossJoin,
                    })?;
                    for c in criteria {
                        self.expr(c, false, scope)?;
                    }
                    stack.push(left);
                    stack.push(right);
                }
            }
        }
        Ok(())
    }

    fn expr(&self, expr: &Expr, in_select: bool, scope: &BTreeSet<String>) -> Result<(), Missing> {
        for e in expr.walk() {
            match e {
                Expr::Column(_) | Expr::Literal(_) | Expr::And(_) => {}
                Expr::Binary { op, .. } => match op {
                    BinaryOp::Eq => self.require(Capability::CompareEq)?,
                    BinaryOp::NotEq => self.require(Capability::CompareNe)?,
                    BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
                        self.require(Capability::CompareOrdered)?
                    }
                    arithmetic => {
                        if !self.caps.supports_function(arithmetic.symbol()) {
                            return Err(format!("function {}", arithmetic.symbol()));
                        }
                    }
                },
                Expr::Or(_) => self.require(Capability::Or)?,
                Expr::Not(_) => self.require(Capability::Not)?,
                Expr::IsNull(_) => self.require(Capability::IsNull)?,
                Expr::Like { .. } => self.require(Capability::Like)?,
                Expr::InList { list, .. } => {
                    self.require(Capability::InCriteria)?;
                    if let Some(max) = self.caps.max_in_size() {
                        if list.len() > max as usize {
                            return Err(format!("IN list of {} values (max {})", list.len(), max));
                        }
                    }
                }
                Expr::DependentSet { .. } => {
                    self.require(Capability::InCriteria)?;
                    if self.caps.max_in_size() == Some(0) {
                        return Err("dependent value binding".to_string());
                    }
                }
                Expr::Function { name, .. } => {
                    if !self.caps.supports_function(name) {
                        return Err(format!("function {}", name));
                    }
                }
                Expr::Aggregate { func, arg, distinct } => {
                    self.require(match (func, arg) {
                        (AggregateFunction::Count, None) => Capability::AggregateCountStar,
                        (AggregateFunction::Count, Some(_)) => Capability::AggregateCount,
                        (AggregateFunction::Sum, _) => Capability::AggregateSum,
                        (AggregateFunction::Avg, _) => Capability::AggregateAvg,
                        (AggregateFunction::Min, _) | (AggregateFunction::Max, _) => {
                            Capability::AggregateMinMax
                        }
                    })?;
                    if *distinct {
                        self.require(Capability::AggregateDistinct)?;
                    }
                }
                Expr::Exists(sub) => {
                    self.require(Capability::Exists)?;
                    self.subquery(sub, scope)?;
                }
                Expr::InSubquery { subquery, .. } => {
                    self.require(Capability::InSubquery)?;
                    self.subquery(subquery, scope)?;
                }
                Expr::ScalarSubquery(sub) => {
                    self.require(if in_select {
                        Capability::ScalarSubqueryProjection
                    } else {
                        Capability::ScalarSubquery
                    })?;
                    self.subquery(sub, scope)?;
                }
            }
        }
        Ok(())
    }

    fn subquery(&self, sub: &Command, scope: &BTreeSet<String>) -> Result<(), Missing> {
        let correlated = sub.free_columns().iter().any(|c| scope.contains(&c.group));
        if correlated {
            self.require(Capability::CorrelatedSubquery)?;
            if sub.limit().is_some() {
                self.require(Capability::SubqueryCorrelatedLimit)?;
            }
        }
        self.command(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::scan_command;
    use crate::expr::{col, func, lit};

    fn registry(caps: SourceCapabilities) -> CapabilityRegistry {
        CapabilityRegistry::new().register("s1", caps)
    }

    #[test]
    fn test_absent_source_is_unsupported() {
        let reg = CapabilityRegistry::new();
        let s = SourceId::from("nope");
        assert!(!reg.supports(&s, Capability::CompareEq));
        assert!(!reg.supports_function(&s, "upper"));
        assert_eq!(reg.max_in_predicate_size(&s), None);
        assert!(reg.validate(&s, &scan_command("a", "t", &["x"])).is_err());
    }

    #[test]
    fn test_descriptor_from_json() {
        let caps: SourceCapabilities = serde_json::from_str(
            r#"{"capabilities": ["CompareEq", "InCriteria"], "functions": ["UPPER"], "max_in_size": 50}"#,
        )
        .unwrap();
        assert!(caps.supports(Capability::InCriteria));
        assert!(!caps.supports(Capability::OrderBy));
        assert!(caps.supports_function("upper"));
        assert_eq!(caps.max_in_size(), Some(50));
    }

    #[test]
    fn test_validate_criteria_and_functions() {
        let reg = registry(SourceCapabilities::new().with(Capability::CompareEq));
        let s = SourceId::from("s1");
        let eq = scan_command("a", "t", &["x"])
            .push_criteria(&col("a", "x").eq(lit(1)))
            .unwrap();
        assert!(reg.validate(&s, &eq).is_ok());

        let upper = scan_command("a", "t", &["x"])
            .push_criteria(&func("upper", vec![col("a", "x")]).eq(lit("A")))
            .unwrap();
        let err = reg.validate(&s, &upper).unwrap_err();
        assert!(matches!(
            OptimizerError::of(&err),
            Some(OptimizerError::CapabilityUnsupported(msg)) if msg.contains("function upper")
        ));
    }

    #[test]
    fn test_in_list_size_bound() {
        let reg = registry(
            SourceCapabilities::new()
                .with(Capability::InCriteria)
                .with_max_in_size(2),
        );
        let s = SourceId::from("s1");
        let small = scan_command("a", "t", &["x"])
            .push_criteria(&col("a", "x").in_list(vec![lit(1), lit(2)]))
            .unwrap();
        let large = scan_command("a", "t", &["x"])
            .push_criteria(&col("a", "x").in_list(vec![lit(1), lit(2), lit(3)]))
            .unwrap();
        assert!(reg.validate(&s, &small).is_ok());
        assert!(reg.validate(&s, &large).is_err());
    }

    #[test]
    fn test_correlated_exists_requires_capability() {
        let inner = scan_command("b", "t2", &["y"])
            .push_criteria(&col("b", "y").eq(col("a", "x")))
            .unwrap();
        let outer = scan_command("a", "t1", &["x"])
            .push_criteria(&Expr::Exists(Box::new(inner)))
            .unwrap();
        let s = SourceId::from("s1");
        let base = SourceCapabilities::new().with_all([Capability::CompareEq, Capability::Exists]);
        assert!(registry(base.clone()).validate(&s, &outer).is_err());
        assert!(registry(base.with(Capability::CorrelatedSubquery))
            .validate(&s, &outer)
            .is_ok());
    }
}
