use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;

use crate::error::OptResult;
use crate::expr::{conjunction, ColumnRef, Expr};
use crate::operator::OperatorTrait;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum JoinKind {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    Cross,
}

impl JoinKind {
    pub fn sql_keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
            JoinKind::RightOuter => "RIGHT OUTER JOIN",
            JoinKind::FullOuter => "FULL OUTER JOIN",
            JoinKind::Cross => "CROSS JOIN",
        }
    }

    /// Whether unmatched rows of `side` are kept.
    pub fn preserves(self, side: Side) -> bool {
        matches!(
            (self, side),
            (JoinKind::LeftOuter, Side::Left)
                | (JoinKind::RightOuter, Side::Right)
                | (JoinKind::FullOuter, _)
        )
    }

    /// Whether `side` may be constrained by the values of the other side.
    pub fn allows_dependent(self, side: Side) -> bool {
        self != JoinKind::FullOuter && !self.preserves(side)
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Planner hint attached to one side of a join.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Default)]
pub enum JoinHint {
    #[default]
    None,
    /// `MAKEDEP`: make this side dependent regardless of cost.
    MakeDep,
    /// `MAKENOTDEP`: never make this side dependent.
    MakeNotDep,
}

/// Equality conjuncts oriented as `(left operand, right operand)` and the remaining criteria.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EquiCriteria {
    pub pairs: Vec<(Expr, Expr)>,
    pub residual: Vec<Expr>,
}

impl EquiCriteria {
    /// Splits `criteria` over the concatenation of `left` and `right`.
    pub fn split(criteria: &[Expr], left: &[ColumnRef], right: &[ColumnRef]) -> Self {
        let left: BTreeSet<&ColumnRef> = left.iter().collect();
        let right: BTreeSet<&ColumnRef> = right.iter().collect();
        let covered = |e: &Expr, side: &BTreeSet<&ColumnRef>| {
            let cols = e.columns();
            !cols.is_empty() && cols.iter().all(|c| side.contains(c))
        };
        let mut out = EquiCriteria::default();
        for conjunct in criteria.iter().flat_map(|c| c.conjuncts()) {
            let pair = conjunct.as_equality().and_then(|(a, b)| {
                if covered(a, &left) && covered(b, &right) {
                    Some((a.clone(), b.clone()))
                } else if covered(b, &left) && covered(a, &right) {
                    Some((b.clone(), a.clone()))
                } else {
                    None
                }
            });
            match pair {
                Some(pair) => out.pairs.push(pair),
                None => out.residual.push(conjunct),
            }
        }
        out
    }
}

/// Logical join.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Join {
    kind: JoinKind,
    criteria: Vec<Expr>,
    hints: [JoinHint; 2],
}

impl Join {
    pub fn new(kind: JoinKind, criteria: Vec<Expr>) -> Self {
        Self {
            kind,
            criteria: criteria.into_iter().flat_map(|c| c.into_conjuncts()).collect(),
            hints: [JoinHint::None; 2],
        }
    }

    pub fn with_hint(mut self, side: Side, hint: JoinHint) -> Self {
        self.hints[side.index()] = hint;
        self
    }

    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn criteria(&self) -> &[Expr] {
        &self.criteria
    }

    pub fn hint(&self, side: Side) -> JoinHint {
        self.hints[side.index()]
    }

    /// The same join with `extra` conjuncts added to its criteria.
    pub fn with_criteria(&self, extra: Vec<Expr>) -> Self {
        let mut criteria = self.criteria.clone();
        criteria.extend(extra.into_iter().flat_map(|c| c.into_conjuncts()));
        let kind = match self.kind {
            JoinKind::Cross if !criteria.is_empty() => JoinKind::Inner,
            kind => kind,
        };
        Self {
            kind,
            criteria,
            hints: self.hints,
        }
    }
}

fn concat_schema(inputs: &[&[ColumnRef]]) -> Vec<ColumnRef> {
    inputs.iter().flat_map(|cols| cols.iter().cloned()).collect()
}

fn fmt_join(f: &mut fmt::Formatter<'_>, kind: JoinKind, criteria: &[Expr]) -> fmt::Result {
    write!(f, "{}", kind.sql_keyword())?;
    if let Some(on) = conjunction(criteria.iter().cloned()) {
        write!(f, " ON {}", on)?;
    }
    Ok(())
}

impl OperatorTrait for Join {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(concat_schema(inputs))
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_join(f, self.kind, &self.criteria)?;
        for (side, hint) in [Side::Left, Side::Right].into_iter().zip(self.hints) {
            match hint {
                JoinHint::None => {}
                JoinHint::MakeDep => write!(f, ", MAKEDEP {}", side)?,
                JoinHint::MakeNotDep => write!(f, ", MAKENOTDEP {}", side)?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum JoinAlgorithm {
    /// Fully materializes `materialize` and streams the other side past it.
    NestedLoop { materialize: Side },
    /// Both inputs arrive ordered ascending on their keys.
    Merge {
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
    },
}

/// Dependent execution of a join: the driving side is consumed first and the distinct values
/// of `driving_key` populate `value_set`, which constrains the other side's access.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct DependentJoin {
    pub value_set: String,
    pub driving: Side,
    pub driving_key: Expr,
}

/// Physical join.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct JoinStrategy {
    kind: JoinKind,
    criteria: Vec<Expr>,
    algorithm: JoinAlgorithm,
    dependent: Option<DependentJoin>,
}

impl JoinStrategy {
    pub fn new(kind: JoinKind, criteria: Vec<Expr>, algorithm: JoinAlgorithm) -> Self {
        Self {
            kind,
            criteria,
            algorithm,
            dependent: None,
        }
    }

    pub fn with_dependent(mut self, dependent: DependentJoin) -> Self {
        self.dependent = Some(dependent);
        self
    }

    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    pub fn criteria(&self) -> &[Expr] {
        &self.criteria
    }

    pub fn algorithm(&self) -> &JoinAlgorithm {
        &self.algorithm
    }

    pub fn dependent(&self) -> Option<&DependentJoin> {
        self.dependent.as_ref()
    }
}

impl OperatorTrait for JoinStrategy {
    fn arity(&self) -> Option<usize> {
        Some(2)
    }

    fn derive_schema(&self, inputs: &[&[ColumnRef]]) -> OptResult<Vec<ColumnRef>> {
        Ok(concat_schema(inputs))
    }
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.algorithm {
            JoinAlgorithm::NestedLoop { materialize } => {
                write!(f, "NestedLoop, materialize {}, ", materialize)?
            }
            JoinAlgorithm::Merge {
                left_keys,
                right_keys,
            } => write!(
                f,
                "Merge [{}] = [{}], ",
                left_keys.iter().join(", "),
                right_keys.iter().join(", ")
            )?,
        }
        fmt_join(f, self.kind, &self.criteria)?;
        if let Some(dep) = &self.dependent {
            write!(
                f,
                ", {} <- {} {}",
                dep.value_set, dep.driving, dep.driving_key
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit};

    #[test]
    fn test_outer_join_dependency() {
        assert!(JoinKind::Inner.allows_dependent(Side::Left));
        assert!(JoinKind::LeftOuter.allows_dependent(Side::Right));
        assert!(!JoinKind::LeftOuter.allows_dependent(Side::Left));
        assert!(!JoinKind::FullOuter.allows_dependent(Side::Right));
    }

    #[test]
    fn test_split_orients_pairs() {
        let left = vec![ColumnRef::new("a", "id")];
        let right = vec![ColumnRef::new("b", "id"), ColumnRef::new("b", "v")];
        let split = EquiCriteria::split(
            &[
                col("b", "id").eq(col("a", "id")),
                col("b", "v").eq(lit(1)),
                col("a", "id").lt(col("b", "v")),
            ],
            &left,
            &right,
        );
        assert_eq!(split.pairs, vec![(col("a", "id"), col("b", "id"))]);
        assert_eq!(split.residual.len(), 2);
    }
}
