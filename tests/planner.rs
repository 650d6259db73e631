use std::sync::Arc;

use fed_optimizer::capability::{Capability, CapabilityRegistry, SourceCapabilities, SourceId};
use fed_optimizer::command::{Command, SelectItem};
use fed_optimizer::config::OptimizerConfig;
use fed_optimizer::error::OptimizerError;
use fed_optimizer::expr::{col, func, ColumnRef};
use fed_optimizer::operator::{
    Join, JoinHint, JoinKind, Operator, PhysicalOperator, Side, Source, Subquery, SubqueryKind,
};
use fed_optimizer::plan::{LogicalPlanBuilder, Plan};
use fed_optimizer::planner::Planner;
use fed_optimizer::stat::{CardinalityHints, InMemoryStatistics, NoStatistics, TableStatistics};

fn planner(registry: CapabilityRegistry, hints: impl CardinalityHints + 'static) -> Planner {
    Planner::new(Arc::new(registry), Arc::new(hints), OptimizerConfig::default())
}

fn two_sources(x: SourceCapabilities, y: SourceCapabilities) -> CapabilityRegistry {
    CapabilityRegistry::new().register("x", x).register("y", y)
}

fn sized(a_rows: f64, b_rows: f64) -> InMemoryStatistics {
    InMemoryStatistics::new()
        .with_table("x", "ta", TableStatistics::new(a_rows))
        .with_table("y", "tb", TableStatistics::new(b_rows))
}

fn count(plan: &Plan, name: &str) -> usize {
    plan.find_all(|op| op.name() == name).len()
}

fn accesses(plan: &Plan) -> Vec<(SourceId, Command)> {
    plan.bfs_iterator()
        .filter_map(|node| match node.operator() {
            Operator::Physical(op) => op
                .access()
                .map(|a| (a.source().clone(), a.command().clone())),
            Operator::Logical(_) => None,
        })
        .collect()
}

fn dependent_source(plan: &Plan) -> Option<SourceId> {
    plan.bfs_iterator().find_map(|node| match node.operator() {
        Operator::Physical(PhysicalOperator::PhysicalDependentAccess(dep)) => {
            Some(dep.access().source().clone())
        }
        _ => None,
    })
}

/// `SELECT * FROM x.ta AS a JOIN y.tb AS b ON a.k = b.k`
fn cross_source_join(join: Join, b: Source) -> Plan {
    let mut builder = LogicalPlanBuilder::new();
    let right = builder.source(b).build().unwrap().root();
    builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .join_with(join, right)
        .build()
        .unwrap()
}

fn equi_join() -> Join {
    Join::new(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))])
}

fn b_source() -> Source {
    Source::new("y", "b", "tb", &["k", "w"])
}

#[test]
fn test_every_pushed_command_is_supported_by_its_source() {
    let registry = two_sources(
        SourceCapabilities::full().without(Capability::OrderBy),
        SourceCapabilities::full(),
    );
    let mut builder = LogicalPlanBuilder::new();
    let right = builder.source(b_source()).build().unwrap().root();
    let plan = builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .select(col("a", "v").eq(func("upper", vec![col("a", "k")])))
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
        .sort(vec![fed_optimizer::command::SortKey::asc(col("a", "k"))])
        .build()
        .unwrap();

    let planned = planner(registry.clone(), sized(10.0, 1e6)).plan(plan).unwrap();
    for (source, command) in accesses(&planned) {
        assert!(
            registry.validate(&source, &command).is_ok(),
            "{} cannot run {}",
            source,
            command
        );
    }
    // Neither UPPER nor the ordering is pushed to x.
    assert_eq!(1, count(&planned, "Select"));
    assert_eq!(1, count(&planned, "Sort"));
}

#[test]
fn test_unbound_access_pattern_forces_dependent_join() {
    let registry = two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let plan = cross_source_join(equi_join(), b_source().with_access_pattern(&["k"]));

    let planned = planner(registry, NoStatistics).plan(plan).unwrap();
    assert_eq!(1, count(&planned, "JoinStrategy"));
    assert_eq!(1, count(&planned, "DependentAccess"));
    assert_eq!(1, count(&planned, "Access"));
    assert_eq!(Some(SourceId::from("y")), dependent_source(&planned));
}

#[test]
fn test_unbindable_access_pattern_fails_planning() {
    let registry = two_sources(
        SourceCapabilities::full(),
        SourceCapabilities::full().without(Capability::InCriteria),
    );
    let plan = cross_source_join(equi_join(), b_source().with_access_pattern(&["k"]));

    let err = planner(registry, NoStatistics).plan(plan).unwrap_err();
    assert!(matches!(
        OptimizerError::of(&err),
        Some(OptimizerError::UnsatisfiableAccessPattern(_))
    ));
}

#[test]
fn test_weak_side_is_made_dependent() {
    let registry = || two_sources(SourceCapabilities::full(), SourceCapabilities::full());

    let planned = planner(registry(), sized(10.0, 1e6))
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap();
    assert_eq!(Some(SourceId::from("y")), dependent_source(&planned));

    let planned = planner(registry(), sized(1e6, 10.0))
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap();
    assert_eq!(Some(SourceId::from("x")), dependent_source(&planned));
}

#[test]
fn test_no_dependent_join_without_a_cost_decision() {
    let registry = || two_sources(SourceCapabilities::full(), SourceCapabilities::full());

    for hints in [sized(10.0, 20.0), sized(1e6, 2e6)] {
        let planned = planner(registry(), hints)
            .plan(cross_source_join(equi_join(), b_source()))
            .unwrap();
        assert_eq!(0, count(&planned, "DependentAccess"));
        assert_eq!(1, count(&planned, "JoinStrategy"));
    }

    let planned = planner(registry(), NoStatistics)
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap();
    assert_eq!(0, count(&planned, "DependentAccess"));
}

#[test]
fn test_unknown_cardinality_counts_as_weak() {
    let registry = || two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let only_x = |rows: f64| {
        InMemoryStatistics::new().with_table("x", "ta", TableStatistics::new(rows))
    };

    let planned = planner(registry(), only_x(10.0))
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap();
    assert_eq!(Some(SourceId::from("y")), dependent_source(&planned));

    // Two weak sides.
    let planned = planner(registry(), only_x(1e6))
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap();
    assert_eq!(None, dependent_source(&planned));
}

#[test]
fn test_cost_choice_falls_back_when_dependent_command_is_limited() {
    let registry = two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let mut builder = LogicalPlanBuilder::new();
    let right = builder
        .source(b_source())
        .limit(0, Some(5000))
        .build()
        .unwrap()
        .root();
    let plan = builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
        .build()
        .unwrap();

    let planned = planner(registry, sized(10.0, 1e6)).plan(plan).unwrap();
    assert_eq!(0, count(&planned, "DependentAccess"));
    assert_eq!(1, count(&planned, "JoinStrategy"));
}

/// `(x.ta AS a JOIN y.tb AS b ON a.k = b.k) JOIN z.tc AS c ON a.k = c.k`, where `c` can only be
/// read with a bound `k`.
fn three_way_join() -> Plan {
    let mut builder = LogicalPlanBuilder::new();
    let b = builder.source(b_source()).build().unwrap().root();
    let c = builder
        .source(Source::new("z", "c", "tc", &["k", "u"]).with_access_pattern(&["k"]))
        .build()
        .unwrap()
        .root();
    builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], b)
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("c", "k"))], c)
        .build()
        .unwrap()
}

#[test]
fn test_three_regions_are_made_dependent_pairwise() {
    let registry = || {
        two_sources(SourceCapabilities::full(), SourceCapabilities::full())
            .register("z", SourceCapabilities::full())
    };

    let once = planner(registry(), sized(10.0, 1e6))
        .plan(three_way_join())
        .unwrap();
    assert_eq!(2, count(&once, "JoinStrategy"));
    assert_eq!(2, count(&once, "DependentAccess"));
    assert_eq!(1, count(&once, "Access"));
    let mut dependents: Vec<SourceId> = once
        .bfs_iterator()
        .filter_map(|node| match node.operator() {
            Operator::Physical(PhysicalOperator::PhysicalDependentAccess(dep)) => {
                Some(dep.access().source().clone())
            }
            _ => None,
        })
        .collect();
    dependents.sort();
    assert_eq!(vec![SourceId::from("y"), SourceId::from("z")], dependents);

    let twice = planner(registry(), sized(10.0, 1e6))
        .plan(once.clone())
        .unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_makedep_overrides_cost() {
    let registry = || two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let hinted = || equi_join().with_hint(Side::Right, JoinHint::MakeDep);

    // Cost alone would make the left side dependent.
    let planned = planner(registry(), sized(1e6, 10.0))
        .plan(cross_source_join(hinted(), b_source()))
        .unwrap();
    assert_eq!(Some(SourceId::from("y")), dependent_source(&planned));

    let registry = two_sources(
        SourceCapabilities::full(),
        SourceCapabilities::full().without(Capability::InCriteria),
    );
    let err = planner(registry, sized(1e6, 10.0))
        .plan(cross_source_join(hinted(), b_source()))
        .unwrap_err();
    assert!(matches!(
        OptimizerError::of(&err),
        Some(OptimizerError::UnsatisfiableAccessPattern(_))
    ));
}

#[test]
fn test_makenotdep_prevents_dependent_side() {
    let registry = two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let join = equi_join().with_hint(Side::Right, JoinHint::MakeNotDep);

    let planned = planner(registry, sized(10.0, 1e6))
        .plan(cross_source_join(join, b_source()))
        .unwrap();
    assert_eq!(0, count(&planned, "DependentAccess"));
}

#[test]
fn test_same_source_join_is_one_access() {
    let registry = CapabilityRegistry::new().register("x", SourceCapabilities::full());
    let mut builder = LogicalPlanBuilder::new();
    let right = builder
        .source(Source::new("x", "b", "tb", &["k", "w"]))
        .build()
        .unwrap()
        .root();
    let plan = builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
        .build()
        .unwrap();

    let planned = planner(registry, NoStatistics).plan(plan).unwrap();
    assert_eq!("Access", planned.root().operator().name());
    assert_eq!(0, count(&planned, "JoinStrategy"));
    let (_, command) = accesses(&planned).remove(0);
    let text = command.to_string();
    assert!(text.contains("JOIN tb AS b"), "{}", text);
    assert!(text.contains("a.k = b.k"), "{}", text);
}

fn three_branch_union() -> Plan {
    let mut builder = LogicalPlanBuilder::new();
    let y = builder
        .source(Source::new("y", "b", "tb", &["k"]))
        .build()
        .unwrap()
        .root();
    let x2 = builder
        .source(Source::new("x", "c", "tc", &["k"]))
        .build()
        .unwrap()
        .root();
    builder
        .source(Source::new("x", "a", "ta", &["k"]))
        .union(true, vec![y, x2])
        .build()
        .unwrap()
}

#[test]
fn test_union_branches_merge_per_source() {
    let registry = two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let planned = planner(registry, NoStatistics).plan(three_branch_union()).unwrap();

    assert_eq!("UnionAll", planned.root().operator().name());
    let branches = planned.root().inputs().to_vec();
    assert_eq!(2, branches.len());
    let sources: Vec<SourceId> = accesses(&planned).into_iter().map(|(s, _)| s).collect();
    assert_eq!(vec![SourceId::from("x"), SourceId::from("y")], sources);
    match &accesses(&planned)[0].1 {
        Command::SetQuery(set) => {
            assert!(set.all);
            assert_eq!(2, set.branches.len());
        }
        other => panic!("expected a set query, got {}", other),
    }
}

#[test]
fn test_union_merge_is_idempotent() {
    let registry = || two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let once = planner(registry(), NoStatistics)
        .plan(three_branch_union())
        .unwrap();
    let twice = planner(registry(), NoStatistics).plan(once.clone()).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_union_without_set_capability_keeps_branches() {
    let registry = two_sources(
        SourceCapabilities::full().without(Capability::UnionAll),
        SourceCapabilities::full(),
    );
    let planned = planner(registry, NoStatistics).plan(three_branch_union()).unwrap();
    assert_eq!(3, planned.root().inputs().len());
    assert_eq!(3, count(&planned, "Access"));
}

/// `SELECT a.k, a.v FROM ta AS a WHERE EXISTS (SELECT b.k FROM tb AS b WHERE b.k = <outer>)`
fn exists_plan(outer_project: Option<Vec<SelectItem>>, correlated: ColumnRef) -> Plan {
    let mut builder = LogicalPlanBuilder::new();
    let inner = builder
        .source(Source::new("x", "b", "tb", &["k"]))
        .select(col("b", "k").eq(fed_optimizer::expr::Expr::Column(correlated)))
        .build()
        .unwrap()
        .root();
    builder.source(Source::new("x", "a", "ta", &["k", "v"]));
    if let Some(items) = outer_project {
        builder.project(items);
    }
    builder
        .subquery(Subquery::new(SubqueryKind::Exists), inner)
        .build()
        .unwrap()
}

#[test]
fn test_correlated_exists_is_pushed_into_one_command() {
    let registry = CapabilityRegistry::new().register("x", SourceCapabilities::full());
    let plan = exists_plan(None, ColumnRef::new("a", "k"));

    let planned = planner(registry, NoStatistics).plan(plan).unwrap();
    assert_eq!("Access", planned.root().operator().name());
    let (_, command) = accesses(&planned).remove(0);
    assert!(
        command
            .to_string()
            .contains("EXISTS (SELECT b.k FROM tb AS b WHERE b.k = a.k)"),
        "{}",
        command
    );
}

#[test]
fn test_correlated_exists_without_capability_stays_dependent() {
    let registry = CapabilityRegistry::new().register(
        "x",
        SourceCapabilities::full().without(Capability::CorrelatedSubquery),
    );
    let plan = exists_plan(None, ColumnRef::new("a", "k"));

    let planned = planner(registry, NoStatistics).plan(plan).unwrap();
    assert_eq!("DependentSelect", planned.root().operator().name());
    assert_eq!(2, count(&planned, "Access"));
}

#[test]
fn test_correlation_to_local_expression_stays_dependent() {
    let registry = CapabilityRegistry::new().register("x", SourceCapabilities::full());
    let items = vec![
        SelectItem::column(ColumnRef::new("a", "k")),
        SelectItem::new(
            func("upper", vec![col("a", "v")]),
            ColumnRef::new("p", "u"),
        ),
    ];
    let plan = exists_plan(Some(items), ColumnRef::new("p", "u"));

    let planned = planner(registry, NoStatistics).plan(plan).unwrap();
    assert_eq!("DependentSelect", planned.root().operator().name());
    assert_eq!(1, count(&planned, "Project"));
}

#[test]
fn test_unregistered_source_is_rejected() {
    let registry = CapabilityRegistry::new().register("x", SourceCapabilities::full());
    let plan = cross_source_join(equi_join(), b_source());

    let err = planner(registry, NoStatistics).plan(plan).unwrap_err();
    assert!(matches!(
        OptimizerError::of(&err),
        Some(OptimizerError::CapabilityUnsupported(_))
    ));
}

#[test]
fn test_rule_budget_exhaustion() {
    let registry = two_sources(SourceCapabilities::full(), SourceCapabilities::full());
    let planner = Planner::new(
        Arc::new(registry),
        Arc::new(NoStatistics),
        OptimizerConfig::default().with_max_rule_applications(1),
    );

    let err = planner
        .plan(cross_source_join(equi_join(), b_source()))
        .unwrap_err();
    match OptimizerError::of(&err) {
        Some(OptimizerError::PlanningExhausted {
            applications,
            rule_trail,
        }) => {
            assert_eq!(1, *applications);
            assert!(!rule_trail.is_empty());
        }
        other => panic!("unexpected error {:?}", other),
    }
}
