use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;

use fed_optimizer::capability::{Capability, CapabilityRegistry, SourceCapabilities, SourceId};
use fed_optimizer::command::{SelectItem, SortKey};
use fed_optimizer::config::OptimizerConfig;
use fed_optimizer::error::{OptResult, OptimizerError};
use fed_optimizer::exec::{
    Batch, BatchStream, Connector, ConnectorRegistry, ConnectorRequest, ExecContext,
    PlanExecution, Row,
};
use fed_optimizer::expr::{aggregate, col, count_star, AggregateFunction, ColumnRef, ScalarValue};
use fed_optimizer::operator::{JoinKind, Source};
use fed_optimizer::plan::{LogicalPlanBuilder, Plan};
use fed_optimizer::planner::Planner;
use fed_optimizer::stat::{CardinalityHints, InMemoryStatistics, NoStatistics, TableStatistics};

#[derive(Clone)]
enum Response {
    Rows(Vec<Row>),
    Fail(&'static str),
    Pending,
}

/// Answers the n-th request with the n-th canned response and records every request.
struct MockConnector {
    responses: Vec<Response>,
    requests: Mutex<Vec<ConnectorRequest>>,
}

impl MockConnector {
    fn new(responses: Vec<Response>) -> Arc<Self> {
        Arc::new(Self {
            responses,
            requests: Mutex::new(vec![]),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.to_string())
            .collect()
    }

    fn all_cancelled(&self) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.cancel.is_cancelled())
    }
}

impl Connector for MockConnector {
    fn execute(&self, request: ConnectorRequest) -> OptResult<BatchStream> {
        let mut requests = self.requests.lock().unwrap();
        let response = self
            .responses
            .get(requests.len())
            .cloned()
            .unwrap_or(Response::Rows(vec![]));
        requests.push(request);
        let stream: BatchStream = match response {
            Response::Rows(rows) => Box::pin(tokio_stream::iter(vec![OptResult::Ok(
                Batch::new(rows),
            )])),
            Response::Fail(message) => {
                Box::pin(tokio_stream::iter(vec![OptResult::<Batch>::Err(anyhow!(message))]))
            }
            Response::Pending => Box::pin(futures::stream::pending::<OptResult<Batch>>()),
        };
        Ok(stream)
    }
}

fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(v)
}

fn text(v: &str) -> ScalarValue {
    ScalarValue::Utf8(v.to_string())
}

fn registry(x: SourceCapabilities, y: SourceCapabilities) -> Arc<CapabilityRegistry> {
    Arc::new(CapabilityRegistry::new().register("x", x).register("y", y))
}

fn plan(
    registry: &Arc<CapabilityRegistry>,
    hints: impl CardinalityHints + 'static,
    logical: Plan,
) -> Plan {
    Planner::new(registry.clone(), Arc::new(hints), OptimizerConfig::default())
        .plan(logical)
        .unwrap()
}

fn execution(
    plan: &Plan,
    registry: &Arc<CapabilityRegistry>,
    connectors: Vec<(&str, Arc<MockConnector>)>,
) -> PlanExecution {
    let connectors = connectors
        .into_iter()
        .fold(ConnectorRegistry::new(), |reg, (source, c)| {
            reg.register(source, c as Arc<dyn Connector>)
        });
    let ctx = ExecContext::new(
        Arc::new(connectors),
        registry.clone(),
        OptimizerConfig::default(),
    );
    PlanExecution::new(plan, ctx).unwrap()
}

/// `x.ta AS a JOIN y.tb AS b ON a.k = b.k` with `a` strong and `b` weak, so `b` depends on `a`.
fn dependent_join_plan(registry: &Arc<CapabilityRegistry>) -> Plan {
    let mut builder = LogicalPlanBuilder::new();
    let right = builder
        .source(Source::new("y", "b", "tb", &["k", "w"]))
        .build()
        .unwrap()
        .root();
    let logical = builder
        .source(Source::new("x", "a", "ta", &["k", "v"]))
        .join(JoinKind::Inner, vec![col("a", "k").eq(col("b", "k"))], right)
        .build()
        .unwrap();
    let hints = InMemoryStatistics::new()
        .with_table("x", "ta", TableStatistics::new(10.0))
        .with_table("y", "tb", TableStatistics::new(1e6));
    plan(registry, hints, logical)
}

#[tokio::test]
async fn test_dependent_join_chunks_value_set() {
    let registry = registry(
        SourceCapabilities::full(),
        SourceCapabilities::full().with_max_in_size(2),
    );
    let plan = dependent_join_plan(&registry);
    let x = MockConnector::new(vec![Response::Rows(vec![
        vec![int(3), text("a3")],
        vec![int(1), text("a1")],
        vec![ScalarValue::Null, text("a0")],
        vec![int(5), text("a5")],
        vec![int(2), text("a2")],
        vec![int(4), text("a4")],
        vec![int(3), text("a3b")],
    ])]);
    let y = MockConnector::new(vec![
        Response::Rows(vec![vec![int(1), text("w1")]]),
        Response::Rows(vec![vec![int(3), text("w3")]]),
        Response::Rows(vec![]),
    ]);

    let mut rows = execution(&plan, &registry, vec![("x", x.clone()), ("y", y.clone())])
        .collect_rows()
        .await
        .unwrap();
    rows.sort();

    assert_eq!(1, x.commands().len());
    let commands = y.commands();
    assert_eq!(3, commands.len());
    assert!(commands[0].contains("b.k IN (1, 2)"), "{}", commands[0]);
    assert!(commands[1].contains("b.k IN (3, 4)"), "{}", commands[1]);
    assert!(commands[2].contains("b.k IN (5)"), "{}", commands[2]);
    assert_eq!(
        vec![
            vec![int(1), text("a1"), int(1), text("w1")],
            vec![int(3), text("a3"), int(3), text("w3")],
            vec![int(3), text("a3b"), int(3), text("w3")],
        ],
        rows
    );
}

#[tokio::test]
async fn test_empty_value_set_skips_dependent_source() {
    let registry = registry(SourceCapabilities::full(), SourceCapabilities::full());
    let plan = dependent_join_plan(&registry);
    let x = MockConnector::new(vec![Response::Rows(vec![])]);
    let y = MockConnector::new(vec![]);

    let rows = execution(&plan, &registry, vec![("x", x), ("y", y.clone())])
        .collect_rows()
        .await
        .unwrap();

    assert!(rows.is_empty());
    assert!(y.commands().is_empty());
}

#[tokio::test]
async fn test_connector_failure_cancels_plan() {
    let registry = registry(SourceCapabilities::full(), SourceCapabilities::full());
    let plan = dependent_join_plan(&registry);
    let x = MockConnector::new(vec![Response::Rows(vec![vec![int(1), text("a1")]])]);
    let y = MockConnector::new(vec![Response::Fail("connection reset")]);

    let mut exec = execution(&plan, &registry, vec![("x", x.clone()), ("y", y)]);
    let err = loop {
        match exec.next().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e,
            None => panic!("execution finished without the connector error"),
        }
    };

    match OptimizerError::of(&err) {
        Some(OptimizerError::ConnectorExecution { source_id, message }) => {
            assert_eq!(&SourceId::from("y"), source_id);
            assert!(message.contains("connection reset"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(x.all_cancelled());
    assert!(exec.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_while_source_is_pending() {
    let registry = registry(SourceCapabilities::full(), SourceCapabilities::full());
    let logical = LogicalPlanBuilder::new()
        .source(Source::new("x", "a", "ta", &["k"]))
        .build()
        .unwrap();
    let plan = plan(&registry, NoStatistics, logical);
    let x = MockConnector::new(vec![Response::Pending]);

    let mut exec = execution(&plan, &registry, vec![("x", x.clone())]);
    let waited = tokio::time::timeout(Duration::from_millis(20), exec.next()).await;
    assert!(waited.is_err());

    exec.cancel_token().cancel();
    let err = exec.next().await.unwrap().unwrap_err();
    assert_eq!(Some(&OptimizerError::Cancelled), OptimizerError::of(&err));
    assert!(x.all_cancelled());
    assert!(exec.next().await.is_none());
}

#[tokio::test]
async fn test_local_sort_and_limit() {
    let registry = registry(
        SourceCapabilities::full()
            .without(Capability::OrderBy)
            .without(Capability::RowLimit),
        SourceCapabilities::full(),
    );
    let logical = LogicalPlanBuilder::new()
        .source(Source::new("x", "a", "ta", &["k"]))
        .sort(vec![SortKey::desc(col("a", "k"))])
        .limit(0, Some(2))
        .build()
        .unwrap();
    let plan = plan(&registry, NoStatistics, logical);
    let x = MockConnector::new(vec![Response::Rows(
        [3, 1, 2, 5, 4].iter().map(|k| vec![int(*k)]).collect(),
    )]);

    let rows = execution(&plan, &registry, vec![("x", x)])
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(vec![vec![int(5)], vec![int(4)]], rows);
}

#[tokio::test]
async fn test_local_aggregation() {
    let registry = registry(
        SourceCapabilities::full()
            .without(Capability::AggregateCountStar)
            .without(Capability::AggregateSum),
        SourceCapabilities::full(),
    );
    let logical = LogicalPlanBuilder::new()
        .source(Source::new("x", "a", "ta", &["k"]))
        .group(
            vec![],
            vec![
                SelectItem::new(count_star(), ColumnRef::new("a", "n")),
                SelectItem::new(
                    aggregate(AggregateFunction::Sum, col("a", "k")),
                    ColumnRef::new("a", "s"),
                ),
            ],
        )
        .build()
        .unwrap();
    let plan = plan(&registry, NoStatistics, logical);
    assert_eq!("Grouping", plan.root().operator().name());
    let x = MockConnector::new(vec![Response::Rows(vec![
        vec![int(4)],
        vec![ScalarValue::Null],
        vec![int(6)],
    ])]);

    let rows = execution(&plan, &registry, vec![("x", x)])
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(vec![vec![int(3), int(10)]], rows);
}

#[test]
fn test_capability_descriptor_from_json() {
    let caps: SourceCapabilities = serde_json::from_str(
        r#"{"capabilities": ["CompareEq", "InCriteria", "InnerJoin"], "functions": [], "max_in_size": 2}"#,
    )
    .unwrap();
    let registry = CapabilityRegistry::new().register("x", caps);
    let x = SourceId::from("x");
    assert!(registry.supports(&x, Capability::InCriteria));
    assert!(!registry.supports(&x, Capability::OrderBy));
    assert_eq!(Some(2), registry.max_in_predicate_size(&x));
}
