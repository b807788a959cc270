use chrono::{DateTime, Duration, Utc};
use mq_base_schema::metrics::UseCaseId;
use mq_base_schema::project::{OrganizationId, ProjectId};
use mq_indexer::MemoryIndexer;
use mq_query::{
    Bucket, BucketValue, DerivedMetricRegistry, MemoryStore, MetricsQuery, MetricsQueryResult,
    QueryConfig, QueryError, QueryParams, Value, run_metrics_query,
};
use similar_asserts::assert_eq;

const ORG: OrganizationId = OrganizationId::new(1);
const PROJECT: ProjectId = ProjectId::new(1);

const DURATION: &str = "d:transactions/duration@millisecond";
const SESSION: &str = "c:sessions/session@none";
const SESSION_ERROR: &str = "s:sessions/error@none";

struct Harness {
    indexer: MemoryIndexer,
    store: MemoryStore,
    registry: DerivedMetricRegistry,
    config: QueryConfig,
}

impl Harness {
    fn new() -> Self {
        mq_test::setup();

        Self {
            indexer: MemoryIndexer::new(),
            store: MemoryStore::new(),
            registry: DerivedMetricRegistry::builtin(),
            config: QueryConfig::default(),
        }
    }

    fn record(&self, bucket: Bucket) {
        self.store.record(&self.indexer, bucket).unwrap();
    }

    fn distribution(&self, timestamp: DateTime<Utc>, values: &[f64]) -> Bucket {
        Bucket::new(
            ORG,
            PROJECT,
            timestamp,
            DURATION,
            BucketValue::Distribution(values.to_vec()),
        )
    }

    fn params(&self, use_case: UseCaseId, fields: &[&str], days: i64) -> QueryParams {
        let start = mq_test::base_time();
        let mut params = QueryParams::new(
            ORG,
            vec![PROJECT],
            use_case,
            start,
            start + Duration::days(days),
        );
        params.fields = fields.iter().map(|f| (*f).to_owned()).collect();
        params
    }

    fn try_query(&self, params: QueryParams) -> Result<MetricsQueryResult, QueryError> {
        let query = MetricsQuery::new(params, &self.registry, &self.config)?;
        run_metrics_query(
            &query,
            &self.registry,
            &self.indexer,
            &self.store,
            &self.config,
        )
    }

    fn query(&self, params: QueryParams) -> MetricsQueryResult {
        self.try_query(params).unwrap()
    }
}

fn total(result: &MetricsQueryResult, field: &str) -> Value {
    result.groups[0].totals[field].clone()
}

#[test]
fn test_count_transactions() {
    let harness = Harness::new();
    let time = mq_test::at(3600);
    for values in [[150.0, 150.0], [50.0, 50.0], [150.0, 50.0]] {
        harness.record(harness.distribution(time, &values));
    }

    let result = harness.query(harness.params(UseCaseId::Transactions, &["count()"], 1));
    assert_eq!(total(&result, "count()"), Value::Int(6));
}

#[test]
fn test_avg_duration() {
    let harness = Harness::new();
    for hour in 0..3 {
        harness.record(harness.distribution(mq_test::at(hour * 3600), &[150.0, 50.0]));
    }

    let result = harness.query(harness.params(
        UseCaseId::Transactions,
        &["avg(transaction.duration)"],
        1,
    ));
    assert_eq!(
        total(&result, "avg(transaction.duration)"),
        Value::Float(100.0)
    );
}

#[test]
fn test_failure_rate() {
    let harness = Harness::new();
    for status in ["internal_error", "ok"] {
        let bucket = harness
            .distribution(mq_test::at(60), &[100.0, 200.0, 300.0])
            .with_tag("transaction.status", status);
        harness.record(bucket);
    }

    let result = harness.query(harness.params(
        UseCaseId::Transactions,
        &["failure_rate()", "failure_count()"],
        1,
    ));

    assert_eq!(total(&result, "failure_rate()"), Value::Float(0.5));
    assert_eq!(total(&result, "failure_count()"), Value::Int(3));
}

#[test]
fn test_composite_errored_sessions() {
    let harness = Harness::new();
    let day = |n: i64| mq_test::at(n * 86400);

    harness.record(
        Bucket::new(ORG, PROJECT, day(0), SESSION, BucketValue::Counter(4.0))
            .with_tag("session.status", "errored_preaggr"),
    );
    harness.record(
        Bucket::new(ORG, PROJECT, day(0), SESSION, BucketValue::Counter(10.0))
            .with_tag("session.status", "init"),
    );
    harness.record(Bucket::new(
        ORG,
        PROJECT,
        day(1),
        SESSION_ERROR,
        BucketValue::Set(vec![1, 2, 3]),
    ));

    let mut params = harness.params(UseCaseId::Sessions, &["session.errored"], 2);
    params.interval = Some(86400);
    let result = harness.query(params);

    assert_eq!(total(&result, "session.errored"), Value::Int(7));
    assert_eq!(
        result.groups[0].series["session.errored"],
        vec![Value::Int(4), Value::Int(3)]
    );

    insta::assert_snapshot!(serde_json::to_string(&result.to_series_data()).unwrap(), @r###"{"data":[{"session.errored":4,"time":"2021-08-25T00:00:00Z"},{"session.errored":3,"time":"2021-08-26T00:00:00Z"}],"meta":[{"name":"time","type":"DateTime('Universal')"},{"name":"session.errored","type":"integer"}]}"###);
}

#[test]
fn test_crash_free_rate_without_sessions() {
    let harness = Harness::new();
    harness.record(
        Bucket::new(
            ORG,
            ProjectId::new(2),
            mq_test::base_time(),
            SESSION,
            BucketValue::Counter(1.0),
        )
        .with_tag("session.status", "init"),
    );

    let result = harness.query(harness.params(
        UseCaseId::Sessions,
        &["session.crash_free_rate", "session.all"],
        1,
    ));

    assert_eq!(total(&result, "session.crash_free_rate"), Value::Null);
    assert_eq!(total(&result, "session.all"), Value::Int(0));
}

#[test]
fn test_fill_missing_days() {
    let harness = Harness::new();
    for (day, value) in [(0, 3.0), (2, 5.0)] {
        harness.record(Bucket::new(
            ORG,
            PROJECT,
            mq_test::at(day * 86400 + 60),
            SESSION,
            BucketValue::Counter(value),
        ));
    }

    let mut params = harness.params(UseCaseId::Sessions, &["sum(sentry.sessions.session)"], 3);
    params.interval = Some(86400);
    let result = harness.query(params);

    assert_eq!(
        result.groups[0].series["sum(sentry.sessions.session)"],
        vec![Value::Float(3.0), Value::Float(0.0), Value::Float(5.0)]
    );
}

#[test]
fn test_groupby_orderby_limit() {
    let harness = Harness::new();
    let time = mq_test::at(120);
    for (transaction, values) in [("/a", &[10.0][..]), ("/b", &[20.0, 30.0]), ("/c", &[5.0])] {
        let bucket = harness
            .distribution(time, values)
            .with_tag("transaction", transaction);
        harness.record(bucket);
    }

    let mut params = harness.params(
        UseCaseId::Transactions,
        &["count()", "p100(transaction.duration)", "transaction"],
        1,
    );
    params.groupby = vec!["transaction".to_owned()];
    params.orderby = vec!["-count()".to_owned()];
    params.query = "!transaction:/c".to_owned();
    params.limit = Some(1);
    params.include_series = false;

    let result = harness.query(params);
    assert_eq!(result.groups.len(), 1);

    let group = &result.groups[0];
    assert_eq!(group.by["transaction"], Value::from("/b"));
    assert_eq!(group.totals["count()"], Value::Int(2));
    assert_eq!(group.totals["p100(transaction.duration)"], Value::Float(30.0));
}

#[test]
fn test_union_of_groups_across_entities() {
    let harness = Harness::new();
    let time = mq_test::at(120);
    harness.record(
        harness
            .distribution(time, &[10.0])
            .with_tag("transaction", "/a"),
    );
    harness.record(
        Bucket::new(
            ORG,
            PROJECT,
            time,
            "s:transactions/user@none",
            BucketValue::Set(vec![7]),
        )
        .with_tag("transaction", "/b"),
    );

    let mut params = harness.params(
        UseCaseId::Transactions,
        &["count()", "count_unique(transaction.user)"],
        1,
    );
    params.groupby = vec!["transaction".to_owned()];
    params.include_series = false;

    let result = harness.query(params);
    let groups: Vec<_> = result
        .groups
        .iter()
        .map(|g| {
            (
                g.by["transaction"].clone(),
                g.totals["count()"].clone(),
                g.totals["count_unique(transaction.user)"].clone(),
            )
        })
        .collect();

    assert_eq!(
        groups,
        vec![
            (Value::from("/a"), Value::Int(1), Value::Int(0)),
            (Value::from("/b"), Value::Int(0), Value::Int(1)),
        ]
    );
}

#[test]
fn test_limit_across_entities() {
    let harness = Harness::new();
    let time = mq_test::at(120);
    for transaction in ["/a", "/b"] {
        harness.record(
            harness
                .distribution(time, &[10.0])
                .with_tag("transaction", transaction),
        );
    }
    for transaction in ["/c", "/d"] {
        harness.record(
            Bucket::new(
                ORG,
                PROJECT,
                time,
                "s:transactions/user@none",
                BucketValue::Set(vec![7]),
            )
            .with_tag("transaction", transaction),
        );
    }

    let mut params = harness.params(
        UseCaseId::Transactions,
        &["count()", "count_unique(transaction.user)"],
        1,
    );
    params.groupby = vec!["transaction".to_owned()];
    params.limit = Some(1);

    let result = harness.query(params.clone());
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].by["transaction"], Value::from("/a"));

    params.offset = 2;
    let result = harness.query(params);
    assert_eq!(result.groups.len(), 1);
    assert_eq!(result.groups[0].by["transaction"], Value::from("/c"));
    assert_eq!(total(&result, "count()"), Value::Int(0));
    assert_eq!(total(&result, "count_unique(transaction.user)"), Value::Int(1));
}

#[test]
fn test_invalid_percentile() {
    let harness = Harness::new();
    let params = harness.params(UseCaseId::Transactions, &["p42(transaction.duration)"], 1);

    let error = harness.try_query(params).unwrap_err();
    assert!(error.is_user_error());
}
