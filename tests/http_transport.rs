//! End-to-end fetches against a mock HTTP server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use worklog_fetch::{
    CancellationToken, ClientConfig, RecordingSink, RetryPolicy, StaticToken, TimeRange,
    TruncationReason, WorklogClient,
};

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        base_url: server.uri(),
        page_size: 2,
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn client(server: &MockServer, sink: RecordingSink) -> WorklogClient {
    init_tracing();
    let transport = worklog_fetch::HttpTransport::new(&server.uri()).unwrap();
    WorklogClient::new(
        config(server),
        transport,
        Arc::new(StaticToken::new("tok")),
        Arc::new(sink),
    )
    .unwrap()
}

fn january() -> TimeRange {
    TimeRange::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn pages_through_results_with_auth_and_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/worklogs"))
        .and(header("authorization", "Bearer tok"))
        .and(query_param("authorAccountId", "acct-1"))
        .and(query_param("from", "2024-01-01"))
        .and(query_param("to", "2024-01-31"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                {"id": 1, "authorAccountId": "acct-1", "timeSpentSeconds": 1800},
                {"id": 2, "authorAccountId": "acct-1", "timeSpentSeconds": 900}
            ],
            "total": 3
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/worklogs"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": 3, "authorAccountId": "acct-1", "timeSpentSeconds": 60}],
            "total": 3
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server, RecordingSink::new())
        .fetch_subject("acct-1", january(), &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = outcome.records().iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert!(!outcome.truncated());
    assert_eq!(outcome.records()[0].time_spent_seconds, 1800);
}

#[tokio::test]
async fn rate_limited_response_waits_for_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/worklogs"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/worklogs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": "w1"}],
            "total": 1
        })))
        .mount(&server)
        .await;

    let sink = RecordingSink::new();
    let started = Instant::now();
    let outcome = client(&server, sink.clone())
        .fetch_subject("acct-1", january(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(outcome.records().len(), 1);
    assert_eq!(sink.count("retry_scheduled"), 1);
    assert_eq!(sink.count("request_succeeded"), 1);
}

#[tokio::test]
async fn persistent_server_error_is_flagged_not_hidden() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/worklogs"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let outcome = client(&server, RecordingSink::new())
        .fetch_subject("acct-1", january(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.records().is_empty());
    assert!(outcome.truncated());
    assert!(outcome
        .truncation_reasons()
        .contains(&TruncationReason::FetchError));
}

#[tokio::test]
async fn bulk_fetch_over_http_keys_results_by_subject() {
    let server = MockServer::start().await;
    for subject in ["a", "b", "c"] {
        Mock::given(method("GET"))
            .and(path("/worklogs"))
            .and(query_param("authorAccountId", subject))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"id": format!("{subject}-1"), "authorAccountId": subject}],
                "total": 1
            })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let subjects: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let bulk = client(&server, RecordingSink::new())
        .fetch_for_subjects(&subjects, january(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(bulk.subjects.len(), 3);
    assert!(!bulk.any_truncated());
    assert_eq!(
        bulk.get("c").unwrap().records()[0].subject_id.as_deref(),
        Some("c")
    );
}
