//! End-to-end tests of the HTTP job service client against a mock server.
//!
//! Uses wiremock to stand in for the threads/messages/runs API.

use std::time::Duration;

use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

use research_orchestrator::model::{JobStatus, WorkItem};
use research_orchestrator::poller::{JobPoller, PollSettings};
use research_orchestrator::service::{HttpJobService, JobService, MessageRole, ServiceError};

const KEY: &str = "sk-test";

fn client(server: &MockServer) -> HttpJobService {
    HttpJobService::new(server.uri(), KEY).unwrap()
}

fn agent_message(run_id: &str, text: &str) -> serde_json::Value {
    json!({
        "id": "msg_2",
        "role": "assistant",
        "created_at": 2,
        "run_id": run_id,
        "content": [{
            "type": "text",
            "text": {
                "value": text,
                "annotations": [{
                    "type": "url_citation",
                    "url_citation": {"title": "Example", "url": "https://example.com/a"}
                }]
            }
        }]
    })
}

fn user_message(text: &str) -> serde_json::Value {
    json!({
        "id": "msg_1",
        "role": "user",
        "created_at": 1,
        "content": [{"type": "text", "text": {"value": text, "annotations": []}}]
    })
}

#[tokio::test]
async fn poller_runs_a_job_to_completion() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/threads/thread_1/messages"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_json(json!({"role": "user", "content": "What is X?"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_message("What is X?")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .and(body_json(json!({"assistant_id": "asst_1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "run_1", "status": "queued"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "run_1",
            "status": "completed",
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/messages"))
        .and(query_param("order", "desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                agent_message("run_1", "## Answer\nX is Y, see https://example.com/a"),
                user_message("What is X?")
            ]
        })))
        .mount(&server)
        .await;

    let service = client(&server);
    let poller = JobPoller::new(
        &service,
        PollSettings {
            tick: Duration::from_millis(1),
            ..PollSettings::default()
        },
    );
    let outcome = poller
        .run("thread_1", "asst_1", "What is X?", Duration::from_secs(5))
        .await
        .unwrap();
    let record = outcome.into_record(WorkItem::new("What is X?"), None);

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.metrics.tokens_in, 12);
    assert_eq!(record.metrics.total_tokens, 42);
    assert!(record.metrics.time_to_first_output.is_some());
    assert_eq!(record.extracted_attributes, vec!["Answer"]);
    assert_eq!(record.citations, vec!["https://example.com/a"]);
    assert_eq!(record.annotations[0].title, "Example");
}

#[tokio::test]
async fn earlier_run_answer_is_not_reported_for_a_stalled_run() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/threads/thread_1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user_message("Turn 2")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "run_2", "status": "queued"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "run_2", "status": "in_progress"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs/run_2/cancel"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "run_2", "status": "cancelling"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_1/messages"))
        .and(query_param("order", "desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                user_message("Turn 2"),
                agent_message("run_1", "OLD ANSWER TO TURN 1"),
                user_message("Turn 1")
            ]
        })))
        .mount(&server)
        .await;

    let service = client(&server);
    let poller = JobPoller::new(
        &service,
        PollSettings {
            tick: Duration::from_millis(1),
            ..PollSettings::default()
        },
    );
    let outcome = poller
        .run("thread_1", "asst_1", "Turn 2", Duration::from_millis(5))
        .await
        .unwrap();

    assert_eq!(outcome.status(), JobStatus::TimedOut);
    assert!(outcome.metrics.time_to_first_output.is_none());
    assert!(!outcome.output.text.contains("OLD ANSWER"));
    assert!(outcome.output.text.starts_with("Research timed out"));
}

#[tokio::test]
async fn create_session_and_history() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "thread_9"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/threads/thread_9/messages"))
        .and(query_param("order", "asc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [user_message("Hi"), agent_message("run_1", "Hello")]
        })))
        .mount(&server)
        .await;

    let service = client(&server);
    let handle = service.create_session().await.unwrap();
    assert_eq!(handle, "thread_9");

    let history = service.list_messages(&handle).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, MessageRole::User);
    assert_eq!(history[1].role, MessageRole::Agent);
    assert_eq!(history[1].citations.len(), 1);
}

#[tokio::test]
async fn missing_session_maps_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/threads/thread_gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_gone/messages"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let service = client(&server);
    assert!(!service.session_exists("thread_gone").await.unwrap());

    let err = service.post_message("thread_gone", "hi").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    assert!(err.is_session_invalid());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .mount(&server)
        .await;

    let err = client(&server)
        .submit_job("thread_1", "asst_1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::RateLimited {
            retry_after_ms: 2000
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable_client_errors_are_not() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/threads/thread_1/runs/run_1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/threads/thread_1/runs"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad agent"))
        .mount(&server)
        .await;

    let service = client(&server);
    let err = service.poll_job("thread_1", "run_1").await.unwrap_err();
    assert!(matches!(err, ServiceError::Api { status: 503, .. }));
    assert!(err.is_retryable());

    let err = service.submit_job("thread_1", "asst_1").await.unwrap_err();
    assert_eq!(err.to_string(), "API error (status 400): bad agent");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = client(&server).create_session().await.unwrap_err();
    assert!(matches!(err, ServiceError::Decode(_)));
}
