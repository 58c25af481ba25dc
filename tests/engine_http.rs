//! Integration tests for the HTTP engine over the real transport.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use nimbus_cli::client::{Client, ClientSettings, Method, RequestOptions};
use nimbus_cli::parallel::ThreadLimit;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Run engine code off the async runtime
async fn blocking<T, F>(job: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(job).await.unwrap()
}

fn client(base: String, settings: ClientSettings) -> Client {
    Client::with_settings(base, "tok-123", settings).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_sends_token_and_decodes_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/servers"))
        .and(header("X-Auth-Token", "tok-123"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"servers": [{"id": "s-1"}]}))
                .insert_header("X-Compute-Request-Id", "req%20one"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let base = format!("{}/v2", server.uri());
    let (servers, request_id) = blocking(move || {
        let mut client = client(base, ClientSettings::default());
        let response = client.get("/servers", RequestOptions::new()).unwrap();
        let body: Value = response.json().unwrap();
        let request_id = response
            .header("x-compute-request-id")
            .unwrap()
            .map(ToString::to_string);
        (body, request_id)
    })
    .await;

    assert_eq!(servers["servers"][0]["id"], "s-1");
    assert_eq!(request_id.as_deref(), Some("req one"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_query_params_are_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account/photos"))
        .and(query_param("format", "json"))
        .and(query_param("prefix", "summer 2024"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let base = format!("{}/v1/account", server.uri());
    let status = blocking(move || {
        let mut client = client(base, ClientSettings::default());
        client.set_param("format", Some("json"), true);
        client.set_param("prefix", Some("summer 2024"), true);
        client
            .get("/photos", RequestOptions::new())
            .unwrap()
            .status_code()
            .unwrap()
    })
    .await;

    assert_eq!(status, 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_fault_becomes_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/servers"))
        .and(body_json(json!({"server": {"name": ""}})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "badRequest": {"code": 400, "message": "bad input", "details": "field x"}
        })))
        .mount(&server)
        .await;

    let base = server.uri();
    let err = blocking(move || {
        let mut client = client(base, ClientSettings::default());
        client
            .post(
                "/servers",
                RequestOptions::new().json(json!({"server": {"name": ""}})).success(202),
            )
            .unwrap_err()
    })
    .await;

    assert_eq!(err.status(), 400);
    assert!(err.message().contains("bad input"));
    assert_eq!(err.details(), ["field x".to_string()]);
    assert_eq!(err.exit_code(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_extension_methods() {
    let server = MockServer::start().await;
    Mock::given(method("COPY"))
        .and(path("/c/o"))
        .and(header("Destination", "/c/o2"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MOVE"))
        .and(path("/c/o2"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let base = server.uri();
    blocking(move || {
        let mut client = client(base, ClientSettings::default());
        let _ = client
            .copy("/c/o", RequestOptions::new().header("Destination", "/c/o2").success(201))
            .unwrap();
        let _ = client
            .request(Method::Move, "/c/o2", RequestOptions::new().success(201))
            .unwrap();
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_response_waits_through_not_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("done")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let base = server.uri();
    let body = blocking(move || {
        let mut client = client(base, ClientSettings::default());
        let response = client.get("/slow", RequestOptions::new()).unwrap();
        response.text().unwrap().into_owned()
    })
    .await;

    assert_eq!(body, "done");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_budget_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stuck"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let base = server.uri();
    let settings = ClientSettings {
        timeout: Duration::from_millis(300),
        ..ClientSettings::default()
    };
    let err = blocking(move || {
        let mut client = client(base, settings);
        client.get("/stuck", RequestOptions::new()).unwrap_err()
    })
    .await;

    assert_eq!(err.status(), 0);
    assert!(err.message().contains("client timeout"));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unchecked_response_is_lazy() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/servers/9"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .expect(0)
        .mount(&server)
        .await;

    let base = server.uri();
    blocking(move || {
        let mut client = client(base, ClientSettings::default());
        let response = client
            .delete("/servers/9", RequestOptions::new().unchecked())
            .unwrap();
        assert!(!response.is_materialized());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fan_out_under_thread_limit() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(6)
        .mount(&server)
        .await;

    let base = server.uri();
    let (ok, limit) = blocking(move || {
        let mut client = client(base, ClientSettings::default());
        let jobs: Vec<_> = (0..6)
            .map(|n| {
                let worker = client.clone();
                move || {
                    let response = worker.execute(
                        Method::Put,
                        &format!("/c/chunk-{n}"),
                        RequestOptions::new().data(vec![b'x'; 16]).success(201),
                    )?;
                    response.status_code()
                }
            })
            .collect();
        let tasks = client.run_throttled(jobs);
        let ok = tasks.iter().filter(|task| task.result() == Some(&201)).count();
        (ok, client.thread_limit())
    })
    .await;

    assert_eq!(ok, 6);
    assert!((1..=ThreadLimit::default().max()).contains(&limit));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_refused_is_transport_error() {
    let err = blocking(|| {
        let mut client = client("http://127.0.0.1:9".to_string(), ClientSettings::default());
        client.get("/", RequestOptions::new()).unwrap_err()
    })
    .await;

    assert!(err.is_transport());
    assert!(err.message().starts_with("Failed while http-connecting to"));
}
