use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use http::{Method, StatusCode};
use shardwire::rest::RouteSignature;
use shardwire::testing::MockHttpExecutor;
use shardwire::{ClientConfig, ClientError, RequestDispatcher, RestResponse};
use tokio::time::Instant;

fn dispatcher(http: &MockHttpExecutor) -> RequestDispatcher {
    let mut config = ClientConfig::new("app.secret.token");
    config.max_retry_attempts = 2;
    config.max_rate_limit_retries = 3;
    config.retry_backoff_base_ms = 100;
    config.retry_backoff_max_ms = 1_000;
    config.request_timeout_default_ms = 60_000;
    RequestDispatcher::new(&config, Arc::new(http.clone()))
}

fn ok() -> RestResponse {
    RestResponse::new(StatusCode::OK, "{}")
}

#[tokio::test(start_paused = true)]
async fn same_route_runs_in_submission_order() {
    let http = MockHttpExecutor::new();
    // earlier calls are slower; order must still hold
    for delay in [50, 40, 30, 20, 10] {
        http.reply_after(Duration::from_millis(delay), ok());
    }
    let dispatcher = dispatcher(&http);

    let paths: Vec<String> = (0..5)
        .map(|n| format!("/channels/1/messages?nonce={n}"))
        .collect();
    let results = join_all(
        paths
            .iter()
            .map(|path| dispatcher.submit(Method::POST, path, None, None)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    let seen: Vec<String> = http
        .calls()
        .into_iter()
        .map(|call| call.request.path)
        .collect();
    assert_eq!(seen, paths);

    let calls = http.calls();
    for pair in calls.windows(2) {
        assert!(pair[1].at >= pair[0].at, "calls overlapped");
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_stalls_until_reset_then_one_call_proceeds() {
    let http = MockHttpExecutor::new();
    http.reply(ok().with_rate_limit(5, 0, Duration::from_secs(3), "bucket-a"));
    let dispatcher = dispatcher(&http);
    let path = "/channels/1/messages";

    dispatcher
        .submit(Method::POST, path, None, None)
        .await
        .expect("first");
    let first_at = http.calls()[0].at;

    dispatcher
        .submit(Method::POST, path, None, None)
        .await
        .expect("second");
    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at >= first_at + Duration::from_secs(3));

    let bucket = dispatcher
        .registry()
        .resolve(&RouteSignature::new(Method::POST, path));
    assert_eq!(bucket.snapshot().remaining, 4);
}

#[tokio::test(start_paused = true)]
async fn global_rate_limit_blocks_every_bucket() {
    let http = MockHttpExecutor::new();
    http.reply_for(
        "/channels/1/messages",
        RestResponse::new(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after":2.0,"global":true}"#)
            .with_header("x-ratelimit-global", "true")
            .with_header("x-ratelimit-scope", "global"),
    );
    let dispatcher = dispatcher(&http);

    let limited = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .submit(Method::POST, "/channels/1/messages", None, None)
                .await
        })
    };
    http.wait_for_calls(1).await;
    let t0 = http.calls()[0].at;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(dispatcher.cooldown().is_active());

    let others = join_all([
        dispatcher.submit(Method::GET, "/guilds/5/roles", None, None),
        dispatcher.submit(Method::GET, "/channels/9/pins", None, None),
        dispatcher.submit(Method::DELETE, "/channels/1/messages/77", None, None),
    ])
    .await;
    assert!(others.iter().all(Result::is_ok));
    limited.await.expect("task").expect("retried after cooldown");

    let calls = http.calls();
    assert_eq!(calls.len(), 5);
    for call in &calls[1..] {
        assert!(
            call.at >= t0 + Duration::from_secs(2),
            "{} ran during the cooldown",
            call.request.path
        );
    }
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_with_backoff() {
    let http = MockHttpExecutor::new();
    http.reply(RestResponse::new(StatusCode::BAD_GATEWAY, "upstream"));
    http.reply(ok());
    let dispatcher = dispatcher(&http);

    let response = dispatcher
        .submit(Method::GET, "/gateway/bot", None, None)
        .await
        .expect("recovered");
    assert_eq!(response.status, StatusCode::OK);

    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at >= calls[0].at + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn server_errors_give_up_after_the_retry_budget() {
    let http = MockHttpExecutor::new();
    for _ in 0..3 {
        http.reply(RestResponse::new(StatusCode::SERVICE_UNAVAILABLE, "down"));
    }
    let dispatcher = dispatcher(&http);

    let err = dispatcher
        .submit(Method::GET, "/gateway/bot", None, None)
        .await
        .expect_err("exhausted");
    assert!(matches!(
        err,
        ClientError::TransientServer {
            status: Some(503),
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(http.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn rejected_requests_are_never_retried() {
    let http = MockHttpExecutor::new();
    http.reply(RestResponse::new(StatusCode::NOT_FOUND, r#"{"message":"Unknown Channel"}"#));
    let dispatcher = dispatcher(&http);

    let err = dispatcher
        .submit(Method::GET, "/channels/404", None, None)
        .await
        .expect_err("rejected");
    assert!(matches!(err, ClientError::RequestRejected { status: 404, .. }));
    assert!(!err.is_retryable());
    assert_eq!(http.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_surfaces_early_and_leaves_the_route_usable() {
    let http = MockHttpExecutor::new();
    http.reply_after(Duration::from_secs(5), ok());
    let dispatcher = dispatcher(&http);
    let path = "/channels/1/messages";

    let started = Instant::now();
    let err = dispatcher
        .submit(Method::POST, path, None, Some(Duration::from_secs(1)))
        .await
        .expect_err("timed out");
    assert!(matches!(err, ClientError::Timeout { .. }));
    assert_eq!(Instant::now(), started + Duration::from_secs(1));

    dispatcher
        .submit(Method::POST, path, None, None)
        .await
        .expect("next call on the same route");
    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    // the abandoned call still held the route until it finished
    assert!(calls[1].at >= started + Duration::from_secs(5));
}
