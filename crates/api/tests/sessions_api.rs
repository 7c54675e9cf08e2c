//! HTTP-level tests for the `/sessions` resource and shared-secret auth.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    build_test_app, build_test_app_with, delete, expect_status, get, send, worker, SECRET,
};

// ---------------------------------------------------------------------------
// Test: list and get snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_and_get_sessions() {
    let mut app = build_test_app();
    let assigned = app.start_session("s1").await;
    app.start_session("s2").await;

    let json = expect_status(get(app.router.clone(), "/api/v1/sessions").await, StatusCode::OK).await;
    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["s1", "s2"]);

    let json = expect_status(get(app.router.clone(), "/api/v1/sessions/s1").await, StatusCode::OK).await;
    let data = &json["data"];
    assert_eq!(data["variant"], "female");
    assert_eq!(data["source_file"], "face.png");
    assert_eq!(data["unit_count"], 2);
    assert_eq!(data["next_index"], 2);
    assert_eq!(data["completed"], 0);
    assert_eq!(data["in_flight"].as_array().unwrap().len(), assigned.len());

    let health = expect_status(get(app.router.clone(), "/health").await, StatusCode::OK).await;
    assert_eq!(health["live_sessions"], 2);
}

#[tokio::test]
async fn unknown_session_returns_404() {
    let app = build_test_app();
    let json = expect_status(
        get(app.router.clone(), "/api/v1/sessions/nope").await,
        StatusCode::NOT_FOUND,
    )
    .await;
    assert_eq!(json["code"], "UNKNOWN_SESSION");
}

#[tokio::test]
async fn malformed_session_id_returns_400() {
    let app = build_test_app();
    let long_id = "x".repeat(200);
    let json = expect_status(
        get(app.router.clone(), &format!("/api/v1/sessions/{long_id}")).await,
        StatusCode::BAD_REQUEST,
    )
    .await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

// ---------------------------------------------------------------------------
// Test: retire
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retired_session_rejects_reports() {
    let mut app = build_test_app();
    let assigned = app.start_session("s1").await;

    let response = delete(app.router.clone(), "/api/v1/sessions/s1").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let json = expect_status(
        get(app.router.clone(), "/api/v1/sessions/s1").await,
        StatusCode::NOT_FOUND,
    )
    .await;
    assert_eq!(json["code"], "UNKNOWN_SESSION");

    let (worker, index) = assigned[0].clone();
    let json = expect_status(
        app.report("s1", &worker, Some(index), "late.mp4").await,
        StatusCode::NOT_FOUND,
    )
    .await;
    assert_eq!(json["code"], "UNKNOWN_SESSION");

    let response = delete(app.router.clone(), "/api/v1/sessions/s1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Test: shared secret
// ---------------------------------------------------------------------------

fn get_with_auth(uri: &str, authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(value) = authorization {
        builder = builder.header("authorization", value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn shared_secret_required_when_configured() {
    let app = build_test_app_with(vec![worker("gpu-a", "10.0.0.5")], Some(SECRET));

    let json = expect_status(
        send(app.router.clone(), get_with_auth("/api/v1/sessions", None)).await,
        StatusCode::UNAUTHORIZED,
    )
    .await;
    assert_eq!(json["code"], "UNAUTHORIZED");

    expect_status(
        send(
            app.router.clone(),
            get_with_auth("/api/v1/sessions", Some("Bearer wrong-secret")),
        )
        .await,
        StatusCode::UNAUTHORIZED,
    )
    .await;

    expect_status(
        send(app.router.clone(), get_with_auth("/api/v1/sessions", Some(SECRET))).await,
        StatusCode::UNAUTHORIZED,
    )
    .await;

    let bearer = format!("Bearer {SECRET}");
    expect_status(
        send(app.router.clone(), get_with_auth("/api/v1/sessions", Some(&bearer))).await,
        StatusCode::OK,
    )
    .await;
}

#[tokio::test]
async fn uploads_require_secret_and_health_stays_open() {
    let app = build_test_app_with(vec![worker("gpu-a", "10.0.0.5")], Some(SECRET));

    let json = expect_status(
        common::post_multipart(
            app.router.clone(),
            "/api/v1/upload_image",
            &[common::file("face.png", common::png())],
        )
        .await,
        StatusCode::UNAUTHORIZED,
    )
    .await;
    assert_eq!(json["code"], "UNAUTHORIZED");
    assert!(app.uploads_with_prefix("").is_empty());

    let response = get(app.router.clone(), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}
