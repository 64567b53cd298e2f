//! Router integration tests
//!
//! Exercise the API end to end against an in-process router with a real
//! engine over a temp store and the built-in local destination.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use dbvault_core::engine::{Engine, EngineConfig};
use dbvault_core::store::{SecretSealer, Store};
use dbvault_core::Notifier;

use crate::{create_router, parse_api_tokens, ServerConfig};

struct TestApp {
    _dir: tempfile::TempDir,
    router: axum::Router,
}

fn app_with_config(config: ServerConfig) -> TestApp {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open_with_sealer(
        dir.path().join("repo.db").to_str().unwrap(),
        SecretSealer::from_passphrase("test-seal").unwrap(),
    )
    .unwrap();
    let engine = Engine::new(
        store,
        EngineConfig {
            local_root: dir.path().join("backups"),
            workers: 2,
        },
        Notifier::new(None, None),
    );
    TestApp {
        _dir: dir,
        router: create_router(engine, config),
    }
}

fn app() -> TestApp {
    app_with_config(ServerConfig {
        require_auth: false,
        tokens: vec![],
    })
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(path: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

fn sqlite_target_body(dir: &tempfile::TempDir, name: &str) -> Value {
    let db_path = dir.path().join(format!("{}.db", name));
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
        .unwrap();
    json!({
        "name": name,
        "db_type": "sqlite",
        "config": {"path": db_path},
    })
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app_with_config(ServerConfig {
        require_auth: true,
        tokens: vec![],
    });
    let (status, body) = send(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_auth_required() {
    let app = app_with_config(ServerConfig {
        require_auth: true,
        tokens: parse_api_tokens("secret-token=backup:admin"),
    });

    let (status, body) = send(&app.router, get("/automation/targets")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH");

    let authed = Request::builder()
        .uri("/automation/targets")
        .header(header::AUTHORIZATION, "Bearer secret-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, authed).await;
    assert_eq!(status, StatusCode::OK);

    let wrong = Request::builder()
        .uri("/automation/targets")
        .header(header::AUTHORIZATION, "Bearer wrong-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_role_gating() {
    let app = app_with_config(ServerConfig {
        require_auth: true,
        tokens: parse_api_tokens("reader=backup:read"),
    });

    let list = Request::builder()
        .uri("/automation/targets")
        .header(header::AUTHORIZATION, "Bearer reader")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, list).await;
    assert_eq!(status, StatusCode::OK);

    // A read-only token cannot create targets
    let create = Request::builder()
        .method("POST")
        .uri("/automation/targets")
        .header(header::AUTHORIZATION, "Bearer reader")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"name": "x", "db_type": "sqlite", "config": {"path": "/tmp/x.db"}}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app.router, create).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "AUTH");
}

#[tokio::test]
async fn test_target_crud_roundtrip() {
    let app = app();

    let (status, created) = send(
        &app.router,
        post_json("/automation/targets", sqlite_target_body(&app._dir, "app")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["db_type"], "sqlite");

    // Duplicate name conflicts
    let (status, body) = send(
        &app.router,
        post_json("/automation/targets", sqlite_target_body(&app._dir, "app")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, fetched) = send(&app.router, get(&format!("/automation/targets/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "app");

    let (status, _) = send(&app.router, delete(&format!("/automation/targets/{}", id))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app.router, get(&format!("/automation/targets/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_validation_errors_are_400() {
    let app = app();
    let (status, body) = send(
        &app.router,
        post_json(
            "/automation/targets",
            json!({"name": "bad", "db_type": "sqlite", "config": {"host": "nope"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn test_schedule_lifecycle_and_in_use_protection() {
    let app = app();

    let (_, target) = send(
        &app.router,
        post_json("/automation/targets", sqlite_target_body(&app._dir, "app")),
    )
    .await;
    let target_id = target["id"].as_str().unwrap().to_string();

    let (status, schedule) = send(
        &app.router,
        post_json(
            "/automation/schedules",
            json!({
                "name": "nightly",
                "target_id": target_id,
                "destination_ids": ["__local__"],
                "interval_seconds": 86400,
                "retention": {"max_count": 3, "run_at_time": "03:30"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", schedule);
    let schedule_id = schedule["id"].as_str().unwrap().to_string();
    assert!(schedule["next_run_at"].is_string());

    // The referenced target is delete-protected
    let (status, body) = send(
        &app.router,
        delete(&format!("/automation/targets/{}", target_id)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["message"].as_str().unwrap().contains("nightly"));

    let (status, _) = send(
        &app.router,
        delete(&format!("/automation/schedules/{}", schedule_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &app.router,
        delete(&format!("/automation/targets/{}", target_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_backup_now_and_audit() {
    let app = app();

    let (_, target) = send(
        &app.router,
        post_json("/automation/targets", sqlite_target_body(&app._dir, "app")),
    )
    .await;
    let target_id = target["id"].as_str().unwrap().to_string();

    let (status, run) = send(
        &app.router,
        post_json(
            "/automation/backup-now",
            json!({"target_id": target_id, "use_local_storage": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", run);
    assert_eq!(run["status"], "success");
    assert_eq!(run["operation"], "backup");
    assert_eq!(run["trigger"], "manual");
    let filename = run["backup_filename"].as_str().unwrap().to_string();
    assert!(filename.starts_with("backup_app_"));

    // The run shows up in the audit history
    let (status, audit) = send(
        &app.router,
        get("/automation/audit?operation=backup&include_total=true"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(audit["total"], 1);
    assert_eq!(audit["runs"][0]["backup_filename"], filename.as_str());

    // And in the built-in local destination listing
    let (status, listed) = send(&app.router, get("/backup/list")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], filename.as_str());

    // Download streams the artifact bytes
    let response = app
        .router
        .clone()
        .oneshot(get(&format!("/backup/download/{}", filename)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!bytes.is_empty());

    // Delete by filename
    let (status, _) = send(&app.router, delete(&format!("/backup/delete/{}", filename))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = send(&app.router, get("/backup/list")).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_restore_now_confirmation_gate() {
    let app = app();

    let (_, target) = send(
        &app.router,
        post_json("/automation/targets", sqlite_target_body(&app._dir, "app")),
    )
    .await;
    let target_id = target["id"].as_str().unwrap().to_string();

    // Lowercase confirmation is refused with 400 and no run is recorded
    let (status, body) = send(
        &app.router,
        post_json(
            "/automation/restore-now",
            json!({
                "target_id": target_id,
                "backup_id": "whatever",
                "use_local_storage": true,
                "confirmation": "restore"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "CONFIRMATION_REQUIRED");

    let (_, audit) = send(&app.router, get("/automation/audit")).await;
    assert!(audit["runs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_now_unknown_schedule_is_404() {
    let app = app();
    let (status, body) = send(
        &app.router,
        post_json("/automation/schedules/nope/run-now", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[test]
fn test_parse_api_tokens_format() {
    let tokens = parse_api_tokens("a=backup:admin;b=backup:read,backup:run;;bad;c=");
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].token, "a");
    assert!(tokens[0].roles.contains(&crate::Role::Admin));
    assert_eq!(tokens[1].roles.len(), 2);
}
