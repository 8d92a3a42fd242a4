use futures::StreamExt;
use serde_json::json;
use shared_storage::{
    ChangeFilter, ChangeKind, Error, MemoryStore, RemoteBackend, RestBackend, Row, SyncConfig,
    SyncShim,
};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TABLE: &str = "kv_store";
const TABLE_PATH: &str = "/rest/v1/kv_store";

fn row_json(key: &str, value: &str) -> serde_json::Value {
    json!({ "key": key, "value": value, "updated_at": "2024-06-01T10:00:00+00:00" })
}

fn backend(server: &MockServer) -> RestBackend {
    RestBackend::new(server.uri(), "anon-key").poll_interval(Duration::from_millis(20))
}

// ── Reads ───────────────────────────────────────────────────────

#[tokio::test]
async fn select_sends_auth_headers_and_decodes_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .and(query_param("select", "key,value,updated_at"))
        .and(header("apikey", "anon-key"))
        .and(header("Authorization", "Bearer anon-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            row_json("gallery", "[]"),
            row_json("admissions", "{\"open\":true}"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let rows = backend(&server).select(TABLE).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, "gallery");
    assert_eq!(rows[1].value, "{\"open\":true}");
}

#[tokio::test]
async fn select_one_filters_by_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .and(query_param("key", "eq.course-list"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([row_json("course-list", "[]")])),
        )
        .mount(&server)
        .await;

    let row = backend(&server).select_one(TABLE, "course-list").await.unwrap();
    assert_eq!(row.key, "course-list");
    assert_eq!(row.value, "[]");
}

#[tokio::test]
async fn select_one_on_empty_result_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let err = backend(&server).select_one(TABLE, "gallery").await.unwrap_err();
    assert_eq!(err, Error::NotFound("gallery".into()));
}

#[tokio::test]
async fn error_status_becomes_remote_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .mount(&server)
        .await;

    let err = backend(&server).select(TABLE).await.unwrap_err();
    match err {
        Error::Remote(msg) => {
            assert!(msg.contains("401"), "{msg}");
            assert!(msg.contains("invalid api key"), "{msg}");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = backend(&server).select(TABLE).await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_server_is_remote_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let err = RestBackend::new(uri, "k").select(TABLE).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)), "{err:?}");
}

// ── Writes ──────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_posts_with_merge_preference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TABLE_PATH))
        .and(query_param("on_conflict", "key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server)
        .upsert(TABLE, Row::new("gallery", "[\"a.jpg\"]"))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let prefer = requests[0].headers.get("Prefer").unwrap().to_str().unwrap();
    assert_eq!(prefer, "resolution=merge-duplicates,return=minimal");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body[0]["key"], "gallery");
    assert_eq!(body[0]["value"], "[\"a.jpg\"]");
    assert!(body[0]["updated_at"].is_string());
}

#[tokio::test]
async fn delete_filters_by_key() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(TABLE_PATH))
        .and(query_param("key", "eq.gallery"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    backend(&server).delete(TABLE, "gallery").await.unwrap();
}

#[tokio::test]
async fn rejected_upsert_is_remote_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
        .mount(&server)
        .await;

    let err = backend(&server).upsert(TABLE, Row::new("a", "1")).await.unwrap_err();
    assert!(matches!(err, Error::Remote(_)));
}

// ── Change feed ─────────────────────────────────────────────────

#[tokio::test]
async fn polling_feed_reports_changes_after_baseline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row_json("gallery", "[]")])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TABLE_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            row_json("gallery", "[\"a.jpg\"]"),
            row_json("admissions", "{}"),
        ])))
        .mount(&server)
        .await;

    let mut feed = backend(&server)
        .subscribe(TABLE, ChangeFilter::Key("gallery".into()))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, ChangeKind::Update);
    assert_eq!(event.new_row.unwrap().value, "[\"a.jpg\"]");
    assert_eq!(event.old_row.unwrap().value, "[]");
}

// ── Wiring ──────────────────────────────────────────────────────

#[tokio::test]
async fn config_builds_a_working_backend() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/site_state"))
        .and(header("apikey", "cfg-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([row_json("gallery", "[]")])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/site_state"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let cfg = SyncConfig::from_json_str(&format!(
        r#"{{ "table": "site_state", "rest": {{ "url": "{}/", "api_key": "cfg-key", "poll_interval_ms": 50 }} }}"#,
        server.uri()
    ))
    .unwrap();
    let remote = Arc::new(cfg.rest_backend().unwrap());
    let shim = SyncShim::builder(MemoryStore::new(), remote)
        .config(&cfg)
        .unwrap()
        .build();

    assert_eq!(
        shim.init().await,
        shared_storage::InitOutcome::Synced { rows: 1 }
    );
    assert_eq!(shim.get("gallery").as_deref(), Some("[]"));

    shim.set("gallery", "[\"b.jpg\"]").unwrap();
    shim.settle().await;
    assert!(!shim.is_unsynced("gallery"));
    let posts = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .count();
    assert_eq!(posts, 1);
    shim.shutdown();
}
