//! End-to-end sync against a loopback HTTP server.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use fieldsync_core::auth::{AuthSession, AuthUser, MemorySessionStore};
use fieldsync_core::connectivity::ConnectivityMonitor;
use fieldsync_core::reconcile::ListResource;
use fieldsync_core::{FormDomain, SubmitOutcome, SyncConfig, SyncOrchestrator};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Default)]
struct Received {
    bodies: Vec<Value>,
    authorization: Vec<Option<String>>,
    list_downloads: usize,
}

type Shared = Arc<Mutex<Received>>;

async fn store_daily(
    State(received): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    if body["jde_no"] == "duplicate" {
        return Json(json!({"success": false, "message": "Data already submitted"}));
    }
    let mut received = received.lock().unwrap();
    received.bodies.push(body);
    received.authorization.push(
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned),
    );
    Json(json!({"success": true, "message": "Saved"}))
}

async fn units_summary() -> Json<Value> {
    Json(json!({"max_id": 3, "last_update": "2024-06-01 07:00:00"}))
}

async fn units(State(received): State<Shared>) -> Json<Value> {
    received.lock().unwrap().list_downloads += 1;
    Json(json!([{"id": 1, "unit": "HD785-01"}, {"id": 3, "unit": "PC2000-02"}]))
}

async fn spawn_server() -> (SocketAddr, Shared) {
    let received = Shared::default();
    let router = Router::new()
        .route("/daily-activity/store", post(store_daily))
        .route("/units/summary", get(units_summary))
        .route("/units", get(units))
        .route("/health", get(|| async { Json(json!({"ok": true})) }))
        .with_state(Arc::clone(&received));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, received)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session() -> MemorySessionStore {
    MemorySessionStore::with_session(AuthSession {
        access_token: "field-token".to_string(),
        expires_at: None,
        user: AuthUser {
            id: "42".to_string(),
            jde_no: Some("1001".to_string()),
        },
    })
}

async fn orchestrator(
    base_url: &str,
    dir: &TempDir,
    online: bool,
) -> SyncOrchestrator<
    fieldsync_core::store::LibSqlStore,
    fieldsync_core::http::ReqwestTransport,
    MemorySessionStore,
> {
    let config = SyncConfig::new(base_url).unwrap();
    let orchestrator = SyncOrchestrator::open(&config, dir.path().join("fieldsync.db"), session())
        .await
        .unwrap()
        .with_connectivity(ConnectivityMonitor::new(online))
        .with_resources(vec![ListResource::new("units", "/units")]);
    orchestrator.init().await;
    orchestrator
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_entries_survive_restart_and_reach_the_server() {
    init_tracing();
    let (addr, received) = spawn_server().await;
    let base_url = format!("http://{addr}");
    let dir = tempfile::tempdir().unwrap();

    {
        let offline = orchestrator(&base_url, &dir, false).await;
        for jde in ["2001", "2002"] {
            let outcome = offline
                .submit(FormDomain::DailyActivity, json!({"jde_no": jde, "total_hour": 9}))
                .await
                .unwrap();
            assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        }
    }

    let restarted = orchestrator(&base_url, &dir, true).await;
    assert_eq!(restarted.pending_count(FormDomain::DailyActivity), 2);

    let report = restarted.push_now(FormDomain::DailyActivity).await.unwrap();

    assert_eq!(report.delivered, 2);
    assert_eq!(restarted.pending_count(FormDomain::DailyActivity), 0);
    let received = received.lock().unwrap();
    assert_eq!(
        received.bodies,
        vec![
            json!({"jde_no": "2001", "total_hour": 9}),
            json!({"jde_no": "2002", "total_hour": 9}),
        ]
    );
    assert_eq!(
        received.authorization,
        vec![Some("Bearer field-token".to_string()); 2]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_submit_distinguishes_rejection_from_unreachable_server() {
    init_tracing();
    let (addr, received) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let online = orchestrator(&format!("http://{addr}"), &dir, true).await;

    let sent = online
        .submit(FormDomain::DailyActivity, json!({"jde_no": "3001", "total_hour": 4}))
        .await
        .unwrap();
    let rejected = online
        .submit(FormDomain::DailyActivity, json!({"jde_no": "duplicate", "total_hour": 4}))
        .await
        .unwrap();

    assert_eq!(sent, SubmitOutcome::Sent);
    assert_eq!(
        rejected,
        SubmitOutcome::Rejected {
            message: "Data already submitted".to_string()
        }
    );
    assert_eq!(received.lock().unwrap().bodies.len(), 1);

    let other_dir = tempfile::tempdir().unwrap();
    let unreachable = orchestrator("http://127.0.0.1:9", &other_dir, true).await;
    let queued = unreachable
        .submit(FormDomain::DailyActivity, json!({"jde_no": "3002", "total_hour": 4}))
        .await
        .unwrap();
    assert_eq!(queued, SubmitOutcome::Queued { pending: 1 });
}

#[tokio::test(flavor = "multi_thread")]
async fn unchanged_summary_serves_list_from_cache() {
    init_tracing();
    let (addr, received) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let online = orchestrator(&format!("http://{addr}"), &dir, true).await;

    let first = online.load_list("units", false, &[]).await.unwrap();
    let second = online.load_list("units", false, &[]).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(received.lock().unwrap().list_downloads, 1);
    assert_eq!(online.reconciler().watermark("units").unwrap().max_id, "3");

    online.load_list("units", true, &[]).await.unwrap();
    assert_eq!(received.lock().unwrap().list_downloads, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_list_is_served_when_server_is_gone() {
    init_tracing();
    let (addr, _) = spawn_server().await;
    let dir = tempfile::tempdir().unwrap();
    let online = orchestrator(&format!("http://{addr}"), &dir, true).await;
    let live = online.fetch("units", "/units", &[]).await.unwrap();
    drop(online);

    let unreachable = orchestrator("http://127.0.0.1:9", &dir, true).await;
    let fallback = unreachable.fetch("units", "/units", &[]).await.unwrap();
    let miss = unreachable.fetch("operators", "/operators", &[]).await;

    assert_eq!(fallback, live);
    assert!(miss.unwrap_err().is_transport());
}
