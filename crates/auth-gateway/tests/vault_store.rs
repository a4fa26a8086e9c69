use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use auth_gateway::cache::SecretCache;
use auth_gateway::clock::MonotonicClock;
use auth_gateway::gate::{Denial, Gate};
use auth_gateway::keys::{KeyError, KeyManager};
use auth_gateway::limiter::SlidingWindowLimiter;
use auth_gateway::metric::Metrics;
use auth_gateway::store::{
    SecretAdmin, SecretStore, StaticCredential, StoreError, VaultSecretStore,
};
use auth_gateway::throttle::StaticRatelimit;
use auth_gateway::usage::UsageTracker;
use auth_gateway::verify::SecretVerifier;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::sleep;

const VAULT_TOKEN: &str = "vault-token";

/// Secrets per listing page, small so listing has to follow `nextLink`.
const PAGE_SIZE: usize = 2;

#[derive(Clone, Default)]
struct FakeVault {
    hits: Arc<AtomicUsize>,
    written: Arc<Mutex<HashMap<String, String>>>,
}

impl FakeVault {
    fn written(&self) -> HashMap<String, String> {
        self.written.lock().unwrap().clone()
    }
}

fn check_request(headers: &HeaderMap, params: &HashMap<String, String>) -> Result<(), StatusCode> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {VAULT_TOKEN}"));
    if !authorized {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if params.get("api-version").map(String::as_str) != Some("7.4") {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "code": "SecretNotFound" } })),
    )
        .into_response()
}

async fn secret_handler(
    State(vault): State<FakeVault>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    vault.hits.fetch_add(1, Ordering::SeqCst);
    if let Err(status) = check_request(&headers, &params) {
        return status.into_response();
    }

    if let Some(value) = vault.written().get(&name) {
        return Json(json!({ "value": value })).into_response();
    }
    match name.as_str() {
        "azjina-api-key-abc123" => Json(json!({
            "value": "s3cr3t",
            "id": "https://vault/secrets/azjina-api-key-abc123/1",
        }))
        .into_response(),
        "azjina-api-key-empty1" => Json(json!({ "value": "" })).into_response(),
        "azjina-api-key-broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        "azjina-api-key-slow01" => {
            sleep(Duration::from_secs(5)).await;
            Json(json!({ "value": "late" })).into_response()
        }
        _ => not_found(),
    }
}

async fn set_handler(
    State(vault): State<FakeVault>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(status) = check_request(&headers, &params) {
        return status.into_response();
    }
    let Some(value) = body["value"].as_str() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    vault
        .written
        .lock()
        .unwrap()
        .insert(name.clone(), value.to_string());
    Json(json!({ "id": format!("https://vault/secrets/{name}/1") })).into_response()
}

async fn delete_handler(
    State(vault): State<FakeVault>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_request(&headers, &params) {
        return status.into_response();
    }
    let removed = vault.written.lock().unwrap().remove(&name);
    match removed {
        Some(_) => Json(json!({ "id": format!("https://vault/secrets/{name}") })).into_response(),
        None => not_found(),
    }
}

async fn list_handler(
    State(vault): State<FakeVault>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = check_request(&headers, &params) {
        return status.into_response();
    }
    let mut names: Vec<String> = vault.written().into_keys().collect();
    names.push("unrelated-secret".to_string());
    names.sort();

    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let value: Vec<Value> = names
        .iter()
        .skip(page * PAGE_SIZE)
        .take(PAGE_SIZE)
        .map(|name| json!({ "id": format!("https://vault/secrets/{name}") }))
        .collect();
    let next_link = ((page + 1) * PAGE_SIZE < names.len()).then(|| {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        format!("http://{host}/secrets?api-version=7.4&page={}", page + 1)
    });
    Json(json!({ "value": value, "nextLink": next_link })).into_response()
}

async fn spawn_fake_vault() -> (SocketAddr, FakeVault, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let vault = FakeVault::default();
    let app = Router::new()
        .route(
            "/secrets/{name}",
            get(secret_handler).put(set_handler).delete(delete_handler),
        )
        .route("/secrets", get(list_handler))
        .with_state(vault.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        server.await.expect("fake vault failed");
    });
    (addr, vault, shutdown_tx)
}

fn vault_store(addr: SocketAddr, token: &str, timeout: Duration) -> VaultSecretStore {
    VaultSecretStore::new(
        format!("http://{addr}/"),
        Arc::new(StaticCredential::new(token)),
        timeout,
    )
    .unwrap()
}

#[tokio::test]
async fn vault_store_maps_responses() {
    let (addr, vault, shutdown) = spawn_fake_vault().await;
    let store = vault_store(addr, VAULT_TOKEN, Duration::from_secs(2));

    assert_eq!(store.get("azjina-api-key-abc123").await.unwrap(), "s3cr3t");
    assert_eq!(store.get("azjina-api-key-empty1").await.unwrap(), "");
    assert_eq!(
        store.get("azjina-api-key-nobody").await,
        Err(StoreError::NotFound)
    );
    assert!(matches!(
        store.get("azjina-api-key-broken").await,
        Err(StoreError::Unavailable(_))
    ));
    assert_eq!(vault.hits.load(Ordering::SeqCst), 4);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn vault_store_rejected_credential_is_unavailable() {
    let (addr, _vault, shutdown) = spawn_fake_vault().await;
    let store = vault_store(addr, "wrong", Duration::from_secs(2));

    assert!(matches!(
        store.get("azjina-api-key-abc123").await,
        Err(StoreError::Unavailable(_))
    ));

    let _ = shutdown.send(());
}

#[tokio::test]
async fn vault_store_times_out() {
    let (addr, _vault, shutdown) = spawn_fake_vault().await;
    let store = vault_store(addr, VAULT_TOKEN, Duration::from_millis(200));

    assert!(matches!(
        store.get("azjina-api-key-slow01").await,
        Err(StoreError::Unavailable(_))
    ));

    let _ = shutdown.send(());
}

fn gate_over(store: Arc<dyn SecretStore>) -> Gate {
    let clock = Arc::new(MonotonicClock);
    let cache = Arc::new(SecretCache::new(300, clock.clone()));
    Gate::new(
        api_key::ApiKeyConfig::default(),
        SecretVerifier::new(store, cache, Duration::from_millis(500)),
        SlidingWindowLimiter::new(Arc::new(StaticRatelimit::new(0)), clock),
        UsageTracker::new(100),
        Arc::new(Metrics::new()),
    )
}

#[tokio::test]
async fn gate_over_vault_caches_and_reports_outages() {
    let (addr, vault, shutdown) = spawn_fake_vault().await;
    let gate = gate_over(Arc::new(vault_store(addr, VAULT_TOKEN, Duration::from_secs(2))));

    let grant = gate.authorize("azjina_abc123_s3cr3t").await.unwrap();
    assert_eq!(grant.balance, 100);
    assert!(gate.authorize("azjina_abc123_s3cr3t").await.is_ok());

    // unknown and empty secrets are both invalid, and cached as such
    assert_eq!(
        gate.authorize("azjina_nobody_x").await,
        Err(Denial::InvalidToken)
    );
    assert_eq!(
        gate.authorize("azjina_empty1_").await,
        Err(Denial::InvalidToken)
    );
    assert_eq!(
        gate.authorize("azjina_empty1_anything").await,
        Err(Denial::InvalidToken)
    );
    assert_eq!(
        gate.authorize("azjina_nobody_x").await,
        Err(Denial::InvalidToken)
    );

    // outages are never cached
    assert_eq!(
        gate.authorize("azjina_broken_x").await,
        Err(Denial::BackendUnavailable)
    );
    assert_eq!(
        gate.authorize("azjina_broken_x").await,
        Err(Denial::BackendUnavailable)
    );
    assert_eq!(
        gate.authorize("azjina_slow01_x").await,
        Err(Denial::BackendUnavailable)
    );

    // abc123 x1, nobody x1, empty1 x1, broken x2, slow01 x1
    assert_eq!(vault.hits.load(Ordering::SeqCst), 6);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn vault_store_writes_lists_and_deletes() {
    let (addr, vault, shutdown) = spawn_fake_vault().await;
    let store = vault_store(addr, VAULT_TOKEN, Duration::from_secs(2));

    for name in ["azjina-api-key-aaa111", "azjina-api-key-bbb222", "azjina-api-key-ccc333"] {
        store.set(name, "s3cr3t").await.unwrap();
    }
    assert_eq!(store.get("azjina-api-key-bbb222").await.unwrap(), "s3cr3t");

    // four names over two pages
    let mut names = store.list_names().await.unwrap();
    names.sort();
    assert_eq!(
        names,
        [
            "azjina-api-key-aaa111",
            "azjina-api-key-bbb222",
            "azjina-api-key-ccc333",
            "unrelated-secret",
        ]
    );

    store.delete("azjina-api-key-bbb222").await.unwrap();
    assert_eq!(
        store.delete("azjina-api-key-bbb222").await,
        Err(StoreError::NotFound)
    );
    assert_eq!(vault.written().len(), 2);

    let _ = shutdown.send(());
}

#[tokio::test]
async fn vault_admin_rejected_credential_is_unavailable() {
    let (addr, vault, shutdown) = spawn_fake_vault().await;
    let store = vault_store(addr, "wrong", Duration::from_secs(2));

    assert!(matches!(
        store.set("azjina-api-key-abc123", "x").await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(matches!(
        store.list_names().await,
        Err(StoreError::Unavailable(_))
    ));
    assert!(vault.written().is_empty());

    let _ = shutdown.send(());
}

#[tokio::test]
async fn managed_keys_authorize_until_revoked() {
    let (addr, vault, shutdown) = spawn_fake_vault().await;
    let store = Arc::new(vault_store(addr, VAULT_TOKEN, Duration::from_secs(2)));
    let manager = KeyManager::new(api_key::ApiKeyConfig::default(), store.clone());

    let created = manager.create(Some("team-a1"), None).await.unwrap();
    let imported = manager
        .create(None, Some("azjina_team-b2_imp0rted"))
        .await
        .unwrap();
    assert_eq!(imported.key_id, "team-b2");
    assert_eq!(
        vault.written().get("azjina-api-key-team-b2").map(String::as_str),
        Some("imp0rted")
    );
    assert_eq!(manager.list().await.unwrap(), ["team-a1", "team-b2"]);

    let gate = gate_over(store);
    assert!(gate.authorize(&created.token).await.is_ok());

    assert_eq!(
        manager.revoke(&["team-a1".to_string()]).await.unwrap(),
        ["team-a1"]
    );
    assert_eq!(manager.list().await.unwrap(), ["team-b2"]);
    assert!(matches!(
        manager.revoke(&["team-a1".to_string()]).await,
        Err(KeyError::UnknownKey(id)) if id == "team-a1"
    ));

    // a fresh gate has no cached copy of the revoked secret
    let fresh = gate_over(Arc::new(vault_store(addr, VAULT_TOKEN, Duration::from_secs(2))));
    assert_eq!(
        fresh.authorize(&created.token).await,
        Err(Denial::InvalidToken)
    );
    assert!(fresh.authorize("azjina_team-b2_imp0rted").await.is_ok());

    let _ = shutdown.send(());
}
