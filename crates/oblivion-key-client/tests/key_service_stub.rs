use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use oblivion_key_client::{KeyClientError, KeyServiceClient, KeyServiceClientConfig};
use oblivion_key_core::protocol::{CheckKeyRequest, GenerateKeyRequest};
use oblivion_key_core::{
    AcquisitionConfig, AcquisitionError, AttemptResult, AttemptStatus, KeyAcquisitionController,
    Sid,
};

#[derive(Default)]
struct StubState {
    /// Number of generate calls answered with 403 before a key is minted.
    gated_calls: usize,
    generate_calls: AtomicUsize,
    bodies: Mutex<Vec<Value>>,
    request_ids: Mutex<Vec<String>>,
    postback_sids: Mutex<Vec<String>>,
}

impl StubState {
    fn gated_for(calls: usize) -> Arc<Self> {
        Arc::new(Self {
            gated_calls: calls,
            ..Self::default()
        })
    }

    fn record(&self, headers: &HeaderMap, body: Value) {
        if let Some(id) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
            self.request_ids.lock().expect("ids lock").push(id.to_string());
        }
        self.bodies.lock().expect("bodies lock").push(body);
    }
}

async fn generate_key(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record(&headers, body);
    let call = state.generate_calls.fetch_add(1, Ordering::SeqCst);
    if call < state.gated_calls {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "message": "Complete the ad first"})),
        )
            .into_response();
    }
    Json(json!({"success": true, "key": "OX-HTTP-KEY", "expiresIn": 24})).into_response()
}

async fn check_key(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record(&headers, body);
    Json(json!({"hasKey": true, "expired": false, "key": "OX-EXISTING", "expiresIn": 12}))
        .into_response()
}

async fn postback(
    State(state): State<Arc<StubState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(sid) = query.get("sid") {
        state
            .postback_sids
            .lock()
            .expect("postback lock")
            .push(sid.clone());
    }
    Json(json!({"success": true})).into_response()
}

fn key_service(state: Arc<StubState>) -> Router {
    Router::new()
        .route("/api/generate-key", post(generate_key))
        .route("/api/check-key", post(check_key))
        .route("/api/postback", get(postback))
        .with_state(state)
}

fn cold_start_service() -> Router {
    Router::new().route(
        "/api/generate-key",
        post(|| async {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Html("<html><body>Service waking up</body></html>"),
            )
        }),
    )
}

async fn spawn_http_server(app: Router) -> Result<(String, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });
    Ok((format!("http://{addr}"), shutdown_tx))
}

fn client(base_url: &str) -> KeyServiceClient {
    KeyServiceClient::new(KeyServiceClientConfig::new(base_url)).expect("key client")
}

fn acquisition_config() -> AcquisitionConfig {
    AcquisitionConfig::new(
        "https://ads.example.com/go",
        "https://portal.example.com/verify",
    )
}

fn sid(raw: &str) -> Sid {
    Sid::parse(raw).expect("sid")
}

#[tokio::test]
async fn generate_key_posts_camel_case_body_with_request_id() -> Result<()> {
    let state = StubState::gated_for(0);
    let (base_url, shutdown) = spawn_http_server(key_service(Arc::clone(&state))).await?;
    let client = client(&format!("{base_url}/"));

    let reply = client
        .generate_key_reply(&GenerateKeyRequest {
            session_id: "SID-HTTP001".to_string(),
            system: "standard".to_string(),
        })
        .await?;

    assert_eq!(reply.status, 200);
    assert!(reply.is_json());
    let bodies = state.bodies.lock().expect("bodies lock").clone();
    assert_eq!(
        bodies,
        vec![json!({"sessionId": "SID-HTTP001", "system": "standard"})]
    );
    let ids = state.request_ids.lock().expect("ids lock").clone();
    assert_eq!(ids.len(), 1);
    assert!(ids[0].starts_with("req_"));

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn controller_is_gated_then_issued_over_http() -> Result<()> {
    let state = StubState::gated_for(1);
    let (base_url, shutdown) = spawn_http_server(key_service(Arc::clone(&state))).await?;
    let controller = KeyAcquisitionController::new(client(&base_url), acquisition_config());
    let sid = sid("SID-HTTP002");

    let AttemptResult::Gated(redirect) = controller.request_key(&sid).await else {
        panic!("first request should be gated");
    };
    assert_eq!(
        redirect.return_url,
        "https://portal.example.com/verify?sid=SID-HTTP002"
    );
    assert_eq!(controller.attempt().status, AttemptStatus::Gated);

    let AttemptResult::Issued(key) = controller.recheck(&sid).await else {
        panic!("second request should issue a key");
    };
    assert_eq!(key.key, "OX-HTTP-KEY");
    assert_eq!(key.expires_in_hours, Some(24.0));
    assert_eq!(state.generate_calls.load(Ordering::SeqCst), 2);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn check_key_reports_an_existing_key() -> Result<()> {
    let state = StubState::gated_for(usize::MAX);
    let (base_url, shutdown) = spawn_http_server(key_service(Arc::clone(&state))).await?;
    let client = client(&base_url);

    let raw = client
        .check_key_reply(&CheckKeyRequest {
            session_id: "SID-HTTP003".to_string(),
        })
        .await?;
    assert_eq!(raw.status, 200);

    let controller = KeyAcquisitionController::new(client, acquisition_config());
    let existing = controller.check_existing(&sid("SID-HTTP003")).await?;
    assert_eq!(existing.map(|key| key.key), Some("OX-EXISTING".to_string()));
    assert_eq!(controller.attempt().status, AttemptStatus::Issued);
    assert_eq!(state.generate_calls.load(Ordering::SeqCst), 0);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn html_cold_start_reply_is_warming_up() -> Result<()> {
    let (base_url, shutdown) = spawn_http_server(cold_start_service()).await?;
    let controller = KeyAcquisitionController::new(client(&base_url), acquisition_config());

    let result = controller.request_key(&sid("SID-HTTP004")).await;
    assert_eq!(
        result,
        AttemptResult::Failed(AcquisitionError::ServiceWarmingUp { status: 503 })
    );
    assert_eq!(controller.attempt().status, AttemptStatus::Failed);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_unreachable() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let client = client(&format!("http://{addr}"));

    let direct = client
        .generate_key_reply(&GenerateKeyRequest {
            session_id: "SID-HTTP005".to_string(),
            system: "standard".to_string(),
        })
        .await;
    assert!(matches!(direct, Err(KeyClientError::Request { .. })));

    let controller = KeyAcquisitionController::new(client, acquisition_config());
    let result = controller.request_key(&sid("SID-HTTP005")).await;
    let AttemptResult::Failed(error) = result else {
        panic!("refused connection should fail");
    };
    assert!(matches!(error, AcquisitionError::Unreachable { .. }));
    assert!(error.is_service_unavailable());
    Ok(())
}

#[tokio::test]
async fn postback_sends_sid_as_query() -> Result<()> {
    let state = StubState::gated_for(0);
    let (base_url, shutdown) = spawn_http_server(key_service(Arc::clone(&state))).await?;

    let reply = client(&base_url).postback("SID-HTTP006").await?;
    assert_eq!(reply.status, 200);
    assert_eq!(
        state.postback_sids.lock().expect("postback lock").clone(),
        vec!["SID-HTTP006".to_string()]
    );

    let _ = shutdown.send(());
    Ok(())
}
