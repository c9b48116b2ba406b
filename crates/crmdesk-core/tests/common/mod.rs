//! In-process stand-in for the customer-service backend.
//!
//! Protected routes accept a bearer only if it is in `accepted`. The refresh
//! route hands out `A2` (and `R2` when rotation is on) for the refresh
//! credential `R1`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crmdesk_core::api::Gateway;
use crmdesk_core::auth::CredentialStore;
use crmdesk_core::ApiClient;

pub const PASSWORD: &str = "secret";
pub const PROFILE_ID: i64 = 7;

pub struct BackendState {
    pub token_hits: AtomicUsize,
    pub refresh_hits: AtomicUsize,
    pub me_hits: AtomicUsize,
    pub queue_hits: AtomicUsize,
    pub action_hits: AtomicUsize,

    /// Bearer values protected routes accept
    pub accepted: Mutex<Vec<String>>,
    pub refresh_accepted: AtomicBool,
    pub rotate_refresh: AtomicBool,
    pub token_includes_user: AtomicBool,
    pub refresh_delay_ms: AtomicU64,
    pub token_delay_ms: AtomicU64,

    pub queue_body: Mutex<Value>,
    pub last_queue_query: Mutex<Option<String>>,
    pub last_refresh_body: Mutex<Option<Value>>,
    /// Conversation actions in arrival order, with their JSON body if any
    pub actions: Mutex<Vec<RecordedAction>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedAction {
    pub id: i64,
    pub action: String,
    pub body: Option<Value>,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            token_hits: AtomicUsize::new(0),
            refresh_hits: AtomicUsize::new(0),
            me_hits: AtomicUsize::new(0),
            queue_hits: AtomicUsize::new(0),
            action_hits: AtomicUsize::new(0),
            accepted: Mutex::new(vec!["A1".to_string(), "A2".to_string()]),
            refresh_accepted: AtomicBool::new(true),
            rotate_refresh: AtomicBool::new(false),
            token_includes_user: AtomicBool::new(true),
            refresh_delay_ms: AtomicU64::new(0),
            token_delay_ms: AtomicU64::new(0),
            queue_body: Mutex::new(json!({
                "count": 1,
                "next": null,
                "previous": null,
                "results": [{"id": 1, "nome_contato": "Maria", "status_atendimento": "ABERTA"}]
            })),
            last_queue_query: Mutex::new(None),
            last_refresh_body: Mutex::new(None),
            actions: Mutex::new(Vec::new()),
        }
    }
}

impl BackendState {
    pub fn hits(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn accept_only(&self, tokens: &[&str]) {
        *self.accepted.lock().unwrap() = tokens.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_queue_body(&self, body: Value) {
        *self.queue_body.lock().unwrap() = body;
    }

    pub fn last_queue_query(&self) -> Option<String> {
        self.last_queue_query.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<RecordedAction> {
        self.actions.lock().unwrap().clone()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(token) = value.strip_prefix("Bearer ") else {
            return false;
        };
        self.accepted.lock().unwrap().iter().any(|t| t == token)
    }
}

pub struct MockBackend {
    pub base_url: String,
    pub state: Arc<BackendState>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::with_state(BackendState::default()).await
    }

    pub async fn with_state(state: BackendState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/api/token/", post(issue_token))
            .route("/api/token/refresh/", post(refresh_token))
            .route("/api/usuarios/me/", get(current_user))
            .route("/api/atendimentos/conversas/fila-atendimento/", get(queue))
            .route("/api/atendimentos/conversas/{id}/{action}/", post(conversation_action))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener.local_addr().expect("resolved local listener address");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}/api"),
            state,
            handle,
        }
    }

    pub fn gateway(&self, credentials: Arc<dyn CredentialStore>) -> Gateway {
        Gateway::with_client(reqwest::Client::new(), &self.base_url, credentials)
    }

    pub fn client(&self, credentials: Arc<dyn CredentialStore>) -> ApiClient {
        ApiClient::from_gateway(self.gateway(credentials))
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn unauthorized(detail: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": detail}))).into_response()
}

async fn issue_token(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    state.token_hits.fetch_add(1, Ordering::SeqCst);
    let delay = state.token_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    if body.get("password").and_then(Value::as_str) != Some(PASSWORD) {
        return unauthorized("No active account found with the given credentials");
    }
    let mut tokens = json!({"access": "A1", "refresh": "R1"});
    if state.token_includes_user.load(Ordering::SeqCst) {
        tokens["user"] = json!({"id": PROFILE_ID});
    }
    Json(tokens).into_response()
}

async fn refresh_token(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    state.refresh_hits.fetch_add(1, Ordering::SeqCst);
    *state.last_refresh_body.lock().unwrap() = Some(body.clone());
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let valid = body.get("refresh").and_then(Value::as_str) == Some("R1");
    if !valid || !state.refresh_accepted.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Token is invalid or expired", "code": "token_not_valid"})),
        )
            .into_response();
    }
    let mut tokens = json!({"access": "A2"});
    if state.rotate_refresh.load(Ordering::SeqCst) {
        tokens["refresh"] = json!("R2");
    }
    Json(tokens).into_response()
}

async fn current_user(State(state): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    state.me_hits.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    Json(json!({"id": PROFILE_ID, "email": "agent@x.com", "nome_completo": "Ana Souza"})).into_response()
}

async fn queue(
    State(state): State<Arc<BackendState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    state.queue_hits.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    *state.last_queue_query.lock().unwrap() = query;
    Json(state.queue_body.lock().unwrap().clone()).into_response()
}

async fn conversation_action(
    State(state): State<Arc<BackendState>>,
    Path((id, action)): Path<(i64, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.action_hits.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(&headers) {
        return unauthorized("Given token not valid for any token type");
    }
    let body = (!body.is_empty())
        .then(|| serde_json::from_slice::<Value>(&body).expect("action body should be JSON"));
    state.actions.lock().unwrap().push(RecordedAction {
        id,
        action: action.clone(),
        body,
    });

    let status = match action.as_str() {
        "assumir" => "EM_ATENDIMENTO",
        "marcar_resolvido" => "RESOLVIDA",
        "marcar-nao-lida" | "marcar-como-lida" => "EM_ATENDIMENTO",
        "transferir" => "ABERTA",
        _ => return other_action(&action),
    };
    Json(json!({"id": id, "status_atendimento": status})).into_response()
}

fn other_action(action: &str) -> Response {
    match action {
        "fechar" => (
            StatusCode::FORBIDDEN,
            Json(json!({"erro": "Somente o atendente responsável pode fechar"})),
        )
            .into_response(),
        "enviar_mensagem" => Json(json!({"id": 99, "texto": "ok"})).into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({"detail": "Not found."}))).into_response(),
    }
}
