//! Outgoing request pipeline shared by every API call.
//!
//! Each request passes two interceptors. The outbound one attaches the
//! stored access credential as a bearer header. The inbound one turns a 401
//! into at most one credential renewal followed by at most one replay of the
//! original request; the replay's outcome is final.
//!
//! Renewal calls bypass the pipeline, so a rejected renewal can never
//! trigger another renewal. Concurrent requests that hit a 401 while a
//! renewal is in flight wait for that renewal instead of starting their own.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::{CredentialSlot, CredentialStore};

use super::error::{ApiError, ErrorBody, RenewalError};

/// Credential renewal endpoint, relative to the base URL
const REFRESH_PATH: &str = "/token/refresh/";

/// Buffer for gateway events; subscribers only care about the latest few.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session-level signals raised by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A renewal stored a new access credential.
    CredentialRenewed,
    /// The session cannot be renewed. Both credentials were cleared and the
    /// user has to sign in again.
    LoginRequired,
}

/// A request as the pipeline sees it, independent of any HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_query<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(body);
        Ok(self)
    }

    /// Pin the bearer credential instead of reading it from the store.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }
}

/// An in-flight call and whether it has already been through a renewal.
/// Once `retried` is set the inbound interceptor passes every outcome through.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: ApiRequest,
    pub retried: bool,
}

impl PendingRequest {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request,
            retried: false,
        }
    }

    /// A request whose 401 is reported as-is, with no renewal attempt.
    pub fn without_renewal(request: ApiRequest) -> Self {
        Self {
            request,
            retried: true,
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    // Present when the backend rotates refresh credentials
    #[serde(default)]
    refresh: Option<String>,
}

type RenewalFuture = Shared<BoxFuture<'static, Result<String, RenewalError>>>;

/// HTTP gateway.
/// Clone is cheap - every field is reference counted, and clones share the
/// connection pool, the event channel and the in-flight renewal.
#[derive(Clone)]
pub struct Gateway {
    client: Client,
    base_url: Arc<str>,
    credentials: Arc<dyn CredentialStore>,
    events: broadcast::Sender<GatewayEvent>,
    renewal: Arc<Mutex<Option<RenewalFuture>>>,
}

impl Gateway {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, credentials))
    }

    pub fn with_client(client: Client, base_url: &str, credentials: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            credentials,
            events,
            renewal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Send a request through the full pipeline and decode the JSON response.
    pub async fn send<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let response = self.dispatch(PendingRequest::new(request)).await?;
        Self::decode(response).await
    }

    /// Like `send`, but a 401 is returned to the caller without renewal.
    pub async fn send_without_renewal<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, ApiError> {
        let response = self.dispatch(PendingRequest::without_renewal(request)).await?;
        Self::decode(response).await
    }

    /// Inbound interceptor.
    async fn dispatch(&self, mut pending: PendingRequest) -> Result<reqwest::Response, ApiError> {
        loop {
            let error = match self.execute(&pending.request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !error.is_unauthorized() || pending.retried {
                return Err(error);
            }
            pending.retried = true;

            let access = match self.renew().await {
                Ok(access) => access,
                // Nothing to renew with: the caller sees its own 401
                Err(RenewalError::MissingRefreshToken) => return Err(error),
                Err(e) => return Err(e.into()),
            };

            debug!(path = %pending.request.path, "Replaying request with renewed credential");
            pending.request.bearer = Some(access);
        }
    }

    /// Outbound interceptor plus the actual send.
    async fn execute(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header(header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(token) = self.bearer_for(request) {
            builder = builder.bearer_auth(token);
        }

        debug!(method = %request.method, path = %request.path, "Sending request");
        let response = builder.send().await?;
        Self::check_response(response).await
    }

    fn bearer_for(&self, request: &ApiRequest) -> Option<String> {
        if let Some(ref token) = request.bearer {
            return Some(token.clone());
        }
        match self.credentials.get(CredentialSlot::Access) {
            Ok(token) => token,
            Err(e) => {
                // Proceed unauthenticated; the backend decides
                warn!(error = %e, "Failed to read access credential");
                None
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let url = response.url().path().to_string();
        let text = response.text().await?;
        // Empty bodies (204 and friends) decode as JSON null
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    /// Join the in-flight renewal, or start one.
    async fn renew(&self) -> Result<String, RenewalError> {
        let renewal = {
            let mut slot = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight credential renewal");
                    in_flight.clone()
                }
                None => {
                    let renewal = Self::renew_credentials(
                        self.client.clone(),
                        format!("{}{}", self.base_url, REFRESH_PATH),
                        Arc::clone(&self.credentials),
                        self.events.clone(),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(renewal.clone());
                    renewal
                }
            }
        };

        let result = renewal.clone().await;

        let mut slot = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|in_flight| in_flight.ptr_eq(&renewal)) {
            *slot = None;
        }
        result
    }

    /// Exchange the refresh credential for a new access credential. Any
    /// failure clears both credentials and raises `LoginRequired`.
    async fn renew_credentials(
        client: Client,
        url: String,
        credentials: Arc<dyn CredentialStore>,
        events: broadcast::Sender<GatewayEvent>,
    ) -> Result<String, RenewalError> {
        let refresh = match credentials.get(CredentialSlot::Refresh) {
            Ok(Some(refresh)) => refresh,
            Ok(None) => {
                warn!("No refresh credential stored, session cannot be renewed");
                Self::expire_session(credentials.as_ref(), &events);
                return Err(RenewalError::MissingRefreshToken);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read refresh credential");
                Self::expire_session(credentials.as_ref(), &events);
                return Err(RenewalError::MissingRefreshToken);
            }
        };

        match Self::request_renewal(&client, &url, &refresh).await {
            Ok(renewed) => {
                if let Err(e) = credentials.set(CredentialSlot::Access, &renewed.access) {
                    warn!(error = %e, "Failed to store renewed access credential");
                }
                if let Some(ref rotated) = renewed.refresh {
                    if let Err(e) = credentials.set(CredentialSlot::Refresh, rotated) {
                        warn!(error = %e, "Failed to store rotated refresh credential");
                    }
                }
                info!("Access credential renewed");
                // No subscribers is fine
                let _ = events.send(GatewayEvent::CredentialRenewed);
                Ok(renewed.access)
            }
            Err(e) => {
                warn!(error = %e, "Credential renewal failed");
                Self::expire_session(credentials.as_ref(), &events);
                Err(e)
            }
        }
    }

    async fn request_renewal(
        client: &Client,
        url: &str,
        refresh: &str,
    ) -> Result<RefreshResponse, RenewalError> {
        let response = client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh })
            .send()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        if !status.is_success() {
            let body = ErrorBody::parse(&text);
            let message = body
                .backend_message()
                .map(str::to_string)
                .unwrap_or_else(|| body.raw().to_string());
            return Err(RenewalError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|e| RenewalError::InvalidResponse(e.to_string()))
    }

    fn expire_session(credentials: &dyn CredentialStore, events: &broadcast::Sender<GatewayEvent>) {
        if let Err(e) = credentials.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        let _ = events.send(GatewayEvent::LoginRequired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentials;

    fn gateway(credentials: MemoryCredentials) -> Gateway {
        Gateway::with_client(Client::new(), "http://localhost:8000/api/", Arc::new(credentials))
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let gateway = gateway(MemoryCredentials::new());
        assert_eq!(gateway.base_url(), "http://localhost:8000/api");
    }

    #[test]
    fn test_bearer_from_store() {
        let gateway = gateway(MemoryCredentials::with_tokens("A1", "R1"));
        let request = ApiRequest::get("/usuarios/me/");
        assert_eq!(gateway.bearer_for(&request).as_deref(), Some("A1"));
    }

    #[test]
    fn test_pinned_bearer_wins() {
        let gateway = gateway(MemoryCredentials::with_tokens("A1", "R1"));
        let request = ApiRequest::get("/usuarios/me/").with_bearer("A2");
        assert_eq!(gateway.bearer_for(&request).as_deref(), Some("A2"));
    }

    #[test]
    fn test_no_bearer_when_store_empty() {
        let gateway = gateway(MemoryCredentials::new());
        assert_eq!(gateway.bearer_for(&ApiRequest::get("/usuarios/me/")), None);
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::post("/atendimentos/conversas/1/transferir/")
            .with_query([("a", "1")])
            .with_json(&serde_json::json!({"motivo": "x"}))
            .unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.query(), &[("a".to_string(), "1".to_string())]);
        assert_eq!(request.body(), Some(&serde_json::json!({"motivo": "x"})));
        assert_eq!(request.bearer(), None);
    }

    #[test]
    fn test_without_renewal_is_pre_marked() {
        assert!(!PendingRequest::new(ApiRequest::get("/")).retried);
        assert!(PendingRequest::without_renewal(ApiRequest::get("/")).retried);
    }
}
