//! API client for the customer-service backend.
//!
//! This module provides the `ApiClient` struct: one typed method per REST
//! endpoint, all of them routed through the shared `Gateway`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::CredentialStore;
use crate::config::Config;
use crate::models::{Conversation, ConversationId, QueueFilters, QueuePage, TransferRequest, UserProfile};

use super::gateway::{ApiRequest, Gateway};
use super::ApiError;

// ============================================================================
// Endpoints
// ============================================================================

/// Credential issuance
const TOKEN_PATH: &str = "/token/";

/// Profile of the authenticated user
const CURRENT_USER_PATH: &str = "/usuarios/me/";

/// Service queue
const QUEUE_PATH: &str = "/atendimentos/conversas/fila-atendimento/";

/// Conversation lifecycle actions, relative to `/atendimentos/conversas/{id}/`
const ACTION_TAKE: &str = "assumir";
const ACTION_RESOLVE: &str = "marcar_resolvido";
const ACTION_CLOSE: &str = "fechar";
const ACTION_SEND_MESSAGE: &str = "enviar_mensagem";
const ACTION_MARK_UNREAD: &str = "marcar-nao-lida";
const ACTION_MARK_READ: &str = "marcar-como-lida";
const ACTION_TRANSFER: &str = "transferir";

#[derive(Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Credential pair issued at sign-in, with the profile when the backend includes it.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access: String,
    pub refresh: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    texto: &'a str,
}

/// API client for the backend.
/// Clone is cheap - the gateway shares its connection pool and state.
#[derive(Clone)]
pub struct ApiClient {
    gateway: Gateway,
}

impl ApiClient {
    /// Create a new API client from configuration
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let gateway = Gateway::new(config.api_base_url(), config.request_timeout(), credentials)?;
        Ok(Self { gateway })
    }

    pub fn from_gateway(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    // ===== Authentication =====

    /// Exchange a username/password for a credential pair.
    ///
    /// Sent without renewal: a 401 here means bad credentials, not an
    /// expired session.
    pub async fn obtain_token(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        let request = ApiRequest::post(TOKEN_PATH).with_json(&TokenRequest { username, password })?;
        self.gateway.send_without_renewal(request).await
    }

    /// Fetch the profile of the user the access credential belongs to
    pub async fn current_user(&self) -> Result<UserProfile, ApiError> {
        self.gateway.send(ApiRequest::get(CURRENT_USER_PATH)).await
    }

    // ===== Service queue =====

    /// Fetch one page of the service queue
    pub async fn fetch_queue(&self, filters: &QueueFilters) -> Result<QueuePage, ApiError> {
        let request = ApiRequest::get(QUEUE_PATH).with_query(filters.query_pairs());
        let value: Value = self.gateway.send(request).await?;
        let page = parse_queue_page(value)?;
        debug!(count = page.count, returned = page.results.len(), "Queue page fetched");
        Ok(page)
    }

    // ===== Conversation actions =====

    /// Assign the conversation to the signed-in agent
    pub async fn take_conversation(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        self.action(id, ACTION_TAKE).await
    }

    pub async fn resolve_conversation(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        self.action(id, ACTION_RESOLVE).await
    }

    pub async fn close_conversation(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        self.action(id, ACTION_CLOSE).await
    }

    /// Send a text message; returns the message record as the backend stored it
    pub async fn send_message(&self, id: ConversationId, text: &str) -> Result<Value, ApiError> {
        let request = ApiRequest::post(action_path(id, ACTION_SEND_MESSAGE))
            .with_json(&MessageRequest { texto: text })?;
        self.gateway.send(request).await
    }

    pub async fn mark_unread(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        self.action(id, ACTION_MARK_UNREAD).await
    }

    pub async fn mark_read(&self, id: ConversationId) -> Result<Conversation, ApiError> {
        self.action(id, ACTION_MARK_READ).await
    }

    /// Hand the conversation over to another sector and/or agent
    pub async fn transfer_conversation(
        &self,
        id: ConversationId,
        transfer: &TransferRequest,
    ) -> Result<Conversation, ApiError> {
        let request = ApiRequest::post(action_path(id, ACTION_TRANSFER)).with_json(transfer)?;
        self.gateway.send(request).await
    }

    async fn action(&self, id: ConversationId, action: &str) -> Result<Conversation, ApiError> {
        self.gateway.send(ApiRequest::post(action_path(id, action))).await
    }
}

fn action_path(id: ConversationId, action: &str) -> String {
    format!("/atendimentos/conversas/{}/{}/", id, action)
}

/// Shape-check a queue response: a JSON object with a `results` list.
fn parse_queue_page(value: Value) -> Result<QueuePage, ApiError> {
    let Value::Object(ref body) = value else {
        return Err(ApiError::InvalidResponse(
            "queue response is not a JSON object".to_string(),
        ));
    };
    if !matches!(body.get("results"), Some(Value::Array(_))) {
        return Err(ApiError::InvalidResponse(
            "queue response has no `results` list".to_string(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse queue response: {}", e)))
}
