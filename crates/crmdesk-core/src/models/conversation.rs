//! Conversation entries of the service queue.
//!
//! Only the fields the queue view reads are typed; everything else the
//! backend sends is kept in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type ConversationId = i64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,

    // Contact
    pub cliente_nome: Option<String>,
    pub nome_contato: Option<String>,
    pub cliente_telefone: Option<String>,
    pub numero_contato: Option<String>,

    // Queue state, each with the backend's display label
    pub status_atendimento: Option<String>,
    pub status_atendimento_display: Option<String>,
    pub modo_atendimento: Option<String>,
    pub modo_atendimento_display: Option<String>,
    pub prioridade: Option<String>,
    pub prioridade_display: Option<String>,
    pub marcada_nao_lida: Option<bool>,

    pub data_inicio: Option<String>,
    pub tempo_espera: Option<Value>,
    pub ultima_mensagem: Option<Value>,
    pub ultima_mensagem_texto: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    pub fn contact_name(&self) -> Option<&str> {
        non_empty(&self.cliente_nome).or_else(|| non_empty(&self.nome_contato))
    }

    pub fn contact_phone(&self) -> Option<&str> {
        non_empty(&self.cliente_telefone).or_else(|| non_empty(&self.numero_contato))
    }

    pub fn status_label(&self) -> Option<&str> {
        non_empty(&self.status_atendimento_display).or_else(|| non_empty(&self.status_atendimento))
    }

    pub fn mode_label(&self) -> Option<&str> {
        non_empty(&self.modo_atendimento_display).or_else(|| non_empty(&self.modo_atendimento))
    }

    pub fn priority_label(&self) -> Option<&str> {
        non_empty(&self.prioridade_display).or_else(|| non_empty(&self.prioridade))
    }

    pub fn is_unread(&self) -> bool {
        self.marcada_nao_lida.unwrap_or(false)
    }

    /// Preview of the last message: the dedicated text field, or the
    /// message itself when sent as a string or as an object with text.
    pub fn last_message_text(&self) -> Option<&str> {
        if let Some(text) = non_empty(&self.ultima_mensagem_texto) {
            return Some(text);
        }
        let text = match self.ultima_mensagem.as_ref()? {
            Value::String(text) => Some(text.as_str()),
            Value::Object(message) => ["conteudo", "texto", "text"]
                .iter()
                .find_map(|field| message.get(*field).and_then(Value::as_str)),
            _ => None,
        };
        text.map(str::trim).filter(|s| !s.is_empty())
    }

    /// Waiting time as sent by the backend; numbers are minutes.
    pub fn wait_display(&self) -> Option<String> {
        match self.tempo_espera.as_ref()? {
            Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Value::Number(minutes) => minutes.as_i64().map(|m| {
                if m >= 60 {
                    format!("{}h {}m", m / 60, m % 60)
                } else {
                    format!("{}m", m)
                }
            }),
            _ => None,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Body of the transfer action. At least one target is expected by the
/// backend; the client forwards whatever is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novo_setor_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub novo_atendente_id: Option<i64>,
    pub motivo: String,
}
