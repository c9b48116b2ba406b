use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Profile of the signed-in agent.
///
/// The backend owns its shape; the client reads a few well-known fields and
/// otherwise treats it as a field-name to value mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(Map<String, Value>);

impl UserProfile {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Minimal profile used when the token endpoint returns no user.
    pub fn from_identifier(identifier: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("email".to_string(), Value::String(identifier.to_string()));
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn id(&self) -> Option<i64> {
        self.0.get("id").and_then(Value::as_i64)
    }

    pub fn email(&self) -> Option<&str> {
        self.str_field("email")
    }

    /// Best available human name: full name, first + last, username, email.
    pub fn display_name(&self) -> Option<String> {
        for field in ["nome_completo", "nome", "full_name"] {
            if let Some(name) = self.str_field(field) {
                return Some(name.to_string());
            }
        }
        let first = self.str_field("first_name");
        let last = self.str_field("last_name");
        match (first, last) {
            (Some(first), Some(last)) => return Some(format!("{} {}", first, last)),
            (Some(name), None) | (None, Some(name)) => return Some(name.to_string()),
            (None, None) => {}
        }
        self.str_field("username")
            .or_else(|| self.email())
            .map(str::to_string)
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

impl From<Map<String, Value>> for UserProfile {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
