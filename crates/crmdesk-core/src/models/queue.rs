//! Service-queue query parameters and paginated results.

use serde::{Deserialize, Deserializer, Serialize};

use super::Conversation;

/// "All" sentinel for masculine filter names (status, mode).
pub const ALL_MASCULINE: &str = "TODOS";

/// "All" sentinel for feminine filter names (priority).
pub const ALL_FEMININE: &str = "TODAS";

/// Page size the backend uses when it does not report one.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Status the inbox shows when first opened.
pub const DEFAULT_STATUS: &str = "ABERTA";

/// Filters for the service queue. A filter that is unset, blank, or set to
/// an "all" sentinel is left out of the query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueFilters {
    pub status_atendimento: Option<String>,
    pub modo_atendimento: Option<String>,
    pub prioridade: Option<String>,
    pub apenas_nao_lidas: bool,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl QueueFilters {
    /// Filters of a freshly opened inbox: open conversations, every mode and priority.
    pub fn inbox() -> Self {
        Self {
            status_atendimento: Some(DEFAULT_STATUS.to_string()),
            modo_atendimento: Some(ALL_MASCULINE.to_string()),
            prioridade: Some(ALL_FEMININE.to_string()),
            ..Default::default()
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    /// Query parameters in wire order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(status) = selected(&self.status_atendimento) {
            pairs.push(("status_atendimento", status.to_string()));
        }
        if let Some(mode) = selected(&self.modo_atendimento) {
            pairs.push(("modo_atendimento", mode.to_string()));
        }
        if let Some(priority) = selected(&self.prioridade) {
            pairs.push(("prioridade", priority.to_string()));
        }
        if self.apenas_nao_lidas {
            pairs.push(("marcada_nao_lida", "true".to_string()));
        }
        // The backend searches contact name and number
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            pairs.push(("search", search.to_string()));
        }
        if let Some(page) = self.page.filter(|p| *p > 0) {
            pairs.push(("page", page.to_string()));
        }
        if let Some(page_size) = self.page_size.filter(|p| *p > 0) {
            pairs.push(("page_size", page_size.to_string()));
        }

        pairs
    }
}

fn selected(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty() && *v != ALL_MASCULINE && *v != ALL_FEMININE)
}

/// One page of the service queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuePage {
    pub results: Vec<Conversation>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
}

impl QueuePage {
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.filter(|size| *size > 0).unwrap_or(DEFAULT_PAGE_SIZE)
    }

    /// Number of pages for `count` results; an empty queue still has one page.
    pub fn total_pages(&self) -> u64 {
        if self.count == 0 {
            1
        } else {
            self.count.div_ceil(u64::from(self.effective_page_size()))
        }
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    pub fn has_previous(&self) -> bool {
        self.previous.is_some()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
