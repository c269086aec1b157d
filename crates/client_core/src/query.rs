use std::{cmp::Ordering, sync::Arc};

use serde_json::Value;
use shared::domain::{FieldValue, RowKey, SortDirection};

/// A record held by a collection.
///
/// Rows expose named scalar fields; the collection reads the configured key
/// field, the searchable fields and the sort field through this accessor.
pub trait Row: Clone + Send + Sync + 'static {
    fn field(&self, name: &str) -> Option<FieldValue>;
}

impl Row for Value {
    fn field(&self, name: &str) -> Option<FieldValue> {
        Some(match self.get(name)? {
            Value::Null => FieldValue::Null,
            Value::Bool(value) => FieldValue::Bool(*value),
            Value::Number(value) => FieldValue::Number(value.as_f64()?),
            Value::String(value) => FieldValue::Text(value.clone()),
            other => FieldValue::Text(other.to_string()),
        })
    }
}

pub fn row_key<R: Row>(row: &R, key_field: &str) -> Option<RowKey> {
    row.field(key_field)?.to_row_key()
}

/// Immutable description of what a collection should show. Every intent
/// produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionQuery {
    pub search_text: String,
    pub sort_field: Option<String>,
    pub sort_direction: SortDirection,
    pub page_index: usize,
    pub page_size: usize,
}

impl CollectionQuery {
    pub fn new(page_size: usize) -> Self {
        Self {
            search_text: String::new(),
            sort_field: None,
            sort_direction: SortDirection::Asc,
            page_index: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn with_search(&self, text: &str) -> Self {
        Self {
            search_text: text.to_string(),
            page_index: 0,
            ..self.clone()
        }
    }

    /// Without an explicit direction, sorting the active field again flips the
    /// direction and a new field starts ascending.
    pub fn with_sort(&self, field: &str, direction: Option<SortDirection>) -> Self {
        let direction = direction.unwrap_or_else(|| {
            if self.sort_field.as_deref() == Some(field) {
                self.sort_direction.toggled()
            } else {
                SortDirection::Asc
            }
        });
        Self {
            sort_field: Some(field.to_string()),
            sort_direction: direction,
            page_index: 0,
            ..self.clone()
        }
    }

    pub fn with_page(&self, page_index: usize) -> Self {
        Self {
            page_index,
            ..self.clone()
        }
    }

    pub fn with_page_size(&self, page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            page_index: 0,
            ..self.clone()
        }
    }

    pub fn offset(&self) -> usize {
        self.page_index.saturating_mul(self.page_size)
    }
}

pub type ParamBuilder = Arc<dyn Fn(&CollectionQuery) -> Vec<(String, String)> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub params: Vec<(String, String)>,
}

impl RemoteRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Filter, comparator and slice bound for a locally held collection.
#[derive(Debug, Clone)]
pub struct ClientPlan {
    needle: Option<String>,
    searchable_fields: Vec<String>,
    sort: Option<(String, SortDirection)>,
    end: usize,
}

#[derive(Debug, Clone)]
pub struct ClientWindow<R> {
    pub items: Vec<R>,
    pub total: usize,
    pub has_more: bool,
}

impl ClientPlan {
    pub fn matches<R: Row>(&self, row: &R) -> bool {
        let Some(needle) = &self.needle else {
            return true;
        };
        self.searchable_fields.iter().any(|field| {
            row.field(field)
                .is_some_and(|value| value.contains_lowercase(needle))
        })
    }

    pub fn compare<R: Row>(&self, a: &R, b: &R) -> Ordering {
        let Some((field, direction)) = &self.sort else {
            return Ordering::Equal;
        };
        let a = a.field(field).unwrap_or(FieldValue::Null);
        let b = b.field(field).unwrap_or(FieldValue::Null);
        let ordering = a.sort_cmp(&b);
        match direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    /// Exclusive end of the cumulative window `[0, end)`.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn apply<R: Row>(&self, rows: &[R]) -> ClientWindow<R> {
        let mut matched: Vec<&R> = rows.iter().filter(|row| self.matches(*row)).collect();
        // `sort_by` is stable, so ties keep their source order in both directions.
        matched.sort_by(|a, b| self.compare(*a, *b));
        let total = matched.len();
        ClientWindow {
            items: matched.into_iter().take(self.end).cloned().collect(),
            total,
            has_more: self.end < total,
        }
    }
}

pub enum NormalizeMode<'a> {
    Client { searchable_fields: &'a [String] },
    Remote { param_builder: Option<&'a ParamBuilder> },
}

pub enum Plan {
    Client(ClientPlan),
    Remote(RemoteRequest),
}

pub fn normalize(query: &CollectionQuery, mode: NormalizeMode<'_>) -> Plan {
    match mode {
        NormalizeMode::Client { searchable_fields } => {
            Plan::Client(client_plan(query, searchable_fields))
        }
        NormalizeMode::Remote { param_builder } => {
            Plan::Remote(remote_request(query, param_builder))
        }
    }
}

pub fn client_plan(query: &CollectionQuery, searchable_fields: &[String]) -> ClientPlan {
    let needle = (!query.search_text.is_empty()).then(|| query.search_text.to_lowercase());
    ClientPlan {
        needle,
        searchable_fields: searchable_fields.to_vec(),
        sort: query
            .sort_field
            .clone()
            .map(|field| (field, query.sort_direction)),
        end: query
            .page_index
            .saturating_add(1)
            .saturating_mul(query.page_size),
    }
}

/// Request parameters for one page. A custom builder replaces the default
/// `search`/`limit`/`skip` naming entirely; empty values are dropped.
pub fn remote_request(query: &CollectionQuery, param_builder: Option<&ParamBuilder>) -> RemoteRequest {
    let params = match param_builder {
        Some(builder) => builder(query)
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect(),
        None => {
            let mut params = Vec::with_capacity(3);
            if !query.search_text.is_empty() {
                params.push(("search".to_string(), query.search_text.clone()));
            }
            params.push(("limit".to_string(), query.page_size.to_string()));
            params.push(("skip".to_string(), query.offset().to_string()));
            params
        }
    };
    RemoteRequest { params }
}

#[cfg(test)]
#[path = "tests/query_tests.rs"]
mod tests;
