//! Paginated collection controller.
//!
//! Serves a search/sort/page controlled list either from a locally held set of
//! rows (client mode) or from a paginated endpoint (remote mode). Every query
//! change starts a new fence generation; responses that arrive for an older
//! generation are dropped, so a slow response to an old search can never
//! overwrite the results of a newer one.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::{
    domain::{RowKey, SortDirection},
    error::{SyncError, SyncFailure},
    protocol::CollectionResponse,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    config::SyncSettings,
    fence::{FetchOutcome, FenceToken, RequestFence},
    query::{client_plan, remote_request, row_key, CollectionQuery, ParamBuilder, Row},
};

#[async_trait]
pub trait CollectionEndpoint<T>: Send + Sync {
    async fn fetch(
        &self,
        params: &[(String, String)],
    ) -> Result<CollectionResponse<T>, SyncError>;
}

pub enum CollectionSource<T> {
    Static(Vec<T>),
    Remote(Arc<dyn CollectionEndpoint<T>>),
}

#[derive(Clone)]
pub struct CollectionConfig {
    pub row_key: String,
    pub searchable_fields: Vec<String>,
    pub page_size: usize,
    pub initial_search: String,
    pub initial_sort: Option<(String, SortDirection)>,
    pub search_debounce: Option<Duration>,
    /// Remote mode only: non-empty searches shorter than this clear the page
    /// instead of fetching.
    pub min_search_length: usize,
    pub selectable: bool,
    pub param_builder: Option<ParamBuilder>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            row_key: "id".into(),
            searchable_fields: Vec::new(),
            page_size: 10,
            initial_search: String::new(),
            initial_sort: None,
            search_debounce: None,
            min_search_length: 0,
            selectable: true,
            param_builder: None,
        }
    }
}

impl CollectionConfig {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            page_size: settings.page_size.max(1),
            search_debounce: (settings.search_debounce_ms > 0)
                .then(|| Duration::from_millis(settings.search_debounce_ms)),
            min_search_length: settings.min_search_length,
            ..Self::default()
        }
    }

    fn initial_query(&self) -> CollectionQuery {
        let query = CollectionQuery::new(self.page_size).with_search(&self.initial_search);
        match &self.initial_sort {
            Some((field, direction)) => query.with_sort(field, Some(*direction)),
            None => query,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionPage<T> {
    pub items: Vec<T>,
    pub total_count: Option<usize>,
    pub has_more: bool,
}

impl<T> Default for CollectionPage<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total_count: None,
            has_more: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionSnapshot<T> {
    pub query: CollectionQuery,
    pub page: CollectionPage<T>,
    pub loading: bool,
    pub loading_more: bool,
    pub error: Option<SyncFailure>,
}

#[derive(Debug, Clone)]
pub enum CollectionEvent {
    PageRealized {
        query: CollectionQuery,
        len: usize,
        total_count: Option<usize>,
        has_more: bool,
    },
    FetchFailed(SyncFailure),
    SelectionChanged {
        selected: Vec<RowKey>,
    },
}

struct CollectionState<T> {
    query: CollectionQuery,
    /// Query the realized page was produced for. Differs from `query` while a
    /// fetch is in flight or after one failed.
    applied: Option<CollectionQuery>,
    rows: Vec<T>,
    page: CollectionPage<T>,
    /// Offset of the first realized item in the full result set.
    window_start: usize,
    loading: bool,
    loading_more: bool,
    error: Option<SyncFailure>,
    selection: BTreeSet<RowKey>,
}

pub struct CollectionController<T: Row> {
    config: CollectionConfig,
    endpoint: Option<Arc<dyn CollectionEndpoint<T>>>,
    fence: RequestFence,
    debounce: RequestFence,
    inner: Mutex<CollectionState<T>>,
    events: broadcast::Sender<CollectionEvent>,
}

impl<T: Row> CollectionController<T> {
    /// Builds a controller. A static source is realized immediately; a remote
    /// source stays empty until the first `refresh()`.
    pub fn new(source: CollectionSource<T>, config: CollectionConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (rows, endpoint) = match source {
            CollectionSource::Static(rows) => (rows, None),
            CollectionSource::Remote(endpoint) => (Vec::new(), Some(endpoint)),
        };
        let query = config.initial_query();
        let mut state = CollectionState {
            query,
            applied: None,
            rows,
            page: CollectionPage::default(),
            window_start: 0,
            loading: false,
            loading_more: false,
            error: None,
            selection: BTreeSet::new(),
        };
        if endpoint.is_none() {
            let plan = client_plan(&state.query, &config.searchable_fields);
            let window = plan.apply(&state.rows);
            state.page = CollectionPage {
                items: window.items,
                total_count: Some(window.total),
                has_more: window.has_more,
            };
            state.applied = Some(state.query.clone());
        }

        Arc::new(Self {
            config,
            endpoint,
            fence: RequestFence::new(),
            debounce: RequestFence::new(),
            inner: Mutex::new(state),
            events,
        })
    }

    pub fn from_rows(rows: Vec<T>, config: CollectionConfig) -> Arc<Self> {
        Self::new(CollectionSource::Static(rows), config)
    }

    pub fn from_endpoint(
        endpoint: Arc<dyn CollectionEndpoint<T>>,
        config: CollectionConfig,
    ) -> Arc<Self> {
        Self::new(CollectionSource::Remote(endpoint), config)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CollectionEvent> {
        self.events.subscribe()
    }

    pub fn is_remote(&self) -> bool {
        self.endpoint.is_some()
    }

    pub async fn snapshot(&self) -> CollectionSnapshot<T> {
        let state = self.inner.lock().await;
        CollectionSnapshot {
            query: state.query.clone(),
            page: state.page.clone(),
            loading: state.loading,
            loading_more: state.loading_more,
            error: state.error.clone(),
        }
    }

    pub async fn query(&self) -> CollectionQuery {
        self.inner.lock().await.query.clone()
    }

    pub async fn items(&self) -> Vec<T> {
        self.inner.lock().await.page.items.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.lock().await.page.has_more
    }

    pub async fn error(&self) -> Option<SyncFailure> {
        self.inner.lock().await.error.clone()
    }

    pub async fn total_pages(&self) -> Option<usize> {
        self.inner.lock().await.total_pages()
    }

    pub async fn has_next_page(&self) -> bool {
        let state = self.inner.lock().await;
        state
            .total_pages()
            .is_some_and(|pages| state.query.page_index + 1 < pages)
    }

    pub async fn has_prev_page(&self) -> bool {
        self.inner.lock().await.query.page_index > 0
    }

    /// Sets the search text. With a debounce interval configured the query is
    /// only issued once the interval has passed since the last call.
    pub async fn set_search(self: &Arc<Self>, text: impl Into<String>) -> Result<FetchOutcome, SyncError> {
        let text = text.into();
        let Some(delay) = self.config.search_debounce.filter(|delay| !delay.is_zero()) else {
            return self.reissue(|query| query.with_search(&text)).await;
        };

        let ticket = self.debounce.begin();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !controller.debounce.is_current(ticket) {
                return;
            }
            if let Err(err) = controller.reissue(|query| query.with_search(&text)).await {
                debug!(%err, "debounced search failed");
            }
        });
        Ok(FetchOutcome::Scheduled)
    }

    pub async fn set_sort(
        &self,
        field: &str,
        direction: Option<SortDirection>,
    ) -> Result<FetchOutcome, SyncError> {
        self.reissue(|query| query.with_sort(field, direction)).await
    }

    pub async fn set_page(&self, page_index: usize) -> Result<FetchOutcome, SyncError> {
        self.reissue(|query| query.with_page(page_index)).await
    }

    pub async fn set_page_size(&self, page_size: usize) -> Result<FetchOutcome, SyncError> {
        if page_size == 0 {
            return Err(SyncError::Validation("page size must be positive".into()));
        }
        self.reissue(|query| query.with_page_size(page_size)).await
    }

    pub async fn next_page(&self) -> Result<FetchOutcome, SyncError> {
        if !self.has_next_page().await {
            return Ok(FetchOutcome::Skipped);
        }
        let page_index = self.inner.lock().await.query.page_index + 1;
        self.set_page(page_index).await
    }

    pub async fn prev_page(&self) -> Result<FetchOutcome, SyncError> {
        let page_index = self.inner.lock().await.query.page_index;
        if page_index == 0 {
            return Ok(FetchOutcome::Skipped);
        }
        self.set_page(page_index - 1).await
    }

    /// Jumps to a page inside the known page range.
    pub async fn go_to_page(&self, page_index: usize) -> Result<FetchOutcome, SyncError> {
        let in_range = {
            let state = self.inner.lock().await;
            state.total_pages().is_some_and(|pages| page_index < pages)
        };
        if !in_range {
            return Ok(FetchOutcome::Skipped);
        }
        self.set_page(page_index).await
    }

    pub async fn refresh(&self) -> Result<FetchOutcome, SyncError> {
        self.reissue(CollectionQuery::clone).await
    }

    /// Restores the initial query, drops any pending debounced search and
    /// clears the selection.
    pub async fn reset(&self) -> Result<FetchOutcome, SyncError> {
        self.debounce.invalidate_all();
        {
            let mut state = self.inner.lock().await;
            if !state.selection.is_empty() {
                state.selection.clear();
                self.emit_selection(&state);
            }
        }
        let initial = self.config.initial_query();
        self.reissue(move |_| initial).await
    }

    /// Replaces the locally held rows. Only valid for a static source.
    pub async fn set_rows(&self, rows: Vec<T>) -> Result<FetchOutcome, SyncError> {
        if self.is_remote() {
            return Err(SyncError::Config(
                "rows can only be replaced on a static collection".into(),
            ));
        }
        self.inner.lock().await.rows = rows;
        self.reissue(|query| query.with_page(0)).await
    }

    /// Requests the page after the realized one and appends it. Skipped while
    /// a fetch is in flight or when there is nothing more to load. The next
    /// page always extends the query the realized rows came from, so a failed
    /// requery is never mixed into them.
    pub async fn load_more(&self) -> Result<FetchOutcome, SyncError> {
        let (token, query) = {
            let mut state = self.inner.lock().await;
            if !state.page.has_more || state.loading || state.loading_more {
                return Ok(FetchOutcome::Skipped);
            }
            let Some(applied) = state.applied.clone() else {
                return Ok(FetchOutcome::Skipped);
            };
            state.query = applied.with_page(applied.page_index.saturating_add(1));
            (self.fence.current(), state.query.clone())
        };
        self.realize(token, query, true).await
    }

    async fn reissue<F>(&self, change: F) -> Result<FetchOutcome, SyncError>
    where
        F: FnOnce(&CollectionQuery) -> CollectionQuery,
    {
        let (token, query) = {
            let mut state = self.inner.lock().await;
            state.query = change(&state.query);
            (self.fence.begin(), state.query.clone())
        };
        self.realize(token, query, false).await
    }

    async fn realize(
        &self,
        token: FenceToken,
        query: CollectionQuery,
        append: bool,
    ) -> Result<FetchOutcome, SyncError> {
        let Some(endpoint) = &self.endpoint else {
            let mut state = self.inner.lock().await;
            if !self.fence.is_current(token) || state.query != query {
                return Ok(FetchOutcome::Discarded);
            }
            let plan = client_plan(&query, &self.config.searchable_fields);
            let window = plan.apply(&state.rows);
            state.window_start = 0;
            state.page = CollectionPage {
                items: window.items,
                total_count: Some(window.total),
                has_more: window.has_more,
            };
            state.applied = Some(query);
            state.error = None;
            self.emit_page(&state);
            return Ok(FetchOutcome::Applied);
        };

        if !query.search_text.is_empty()
            && query.search_text.chars().count() < self.config.min_search_length
        {
            let mut state = self.inner.lock().await;
            if !self.fence.is_current(token) {
                return Ok(FetchOutcome::Discarded);
            }
            state.page = CollectionPage {
                items: Vec::new(),
                total_count: Some(0),
                has_more: false,
            };
            state.window_start = 0;
            state.applied = Some(query);
            state.loading = false;
            state.loading_more = false;
            self.emit_page(&state);
            return Ok(FetchOutcome::Applied);
        }

        let request = remote_request(&query, self.config.param_builder.as_ref());
        {
            let mut state = self.inner.lock().await;
            if self.fence.is_current(token) {
                if append {
                    state.loading_more = true;
                } else {
                    state.loading = true;
                }
            }
        }

        let result = endpoint.fetch(&request.params).await;

        let mut state = self.inner.lock().await;
        if !self.fence.is_current(token) || state.query != query {
            debug!(
                generation = token.generation(),
                search = %query.search_text,
                page_index = query.page_index,
                "discarding stale collection response"
            );
            return Ok(FetchOutcome::Discarded);
        }
        state.loading = false;
        state.loading_more = false;

        match result {
            Ok(response) => {
                state.apply_response(&query, response, append);
                state.applied = Some(query);
                state.error = None;
                self.emit_page(&state);
                Ok(FetchOutcome::Applied)
            }
            Err(err) => {
                warn!(%err, search = %query.search_text, "collection fetch failed");
                if append {
                    // the page was not extended, so the next attempt asks for it again
                    if let Some(applied) = state.applied.clone() {
                        state.query = applied;
                    }
                }
                let failure = SyncFailure::from(&err);
                state.error = Some(failure.clone());
                let _ = self.events.send(CollectionEvent::FetchFailed(failure));
                Err(err)
            }
        }
    }

    fn emit_page(&self, state: &CollectionState<T>) {
        let _ = self.events.send(CollectionEvent::PageRealized {
            query: state.query.clone(),
            len: state.page.items.len(),
            total_count: state.page.total_count,
            has_more: state.page.has_more,
        });
    }

    fn emit_selection(&self, state: &CollectionState<T>) {
        let _ = self.events.send(CollectionEvent::SelectionChanged {
            selected: state.selection.iter().cloned().collect(),
        });
    }

    fn realized_keys(&self, state: &CollectionState<T>) -> Vec<RowKey> {
        state
            .page
            .items
            .iter()
            .filter_map(|row| row_key(row, &self.config.row_key))
            .collect()
    }

    async fn mutate_selection<F>(&self, change: F)
    where
        F: FnOnce(&mut BTreeSet<RowKey>, Vec<RowKey>) -> bool,
    {
        if !self.config.selectable {
            return;
        }
        let mut state = self.inner.lock().await;
        let realized = self.realized_keys(&state);
        if change(&mut state.selection, realized) {
            self.emit_selection(&state);
        }
    }

    pub async fn select_row(&self, key: impl Into<RowKey>) {
        let key = key.into();
        self.mutate_selection(|selection, _| selection.insert(key))
            .await;
    }

    pub async fn deselect_row(&self, key: impl Into<RowKey>) {
        let key = key.into();
        self.mutate_selection(|selection, _| selection.remove(&key))
            .await;
    }

    pub async fn toggle_row(&self, key: impl Into<RowKey>) {
        let key = key.into();
        self.mutate_selection(|selection, _| {
            if !selection.remove(&key) {
                selection.insert(key);
            }
            true
        })
        .await;
    }

    /// Selects every row of the realized page (not the full remote result set).
    pub async fn select_all(&self) {
        self.mutate_selection(|selection, realized| {
            realized
                .into_iter()
                .fold(false, |changed, key| selection.insert(key) || changed)
        })
        .await;
    }

    /// Deselects the rows of the realized page, keeping selections made on
    /// rows that are not currently realized.
    pub async fn deselect_all(&self) {
        self.mutate_selection(|selection, realized| {
            realized
                .iter()
                .fold(false, |changed, key| selection.remove(key) || changed)
        })
        .await;
    }

    pub async fn toggle_all(&self) {
        if self.is_all_selected().await {
            self.deselect_all().await;
        } else {
            self.select_all().await;
        }
    }

    pub async fn clear_selection(&self) {
        self.mutate_selection(|selection, _| {
            let changed = !selection.is_empty();
            selection.clear();
            changed
        })
        .await;
    }

    pub async fn is_row_selected(&self, key: impl Into<RowKey>) -> bool {
        let key = key.into();
        self.config.selectable && self.inner.lock().await.selection.contains(&key)
    }

    pub async fn selected_keys(&self) -> Vec<RowKey> {
        self.inner.lock().await.selection.iter().cloned().collect()
    }

    /// Selected rows among the realized page.
    pub async fn selected_rows(&self) -> Vec<T> {
        let state = self.inner.lock().await;
        state
            .page
            .items
            .iter()
            .filter(|row| {
                row_key(*row, &self.config.row_key)
                    .is_some_and(|key| state.selection.contains(&key))
            })
            .cloned()
            .collect()
    }

    pub async fn is_all_selected(&self) -> bool {
        if !self.config.selectable {
            return false;
        }
        let state = self.inner.lock().await;
        let realized = self.realized_keys(&state);
        !realized.is_empty() && realized.iter().all(|key| state.selection.contains(key))
    }

    pub async fn is_indeterminate(&self) -> bool {
        if !self.config.selectable {
            return false;
        }
        let state = self.inner.lock().await;
        let realized = self.realized_keys(&state);
        let selected = realized
            .iter()
            .filter(|key| state.selection.contains(*key))
            .count();
        selected > 0 && selected < realized.len()
    }
}

impl<T> CollectionState<T> {
    fn total_pages(&self) -> Option<usize> {
        self.page
            .total_count
            .map(|total| total.div_ceil(self.query.page_size))
    }

    /// Applies a remote batch. `has_more` prefers the server's explicit flag,
    /// then its total, then assumes more rows exist whenever a full batch came
    /// back. The last heuristic reports one extra page when the final batch is
    /// exactly full.
    fn apply_response(
        &mut self,
        query: &CollectionQuery,
        response: CollectionResponse<T>,
        append: bool,
    ) {
        let batch_len = response.items.len();
        if append {
            self.page.items.extend(response.items);
        } else {
            self.window_start = query.offset();
            self.page.items = response.items;
        }

        let total = response.total.map(|total| total as usize);
        if total.is_some() || !append {
            self.page.total_count = total;
        }
        self.page.has_more = match (response.has_more, total) {
            (Some(flag), _) => flag,
            (None, Some(total)) => self.window_start + self.page.items.len() < total,
            (None, None) => batch_len >= query.page_size,
        };
    }
}

#[cfg(test)]
#[path = "tests/collection_tests.rs"]
mod tests;
