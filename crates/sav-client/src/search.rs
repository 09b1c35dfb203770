use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use sav_core::ContactCandidate;

use crate::api::ApiClient;
use crate::debounce::LatestOnly;
use crate::error::ApiError;
use crate::SEARCH_QUIET;

/// Shorter queries clear the results instead of hitting the backend.
pub const MIN_QUERY_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    /// `GET /people/lookup`, used by the link generator.
    People,
    /// `GET /contacts/search`, the CRM autocomplete of the desk.
    Crm,
}

/// Search-as-you-type over contacts. Only the newest query's answer is kept.
#[derive(Clone)]
pub struct ContactSearch {
    api: ApiClient,
    source: SearchSource,
    latest: LatestOnly,
    results: Arc<Mutex<Vec<ContactCandidate>>>,
    quiet: Duration,
}

impl ContactSearch {
    pub fn new(api: ApiClient, source: SearchSource) -> Self {
        Self {
            api,
            source,
            latest: LatestOnly::new(),
            results: Arc::new(Mutex::new(Vec::new())),
            quiet: SEARCH_QUIET,
        }
    }

    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn results(&self) -> Vec<ContactCandidate> {
        self.results
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn store(&self, list: Vec<ContactCandidate>) {
        if let Ok(mut slot) = self.results.lock() {
            *slot = list;
        }
    }

    async fn fetch(&self, query: &str) -> Result<Vec<ContactCandidate>, ApiError> {
        match self.source {
            SearchSource::People => self.api.lookup_people(query).await,
            SearchSource::Crm => self.api.search_contacts(query).await,
        }
    }

    /// Run `query` now. `Ok(None)` means a newer query superseded this one and
    /// its answer was dropped.
    pub async fn search(&self, query: &str) -> Result<Option<Vec<ContactCandidate>>, ApiError> {
        let query = query.trim();
        if query.chars().count() < MIN_QUERY_CHARS {
            self.latest.issue();
            self.store(vec![]);
            return Ok(Some(vec![]));
        }
        match self.latest.run(self.fetch(query)).await {
            None => {
                debug!(query, "stale search result dropped");
                Ok(None)
            }
            Some(result) => {
                let list = result?;
                self.store(list.clone());
                Ok(Some(list))
            }
        }
    }

    /// Keystroke entry point: searches once typing pauses. Any answer still in
    /// flight for an older query is discarded from now on, and `Ok(None)` means
    /// a later keystroke arrived during the pause or the request.
    pub async fn type_query(&self, query: &str) -> Result<Option<Vec<ContactCandidate>>, ApiError> {
        let ticket = self.latest.issue();
        tokio::time::sleep(self.quiet).await;
        if !self.latest.is_current(ticket) {
            debug!(query, "keystroke superseded");
            return Ok(None);
        }
        self.search(query).await
    }
}
