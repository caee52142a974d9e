use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::repositories::BoxFuture;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Search endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Search query is empty")]
    EmptyQuery,
}

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub result: String,
    pub similarity: f64,
    #[serde(default)]
    pub all_results: Vec<SearchHit>,
}

/// Function value that runs a search. Handed to whatever needs to trigger searches, so no
/// component has to look the search client up globally.
pub type QueryDispatch = Arc<dyn Fn(String) -> BoxFuture<'static, SearchResult<SearchResponse>> + Send + Sync>;

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
}

#[derive(Clone)]
pub struct SearchService {
    client: reqwest::Client,
    endpoint: String,
}

impl SearchService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub async fn search(&self, query: &str) -> SearchResult<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        debug!(query, "Running semantic search");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequest { query })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status {
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }

    pub fn dispatcher(&self) -> QueryDispatch {
        let service = self.clone();
        Arc::new(move |query: String| -> BoxFuture<'static, SearchResult<SearchResponse>> {
            let service = service.clone();
            Box::pin(async move { service.search(&query).await })
        })
    }
}
