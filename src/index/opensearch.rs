//! OpenSearch-backed [`SearchIndex`].
//!
//! Talks to the REST API directly with `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | exists | `HEAD /{index}` |
//! | create | `PUT /{index}` with [`index_definition`] |
//! | upsert | `PUT /{index}/_doc/{id}?refresh=wait_for` |
//! | get | `GET /{index}/_doc/{id}` |

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use crate::config::IndexConfig;
use crate::error::StepError;
use crate::models::{IndexResult, SnippetDocument};

use super::{index_definition, SearchIndex};

const SERVICE: &str = "opensearch";

pub struct OpenSearchIndex {
    client: reqwest::Client,
    base: Url,
    index: String,
    dims: usize,
}

impl OpenSearchIndex {
    pub fn new(config: &IndexConfig, dims: usize) -> Result<Self> {
        let base = Url::parse(&format!("http://{}:{}/", config.host, config.port))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base,
            index: config.name.clone(),
            dims,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StepError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StepError::permanent("index base URL cannot have path segments"))?
            .pop_if_empty()
            .push(&self.index)
            .extend(segments);
        Ok(url)
    }
}

#[derive(Deserialize)]
struct IndexResponse {
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<SnippetDocument>,
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn ensure_schema(&self) -> Result<(), StepError> {
        let url = self.url(&[])?;
        let head = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| StepError::from_transport(SERVICE, e))?;

        match head.status() {
            s if s.is_success() => return Ok(()),
            StatusCode::NOT_FOUND => {}
            s => return Err(StepError::from_status(SERVICE, s, "")),
        }

        tracing::info!(index = %self.index, dims = self.dims, "creating search index");
        let response = self
            .client
            .put(url)
            .json(&index_definition(self.dims))
            .send()
            .await
            .map_err(|e| StepError::from_transport(SERVICE, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        // Another worker created it between our HEAD and PUT.
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(StepError::from_status(SERVICE, status, &body))
    }

    async fn upsert(&self, doc: &SnippetDocument) -> Result<IndexResult, StepError> {
        let mut url = self.url(&["_doc", &doc.entity_id])?;
        url.query_pairs_mut().append_pair("refresh", "wait_for");

        let response = self
            .client
            .put(url)
            .json(doc)
            .send()
            .await
            .map_err(|e| StepError::from_transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(SERVICE, status, &body));
        }

        let parsed: IndexResponse = response
            .json()
            .await
            .map_err(|e| StepError::transient(format!("invalid index response: {}", e)))?;
        Ok(IndexResult::ok(parsed.id))
    }

    async fn get(&self, entity_id: &str) -> Result<Option<SnippetDocument>, StepError> {
        let url = self.url(&["_doc", entity_id])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StepError::from_transport(SERVICE, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(SERVICE, status, &body));
        }

        let parsed: GetResponse = response
            .json()
            .await
            .map_err(|e| StepError::transient(format!("invalid get response: {}", e)))?;
        Ok(if parsed.found { parsed.source } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> OpenSearchIndex {
        let config = IndexConfig {
            host: "search.internal".to_string(),
            port: 9200,
            name: "code_snippets".to_string(),
            ..IndexConfig::default()
        };
        OpenSearchIndex::new(&config, 8).unwrap()
    }

    #[test]
    fn test_document_url_escapes_id() {
        let idx = index();
        let url = idx.url(&["_doc", "a/b c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://search.internal:9200/code_snippets/_doc/a%2Fb%20c"
        );
    }

    #[test]
    fn test_index_url() {
        let idx = index();
        assert_eq!(
            idx.url(&[]).unwrap().as_str(),
            "http://search.internal:9200/code_snippets"
        );
    }
}
