//! Client for the metadata/indexing service that stores DDOs.

use crate::config::ServiceConfig;
use crate::ddo::Ddo;
use crate::did::Did;
use crate::error::Result;
use crate::http::HttpService;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const DDO_PATH: &str = "/api/v1/aquarius/assets/ddo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub offset: u32,
    pub page: u32,
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub sort: Value,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            offset: 100,
            page: 1,
            query: Value::Object(Default::default()),
            sort: Value::Object(Default::default()),
        }
    }
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub results: Vec<Ddo>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub total_results: u32,
}

#[derive(Clone)]
pub struct MetadataClient {
    service: HttpService,
}

impl MetadataClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new("metadata", config)?,
        })
    }

    /// Where the DDO for `did` can be fetched; this is what gets registered on-chain.
    pub fn service_endpoint(&self, did: &Did) -> String {
        self.service.url(&format!("{}/{}", DDO_PATH, did))
    }

    pub async fn store_ddo(&self, ddo: &Ddo) -> Result<Ddo> {
        info!(did = %ddo.id, "Storing DDO");
        let response = self
            .service
            .http
            .post(self.service.url(DDO_PATH))
            .json(ddo)
            .send()
            .await?;
        let response = self.service.check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn retrieve_ddo(&self, did: &Did) -> Result<Ddo> {
        self.retrieve_ddo_by_url(&self.service_endpoint(did)).await
    }

    /// Fetches a DDO from a resolved metadata URL.
    pub async fn retrieve_ddo_by_url(&self, url: &str) -> Result<Ddo> {
        debug!(%url, "Retrieving DDO");
        let response = self.service.http.get(url).send().await?;
        let response = self.service.check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn query_metadata(&self, query: &SearchQuery) -> Result<QueryResult> {
        debug!(?query, "Querying metadata");
        let response = self
            .service
            .http
            .post(self.service.url(&format!("{}/query", DDO_PATH)))
            .json(query)
            .send()
            .await?;
        let response = self.service.check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn query_metadata_by_text(&self, query: &SearchQuery) -> Result<QueryResult> {
        let mut params = vec![
            ("text", query.text.clone().unwrap_or_default()),
            ("offset", query.offset.to_string()),
            ("page", query.page.to_string()),
        ];
        if !query.sort.as_object().map(|o| o.is_empty()).unwrap_or(true) {
            params.push(("sort", query.sort.to_string()));
        }
        debug!(text = ?query.text, "Text search");
        let response = self
            .service
            .http
            .get(self.service.url(&format!("{}/query", DDO_PATH)))
            .query(&params)
            .send()
            .await?;
        let response = self.service.check(response).await?;
        Ok(response.json().await?)
    }
}
