use crate::config::ServiceConfig;
use crate::error::{Result, SdkError};
use reqwest::{Client, Response};
use tracing::warn;

/// Base URL and HTTP client shared by the off-chain service clients.
#[derive(Clone)]
pub(crate) struct HttpService {
    name: &'static str,
    base: String,
    pub(crate) http: Client,
}

impl HttpService {
    pub(crate) fn new(name: &'static str, config: &ServiceConfig) -> Result<Self> {
        if config.uri.is_empty() {
            return Err(SdkError::Config(format!("{} service URI cannot be empty", name)));
        }
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            name,
            base: config.uri.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Passes successful responses through; anything else becomes a service error.
    pub(crate) async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        warn!(service = self.name, %url, status = status.as_u16(), "Service request failed");
        Err(SdkError::Service {
            service: self.name.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
