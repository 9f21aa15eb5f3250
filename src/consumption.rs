//! Client for the publisher's consumption service.

use crate::account::{Account, Signature};
use crate::config::ServiceConfig;
use crate::ddo::File;
use crate::did::Did;
use crate::error::{Result, SdkError};
use crate::http::HttpService;
use crate::primitives::{Address, Bytes32};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const ACCESS_PATH: &str = "/api/v1/brizo/services/access/initialize";
const CONSUME_PATH: &str = "/api/v1/brizo/services/consume";
const COMPUTE_PATH: &str = "/api/v1/brizo/services/compute";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    pub did: Did,
    pub service_agreement_id: Bytes32,
    pub service_definition_id: String,
    pub signature: Signature,
    pub consumer_address: Address,
}

/// A file fetched from the consume endpoint.
#[derive(Debug, Clone)]
pub struct ConsumedFile {
    pub url: String,
    pub size: u64,
    /// Set when the file was written to disk, otherwise the bytes are in `data`.
    pub path: Option<PathBuf>,
    pub data: Vec<u8>,
}

#[derive(Clone)]
pub struct ConsumptionClient {
    service: HttpService,
}

impl ConsumptionClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new("consumption", config)?,
        })
    }

    pub fn purchase_endpoint(&self) -> String {
        self.service.url(ACCESS_PATH)
    }

    pub fn consume_endpoint(&self) -> String {
        self.service.url(CONSUME_PATH)
    }

    pub fn compute_endpoint(&self, pub_key: &str, service_id: &str, algorithm: &str, container: &str) -> String {
        format!(
            "{}?pubKey={}&serviceId={}&algo={}&container={}",
            self.service.url(COMPUTE_PATH),
            pub_key,
            service_id,
            algorithm,
            container
        )
    }

    /// Hands the signed agreement to the publisher at `endpoint` (the access
    /// service's purchase endpoint); the publisher submits it on-chain.
    pub async fn initialize_agreement(&self, endpoint: &str, request: &InitializeRequest) -> Result<()> {
        info!(
            did = %request.did,
            agreement = %request.service_agreement_id,
            consumer = %request.consumer_address,
            "Sending agreement to publisher"
        );
        let response = self
            .service
            .http
            .post(endpoint)
            .json(request)
            .send()
            .await?;
        self.service.check(response).await?;
        Ok(())
    }

    /// Downloads every file through `endpoint`. With a `destination` the files are
    /// streamed to disk under it; otherwise they are returned in memory.
    pub async fn consume_service(
        &self,
        agreement_id: &Bytes32,
        endpoint: &str,
        consumer: &Account,
        files: &[File],
        destination: Option<&Path>,
    ) -> Result<Vec<ConsumedFile>> {
        if endpoint.is_empty() {
            return Err(SdkError::Validation("Access service has no serviceEndpoint".to_string()));
        }
        if let Some(dir) = destination {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut consumed = Vec::with_capacity(files.len());
        let mut taken = HashSet::new();
        for (i, file) in files.iter().enumerate() {
            let url = file
                .url
                .as_deref()
                .ok_or_else(|| SdkError::Validation(format!("File {} has no url", i)))?;
            let query = [
                ("url", url.to_string()),
                ("serviceAgreementId", agreement_id.to_plain_hex()),
                ("consumerAddress", consumer.address().to_hex()),
            ];
            debug!(agreement = %agreement_id, url, "Consuming file");
            let response = self.service.http.get(endpoint).query(&query).send().await?;
            let response = self.service.check(response).await?;

            let file_out = match destination {
                Some(dir) => {
                    let path = dir.join(unique_file_name(url, file.index.unwrap_or(i as u32), &mut taken));
                    let mut out = tokio::fs::File::create(&path).await?;
                    let mut size = 0u64;
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        let chunk = chunk?;
                        size += chunk.len() as u64;
                        out.write_all(&chunk).await?;
                    }
                    out.flush().await?;
                    ConsumedFile {
                        url: url.to_string(),
                        size,
                        path: Some(path),
                        data: Vec::new(),
                    }
                }
                None => {
                    let data = response.bytes().await?.to_vec();
                    ConsumedFile {
                        url: url.to_string(),
                        size: data.len() as u64,
                        path: None,
                        data,
                    }
                }
            };
            consumed.push(file_out);
        }
        info!(agreement = %agreement_id, files = consumed.len(), "Files consumed");
        Ok(consumed)
    }
}

/// Last path segment of the URL, or `file<index>` when there is none.
fn file_name(url: &str, index: u32) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .map(str::to_string)
        .unwrap_or_else(|| format!("file{}", index))
}

/// [`file_name`], prefixed with the index while it clashes with an earlier file.
fn unique_file_name(url: &str, index: u32, taken: &mut HashSet<String>) -> String {
    let name = file_name(url, index);
    let mut candidate = name.clone();
    let mut prefix = index;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{}_{}", prefix, name);
        prefix = prefix.saturating_add(1);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> ConsumptionClient {
        ConsumptionClient::new(&ServiceConfig::with_uri(server.uri())).unwrap()
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("https://example.com/data/rain.csv?x=1", 0), "rain.csv");
        assert_eq!(file_name("https://example.com/", 3), "file3");
    }

    #[tokio::test]
    async fn test_initialize_agreement_posts_signature() {
        let server = MockServer::start().await;
        let consumer = Account::random();
        let request = InitializeRequest {
            did: Did::generate(),
            service_agreement_id: Bytes32::random(),
            service_definition_id: "1".to_string(),
            signature: consumer.sign_personal("prefix", b"agreement").unwrap(),
            consumer_address: consumer.address(),
        };
        Mock::given(method("POST"))
            .and(path(ACCESS_PATH))
            .and(body_partial_json(serde_json::json!({
                "serviceDefinitionId": "1",
                "consumerAddress": consumer.address().to_hex(),
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server).await;
        client
            .initialize_agreement(&client.purchase_endpoint(), &request)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_consume_writes_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONSUME_PATH))
            .and(query_param("url", "https://example.com/rain.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"a,b\n1,2\n".to_vec()))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let files = vec![File::from_url("https://example.com/rain.csv")];
        let consumed = client
            .consume_service(
                &Bytes32::random(),
                &client.consume_endpoint(),
                &Account::random(),
                &files,
                Some(dir.path()),
            )
            .await
            .unwrap();

        let written = consumed[0].path.clone().unwrap();
        assert_eq!(written, dir.path().join("rain.csv"));
        assert_eq!(std::fs::read(written).unwrap(), b"a,b\n1,2\n");
        assert_eq!(consumed[0].size, 8);
    }

    #[test]
    fn test_clashing_file_names_get_index_prefix() {
        let mut taken = HashSet::new();
        assert_eq!(unique_file_name("https://a.com/rain.csv", 0, &mut taken), "rain.csv");
        assert_eq!(unique_file_name("https://b.com/rain.csv", 1, &mut taken), "1_rain.csv");
        assert_eq!(unique_file_name("https://c.com/x/rain.csv", 1, &mut taken), "2_rain.csv");
    }

    #[tokio::test]
    async fn test_consume_keeps_files_with_same_name_apart() {
        let server = MockServer::start().await;
        for (url, body) in [("https://a.com/rain.csv", "first"), ("https://b.com/rain.csv", "second")] {
            Mock::given(method("GET"))
                .and(path(CONSUME_PATH))
                .and(query_param("url", url))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }

        let client = client(&server).await;
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            File::from_url("https://a.com/rain.csv"),
            File::from_url("https://b.com/rain.csv"),
        ];
        let consumed = client
            .consume_service(
                &Bytes32::random(),
                &client.consume_endpoint(),
                &Account::random(),
                &files,
                Some(dir.path()),
            )
            .await
            .unwrap();

        assert_eq!(consumed[0].path.clone().unwrap(), dir.path().join("rain.csv"));
        assert_eq!(consumed[1].path.clone().unwrap(), dir.path().join("1_rain.csv"));
        assert_eq!(std::fs::read_to_string(dir.path().join("rain.csv")).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(dir.path().join("1_rain.csv")).unwrap(), "second");
    }

    #[tokio::test]
    async fn test_consume_failure_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("not authorized"))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let err = client
            .consume_service(
                &Bytes32::random(),
                &client.consume_endpoint(),
                &Account::random(),
                &[File::from_url("https://example.com/a")],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Service { status: 401, .. }));
    }
}
