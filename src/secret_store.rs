//! Client for the document encryption service.
//!
//! File references are encrypted per asset so only parties with access can
//! resolve the real URLs.

use crate::config::ServiceConfig;
use crate::ddo::File;
use crate::error::{Result, SdkError};
use crate::http::HttpService;
use crate::primitives::Bytes32;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ENCRYPT_PATH: &str = "/api/v1/secretstore/encrypt";
const DECRYPT_PATH: &str = "/api/v1/secretstore/decrypt";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest {
    document_id: String,
    document: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest {
    document_id: String,
    encrypted_document: String,
}

#[derive(Clone)]
pub struct SecretStoreClient {
    service: HttpService,
}

impl SecretStoreClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            service: HttpService::new("secret-store", config)?,
        })
    }

    pub fn uri(&self) -> &str {
        self.service.base()
    }

    pub async fn encrypt_document(&self, asset_id: &Bytes32, files: &[File]) -> Result<String> {
        let request = EncryptRequest {
            document_id: asset_id.to_plain_hex(),
            document: serde_json::to_string(files)?,
        };
        debug!(asset = %asset_id, files = files.len(), "Encrypting document");
        let response = self
            .service
            .http
            .post(self.service.url(ENCRYPT_PATH))
            .json(&request)
            .send()
            .await?;
        let blob = self.service.check(response).await?.text().await?;
        if blob.trim().is_empty() {
            return Err(SdkError::Service {
                service: "secret-store".to_string(),
                status: 200,
                body: "empty encrypted document".to_string(),
            });
        }
        Ok(blob.trim().to_string())
    }

    pub async fn decrypt_document(&self, asset_id: &Bytes32, encrypted: &str) -> Result<Vec<File>> {
        let request = DecryptRequest {
            document_id: asset_id.to_plain_hex(),
            encrypted_document: encrypted.to_string(),
        };
        debug!(asset = %asset_id, "Decrypting document");
        let response = self
            .service
            .http
            .post(self.service.url(DECRYPT_PATH))
            .json(&request)
            .send()
            .await?;
        let document = self.service.check(response).await?.text().await?;
        Ok(serde_json::from_str(&document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_encrypt_then_decrypt() {
        let server = MockServer::start().await;
        let asset = Bytes32([0x5a; 32]);
        let files = vec![File::from_url("https://example.com/rain.csv")];

        Mock::given(method("POST"))
            .and(path(ENCRYPT_PATH))
            .and(body_partial_json(json!({"documentId": asset.to_plain_hex()})))
            .respond_with(ResponseTemplate::new(200).set_body_string("0xdeadbeef\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(DECRYPT_PATH))
            .and(body_partial_json(json!({"encryptedDocument": "0xdeadbeef"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(serde_json::to_string(&files).unwrap()))
            .mount(&server)
            .await;

        let client = SecretStoreClient::new(&ServiceConfig::with_uri(server.uri())).unwrap();
        let blob = client.encrypt_document(&asset, &files).await.unwrap();
        assert_eq!(blob, "0xdeadbeef");
        assert_eq!(client.decrypt_document(&asset, &blob).await.unwrap(), files);
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let client = SecretStoreClient::new(&ServiceConfig::with_uri(server.uri())).unwrap();
        let err = client.encrypt_document(&Bytes32::zero(), &[]).await.unwrap_err();
        assert!(matches!(err, SdkError::Service { status: 500, .. }));
    }
}
