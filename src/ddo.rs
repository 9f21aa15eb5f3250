//! DID documents.
//!
//! A [`Ddo`] round-trips through JSON without loss: unknown metadata fields are
//! kept in `extra` maps. The checksum covers only the file checksums, name,
//! author, license and id, so unrelated metadata can change freely.

use crate::abi::{keccak256, AbiType};
use crate::account::{recover_personal, Account, Signature};
use crate::did::Did;
use crate::error::{Result, SdkError};
use crate::primitives::{Address, Bytes32};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DDO_CONTEXT: &str = "https://w3id.org/future-method/v1";
pub const PUBLIC_KEY_TYPE: &str = "EthereumECDSAKey";
pub const AUTHENTICATION_TYPE: &str = "RsaSignatureAuthentication2018";
pub const PROOF_TYPE: &str = "DDOIntegritySignature";

/// ISO-8601 in UTC without fractional seconds.
pub fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub owner: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: String,
    pub creator: Address,
    pub signature_value: Signature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl File {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            checksum: None,
            content_length: None,
            content_type: None,
            index: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataBase {
    pub name: String,
    #[serde(rename = "type", default)]
    pub asset_type: String,
    #[serde(default)]
    pub date_created: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    /// Decimal token amount.
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_files: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MetadataBase {
    pub fn price_amount(&self) -> Result<u128> {
        self.price
            .trim()
            .parse()
            .map_err(|_| SdkError::Validation(format!("Invalid price '{}'", self.price)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub base: MetadataBase,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub abi_type: AbiType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCondition {
    pub name: String,
    pub contract_name: String,
    pub function_name: String,
    pub index: usize,
    pub timeout: u64,
    pub timelock: u64,
    pub condition_key: Bytes32,
    pub parameters: Vec<ConditionParameter>,
    pub dependencies: Vec<String>,
    pub dependency_timeout_flags: Vec<bool>,
    pub is_terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessService {
    pub service_definition_id: String,
    pub service_endpoint: String,
    pub purchase_endpoint: String,
    pub template_id: Bytes32,
    pub conditions: Vec<ServiceCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataService {
    pub service_definition_id: String,
    pub service_endpoint: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeService {
    pub service_definition_id: String,
    pub service_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Bytes32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationService {
    pub service_definition_id: String,
    pub service_endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Access,
    Metadata,
    Compute,
    Authorization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Service {
    Access(AccessService),
    Metadata(MetadataService),
    Compute(ComputeService),
    Authorization(AuthorizationService),
}

impl Service {
    pub fn service_type(&self) -> ServiceType {
        match self {
            Service::Access(_) => ServiceType::Access,
            Service::Metadata(_) => ServiceType::Metadata,
            Service::Compute(_) => ServiceType::Compute,
            Service::Authorization(_) => ServiceType::Authorization,
        }
    }

    pub fn service_definition_id(&self) -> &str {
        match self {
            Service::Access(s) => &s.service_definition_id,
            Service::Metadata(s) => &s.service_definition_id,
            Service::Compute(s) => &s.service_definition_id,
            Service::Authorization(s) => &s.service_definition_id,
        }
    }

    pub fn service_endpoint(&self) -> &str {
        match self {
            Service::Access(s) => &s.service_endpoint,
            Service::Metadata(s) => &s.service_endpoint,
            Service::Compute(s) => &s.service_endpoint,
            Service::Authorization(s) => &s.service_endpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ddo {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: Did,
    pub created: String,
    pub public_key: Vec<PublicKey>,
    pub authentication: Vec<Authentication>,
    pub service: Vec<Service>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Ddo {
    pub fn new(did: Did, owner: Address) -> Self {
        let key_id = format!("{}#keys-1", did);
        Self {
            context: DDO_CONTEXT.to_string(),
            id: did,
            created: timestamp_now(),
            public_key: vec![PublicKey {
                id: key_id.clone(),
                key_type: PUBLIC_KEY_TYPE.to_string(),
                owner,
            }],
            authentication: vec![Authentication {
                auth_type: AUTHENTICATION_TYPE.to_string(),
                public_key: key_id,
            }],
            service: Vec::new(),
            proof: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn short_id(&self) -> String {
        self.id.short_id()
    }

    /// Adds a service, replacing any existing service of the same type.
    pub fn add_service(&mut self, service: Service) {
        let kind = service.service_type();
        self.service.retain(|s| s.service_type() != kind);
        self.service.push(service);
    }

    pub fn find_service_by_id(&self, service_definition_id: &str) -> Option<&Service> {
        self.service
            .iter()
            .find(|s| s.service_definition_id() == service_definition_id)
    }

    pub fn find_service_by_type(&self, service_type: ServiceType) -> Option<&Service> {
        self.service.iter().find(|s| s.service_type() == service_type)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.service.iter().find_map(|s| match s {
            Service::Metadata(m) => Some(&m.metadata),
            _ => None,
        })
    }

    fn metadata_mut(&mut self) -> Option<&mut Metadata> {
        self.service.iter_mut().find_map(|s| match s {
            Service::Metadata(m) => Some(&mut m.metadata),
            _ => None,
        })
    }

    pub fn access_service(&self, service_definition_id: &str) -> Result<&AccessService> {
        match self.find_service_by_id(service_definition_id) {
            Some(Service::Access(access)) => Ok(access),
            Some(other) => Err(SdkError::Validation(format!(
                "Service {} of {} is {:?}, not Access",
                service_definition_id,
                self.id,
                other.service_type()
            ))),
            None => Err(SdkError::NotFound(format!(
                "Service {} not found in {}",
                service_definition_id, self.id
            ))),
        }
    }

    /// First 32 hex characters of keccak256 over the file checksums, name,
    /// author, license and id, concatenated in that order.
    pub fn compute_checksum(&self) -> Result<String> {
        let base = &self
            .metadata()
            .ok_or_else(|| SdkError::Validation(format!("{} has no metadata service", self.id)))?
            .base;

        let mut input = String::new();
        for file in &base.files {
            if let Some(checksum) = file.checksum.as_deref().filter(|c| !c.is_empty()) {
                input.push_str(checksum);
            }
        }
        input.push_str(&base.name);
        input.push_str(&base.author);
        input.push_str(&base.license);
        input.push_str(&self.id.to_string());

        let digest = hex::encode(keccak256(input.as_bytes()));
        Ok(digest[..32].to_string())
    }

    pub fn checksum(&self) -> Option<&str> {
        self.metadata()
            .and_then(|m| m.base.checksum.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Sets the checksum unless one is already present.
    pub fn add_checksum(&mut self) -> Result<()> {
        if self.checksum().is_some() {
            return Ok(());
        }
        let checksum = self.compute_checksum()?;
        if let Some(metadata) = self.metadata_mut() {
            metadata.base.checksum = Some(checksum);
        }
        Ok(())
    }

    /// Recomputes the checksum after the covered fields changed.
    pub fn refresh_checksum(&mut self) -> Result<()> {
        let checksum = self.compute_checksum()?;
        if let Some(metadata) = self.metadata_mut() {
            metadata.base.checksum = Some(checksum);
        }
        Ok(())
    }

    /// Signs the checksum of the current contents. The stored checksum must agree
    /// with it; call [`Ddo::refresh_checksum`] after editing covered fields.
    pub fn generate_proof(&self, publisher: &Account, prefix: &str) -> Result<Proof> {
        let stored = self
            .checksum()
            .ok_or_else(|| SdkError::Validation("Cannot sign a DDO without a checksum".to_string()))?;
        let checksum = self.compute_checksum()?;
        if stored != checksum {
            return Err(SdkError::Validation(format!(
                "Stored checksum {} of {} is stale, contents hash to {}",
                stored, self.id, checksum
            )));
        }
        Ok(Proof {
            proof_type: PROOF_TYPE.to_string(),
            created: timestamp_now(),
            creator: publisher.address(),
            signature_value: publisher.sign_personal(prefix, checksum.as_bytes())?,
        })
    }

    pub fn add_proof(&mut self, publisher: &Account, prefix: &str) -> Result<()> {
        if self.proof.is_some() {
            return Err(SdkError::Validation(format!("{} already has a proof", self.id)));
        }
        self.proof = Some(self.generate_proof(publisher, prefix)?);
        Ok(())
    }

    /// Whether the proof was made by its creator over the current checksum.
    pub fn verify_proof(&self, prefix: &str) -> Result<bool> {
        let (Some(proof), Some(checksum)) = (&self.proof, self.checksum()) else {
            return Ok(false);
        };
        if self.compute_checksum()? != checksum {
            return Ok(false);
        }
        let signer = recover_personal(prefix, checksum.as_bytes(), &proof.signature_value)?;
        Ok(signer == proof.creator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MESSAGE_PREFIX;

    fn sample_ddo() -> Ddo {
        let did = Did::from_id(Bytes32([0x11; 32]));
        let mut ddo = Ddo::new(did, Address([0x22; 20]));
        let mut file = File::from_url("https://example.com/data.csv");
        file.checksum = Some("abc123".to_string());
        ddo.add_service(Service::Metadata(MetadataService {
            service_definition_id: "0".to_string(),
            service_endpoint: "http://aquarius:5000/api/v1/aquarius/assets/ddo/{did}".to_string(),
            metadata: Metadata {
                base: MetadataBase {
                    name: "UK Weather".to_string(),
                    asset_type: "dataset".to_string(),
                    date_created: "2019-01-01T00:00:00Z".to_string(),
                    author: "Met Office".to_string(),
                    license: "CC-BY".to_string(),
                    price: "10".to_string(),
                    files: vec![file],
                    encrypted_files: None,
                    checksum: None,
                    extra: BTreeMap::new(),
                },
                extra: BTreeMap::new(),
            },
        }));
        ddo
    }

    #[test]
    fn test_json_roundtrip_keeps_unknown_fields() {
        let mut ddo = sample_ddo();
        if let Some(Service::Metadata(m)) = ddo.service.first_mut() {
            m.metadata
                .base
                .extra
                .insert("description".to_string(), Value::String("rain".to_string()));
        }
        let json = ddo.to_json().unwrap();
        assert!(json.contains("\"@context\""));
        assert!(json.contains("\"publicKey\""));
        assert!(json.contains("\"type\": \"Metadata\""));
        assert_eq!(Ddo::from_json(&json).unwrap(), ddo);
    }

    #[test]
    fn test_checksum_ignores_unrelated_metadata() {
        let ddo = sample_ddo();
        let before = ddo.compute_checksum().unwrap();
        assert_eq!(before.len(), 32);

        let mut other = ddo.clone();
        if let Some(Service::Metadata(m)) = other.service.first_mut() {
            m.metadata.base.extra.insert("tags".to_string(), serde_json::json!(["a", "b"]));
            m.metadata.base.date_created = "2020-05-05T00:00:00Z".to_string();
        }
        assert_eq!(other.compute_checksum().unwrap(), before);
    }

    #[test]
    fn test_checksum_tracks_covered_fields() {
        let ddo = sample_ddo();
        let before = ddo.compute_checksum().unwrap();

        let edits: Vec<fn(&mut MetadataBase)> = vec![
            |b| b.name.push('!'),
            |b| b.author.push('!'),
            |b| b.license.push('!'),
            |b| b.files[0].checksum = Some("def456".to_string()),
        ];
        for edit in edits {
            let mut changed = ddo.clone();
            if let Some(Service::Metadata(m)) = changed.service.first_mut() {
                edit(&mut m.metadata.base);
            }
            assert_ne!(changed.compute_checksum().unwrap(), before);
        }
    }

    #[test]
    fn test_add_checksum_is_noop_when_present() {
        let mut ddo = sample_ddo();
        ddo.add_checksum().unwrap();
        let first = ddo.checksum().unwrap().to_string();

        if let Some(Service::Metadata(m)) = ddo.service.first_mut() {
            m.metadata.base.name = "renamed".to_string();
        }
        ddo.add_checksum().unwrap();
        assert_eq!(ddo.checksum().unwrap(), first);

        ddo.refresh_checksum().unwrap();
        assert_ne!(ddo.checksum().unwrap(), first);
    }

    #[test]
    fn test_proof_added_once_and_verifies() {
        let publisher = Account::random();
        let mut ddo = sample_ddo();
        assert!(ddo.add_proof(&publisher, DEFAULT_MESSAGE_PREFIX).is_err());

        ddo.add_checksum().unwrap();
        ddo.add_proof(&publisher, DEFAULT_MESSAGE_PREFIX).unwrap();
        assert!(ddo.verify_proof(DEFAULT_MESSAGE_PREFIX).unwrap());
        assert!(matches!(
            ddo.add_proof(&publisher, DEFAULT_MESSAGE_PREFIX),
            Err(SdkError::Validation(_))
        ));

        ddo.refresh_checksum().unwrap();
        if let Some(Service::Metadata(m)) = ddo.service.first_mut() {
            m.metadata.base.author = "someone else".to_string();
        }
        assert!(!ddo.verify_proof(DEFAULT_MESSAGE_PREFIX).unwrap());
    }

    #[test]
    fn test_proof_requires_current_checksum() {
        let publisher = Account::random();
        let mut ddo = sample_ddo();
        ddo.add_checksum().unwrap();
        if let Some(Service::Metadata(m)) = ddo.service.first_mut() {
            m.metadata.base.name = "UK Weather 2020".to_string();
        }
        assert!(matches!(
            ddo.generate_proof(&publisher, DEFAULT_MESSAGE_PREFIX),
            Err(SdkError::Validation(msg)) if msg.contains("stale")
        ));

        ddo.refresh_checksum().unwrap();
        ddo.add_proof(&publisher, DEFAULT_MESSAGE_PREFIX).unwrap();
        assert!(ddo.verify_proof(DEFAULT_MESSAGE_PREFIX).unwrap());
    }

    #[test]
    fn test_services_unique_by_type() {
        let mut ddo = sample_ddo();
        for endpoint in ["http://a", "http://b"] {
            ddo.add_service(Service::Authorization(AuthorizationService {
                service_definition_id: "3".to_string(),
                service_endpoint: endpoint.to_string(),
            }));
        }
        assert_eq!(ddo.service.len(), 2);
        let auth = ddo.find_service_by_type(ServiceType::Authorization).unwrap();
        assert_eq!(auth.service_endpoint(), "http://b");
        assert!(matches!(ddo.access_service("3"), Err(SdkError::Validation(_))));
        assert!(matches!(ddo.access_service("9"), Err(SdkError::NotFound(_))));
    }
}
