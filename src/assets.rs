//! Publishing, discovering, ordering and consuming assets.

use crate::account::Account;
use crate::agreement::{Agreement, AgreementState};
use crate::conditions::Actor;
use crate::consumption::{ConsumedFile, ConsumptionClient, InitializeRequest};
use crate::ddo::{
    AccessService, AuthorizationService, ComputeService, Ddo, File, Metadata, MetadataService, Service,
};
use crate::did::Did;
use crate::error::{Result, SdkError};
use crate::keeper::Keeper;
use crate::metadata::{MetadataClient, QueryResult, SearchQuery};
use crate::orchestrator::AgreementOrchestrator;
use crate::primitives::Bytes32;
use crate::secret_store::SecretStoreClient;
use crate::template::{escrow_address, PublishContext, TemplateDefinition};
use std::path::{Path, PathBuf};
use tracing::info;

/// Hops followed when resolving a DID to its metadata URL.
pub const MAX_RESOLVE_HOPS: usize = 8;

#[derive(Clone)]
pub struct Assets {
    keeper: Keeper,
    metadata: MetadataClient,
    secret_store: SecretStoreClient,
    consumption: ConsumptionClient,
    orchestrator: AgreementOrchestrator,
    template: TemplateDefinition,
}

impl Assets {
    pub fn new(
        keeper: Keeper,
        metadata: MetadataClient,
        secret_store: SecretStoreClient,
        consumption: ConsumptionClient,
    ) -> Self {
        Self {
            orchestrator: AgreementOrchestrator::new(keeper.clone()),
            keeper,
            metadata,
            secret_store,
            consumption,
            template: TemplateDefinition::escrow_access_secret_store(),
        }
    }

    /// Uses `template` for the access services of newly created assets.
    pub fn with_template(mut self, template: TemplateDefinition) -> Self {
        self.template = template;
        self
    }

    pub fn template(&self) -> &TemplateDefinition {
        &self.template
    }

    pub fn orchestrator(&self) -> &AgreementOrchestrator {
        &self.orchestrator
    }

    /// Publishes an asset: encrypts its file references, builds the services,
    /// signs the DDO, stores it and registers the DID on-chain.
    ///
    /// `extra_services` are appended after the defaults; where two services share
    /// a type, the later one wins.
    pub async fn create(&self, metadata: Metadata, publisher: &Account, extra_services: Vec<Service>) -> Result<Ddo> {
        let did = Did::generate();
        let chain = self.keeper.chain().as_ref();
        info!(%did, publisher = %publisher.address(), name = %metadata.base.name, "Publishing asset");

        let encrypted = self
            .secret_store
            .encrypt_document(&did.id(), &metadata.base.files)
            .await?;

        let ctx = PublishContext {
            asset_id: did.id(),
            price: metadata.base.price_amount()?,
            publisher: publisher.address(),
            escrow_address: escrow_address(chain)?,
        };
        let conditions = self.template.ddo_conditions(chain, &ctx)?;
        let metadata_endpoint = self.metadata.service_endpoint(&did);

        let mut stored_metadata = metadata;
        stored_metadata.base.encrypted_files = Some(encrypted);
        stored_metadata.base.checksum = None;
        for file in &mut stored_metadata.base.files {
            file.url = None;
        }

        let mut next_id = 0usize;
        let mut service_id = || {
            let id = next_id.to_string();
            next_id += 1;
            id
        };

        let mut ddo = Ddo::new(did, publisher.address());
        let mut services = vec![
            Service::Access(AccessService {
                service_definition_id: service_id(),
                service_endpoint: self.consumption.consume_endpoint(),
                purchase_endpoint: self.consumption.purchase_endpoint(),
                template_id: self.template.id,
                conditions,
            }),
            Service::Compute(ComputeService {
                service_definition_id: service_id(),
                service_endpoint: self
                    .consumption
                    .compute_endpoint(&publisher.address().to_hex(), "1", "xxx", "xxx"),
                template_id: None,
            }),
            Service::Authorization(AuthorizationService {
                service_definition_id: service_id(),
                service_endpoint: self.secret_store.uri().to_string(),
            }),
            Service::Metadata(MetadataService {
                service_definition_id: service_id(),
                service_endpoint: metadata_endpoint.clone(),
                metadata: stored_metadata,
            }),
        ];
        for mut extra in extra_services {
            let id = service_id();
            match &mut extra {
                Service::Access(s) => s.service_definition_id = id,
                Service::Metadata(s) => s.service_definition_id = id,
                Service::Compute(s) => s.service_definition_id = id,
                Service::Authorization(s) => s.service_definition_id = id,
            }
            services.push(extra);
        }
        for service in services {
            ddo.add_service(service);
        }

        ddo.refresh_checksum()?;
        ddo.add_proof(publisher, self.keeper.message_prefix())?;

        let stored = self.metadata.store_ddo(&ddo).await?;
        let checksum = ddo
            .checksum()
            .ok_or_else(|| SdkError::Validation(format!("{} has no checksum", did)))?;
        self.keeper
            .did_registry()
            .register_attribute(&did, checksum, &metadata_endpoint, publisher)
            .await?;

        info!(%did, "Asset published");
        Ok(stored)
    }

    /// Resolves the DID on-chain to its metadata URL and fetches the DDO there.
    pub async fn resolve(&self, did: &Did) -> Result<Ddo> {
        let resolved = self.keeper.did_resolver().resolve(did, MAX_RESOLVE_HOPS).await?;
        match resolved.value() {
            Some(url) if resolved.is_url() => self.metadata.retrieve_ddo_by_url(url).await,
            other => Err(SdkError::Validation(format!(
                "{} resolved to {:?}, which is not a metadata URL",
                did, other
            ))),
        }
    }

    pub async fn search(&self, text: &str) -> Result<Vec<Ddo>> {
        Ok(self
            .metadata
            .query_metadata_by_text(&SearchQuery::text(text))
            .await?
            .results)
    }

    pub async fn query(&self, query: &SearchQuery) -> Result<QueryResult> {
        self.metadata.query_metadata(query).await
    }

    /// Runs the whole purchase with both parties' keys in this process.
    pub async fn order(
        &self,
        did: &Did,
        service_definition_id: &str,
        consumer: &Account,
        publisher: &Account,
    ) -> Result<Agreement> {
        let ddo = self.resolve(did).await?;
        self.orchestrator
            .run(Bytes32::random(), &ddo, service_definition_id, consumer, publisher)
            .await
    }

    /// Consumer side only: signs the agreement, sends it to the publisher's
    /// purchase endpoint, waits for it on-chain and locks the payment. The
    /// publisher grants access and releases the reward on its own.
    pub async fn request_access(&self, did: &Did, service_definition_id: &str, consumer: &Account) -> Result<Agreement> {
        let ddo = self.resolve(did).await?;
        let access = ddo.access_service(service_definition_id)?;
        if access.purchase_endpoint.is_empty() {
            return Err(SdkError::Validation(format!(
                "Service {} of {} has no purchase endpoint",
                service_definition_id, did
            )));
        }

        let mut agreement = self
            .orchestrator
            .prepare(Bytes32::random(), &ddo, service_definition_id, consumer)?;
        let signature = self.orchestrator.sign(&mut agreement, consumer)?;

        let request = InitializeRequest {
            did: *did,
            service_agreement_id: agreement.id(),
            service_definition_id: service_definition_id.to_string(),
            signature,
            consumer_address: consumer.address(),
        };
        self.consumption
            .initialize_agreement(&access.purchase_endpoint, &request)
            .await?;
        agreement.transition(AgreementState::Submitted)?;

        self.orchestrator.wait_initialized(&mut agreement).await?;
        self.orchestrator
            .fulfill_as(&mut agreement, Actor::Consumer, consumer)
            .await?;
        Ok(agreement)
    }

    /// Downloads the asset's files through the access service. With a
    /// destination, files land in `datafile.<did>.<agreement>/` under it.
    pub async fn consume(
        &self,
        agreement_id: &Bytes32,
        did: &Did,
        service_definition_id: &str,
        consumer: &Account,
        destination: Option<&Path>,
    ) -> Result<Vec<ConsumedFile>> {
        let ddo = self.resolve(did).await?;
        let access = ddo.access_service(service_definition_id)?;
        let metadata = ddo
            .metadata()
            .ok_or_else(|| SdkError::NotFound(format!("{} has no metadata service", did)))?;
        let encrypted = metadata
            .base
            .encrypted_files
            .as_deref()
            .ok_or_else(|| SdkError::Validation(format!("{} has no encrypted files", did)))?;

        let files: Vec<File> = self.secret_store.decrypt_document(&did.id(), encrypted).await?;
        let target: Option<PathBuf> = destination
            .map(|dir| dir.join(format!("datafile.{}.{}", ddo.short_id(), agreement_id.to_plain_hex())));

        self.consumption
            .consume_service(agreement_id, &access.service_endpoint, consumer, &files, target.as_deref())
            .await
    }
}
