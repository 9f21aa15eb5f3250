use crate::account::Account;
use crate::assets::Assets;
#[cfg(feature = "dev-chain")]
use crate::chain::memory::MemoryChain;
use crate::chain::rpc::RpcChain;
use crate::chain::ChainClient;
use crate::config::AppConfig;
use crate::consumption::ConsumptionClient;
use crate::error::Result;
use crate::keeper::Keeper;
use crate::metadata::MetadataClient;
use crate::orchestrator::AgreementOrchestrator;
use crate::secret_store::SecretStoreClient;
use crate::template::Registration;
use std::sync::Arc;
use tracing::info;

/// Everything an application needs, wired from one [`AppConfig`].
#[derive(Clone)]
pub struct DdxpClient {
    config: AppConfig,
    keeper: Keeper,
    metadata: MetadataClient,
    secret_store: SecretStoreClient,
    consumption: ConsumptionClient,
    assets: Assets,
}

impl DdxpClient {
    /// Connects to the configured JSON-RPC node.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let chain = Arc::new(RpcChain::new(&config.keeper)?);
        info!(node = %chain.node_uri(), "Using JSON-RPC chain");
        Self::with_chain(config, chain)
    }

    /// Runs against an in-process chain. The chain handle is returned so tests
    /// and demos can mint tokens and advance blocks.
    #[cfg(feature = "dev-chain")]
    pub fn in_memory(config: AppConfig) -> Result<(Self, Arc<MemoryChain>)> {
        let chain = Arc::new(MemoryChain::with_message_prefix(config.keeper.message_prefix()));
        info!("Using in-memory chain");
        let client = Self::with_chain(config, chain.clone())?;
        Ok((client, chain))
    }

    pub fn with_chain(config: AppConfig, chain: Arc<dyn ChainClient>) -> Result<Self> {
        let keeper = Keeper::new(chain, config.keeper.message_prefix());
        let metadata = MetadataClient::new(&config.metadata)?;
        let secret_store = SecretStoreClient::new(&config.secret_store)?;
        let consumption = ConsumptionClient::new(&config.consumption)?;
        let assets = Assets::new(keeper.clone(), metadata.clone(), secret_store.clone(), consumption.clone());
        Ok(Self {
            config,
            keeper,
            metadata,
            secret_store,
            consumption,
            assets,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn keeper(&self) -> &Keeper {
        &self.keeper
    }

    pub fn assets(&self) -> &Assets {
        &self.assets
    }

    pub fn agreements(&self) -> &AgreementOrchestrator {
        self.assets.orchestrator()
    }

    pub fn metadata(&self) -> &MetadataClient {
        &self.metadata
    }

    pub fn secret_store(&self) -> &SecretStoreClient {
        &self.secret_store
    }

    pub fn consumption(&self) -> &ConsumptionClient {
        &self.consumption
    }

    /// Registers the template used for new assets under `owner`.
    pub async fn register_template(&self, owner: &Account) -> Result<Registration> {
        self.keeper.templates().register(self.assets.template(), owner).await
    }
}
