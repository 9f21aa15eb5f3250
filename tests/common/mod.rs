#![allow(dead_code)]

use ddxp::chain::memory::MemoryChain;
use ddxp::config::DEFAULT_MESSAGE_PREFIX;
use ddxp::ddo::{AccessService, Service};
use ddxp::template::{escrow_address, PublishContext};
use ddxp::{Account, AgreementOrchestrator, Ddo, Did, Keeper, Result, TemplateDefinition};
use std::sync::Arc;

pub const PRICE: u128 = 100;
pub const SERVICE_ID: &str = "0";

/// A published asset on a fresh in-memory chain, with a funded consumer.
pub struct Market {
    pub chain: Arc<MemoryChain>,
    pub keeper: Keeper,
    pub orchestrator: AgreementOrchestrator,
    pub publisher: Account,
    pub consumer: Account,
    pub ddo: Ddo,
}

pub async fn setup_market(template: TemplateDefinition) -> Result<Market> {
    let chain = Arc::new(MemoryChain::new());
    let keeper = Keeper::new(chain.clone(), DEFAULT_MESSAGE_PREFIX);
    let publisher = Account::random();
    let consumer = Account::random();

    keeper.templates().register(&template, &publisher).await?;

    let did = Did::generate();
    let ctx = PublishContext {
        asset_id: did.id(),
        price: PRICE,
        publisher: publisher.address(),
        escrow_address: escrow_address(chain.as_ref())?,
    };
    let mut ddo = Ddo::new(did, publisher.address());
    ddo.add_service(Service::Access(AccessService {
        service_definition_id: SERVICE_ID.to_string(),
        service_endpoint: "http://localhost:8030/api/v1/brizo/services/consume".to_string(),
        purchase_endpoint: "http://localhost:8030/api/v1/brizo/services/access/initialize".to_string(),
        template_id: template.id,
        conditions: template.ddo_conditions(chain.as_ref(), &ctx)?,
    }));
    ddo.add_checksum()?;

    keeper
        .did_registry()
        .register_attribute(&did, "5e0c4a3b9f1d2e7a", "http://localhost:5000/ddo", &publisher)
        .await?;
    keeper.dispenser().request_tokens(PRICE, &consumer).await?;

    Ok(Market {
        orchestrator: AgreementOrchestrator::new(keeper.clone()),
        chain,
        keeper,
        publisher,
        consumer,
        ddo,
    })
}
