//! # ddxp - Decentralized Data Exchange Protocol client
//!
//! Resolves DIDs to their documents and runs on-chain service agreements
//! between a data consumer and a data publisher.
//!
//! ## Architecture
//!
//! - **Chain**: `ChainClient` trait with a JSON-RPC implementation and an in-process chain
//! - **Agreements**: agreement hashing and signing, template registration, condition clients
//! - **Events**: cancellable subscriptions over the contract event log
//! - **Orchestrator**: sign, submit, initialize, then lock, grant and release
//! - **Documents**: DIDs, the DID registry and DDOs with checksum and proof
//! - **Services**: metadata store, publisher consumption endpoint and encryption service

pub mod abi;
pub mod account;
pub mod agreement;
pub mod assets;
pub mod chain;
pub mod client;
pub mod conditions;
pub mod config;
pub mod consumption;
pub mod contract;
pub mod ddo;
pub mod did;
pub mod error;
pub mod events;
mod http;
pub mod keeper;
pub mod metadata;
pub mod orchestrator;
pub mod primitives;
pub mod secret_store;
pub mod template;

pub use account::{Account, Signature};
pub use agreement::{Agreement, AgreementState, AgreementTerms};
pub use assets::Assets;
pub use client::DdxpClient;
pub use conditions::{Actor, ConditionKind, ConditionState};
pub use config::AppConfig;
pub use ddo::Ddo;
pub use did::Did;
pub use error::{Result, SdkError};
pub use events::{EventBridge, EventFilter, Subscription};
pub use keeper::Keeper;
pub use orchestrator::AgreementOrchestrator;
pub use primitives::{Address, Bytes32};
pub use template::TemplateDefinition;
