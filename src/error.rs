use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdkError>;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// The transaction reverted, failed to mine, or could not be submitted.
    #[error("Transaction {contract}.{method} from {from} failed: {reason} (args: {args})")]
    Transaction {
        contract: String,
        method: String,
        from: String,
        args: String,
        reason: String,
    },

    /// The transaction went through but the chain did not emit the expected domain event.
    #[error("{contract}.{method} succeeded without emitting {expected_event} (tx {transaction_hash})")]
    Protocol {
        contract: String,
        method: String,
        expected_event: String,
        transaction_hash: String,
    },

    #[error("{service} service returned {status}: {body}")]
    Service {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Chain RPC error: {0}")]
    Rpc(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("ABI error: {0}")]
    Abi(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Template {template} is owned by {owner}")]
    TemplateOwnership { template: String, owner: String },

    #[error("Subscription {0} was cancelled")]
    SubscriptionCancelled(uuid::Uuid),
}

impl SdkError {
    /// Whether the error came from the chain rejecting or failing a transaction,
    /// as opposed to a local validation or off-chain failure.
    pub fn is_on_chain(&self) -> bool {
        matches!(self, SdkError::Transaction { .. } | SdkError::Protocol { .. })
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Io(err.to_string())
    }
}

impl From<k256::ecdsa::Error> for SdkError {
    fn from(err: k256::ecdsa::Error) -> Self {
        SdkError::Signature(err.to_string())
    }
}

impl From<hex::FromHexError> for SdkError {
    fn from(err: hex::FromHexError) -> Self {
        SdkError::Validation(format!("invalid hex: {}", err))
    }
}
