use thiserror::Error;

/// Failures reported by the broker transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection to broker lost: {0}")]
    Disconnected(String),

    #[error("broker is not the coordinator for group '{0}'")]
    NotCoordinator(String),

    #[error("group '{0}' is rebalancing")]
    RebalanceInProgress(String),

    #[error("generation {0} is stale")]
    IllegalGeneration(u32),

    #[error("member '{0}' is unknown to the coordinator")]
    UnknownMember(String),

    #[error("topic '{0}' does not exist")]
    UnknownTopic(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("authentication rejected for user '{0}'")]
    AuthenticationFailed(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Errors that mean the member must drop its claims and rejoin.
    pub fn is_rebalance(&self) -> bool {
        matches!(
            self,
            TransportError::RebalanceInProgress(_)
                | TransportError::IllegalGeneration(_)
                | TransportError::UnknownMember(_)
        )
    }

    /// Errors worth another attempt after backing off.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::AuthenticationFailed(_)
            | TransportError::UnknownTopic(_)
            | TransportError::Closed => false,
            _ => true,
        }
    }
}

/// Configuration rejected at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors that end a consumer group run.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("transport error after {attempts} attempts: {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("processing failed on {topic}/{partition} at offset {offset}: {source}")]
    Processing {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("session setup failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("consumer group is closed")]
    Closed,
}

impl ConsumerError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConsumerError::Closed)
    }

    /// Classifies a transport failure that could not be retried any further.
    pub fn from_transport(err: TransportError, attempts: u32) -> Self {
        match err {
            TransportError::AuthenticationFailed(user) => ConsumerError::Auth(user),
            TransportError::Closed => ConsumerError::Closed,
            source => ConsumerError::Transport { attempts, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
