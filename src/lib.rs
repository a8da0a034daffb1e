pub mod app_config;
pub mod assignment;
pub mod broker_config;
pub mod claim;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod infra;
pub mod models;
pub mod offsets;
pub mod producer;
pub mod session;
pub mod status_server;
pub mod supervisor;

pub use app_config::{AppConfig, GroupConfig, InitialOffset, ProcessingErrorPolicy};
pub use assignment::{AssignmentStrategy, PartitionAssignor};
pub use broker_config::{BrokerConfig, Credentials};
pub use error::{ConsumerError, TransportError};
pub use handler::MessageHandler;
pub use models::{Assignment, Message, ProducerRecord, TopicPartition};
pub use session::{SessionContext, StopReason};
pub use supervisor::{GroupConsumer, GroupStatus, SessionEvent, SessionState};
