use energy_client::domain::RegistrationError;

use crate::{pipeline::PipelineError, pubsub::PubSubError, store::StoreError};

/// Failures of the relay's services, independent of how they are served.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("device {0} is not registered")]
    DeviceNotRegistered(String),
    #[error("invalid channel {channel}, device has {channel_count} channels")]
    InvalidChannel { channel: i32, channel_count: i32 },
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("you have already voted in this reset session")]
    DuplicateVote,
    #[error("an energy reset is already pending for device {0}")]
    ResetPending(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] PubSubError),
    #[error("firmware storage error: {0}")]
    Firmware(#[from] std::io::Error),
    #[error("relay queue closed")]
    QueueClosed,
}

impl From<RegistrationError> for ServiceError {
    fn from(e: RegistrationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<PipelineError> for ServiceError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Transform(msg) => Self::Validation(msg),
            other => Self::Validation(other.to_string()),
        }
    }
}
