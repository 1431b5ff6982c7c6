use thiserror::Error;

use super::id::{MessageId, ProcessorId};

/// Usage errors reported by the channel.
///
/// These signal a defect in the caller: they are returned immediately and
/// never retried. Protocol anomalies (stale messages, missed check-ins) are
/// not errors and never surface here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("processor {0} is not registered with this channel")]
    UnregisteredProcessor(ProcessorId),

    #[error("processor {0} is already registered")]
    AlreadyRegistered(ProcessorId),

    #[error("processor {0} was created for a different channel")]
    ForeignProcessor(ProcessorId),

    #[error("message {0} has no receiver")]
    MissingReceiver(MessageId),

    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("check-in period must be greater than zero")]
    ZeroCheckInPeriod,
}
