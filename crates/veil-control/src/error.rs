//! LocalRP errors

use thiserror::Error;
use veil_proto::ControlError;

/// Errors of registration, routing and completion of LocalRP requests.
///
/// The display text is what a waiting client sees after `Error: `.
#[derive(Debug, Error)]
pub enum LocalRpError {
    #[error("localrp disabled")]
    Disabled,

    #[error("request too long")]
    TooLong,

    #[error("no agent available")]
    NoAgent,

    #[error("localrp queue full")]
    QueueFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}
