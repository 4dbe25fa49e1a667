// Errors surfaced by the session and the gateway

use crate::serial::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("No controller port could be opened")]
    PortNotFound,

    #[error("Controller not connected")]
    NotConnected,

    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("Link closed while waiting for the controller")]
    LinkClosed,

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
