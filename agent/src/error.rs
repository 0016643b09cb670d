use thiserror::Error;

/// Error kinds enumerated by the agent's error-handling design. Only
/// [`Error::ChannelUnknown`] surfaces to the user-facing notification
/// string (see [`crate::notify`]); everything else is a debug log or
/// drives the reconnection state machine.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] codec::Error),

    #[error("unknown socket-channel {0}")]
    ChannelUnknown(uuid::Uuid),

    #[error("socket channel creation timed out")]
    EstablishmentTimeout,

    #[error("transport lost")]
    TransportLost,

    #[error("write to local socket failed: {0}")]
    SocketWriteFailed(#[from] std::io::Error),

    #[error("relay rejected the connection: {0}")]
    CriticalError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
