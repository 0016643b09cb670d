use thiserror::Error;

/// Error kinds enumerated by the relay's error-handling design. Every
/// variant is logged; only [`Error::Authentication`] is ever surfaced back
/// to the offending agent (as a `CriticalError` packet).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid password for channel: {channel}")]
    Authentication { channel: String },

    #[error(transparent)]
    Protocol(#[from] codec::Error),

    #[error("unknown socket-channel {id}, dropping packet")]
    ChannelUnknown { id: uuid::Uuid },

    #[error("sink member {sink} is not present in channel {channel}")]
    SinkMissing { channel: String, sink: uuid::Uuid },

    #[error("transport lost for agent {id}")]
    TransportLost { id: uuid::Uuid },
}

pub type Result<T> = std::result::Result<T, Error>;
