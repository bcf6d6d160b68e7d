use fanout_protocol::{OptionsError, Ssrc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Track not found for ssrc {0}")]
    TrackNotFound(Ssrc),

    #[error("End of stream")]
    EndOfStream,

    #[error("Transport is closed")]
    TransportClosed,

    #[error("Pipeline is closed")]
    PipelineClosed,

    #[error("No publisher bound to session")]
    NoPublisher,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::Error),
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub(crate) fn negotiation(e: webrtc::Error) -> Self {
        Error::Negotiation(e.to_string())
    }

    /// Whether this error ends a read loop without being worth reporting
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream | Error::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
