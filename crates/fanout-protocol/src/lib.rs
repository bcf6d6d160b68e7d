//! Shared types exchanged between the signaling layer and the relay core.

pub mod options;
pub mod types;

pub use options::{Codec, OptionsError, PublishOptions};
pub use types::{PayloadType, SessionId, Ssrc, StreamMap, TransportId};
