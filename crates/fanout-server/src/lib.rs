//! Fanout media-routing core
//!
//! Receives one publisher's RTP streams per session and forwards them to any
//! number of subscribers, answering keyframe, bandwidth and retransmission
//! feedback on the way.

pub mod cache;
pub mod config;
pub mod error;
pub mod feedback;
pub mod pipeline;
pub mod registry;
pub mod tracks;
pub mod transport;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use feedback::FeedbackReport;
pub use pipeline::{Pipeline, PipelineStats, Replay};
pub use registry::PipelineRegistry;
pub use transport::{Role, Transport};
