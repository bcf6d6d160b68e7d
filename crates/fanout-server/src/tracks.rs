//! Per-transport track table and its bandwidth/loss bookkeeping.

use crate::transport::TrackSink;
use fanout_media::is_video_payload;
use fanout_protocol::{PayloadType, Ssrc, StreamMap};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Outbound tracks and discovered inbound streams of one transport
#[derive(Default)]
pub struct TrackRegistry {
    /// Outbound tracks keyed by the publisher stream they carry
    tracks: RwLock<HashMap<Ssrc, Arc<dyn TrackSink>>>,
    /// Payload type of every stream seen or offered on this transport
    payload_types: RwLock<StreamMap>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_track(&self, ssrc: Ssrc, track: Arc<dyn TrackSink>) {
        let payload_type = track.payload_type();
        self.tracks.write().await.insert(ssrc, track);
        self.payload_types.write().await.insert(ssrc, payload_type);
    }

    pub async fn track(&self, ssrc: Ssrc) -> Option<Arc<dyn TrackSink>> {
        self.tracks.read().await.get(&ssrc).cloned()
    }

    pub async fn set_payload_type(&self, ssrc: Ssrc, payload_type: PayloadType) {
        self.payload_types.write().await.insert(ssrc, payload_type);
    }

    pub async fn payload_types(&self) -> StreamMap {
        self.payload_types.read().await.clone()
    }

    /// Lowest video stream id, used to address bandwidth estimates
    pub async fn video_ssrc(&self) -> Option<Ssrc> {
        self.payload_types
            .read()
            .await
            .iter()
            .filter(|(_, pt)| is_video_payload(**pt))
            .map(|(ssrc, _)| *ssrc)
            .min()
    }

    pub async fn clear(&self) {
        self.tracks.write().await.clear();
    }
}

/// Rolling counters updated by the transport's loops
#[derive(Debug, Default)]
pub struct TransportStats {
    byte_rate: AtomicU64,
    lost_packet: AtomicBool,
    consecutive_errors: AtomicU32,
    packets_received: AtomicU64,
}

impl TransportStats {
    /// Bytes per second measured over the last completed window
    pub fn byte_rate(&self) -> u64 {
        self.byte_rate.load(Ordering::Relaxed)
    }

    pub(crate) fn finish_window(&self, byte_rate: u64) {
        self.byte_rate.store(byte_rate, Ordering::Relaxed);
        self.lost_packet.store(false, Ordering::Relaxed);
    }

    pub fn lost_packet_recently(&self) -> bool {
        self.lost_packet.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_lost_packet(&self) {
        self.lost_packet.store(true, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }

    /// Record a failure and return the new consecutive count
    pub fn add_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn clear_errors(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }
}
