//! Connection transport
//!
//! Wraps one peer's media connection and runs every loop that talks to it:
//! the inbound RTP readers, the keyframe-request loop and the RTCP readers.
//!
//! ## Teardown
//!
//! [`Transport::close`] always runs the same four steps:
//!
//! 1. close the peer connection, so reads parked in the stack return
//!    end-of-stream instead of hanging
//! 2. cancel the shutdown token that every loop selects on
//! 3. wait on the task tracker until every loop has returned
//! 4. drop the channel senders the transport still holds
//!
//! The inbound channel only reports closed once the last sender is gone, and
//! the loops own the only other senders, so a consumer can never observe a
//! closed channel while a producer is still running.

mod link;
mod negotiate;

pub use link::{
    FeedbackSource, LocalTrack, PacketSource, PeerLink, ReceiverFeedback, RemoteStream,
    SenderFeedback, TrackSink,
};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::feedback::{self, FeedbackReport};
use crate::registry::PipelineRegistry;
use crate::tracks::{TrackRegistry, TransportStats};
use fanout_media::is_video_payload;
use fanout_protocol::{PayloadType, PublishOptions, SessionId, Ssrc, StreamMap, TransportId};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

/// Pause after a non-fatal read error before trying again
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Subscriber,
}

/// Media a publisher announced during negotiation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub video: bool,
    pub audio: bool,
    pub screen: bool,
}

impl From<&PublishOptions> for Capabilities {
    fn from(options: &PublishOptions) -> Self {
        Self {
            video: options.video,
            audio: options.audio,
            screen: options.screen,
        }
    }
}

/// Where a feedback reader sends what it reads
#[derive(Clone)]
pub enum FeedbackRoute {
    /// Publisher receive side: drained and logged
    Publisher,
    /// Subscriber send side for the forwarded stream `source_ssrc`
    Subscriber {
        session_id: SessionId,
        source_ssrc: Ssrc,
        pipelines: Weak<PipelineRegistry>,
    },
}

pub struct Transport {
    id: TransportId,
    role: Role,
    config: Arc<RelayConfig>,
    link: RwLock<Option<Arc<dyn PeerLink>>>,
    tracks: TrackRegistry,
    stats: TransportStats,
    capabilities: Mutex<Capabilities>,
    last_video_ssrc: Mutex<Option<Ssrc>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    /// Held while checking for shutdown and spawning, and while cancelling
    spawn_lock: Mutex<()>,
    closing: AtomicBool,
    keyframe_started: AtomicBool,
    packet_tx: Mutex<Option<mpsc::Sender<Packet>>>,
    packet_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    keyframe_tx: Mutex<Option<mpsc::Sender<()>>>,
    keyframe_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Transport {
    pub fn new(id: TransportId, role: Role, config: Arc<RelayConfig>) -> Arc<Self> {
        let (packet_tx, packet_rx) = mpsc::channel(config.packet_channel_capacity.max(1));
        let (keyframe_tx, keyframe_rx) = mpsc::channel(1);

        debug!(transport_id = %id, ?role, "Created transport");

        Arc::new(Self {
            id,
            role,
            config,
            link: RwLock::new(None),
            tracks: TrackRegistry::new(),
            stats: TransportStats::default(),
            capabilities: Mutex::new(Capabilities::default()),
            last_video_ssrc: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            spawn_lock: Mutex::new(()),
            closing: AtomicBool::new(false),
            keyframe_started: AtomicBool::new(false),
            packet_tx: Mutex::new(Some(packet_tx)),
            packet_rx: tokio::sync::Mutex::new(packet_rx),
            keyframe_tx: Mutex::new(Some(keyframe_tx)),
            keyframe_rx: Mutex::new(Some(keyframe_rx)),
        })
    }

    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn byte_rate(&self) -> u64 {
        self.stats.byte_rate()
    }

    pub fn lost_packet_recently(&self) -> bool {
        self.stats.lost_packet_recently()
    }

    pub fn error_count(&self) -> u32 {
        self.stats.error_count()
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.lock()
    }

    pub fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.lock() = capabilities;
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Attach the peer connection feedback is written to and that `close`
    /// tears down.
    pub async fn attach_link(&self, link: Arc<dyn PeerLink>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        *self.link.write().await = Some(link);
        Ok(())
    }

    /// Spawn a loop onto the tracker unless shutdown has been raised.
    fn spawn_loop<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _guard = self.spawn_lock.lock();
        if self.shutdown.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        self.tasks.spawn(task);
        Ok(())
    }

    /// Register a newly discovered inbound stream and start reading it.
    pub async fn receive_stream(
        self: &Arc<Self>,
        source: Arc<dyn PacketSource>,
        ssrc: Ssrc,
        payload_type: PayloadType,
    ) -> Result<()> {
        self.tracks.set_payload_type(ssrc, payload_type).await;

        let tx = self
            .packet_tx
            .lock()
            .clone()
            .ok_or(Error::TransportClosed)?;

        let transport = Arc::clone(self);
        self.spawn_loop(async move {
            transport.read_loop(source, ssrc, tx).await;
        })?;

        info!(
            transport_id = %self.id,
            ssrc,
            payload_type,
            "Receiving inbound stream"
        );

        if is_video_payload(payload_type) {
            self.start_keyframe_requests()?;
        }
        Ok(())
    }

    /// Register an outbound track for the publisher stream `ssrc`.
    pub async fn add_track(&self, ssrc: Ssrc, track: Arc<dyn TrackSink>) {
        debug!(
            transport_id = %self.id,
            ssrc,
            payload_type = track.payload_type(),
            "Added outbound track"
        );
        self.tracks.insert_track(ssrc, track).await;
    }

    /// Start draining RTCP from one sender or receiver.
    pub fn spawn_feedback_reader(
        self: &Arc<Self>,
        source: Arc<dyn FeedbackSource>,
        route: FeedbackRoute,
    ) -> Result<()> {
        let transport = Arc::clone(self);
        self.spawn_loop(async move {
            transport.feedback_loop(source, route).await;
        })
    }

    /// Start the keyframe-request loop. Periodic requests only run when the
    /// publisher announced video or screen; on-demand requests always work.
    fn start_keyframe_requests(self: &Arc<Self>) -> Result<()> {
        if self.keyframe_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(requests) = self.keyframe_rx.lock().take() else {
            return Err(Error::TransportClosed);
        };

        let caps = self.capabilities();
        let periodic = caps.video || caps.screen;
        let transport = Arc::clone(self);
        self.spawn_loop(async move {
            transport.keyframe_loop(requests, periodic).await;
        })
    }

    /// Ask the publisher for a keyframe now instead of at the next tick.
    ///
    /// Requests coalesce: if one is already pending this is a no-op that
    /// still reports success.
    pub fn request_keyframe(&self) -> bool {
        let guard = self.keyframe_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    /// Next packet forwarded from this transport's inbound streams.
    ///
    /// Returns `Error::ChannelClosed` once the transport is closed and every
    /// reader has stopped.
    pub async fn read_packet(&self) -> Result<Packet> {
        self.packet_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ChannelClosed)
    }

    /// Write a packet to the outbound track registered for its stream.
    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        if packet.header.version != 2 {
            return Err(Error::InvalidPacket);
        }

        let ssrc = packet.header.ssrc;
        let Some(track) = self.tracks.track(ssrc).await else {
            debug!(transport_id = %self.id, ssrc, "No track for packet, dropping");
            return Err(Error::TrackNotFound(ssrc));
        };
        track.write_packet(packet).await
    }

    /// Snapshot of stream id to payload type
    pub async fn streams_and_payload_types(&self) -> StreamMap {
        self.tracks.payload_types().await
    }

    async fn write_reports(&self, reports: &[FeedbackReport]) {
        let link = self.link.read().await.clone();
        let Some(link) = link else {
            return;
        };
        if let Err(e) = link.write_reports(reports).await {
            warn!(transport_id = %self.id, error = %e, "Failed to write feedback");
        }
    }

    async fn send_keyframe_request(&self) {
        let ssrc = *self.last_video_ssrc.lock();
        let Some(media_ssrc) = ssrc else {
            return;
        };
        debug!(transport_id = %self.id, media_ssrc, "Requesting keyframe");
        self.write_reports(&[FeedbackReport::KeyframeRequest { media_ssrc }])
            .await;
    }

    /// Send a bandwidth estimate derived from `loss_rate` to this publisher.
    pub async fn send_bandwidth_estimate(&self, loss_rate: f64) {
        let Some(ssrc) = self.tracks.video_ssrc().await else {
            return;
        };
        let Some(bandwidth) = feedback::estimate_bandwidth(
            loss_rate,
            self.stats.byte_rate(),
            self.config.bandwidth_low,
            self.config.bandwidth_high,
        ) else {
            debug!(transport_id = %self.id, loss_rate, "Ignoring out-of-range loss rate");
            return;
        };

        debug!(
            transport_id = %self.id,
            loss_rate,
            bitrate = bandwidth * 8,
            "Sending bandwidth estimate"
        );
        self.write_reports(&[FeedbackReport::BandwidthEstimate {
            ssrc,
            bitrate: bandwidth * 8,
        }])
        .await;
    }

    /// Ask this publisher to resend packets the pipeline no longer holds.
    pub async fn send_retransmission_request(&self, request: FeedbackReport) {
        self.stats.mark_lost_packet();
        self.write_reports(&[request]).await;
    }

    async fn read_loop(
        self: Arc<Self>,
        source: Arc<dyn PacketSource>,
        ssrc: Ssrc,
        tx: mpsc::Sender<Packet>,
    ) {
        let mut window = interval(self.config.rate_window());
        window.set_missed_tick_behavior(MissedTickBehavior::Delay);
        window.tick().await;
        let mut window_start = Instant::now();
        let mut total: u64 = 0;

        // Kept across iterations so a window tick never drops a read in flight
        let mut pending = source.read_packet();

        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = window.tick() => None,
                result = &mut pending => Some(result),
            };

            let Some(result) = read else {
                let elapsed = window_start.elapsed().as_secs_f64();
                self.stats.finish_window((total as f64 / elapsed) as u64);
                total = 0;
                window_start = Instant::now();
                continue;
            };
            pending = source.read_packet();

            let packet = match result {
                Ok(packet) => packet,
                Err(e) if e.is_end_of_stream() => {
                    debug!(transport_id = %self.id, ssrc, "Inbound stream ended");
                    break;
                }
                Err(e) => {
                    warn!(transport_id = %self.id, ssrc, error = %e, "RTP read error");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            total += packet.marshal_size() as u64;
            self.stats.record_packet();

            if is_video_payload(packet.header.payload_type) {
                *self.last_video_ssrc.lock() = Some(packet.header.ssrc);
            }

            // A full channel parks this reader until the consumer catches up
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                sent = tx.send(packet) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(transport_id = %self.id, ssrc, "RTP read loop stopped");
    }

    async fn keyframe_loop(self: Arc<Self>, mut requests: mpsc::Receiver<()>, periodic: bool) {
        let mut ticker = interval(self.config.keyframe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(()) = requests.recv() => {}
                _ = ticker.tick(), if periodic => {}
            }
            self.send_keyframe_request().await;
        }

        debug!(transport_id = %self.id, "Keyframe loop stopped");
    }

    async fn feedback_loop(self: Arc<Self>, source: Arc<dyn FeedbackSource>, route: FeedbackRoute) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = source.read_reports() => result,
            };

            let reports = match result {
                Ok(reports) => reports,
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => {
                    warn!(transport_id = %self.id, error = %e, "RTCP read error");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            for report in reports {
                match &route {
                    FeedbackRoute::Publisher => feedback::log_publisher_report(&self.id, &report),
                    FeedbackRoute::Subscriber {
                        session_id,
                        source_ssrc,
                        pipelines,
                    } => {
                        feedback::handle_subscriber_report(
                            pipelines,
                            session_id,
                            &self.id,
                            *source_ssrc,
                            report,
                        )
                        .await;
                    }
                }
            }
        }

        debug!(transport_id = %self.id, "Feedback loop stopped");
    }

    /// Tear the transport down. Safe to call more than once; later calls
    /// wait for the first to finish.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.tasks.wait().await;
            return;
        }

        info!(transport_id = %self.id, role = ?self.role, "Closing transport");

        // Connection first, otherwise a reader parked in the stack never wakes
        let link = self.link.write().await.take();
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                warn!(transport_id = %self.id, error = %e, "Error closing peer connection");
            }
        }

        {
            let _guard = self.spawn_lock.lock();
            self.shutdown.cancel();
        }

        self.tasks.close();
        self.tasks.wait().await;

        // Loops are gone, so nothing can send after this point
        self.packet_tx.lock().take();
        self.keyframe_tx.lock().take();
        self.keyframe_rx.lock().take();
        self.tracks.clear().await;

        debug!(transport_id = %self.id, "Transport closed");
    }
}
