//! In-memory stand-ins for the webrtc-rs seams of a transport.

#![allow(dead_code)]

use async_trait::async_trait;
use fanout_protocol::{PayloadType, Ssrc, TransportId};
use fanout_server::feedback::FeedbackReport;
use fanout_server::transport::{FeedbackSource, PacketSource, PeerLink, TrackSink};
use fanout_server::{Error, RelayConfig, Result, Role, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn config() -> Arc<RelayConfig> {
    Arc::new(RelayConfig::default())
}

pub fn packet(ssrc: Ssrc, sequence_number: u16, payload_type: PayloadType) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type,
            sequence_number,
            ssrc,
            ..Default::default()
        },
        payload: vec![0u8; 100].into(),
    }
}

pub fn transport(id: &str, role: Role, config: Arc<RelayConfig>) -> Arc<Transport> {
    Transport::new(TransportId::from(id), role, config)
}

/// Poll `check` until it holds or `WAIT` runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Peer connection that records what it is asked to send
#[derive(Default)]
pub struct MockLink {
    reports: Mutex<Vec<FeedbackReport>>,
    pub closed: CancellationToken,
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<FeedbackReport> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn write_reports(&self, reports: &[FeedbackReport]) -> Result<()> {
        self.reports.lock().extend_from_slice(reports);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Remote stream fed from a channel. Reads park until a packet is pushed or
/// the link closes.
pub struct MockSource {
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
    link_closed: CancellationToken,
    reads: AtomicUsize,
}

impl MockSource {
    pub fn new(link: &MockLink) -> (Arc<Self>, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            packets: tokio::sync::Mutex::new(rx),
            link_closed: link.closed.clone(),
            reads: AtomicUsize::new(0),
        });
        (source, tx)
    }

    /// Packets handed to the transport so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketSource for MockSource {
    async fn read_packet(&self) -> Result<Packet> {
        let mut packets = self.packets.lock().await;
        tokio::select! {
            _ = self.link_closed.cancelled() => Err(Error::EndOfStream),
            packet = packets.recv() => {
                let packet = packet.ok_or(Error::EndOfStream)?;
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(packet)
            }
        }
    }
}

/// RTCP reader fed from a channel
pub struct MockFeedback {
    reports: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<FeedbackReport>>>,
    link_closed: CancellationToken,
}

impl MockFeedback {
    pub fn new(link: &MockLink) -> (Arc<Self>, mpsc::UnboundedSender<Vec<FeedbackReport>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            reports: tokio::sync::Mutex::new(rx),
            link_closed: link.closed.clone(),
        });
        (source, tx)
    }
}

#[async_trait]
impl FeedbackSource for MockFeedback {
    async fn read_reports(&self) -> Result<Vec<FeedbackReport>> {
        let mut reports = self.reports.lock().await;
        tokio::select! {
            _ = self.link_closed.cancelled() => Err(Error::EndOfStream),
            batch = reports.recv() => batch.ok_or(Error::EndOfStream),
        }
    }
}

/// Outbound track that records every packet written to it
pub struct MockSink {
    payload_type: PayloadType,
    fail: bool,
    packets: Mutex<Vec<Packet>>,
}

impl MockSink {
    pub fn new(payload_type: PayloadType) -> Arc<Self> {
        Arc::new(Self {
            payload_type,
            fail: false,
            packets: Mutex::new(Vec::new()),
        })
    }

    /// A sink whose every write fails
    pub fn failing(payload_type: PayloadType) -> Arc<Self> {
        Arc::new(Self {
            payload_type,
            fail: true,
            packets: Mutex::new(Vec::new()),
        })
    }

    pub fn sequences(&self) -> Vec<u16> {
        self.packets
            .lock()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }
}

#[async_trait]
impl TrackSink for MockSink {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        if self.fail {
            return Err(Error::TransportClosed);
        }
        // Let other writers run between packets, as a real track would
        tokio::task::yield_now().await;
        self.packets.lock().push(packet.clone());
        Ok(())
    }

    fn payload_type(&self) -> PayloadType {
        self.payload_type
    }
}
