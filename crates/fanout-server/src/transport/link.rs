//! Narrow seams between the transport and the webrtc-rs stack.
//!
//! Each trait covers exactly what the transport's loops need from a peer
//! connection, a remote track, an RTP sender/receiver or a local track.

use crate::error::{Error, Result};
use crate::feedback::{FeedbackReport, RtcpPacket};
use async_trait::async_trait;
use fanout_protocol::PayloadType;
use std::sync::Arc;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{interceptor, srtp, util};

/// The peer connection a transport owns
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn write_reports(&self, reports: &[FeedbackReport]) -> Result<()>;

    /// Tear the connection down. Parked reads must return end-of-stream.
    async fn close(&self) -> Result<()>;
}

/// Inbound RTP from one remote stream
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Blocks until a packet arrives; `Error::EndOfStream` once torn down.
    async fn read_packet(&self) -> Result<Packet>;
}

/// Inbound RTCP from one sender or receiver
#[async_trait]
pub trait FeedbackSource: Send + Sync {
    async fn read_reports(&self) -> Result<Vec<FeedbackReport>>;
}

/// Outbound RTP track
#[async_trait]
pub trait TrackSink: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<()>;

    fn payload_type(&self) -> PayloadType;
}

/// Whether a stack error means the underlying connection is gone
fn is_closed(e: &webrtc::Error) -> bool {
    match e {
        webrtc::Error::ErrClosedPipe | webrtc::Error::ErrConnectionClosed => true,
        webrtc::Error::Util(e) => buffer_closed(e),
        webrtc::Error::Interceptor(e) => interceptor_closed(e),
        webrtc::Error::Srtp(e) => srtp_closed(e),
        _ => false,
    }
}

fn buffer_closed(e: &util::Error) -> bool {
    matches!(e, util::Error::ErrBufferClosed)
}

fn interceptor_closed(e: &interceptor::Error) -> bool {
    match e {
        interceptor::Error::ErrIoEOF => true,
        interceptor::Error::Util(e) => buffer_closed(e),
        interceptor::Error::Srtp(e) => srtp_closed(e),
        _ => false,
    }
}

fn srtp_closed(e: &srtp::Error) -> bool {
    match e {
        srtp::Error::SessionEof => true,
        srtp::Error::Util(e) => buffer_closed(e),
        _ => false,
    }
}

fn decode(packets: Vec<RtcpPacket>) -> Vec<FeedbackReport> {
    packets
        .iter()
        .flat_map(|packet| FeedbackReport::from_rtcp(&**packet))
        .collect()
}

#[async_trait]
impl PeerLink for RTCPeerConnection {
    async fn write_reports(&self, reports: &[FeedbackReport]) -> Result<()> {
        let packets: Vec<RtcpPacket> = reports.iter().filter_map(FeedbackReport::to_rtcp).collect();
        if packets.is_empty() {
            return Ok(());
        }
        self.write_rtcp(&packets).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        RTCPeerConnection::close(self).await?;
        Ok(())
    }
}

/// A publisher's remote track
pub struct RemoteStream(pub Arc<TrackRemote>);

#[async_trait]
impl PacketSource for RemoteStream {
    async fn read_packet(&self) -> Result<Packet> {
        match self.0.read_rtp().await {
            Ok((packet, _attributes)) => Ok(packet),
            Err(e) if is_closed(&e) => Err(Error::EndOfStream),
            Err(e) => Err(Error::Webrtc(e)),
        }
    }
}

/// RTCP arriving on a publisher's receive side
pub struct ReceiverFeedback(pub Arc<RTCRtpReceiver>);

#[async_trait]
impl FeedbackSource for ReceiverFeedback {
    async fn read_reports(&self) -> Result<Vec<FeedbackReport>> {
        match self.0.read_rtcp().await {
            Ok((packets, _attributes)) => Ok(decode(packets)),
            Err(e) if is_closed(&e) => Err(Error::EndOfStream),
            Err(e) => Err(Error::Webrtc(e)),
        }
    }
}

/// RTCP a subscriber sends back about a forwarded track
pub struct SenderFeedback(pub Arc<RTCRtpSender>);

#[async_trait]
impl FeedbackSource for SenderFeedback {
    async fn read_reports(&self) -> Result<Vec<FeedbackReport>> {
        match self.0.read_rtcp().await {
            Ok((packets, _attributes)) => Ok(decode(packets)),
            Err(e) if is_closed(&e) => Err(Error::EndOfStream),
            Err(e) => Err(Error::Webrtc(e)),
        }
    }
}

/// A subscriber's outbound track for one forwarded stream
pub struct LocalTrack {
    track: Arc<TrackLocalStaticRTP>,
    payload_type: PayloadType,
}

impl LocalTrack {
    pub fn new(track: Arc<TrackLocalStaticRTP>, payload_type: PayloadType) -> Self {
        Self {
            track,
            payload_type,
        }
    }
}

#[async_trait]
impl TrackSink for LocalTrack {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.track.write_rtp(packet).await?;
        Ok(())
    }

    fn payload_type(&self) -> PayloadType {
        self.payload_type
    }
}
