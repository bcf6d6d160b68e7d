//! Feedback controller
//!
//! RTCP arriving from the stack is converted once, at the boundary, into
//! [`FeedbackReport`]. Everything past that point matches on the enum, so a
//! new report kind is a compile error until every handler decides what to do
//! with it.

use crate::pipeline::{Pipeline, Replay};
use crate::registry::PipelineRegistry;
use fanout_protocol::{SessionId, Ssrc, TransportId};
use std::sync::Weak;
use tracing::debug;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

/// Boxed RTCP packet as the webrtc-rs stack reads and writes it
pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// Which side of the stream produced a statistics report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reporter {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackReport {
    /// Ask the encoder of `media_ssrc` for a full frame
    KeyframeRequest { media_ssrc: Ssrc },
    /// Proposed send bitrate, in bits per second
    BandwidthEstimate { ssrc: Ssrc, bitrate: u64 },
    /// Lost packets of `media_ssrc` the reporter wants resent
    RetransmissionRequest {
        sender_ssrc: Ssrc,
        media_ssrc: Ssrc,
        sequences: Vec<u16>,
    },
    /// Reception quality for one stream, `fraction_lost` in 1/256 units
    Statistics {
        reporter: Reporter,
        ssrc: Ssrc,
        fraction_lost: u8,
    },
}

impl FeedbackReport {
    /// Decode one RTCP packet. Types the relay has no use for yield nothing.
    pub fn from_rtcp(packet: &(dyn rtcp::packet::Packet + Send + Sync)) -> Vec<FeedbackReport> {
        let any = packet.as_any();

        if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            return vec![FeedbackReport::KeyframeRequest {
                media_ssrc: pli.media_ssrc,
            }];
        }

        if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            let sequences = nack.nacks.iter().flat_map(NackPair::packet_list).collect();
            return vec![FeedbackReport::RetransmissionRequest {
                sender_ssrc: nack.sender_ssrc,
                media_ssrc: nack.media_ssrc,
                sequences,
            }];
        }

        if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            return remb
                .ssrcs
                .iter()
                .map(|ssrc| FeedbackReport::BandwidthEstimate {
                    ssrc: *ssrc,
                    bitrate: remb.bitrate as u64,
                })
                .collect();
        }

        if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
            return rr
                .reports
                .iter()
                .map(|report| FeedbackReport::Statistics {
                    reporter: Reporter::Receiver,
                    ssrc: report.ssrc,
                    fraction_lost: report.fraction_lost,
                })
                .collect();
        }

        if let Some(sr) = any.downcast_ref::<SenderReport>() {
            return sr
                .reports
                .iter()
                .map(|report| FeedbackReport::Statistics {
                    reporter: Reporter::Sender,
                    ssrc: report.ssrc,
                    fraction_lost: report.fraction_lost,
                })
                .collect();
        }

        debug!(header = ?packet.header(), "Ignoring RTCP packet");
        Vec::new()
    }

    /// Encode for sending. Statistics are produced by the stack's report
    /// interceptor and are never written by the relay.
    pub fn to_rtcp(&self) -> Option<RtcpPacket> {
        match self {
            FeedbackReport::KeyframeRequest { media_ssrc } => {
                Some(Box::new(PictureLossIndication {
                    sender_ssrc: *media_ssrc,
                    media_ssrc: *media_ssrc,
                }))
            }
            FeedbackReport::BandwidthEstimate { ssrc, bitrate } => {
                Some(Box::new(ReceiverEstimatedMaximumBitrate {
                    sender_ssrc: *ssrc,
                    bitrate: *bitrate as f32,
                    ssrcs: vec![*ssrc],
                }))
            }
            FeedbackReport::RetransmissionRequest {
                sender_ssrc,
                media_ssrc,
                sequences,
            } => Some(Box::new(TransportLayerNack {
                sender_ssrc: *sender_ssrc,
                media_ssrc: *media_ssrc,
                nacks: sequences
                    .iter()
                    .map(|seq| NackPair {
                        packet_id: *seq,
                        lost_packets: 0,
                    })
                    .collect(),
            })),
            FeedbackReport::Statistics { .. } => None,
        }
    }
}

/// Propose a target rate in bytes per second from a loss sample.
///
/// Returns `None` for a loss rate outside `[0, 1]`.
pub fn estimate_bandwidth(loss_rate: f64, byte_rate: u64, low: u64, high: u64) -> Option<u64> {
    if !(0.0..=1.0).contains(&loss_rate) {
        return None;
    }

    let proposal = if loss_rate == 0.0 && byte_rate == 0 {
        high
    } else if loss_rate < 0.1 {
        byte_rate.saturating_mul(2)
    } else {
        (byte_rate as f64 * (1.0 - loss_rate)) as u64
    };

    Some(proposal.max(low).min(high))
}

/// Result of routing one retransmission request
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitOutcome {
    pub replayed: usize,
    pub escalated: usize,
    /// Cached packets the subscriber's track failed to take
    pub failed: usize,
}

/// Serve each requested sequence from the pipeline cache, escalating misses
/// to the publisher one request per sequence.
pub async fn route_retransmission(
    pipeline: &Pipeline,
    subscriber_id: &TransportId,
    sender_ssrc: Ssrc,
    media_ssrc: Ssrc,
    sequences: &[u16],
) -> RetransmitOutcome {
    let mut outcome = RetransmitOutcome::default();
    let mut publisher = None;

    for &sequence in sequences {
        match pipeline.write_cached(subscriber_id, media_ssrc, sequence).await {
            Replay::Delivered => outcome.replayed += 1,
            Replay::WriteFailed => outcome.failed += 1,
            Replay::NoSubscriber => {}
            Replay::CacheMiss => {
                if publisher.is_none() {
                    publisher = pipeline.publisher().await;
                }
                let Some(publisher) = publisher.as_ref() else {
                    continue;
                };

                let request = FeedbackReport::RetransmissionRequest {
                    sender_ssrc,
                    media_ssrc,
                    sequences: vec![sequence],
                };
                debug!(
                    session_id = %pipeline.id(),
                    media_ssrc,
                    sequence,
                    "Cache miss, forwarding retransmission request to publisher"
                );
                publisher.send_retransmission_request(request).await;
                outcome.escalated += 1;
            }
        }
    }

    outcome
}

/// Act on one report read from a subscriber's sender.
///
/// `source_ssrc` is the publisher stream the sender carries; it replaces the
/// SSRC the stack rewrote on the way out.
pub(crate) async fn handle_subscriber_report(
    pipelines: &Weak<PipelineRegistry>,
    session_id: &SessionId,
    subscriber_id: &TransportId,
    source_ssrc: Ssrc,
    report: FeedbackReport,
) {
    let Some(registry) = pipelines.upgrade() else {
        return;
    };
    let Some(pipeline) = registry.get(session_id).await else {
        debug!(session_id = %session_id, "Feedback for unknown session");
        return;
    };

    match report {
        FeedbackReport::RetransmissionRequest {
            sender_ssrc,
            sequences,
            ..
        } => {
            let outcome =
                route_retransmission(&pipeline, subscriber_id, sender_ssrc, source_ssrc, &sequences)
                    .await;
            debug!(
                subscriber_id = %subscriber_id,
                replayed = outcome.replayed,
                escalated = outcome.escalated,
                failed = outcome.failed,
                "Handled retransmission request"
            );
        }
        FeedbackReport::Statistics { fraction_lost, .. } => {
            if let Some(publisher) = pipeline.publisher().await {
                publisher
                    .send_bandwidth_estimate(f64::from(fraction_lost) / 256.0)
                    .await;
            }
        }
        FeedbackReport::KeyframeRequest { .. } => {
            if let Some(publisher) = pipeline.publisher().await {
                publisher.request_keyframe();
            }
        }
        FeedbackReport::BandwidthEstimate { bitrate, .. } => {
            debug!(subscriber_id = %subscriber_id, bitrate, "Subscriber bandwidth estimate");
        }
    }
}

/// Publisher-side reports are drained and logged only.
// TODO: decide whether NACKs seen on the publisher's receive side should be
// answered from the pipeline cache as well.
pub(crate) fn log_publisher_report(transport_id: &TransportId, report: &FeedbackReport) {
    match report {
        FeedbackReport::Statistics {
            reporter,
            ssrc,
            fraction_lost,
        } => debug!(
            transport_id = %transport_id,
            ?reporter,
            ssrc,
            fraction_lost,
            "Publisher statistics"
        ),
        FeedbackReport::RetransmissionRequest { media_ssrc, .. } => {
            debug!(transport_id = %transport_id, media_ssrc, "Publisher retransmission request")
        }
        FeedbackReport::KeyframeRequest { .. } | FeedbackReport::BandwidthEstimate { .. } => {
            debug!(transport_id = %transport_id, ?report, "Publisher feedback")
        }
    }
}
