//! Codec catalogue
//!
//! Payload types follow the webrtc-rs defaults so that publisher and
//! subscriber engines agree without renegotiating numbers.

use fanout_protocol::{Codec, PayloadType};
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::RTCPFeedback;

pub const PAYLOAD_TYPE_VP8: PayloadType = 96;
pub const PAYLOAD_TYPE_VP9: PayloadType = 98;
pub const PAYLOAD_TYPE_H264: PayloadType = 102;
pub const PAYLOAD_TYPE_OPUS: PayloadType = 111;

const VIDEO_CLOCK_RATE: u32 = 90000;
const OPUS_CLOCK_RATE: u32 = 48000;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f";
const VP9_FMTP: &str = "profile-id=0";
const OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

/// Whether a payload type carries one of the video codecs the relay forwards
pub fn is_video_payload(payload_type: PayloadType) -> bool {
    matches!(
        payload_type,
        PAYLOAD_TYPE_VP8 | PAYLOAD_TYPE_VP9 | PAYLOAD_TYPE_H264
    )
}

/// Payload type negotiated for a publisher's video codec
pub fn payload_type_for(codec: Codec) -> PayloadType {
    match codec {
        Codec::H264 => PAYLOAD_TYPE_H264,
        Codec::VP8 => PAYLOAD_TYPE_VP8,
        Codec::VP9 => PAYLOAD_TYPE_VP9,
    }
}

/// Track kind used when creating an outbound track for a payload type
fn kind_for(payload_type: PayloadType) -> RTPCodecType {
    if is_video_payload(payload_type) {
        RTPCodecType::Video
    } else {
        RTPCodecType::Audio
    }
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// Codec capability for a forwarded payload type, `None` if the relay does
/// not know how to carry it.
pub fn capability_for(payload_type: PayloadType) -> Option<RTCRtpCodecCapability> {
    let capability = match payload_type {
        PAYLOAD_TYPE_VP8 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: video_feedback(),
        },
        PAYLOAD_TYPE_VP9 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP9.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: VP9_FMTP.to_string(),
            rtcp_feedback: video_feedback(),
        },
        PAYLOAD_TYPE_H264 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_string(),
            rtcp_feedback: video_feedback(),
        },
        PAYLOAD_TYPE_OPUS => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: OPUS_CLOCK_RATE,
            channels: 2,
            sdp_fmtp_line: OPUS_FMTP.to_string(),
            rtcp_feedback: vec![],
        },
        _ => return None,
    };
    Some(capability)
}

/// Register Opus plus the single video codec a publisher asked for.
pub fn register_publish_codecs(
    media_engine: &mut MediaEngine,
    codec: Codec,
) -> Result<(), webrtc::Error> {
    let video_payload_type = payload_type_for(codec);

    for payload_type in [PAYLOAD_TYPE_OPUS, video_payload_type] {
        if let Some(capability) = capability_for(payload_type) {
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability,
                    payload_type,
                    ..Default::default()
                },
                kind_for(payload_type),
            )?;
        }
    }

    tracing::debug!(codec = %codec, video_payload_type, "Registered publish codecs");
    Ok(())
}
