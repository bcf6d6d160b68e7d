//! Offer/answer exchange for both transport roles.

use super::{
    Capabilities, FeedbackRoute, LocalTrack, PeerLink, ReceiverFeedback, RemoteStream,
    SenderFeedback, Transport,
};
use crate::error::{Error, Result};
use crate::registry::PipelineRegistry;
use fanout_media::{capability_for, is_video_payload, register_publish_codecs};
use fanout_protocol::{OptionsError, PayloadType, PublishOptions, SessionId, Ssrc, StreamMap};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::configure_rtcp_reports;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

impl Transport {
    /// Answer a publisher's offer.
    ///
    /// `on_stream` runs for every inbound stream the publisher starts, before
    /// the transport begins reading it.
    pub async fn answer_publish<F>(
        self: &Arc<Self>,
        offer: RTCSessionDescription,
        options: Option<PublishOptions>,
        on_stream: F,
    ) -> Result<RTCSessionDescription>
    where
        F: Fn(Ssrc, PayloadType) + Send + Sync + 'static,
    {
        let options = options.ok_or(OptionsError::Missing)?;
        self.set_capabilities(Capabilities::from(&options));

        let mut media_engine = MediaEngine::default();
        register_publish_codecs(&mut media_engine, options.codec).map_err(Error::negotiation)?;
        let pc = self.open_peer_connection(media_engine).await?;

        match self.negotiate_publish(&pc, offer, on_stream).await {
            Ok(answer) => {
                info!(
                    transport_id = %self.id,
                    codec = %options.codec,
                    periodic_keyframes = options.wants_keyframes(),
                    "Publisher negotiated"
                );
                Ok(answer)
            }
            Err(e) => {
                error!(transport_id = %self.id, error = %e, "Publisher negotiation failed");
                self.close().await;
                Err(e)
            }
        }
    }

    async fn negotiate_publish<F>(
        self: &Arc<Self>,
        pc: &Arc<RTCPeerConnection>,
        offer: RTCSessionDescription,
        on_stream: F,
    ) -> Result<RTCSessionDescription>
    where
        F: Fn(Ssrc, PayloadType) + Send + Sync + 'static,
    {
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(Error::negotiation)?;
        }

        let weak: Weak<Transport> = Arc::downgrade(self);
        let on_stream = Arc::new(on_stream);
        pc.on_track(Box::new(move |track, receiver, _transceiver| {
            let weak = weak.clone();
            let on_stream = Arc::clone(&on_stream);

            Box::pin(async move {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                let ssrc = track.ssrc();
                let payload_type = track.payload_type();
                on_stream(ssrc, payload_type);

                if let Err(e) = transport
                    .receive_stream(Arc::new(RemoteStream(track)), ssrc, payload_type)
                    .await
                {
                    warn!(transport_id = %transport.id, ssrc, error = %e, "Failed to start inbound stream");
                    return;
                }
                if let Err(e) = transport.spawn_feedback_reader(
                    Arc::new(ReceiverFeedback(receiver)),
                    FeedbackRoute::Publisher,
                ) {
                    warn!(transport_id = %transport.id, ssrc, error = %e, "Failed to start feedback reader");
                }
            })
        }));

        complete_answer(pc, offer).await
    }

    /// Answer a subscriber's offer with one outbound track per entry of
    /// `streams`.
    pub async fn answer_subscribe(
        self: &Arc<Self>,
        offer: RTCSessionDescription,
        streams: StreamMap,
        session_id: SessionId,
        pipelines: Weak<PipelineRegistry>,
    ) -> Result<RTCSessionDescription> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(Error::negotiation)?;
        let pc = self.open_peer_connection(media_engine).await?;

        let senders = match self.add_forwarded_tracks(&pc, &streams, &session_id).await {
            Ok(senders) => senders,
            Err(e) => {
                error!(transport_id = %self.id, error = %e, "Failed to add subscriber tracks");
                self.close().await;
                return Err(e);
            }
        };

        let answer = match complete_answer(&pc, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(transport_id = %self.id, error = %e, "Subscriber negotiation failed");
                self.close().await;
                return Err(e);
            }
        };

        for (source_ssrc, sender) in senders {
            self.spawn_feedback_reader(
                Arc::new(SenderFeedback(sender)),
                FeedbackRoute::Subscriber {
                    session_id: session_id.clone(),
                    source_ssrc,
                    pipelines: pipelines.clone(),
                },
            )?;
        }

        info!(
            transport_id = %self.id,
            session_id = %session_id,
            tracks = streams.len(),
            "Subscriber negotiated"
        );
        Ok(answer)
    }

    async fn add_forwarded_tracks(
        &self,
        pc: &Arc<RTCPeerConnection>,
        streams: &StreamMap,
        session_id: &SessionId,
    ) -> Result<Vec<(Ssrc, Arc<RTCRtpSender>)>> {
        let mut senders = Vec::with_capacity(streams.len());

        for (&ssrc, &payload_type) in streams {
            let Some(capability) = capability_for(payload_type) else {
                warn!(transport_id = %self.id, ssrc, payload_type, "Skipping stream with unknown payload type");
                continue;
            };
            let kind = if is_video_payload(payload_type) {
                "video"
            } else {
                "audio"
            };

            let track = Arc::new(TrackLocalStaticRTP::new(
                capability,
                format!("{kind}-{ssrc}"),
                session_id.to_string(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(Error::negotiation)?;

            self.add_track(ssrc, Arc::new(LocalTrack::new(track, payload_type)))
                .await;
            senders.push((ssrc, sender));
        }

        Ok(senders)
    }

    /// Build a peer connection and attach it so `close` tears it down.
    async fn open_peer_connection(
        &self,
        media_engine: MediaEngine,
    ) -> Result<Arc<RTCPeerConnection>> {
        let registry = configure_rtcp_reports(Registry::new());
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(Error::negotiation)?,
        );

        if let Err(e) = self.attach_link(Arc::clone(&pc) as Arc<dyn PeerLink>).await {
            let _ = pc.close().await;
            return Err(e);
        }
        debug!(transport_id = %self.id, role = ?self.role, "Opened peer connection");
        Ok(pc)
    }
}

/// Apply the remote offer and return the local answer once ICE gathering
/// has finished.
async fn complete_answer(
    pc: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    pc.set_remote_description(offer)
        .await
        .map_err(Error::negotiation)?;
    let answer = pc.create_answer(None).await.map_err(Error::negotiation)?;

    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(answer)
        .await
        .map_err(Error::negotiation)?;
    let _ = gathered.recv().await;

    pc.local_description()
        .await
        .ok_or_else(|| Error::Negotiation("no local description after answer".to_string()))
}
