//! Connection transport behaviour against in-memory links.
//!
//! Run with: cargo test -p fanout-server --test transport

mod common;

use common::{eventually, packet, transport, MockFeedback, MockLink, MockSink, MockSource, WAIT};
use fanout_media::{PAYLOAD_TYPE_OPUS, PAYLOAD_TYPE_VP8};
use fanout_server::feedback::FeedbackReport;
use fanout_server::transport::{Capabilities, FeedbackRoute};
use fanout_server::{Error, RelayConfig, Role};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_test::assert_pending;

#[tokio::test]
async fn test_write_without_track_is_track_not_found() {
    let subscriber = transport("sub", Role::Subscriber, common::config());
    let sink = MockSink::new(PAYLOAD_TYPE_VP8);
    subscriber.add_track(1, sink.clone()).await;

    let result = subscriber.write_packet(&packet(2, 1, PAYLOAD_TYPE_VP8)).await;
    assert!(matches!(result, Err(Error::TrackNotFound(2))));

    // Other streams are unaffected
    subscriber
        .write_packet(&packet(1, 7, PAYLOAD_TYPE_VP8))
        .await
        .unwrap();
    assert_eq!(sink.sequences(), vec![7]);
}

#[tokio::test]
async fn test_write_rejects_malformed_packet() {
    let subscriber = transport("sub", Role::Subscriber, common::config());
    subscriber.add_track(1, MockSink::new(PAYLOAD_TYPE_VP8)).await;

    let mut bad = packet(1, 1, PAYLOAD_TYPE_VP8);
    bad.header.version = 0;
    assert!(matches!(
        subscriber.write_packet(&bad).await,
        Err(Error::InvalidPacket)
    ));
}

#[tokio::test]
async fn test_inbound_packets_arrive_in_order() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher
        .receive_stream(source, 10, PAYLOAD_TYPE_OPUS)
        .await
        .unwrap();

    for seq in 1..=5 {
        tx.send(packet(10, seq, PAYLOAD_TYPE_OPUS)).unwrap();
    }
    for seq in 1..=5 {
        let received = timeout(WAIT, publisher.read_packet()).await.unwrap().unwrap();
        assert_eq!(received.header.sequence_number, seq);
    }

    let streams = publisher.streams_and_payload_types().await;
    assert_eq!(streams.get(&10), Some(&PAYLOAD_TYPE_OPUS));

    publisher.close().await;
}

#[tokio::test]
async fn test_read_packet_waits_for_data() {
    let publisher = transport("pub", Role::Publisher, common::config());

    let mut read = tokio_test::task::spawn(publisher.read_packet());
    assert_pending!(read.poll());
}

#[tokio::test]
async fn test_close_stops_every_loop() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    // Readers parked on streams that never produce anything
    let (video, _video_tx) = MockSource::new(&link);
    let (audio, _audio_tx) = MockSource::new(&link);
    let (feedback, _feedback_tx) = MockFeedback::new(&link);
    publisher.receive_stream(video, 1, PAYLOAD_TYPE_VP8).await.unwrap();
    publisher.receive_stream(audio, 2, PAYLOAD_TYPE_OPUS).await.unwrap();
    publisher
        .spawn_feedback_reader(feedback, FeedbackRoute::Publisher)
        .unwrap();

    timeout(WAIT, publisher.close())
        .await
        .expect("close should finish once the link is torn down");

    assert!(link.closed.is_cancelled());
    assert!(publisher.is_closed());
    assert!(matches!(
        publisher.read_packet().await,
        Err(Error::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_close_twice() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();
    let (source, _tx) = MockSource::new(&link);
    publisher.receive_stream(source, 1, PAYLOAD_TYPE_VP8).await.unwrap();

    timeout(WAIT, async {
        tokio::join!(publisher.close(), publisher.close());
    })
    .await
    .unwrap();
    timeout(WAIT, publisher.close()).await.unwrap();
}

#[tokio::test]
async fn test_closed_transport_refuses_new_streams() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.close().await;

    let (source, _tx) = MockSource::new(&link);
    assert!(matches!(
        publisher.receive_stream(source, 1, PAYLOAD_TYPE_OPUS).await,
        Err(Error::TransportClosed)
    ));
    assert!(matches!(
        publisher.attach_link(link).await,
        Err(Error::TransportClosed)
    ));
}

#[tokio::test]
async fn test_full_channel_blocks_producer() {
    let config = Arc::new(RelayConfig {
        packet_channel_capacity: 2,
        ..Default::default()
    });
    let publisher = transport("pub", Role::Publisher, config);
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher
        .receive_stream(source.clone(), 1, PAYLOAD_TYPE_OPUS)
        .await
        .unwrap();
    for seq in 1..=5 {
        tx.send(packet(1, seq, PAYLOAD_TYPE_OPUS)).unwrap();
    }

    // Two packets buffered, the third held by the parked producer
    assert!(eventually(|| source.reads() == 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.reads(), 3);

    // Nothing was dropped: draining one lets exactly one more through
    let first = publisher.read_packet().await.unwrap();
    assert_eq!(first.header.sequence_number, 1);
    assert!(eventually(|| source.reads() == 4).await);

    timeout(WAIT, publisher.close())
        .await
        .expect("a producer blocked on a full channel must not stall close");
}

#[tokio::test]
async fn test_on_demand_keyframe_request_targets_latest_video_stream() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher.receive_stream(source, 42, PAYLOAD_TYPE_VP8).await.unwrap();
    tx.send(packet(42, 1, PAYLOAD_TYPE_VP8)).unwrap();
    timeout(WAIT, publisher.read_packet()).await.unwrap().unwrap();

    assert!(publisher.request_keyframe());
    assert!(
        eventually(|| {
            link.reports() == vec![FeedbackReport::KeyframeRequest { media_ssrc: 42 }]
        })
        .await
    );

    publisher.close().await;
    assert!(!publisher.request_keyframe());
}

#[tokio::test]
async fn test_bandwidth_estimate_is_sent_in_bits() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();
    let (source, _tx) = MockSource::new(&link);
    publisher.receive_stream(source, 7, PAYLOAD_TYPE_VP8).await.unwrap();

    // No rate observed yet, so the upper bound is proposed
    publisher.send_bandwidth_estimate(0.0).await;
    publisher.send_bandwidth_estimate(1.5).await;

    assert_eq!(
        link.reports(),
        vec![FeedbackReport::BandwidthEstimate {
            ssrc: 7,
            bitrate: 800_000,
        }]
    );

    publisher.close().await;
}

#[tokio::test]
async fn test_retransmission_request_marks_loss() {
    let publisher = transport("pub", Role::Publisher, common::config());
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();
    assert!(!publisher.lost_packet_recently());

    let request = FeedbackReport::RetransmissionRequest {
        sender_ssrc: 3,
        media_ssrc: 4,
        sequences: vec![99],
    };
    publisher.send_retransmission_request(request.clone()).await;

    assert!(publisher.lost_packet_recently());
    assert_eq!(link.reports(), vec![request]);
}

#[tokio::test]
async fn test_rate_window_closes_while_idle() {
    let config = Arc::new(RelayConfig {
        rate_window_ms: 200,
        ..Default::default()
    });
    let publisher = transport("pub", Role::Publisher, config);
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher.receive_stream(source, 3, PAYLOAD_TYPE_OPUS).await.unwrap();
    for seq in 1..=20 {
        tx.send(packet(3, seq, PAYLOAD_TYPE_OPUS)).unwrap();
    }
    for _ in 1..=20 {
        timeout(WAIT, publisher.read_packet()).await.unwrap().unwrap();
    }
    assert!(eventually(|| publisher.byte_rate() > 0).await);

    publisher
        .send_retransmission_request(FeedbackReport::RetransmissionRequest {
            sender_ssrc: 1,
            media_ssrc: 3,
            sequences: vec![4],
        })
        .await;
    assert!(publisher.lost_packet_recently());

    // No packet arrives, yet the window still rolls over
    assert!(eventually(|| publisher.byte_rate() == 0 && !publisher.lost_packet_recently()).await);

    publisher.close().await;
}

#[tokio::test]
async fn test_periodic_keyframe_requests_for_video_publisher() {
    let config = Arc::new(RelayConfig {
        keyframe_interval_ms: 50,
        ..Default::default()
    });
    let publisher = transport("pub", Role::Publisher, config);
    publisher.set_capabilities(Capabilities {
        video: true,
        ..Default::default()
    });
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher.receive_stream(source, 42, PAYLOAD_TYPE_VP8).await.unwrap();
    tx.send(packet(42, 1, PAYLOAD_TYPE_VP8)).unwrap();
    timeout(WAIT, publisher.read_packet()).await.unwrap().unwrap();

    let request = FeedbackReport::KeyframeRequest { media_ssrc: 42 };
    assert!(
        eventually(|| link.reports().iter().filter(|r| **r == request).count() >= 2).await
    );

    publisher.close().await;
}

#[tokio::test]
async fn test_audio_only_publisher_gets_no_periodic_keyframe_requests() {
    let config = Arc::new(RelayConfig {
        keyframe_interval_ms: 50,
        ..Default::default()
    });
    let publisher = transport("pub", Role::Publisher, config);
    publisher.set_capabilities(Capabilities {
        audio: true,
        ..Default::default()
    });
    let link = MockLink::new();
    publisher.attach_link(link.clone()).await.unwrap();

    let (source, tx) = MockSource::new(&link);
    publisher.receive_stream(source, 42, PAYLOAD_TYPE_VP8).await.unwrap();
    tx.send(packet(42, 1, PAYLOAD_TYPE_VP8)).unwrap();
    timeout(WAIT, publisher.read_packet()).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(link.reports().is_empty());

    publisher.close().await;
}
