//! Forwarding pipeline
//!
//! Binds one publisher transport to its subscribers for a single session and
//! moves every packet the publisher reads to each subscriber, keeping a short
//! history for retransmission.

use crate::cache::RetransmitCache;
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::registry::PipelineRegistry;
use crate::transport::Transport;
use fanout_protocol::{SessionId, Ssrc, TransportId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;

/// Outcome of replaying one cached packet to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    Delivered,
    CacheMiss,
    /// Found in the cache but the subscriber's track refused it
    WriteFailed,
    /// The requesting subscriber has already left
    NoSubscriber,
}

/// Point-in-time view of a pipeline for the stats sweep
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub session_id: SessionId,
    pub has_publisher: bool,
    pub subscribers: usize,
    pub cached_packets: usize,
    pub packets_forwarded: u64,
    pub packets_received: u64,
    pub publisher_byte_rate: u64,
}

pub struct Pipeline {
    id: SessionId,
    config: Arc<RelayConfig>,
    publisher: RwLock<Option<Arc<Transport>>>,
    subscribers: RwLock<HashMap<TransportId, Arc<Transport>>>,
    cache: RetransmitCache,
    registry: Weak<PipelineRegistry>,
    /// Set once the pipeline has left the registry; membership changes are
    /// refused from then on
    closed: AtomicBool,
    forwarder: TaskTracker,
    packets_forwarded: AtomicU64,
}

impl Pipeline {
    pub fn new(
        id: SessionId,
        config: Arc<RelayConfig>,
        registry: Weak<PipelineRegistry>,
    ) -> Arc<Self> {
        let cache = RetransmitCache::new(config.retransmit_cache_size);
        Arc::new(Self {
            id,
            config,
            publisher: RwLock::new(None),
            subscribers: RwLock::new(HashMap::new()),
            cache,
            registry,
            closed: AtomicBool::new(false),
            forwarder: TaskTracker::new(),
            packets_forwarded: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bind the session's publisher and start forwarding what it reads.
    ///
    /// A previously bound publisher is closed. Binding the current publisher
    /// again is a no-op.
    pub async fn bind_publisher(self: &Arc<Self>, publisher: Arc<Transport>) -> Result<()> {
        let previous = {
            let mut slot = self.publisher.write().await;
            if self.is_closed() {
                return Err(Error::PipelineClosed);
            }
            slot.replace(Arc::clone(&publisher))
        };

        if let Some(previous) = previous {
            // Already forwarding from this transport; a second reader would
            // interleave its packets
            if Arc::ptr_eq(&previous, &publisher) {
                return Ok(());
            }
            info!(session_id = %self.id, transport_id = %previous.id(), "Replacing publisher");
            previous.close().await;
        }

        info!(session_id = %self.id, transport_id = %publisher.id(), "Publisher bound");

        let pipeline = Arc::clone(self);
        self.forwarder.spawn(async move {
            pipeline.forward_loop(publisher).await;
        });
        Ok(())
    }

    pub async fn add_subscriber(&self, subscriber: Arc<Transport>) -> Result<()> {
        let previous = {
            let mut subscribers = self.subscribers.write().await;
            if self.is_closed() {
                return Err(Error::PipelineClosed);
            }
            subscribers.insert(subscriber.id().clone(), Arc::clone(&subscriber))
        };

        if let Some(previous) = previous {
            previous.close().await;
        }

        info!(
            session_id = %self.id,
            transport_id = %subscriber.id(),
            "Subscriber added"
        );
        Ok(())
    }

    /// Remove and close a subscriber. Tears the pipeline down if nothing is
    /// left in it.
    pub async fn remove_subscriber(&self, subscriber_id: &TransportId) -> bool {
        let removed = self.subscribers.write().await.remove(subscriber_id);
        let Some(subscriber) = removed else {
            return false;
        };

        subscriber.close().await;
        info!(session_id = %self.id, transport_id = %subscriber_id, "Subscriber removed");

        self.teardown_if_empty().await;
        true
    }

    /// Unbind and close the publisher. Tears the pipeline down if no
    /// subscriber remains.
    pub async fn remove_publisher(&self) -> bool {
        let removed = self.publisher.write().await.take();
        let Some(publisher) = removed else {
            return false;
        };

        publisher.close().await;
        info!(session_id = %self.id, transport_id = %publisher.id(), "Publisher removed");

        self.teardown_if_empty().await;
        true
    }

    async fn teardown_if_empty(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_empty(&self.id).await;
        }
    }

    pub async fn publisher(&self) -> Option<Arc<Transport>> {
        self.publisher.read().await.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.publisher.read().await.is_none() && self.subscribers.read().await.is_empty()
    }

    /// Mark the pipeline closed if it has no members.
    ///
    /// Both membership locks are held while checking, so no add can slip in
    /// between the check and the flag.
    pub(crate) async fn mark_closed_if_empty(&self) -> bool {
        let publisher = self.publisher.write().await;
        let subscribers = self.subscribers.write().await;
        if publisher.is_none() && subscribers.is_empty() {
            self.closed.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Cache one packet and write it to every current subscriber.
    pub async fn forward(&self, packet: Packet) {
        self.cache.insert(&packet);

        let subscribers: Vec<Arc<Transport>> =
            self.subscribers.read().await.values().cloned().collect();
        for subscriber in &subscribers {
            self.deliver(subscriber, &packet).await;
        }

        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    async fn deliver(&self, subscriber: &Transport, packet: &Packet) {
        let Err(e) = subscriber.write_packet(packet).await else {
            subscriber.stats().clear_errors();
            return;
        };

        let errors = subscriber.stats().add_error();
        match e {
            Error::TrackNotFound(_) => {}
            e => warn!(
                session_id = %self.id,
                transport_id = %subscriber.id(),
                error = %e,
                "Failed to forward packet"
            ),
        }
        if errors == self.config.max_consecutive_errors {
            warn!(
                session_id = %self.id,
                transport_id = %subscriber.id(),
                errors,
                "Subscriber keeps failing writes"
            );
        }
    }

    /// Replay a cached packet to one subscriber.
    pub async fn write_cached(
        &self,
        subscriber_id: &TransportId,
        ssrc: Ssrc,
        sequence: u16,
    ) -> Replay {
        let subscriber = self.subscribers.read().await.get(subscriber_id).cloned();
        let Some(subscriber) = subscriber else {
            return Replay::NoSubscriber;
        };
        let Some(packet) = self.cache.get(ssrc, sequence) else {
            return Replay::CacheMiss;
        };

        match subscriber.write_packet(&packet).await {
            Ok(()) => Replay::Delivered,
            Err(e) => {
                debug!(
                    session_id = %self.id,
                    transport_id = %subscriber_id,
                    ssrc,
                    sequence,
                    error = %e,
                    "Failed to replay cached packet"
                );
                Replay::WriteFailed
            }
        }
    }

    async fn forward_loop(self: Arc<Self>, publisher: Arc<Transport>) {
        loop {
            match publisher.read_packet().await {
                Ok(packet) => self.forward(packet).await,
                Err(e) if e.is_end_of_stream() => break,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "Publisher read failed");
                    break;
                }
            }
        }

        debug!(
            session_id = %self.id,
            transport_id = %publisher.id(),
            "Forwarding stopped"
        );
    }

    /// Close every member and wait for forwarding to stop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let publisher = self.publisher.write().await.take();
        let subscribers: Vec<Arc<Transport>> = self
            .subscribers
            .write()
            .await
            .drain()
            .map(|(_, subscriber)| subscriber)
            .collect();

        if let Some(publisher) = publisher {
            publisher.close().await;
        }
        for subscriber in subscribers {
            subscriber.close().await;
        }

        self.forwarder.close();
        self.forwarder.wait().await;
        self.cache.clear();

        info!(session_id = %self.id, "Pipeline closed");
    }

    pub async fn stats(&self) -> PipelineStats {
        let publisher = self.publisher().await;
        PipelineStats {
            session_id: self.id.clone(),
            has_publisher: publisher.is_some(),
            subscribers: self.subscriber_count().await,
            cached_packets: self.cache.len(),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            packets_received: publisher
                .as_ref()
                .map(|p| p.stats().packets_received())
                .unwrap_or(0),
            publisher_byte_rate: publisher.map(|p| p.byte_rate()).unwrap_or(0),
        }
    }
}
