//! Pipeline registry
//!
//! Owns every live [`Pipeline`], keyed by session. Pipelines are created on
//! first use and dropped as soon as they hold neither a publisher nor a
//! subscriber.

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, PipelineStats};
use crate::transport::{Role, Transport};
use fanout_protocol::{PayloadType, PublishOptions, SessionId, Ssrc, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub struct PipelineRegistry {
    config: Arc<RelayConfig>,
    pipelines: RwLock<HashMap<SessionId, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new(config: Arc<RelayConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<RelayConfig> {
        &self.config
    }

    /// Get the session's pipeline, creating it if there is none.
    pub async fn get_or_create(self: &Arc<Self>, session_id: &SessionId) -> Arc<Pipeline> {
        if let Some(pipeline) = self.pipelines.read().await.get(session_id) {
            return Arc::clone(pipeline);
        }

        let mut pipelines = self.pipelines.write().await;
        // Another caller may have created it while we waited for the lock
        if let Some(pipeline) = pipelines.get(session_id) {
            return Arc::clone(pipeline);
        }

        let pipeline = Pipeline::new(
            session_id.clone(),
            Arc::clone(&self.config),
            Arc::downgrade(self),
        );
        pipelines.insert(session_id.clone(), Arc::clone(&pipeline));
        info!(session_id = %session_id, "Created pipeline");
        pipeline
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<Pipeline>> {
        self.pipelines.read().await.get(session_id).cloned()
    }

    /// Drop the session's pipeline if it has no members left.
    pub(crate) async fn remove_if_empty(&self, session_id: &SessionId) -> bool {
        let removed = {
            let mut pipelines = self.pipelines.write().await;
            let Some(pipeline) = pipelines.get(session_id) else {
                return false;
            };
            if !pipeline.mark_closed_if_empty().await {
                return false;
            }
            pipelines.remove(session_id)
        };

        if let Some(pipeline) = removed {
            pipeline.close().await;
            info!(session_id = %session_id, "Removed empty pipeline");
        }
        true
    }

    /// Negotiate a publisher and bind it to the session's pipeline.
    pub async fn publish<F>(
        self: &Arc<Self>,
        session_id: &SessionId,
        transport_id: TransportId,
        offer: RTCSessionDescription,
        options: Option<PublishOptions>,
        on_stream: F,
    ) -> Result<(Arc<Transport>, RTCSessionDescription)>
    where
        F: Fn(Ssrc, PayloadType) + Send + Sync + 'static,
    {
        let publisher = Transport::new(transport_id, Role::Publisher, Arc::clone(&self.config));
        let answer = publisher.answer_publish(offer, options, on_stream).await?;

        loop {
            let pipeline = self.get_or_create(session_id).await;
            match pipeline.bind_publisher(Arc::clone(&publisher)).await {
                Ok(()) => return Ok((publisher, answer)),
                // Lost a race with teardown; the next lookup creates a fresh one
                Err(Error::PipelineClosed) => continue,
                Err(e) => {
                    publisher.close().await;
                    return Err(e);
                }
            }
        }
    }

    /// Negotiate a subscriber for every stream the session's publisher
    /// currently offers.
    pub async fn subscribe(
        self: &Arc<Self>,
        session_id: &SessionId,
        transport_id: TransportId,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<Transport>, RTCSessionDescription)> {
        let pipeline = self.get(session_id).await.ok_or(Error::NoPublisher)?;
        let publisher = pipeline.publisher().await.ok_or(Error::NoPublisher)?;
        let streams = publisher.streams_and_payload_types().await;

        let subscriber =
            Transport::new(transport_id, Role::Subscriber, Arc::clone(&self.config));
        let answer = subscriber
            .answer_subscribe(offer, streams, session_id.clone(), Arc::downgrade(self))
            .await?;

        if let Err(e) = pipeline.add_subscriber(Arc::clone(&subscriber)).await {
            subscriber.close().await;
            return Err(match e {
                Error::PipelineClosed => Error::NoPublisher,
                e => e,
            });
        }

        // Late joiner: don't make it wait for the next periodic keyframe
        publisher.request_keyframe();
        Ok((subscriber, answer))
    }

    pub async fn remove_subscriber(&self, session_id: &SessionId, transport_id: &TransportId) -> bool {
        match self.get(session_id).await {
            Some(pipeline) => pipeline.remove_subscriber(transport_id).await,
            None => false,
        }
    }

    pub async fn remove_publisher(&self, session_id: &SessionId) -> bool {
        match self.get(session_id).await {
            Some(pipeline) => pipeline.remove_publisher().await,
            None => false,
        }
    }

    /// Close a session and every transport in it.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        let removed = self.pipelines.write().await.remove(session_id);
        match removed {
            Some(pipeline) => {
                pipeline.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.pipelines.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pipelines.read().await.is_empty()
    }

    pub async fn stats(&self) -> Vec<PipelineStats> {
        let pipelines: Vec<Arc<Pipeline>> = self.pipelines.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            stats.push(pipeline.stats().await);
        }
        stats
    }

    /// Log per-pipeline statistics every `stats_interval` until `shutdown`
    /// fires.
    pub async fn run_stats_sweep(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.stats_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for stats in self.stats().await {
                info!(
                    session_id = %stats.session_id,
                    has_publisher = stats.has_publisher,
                    subscribers = stats.subscribers,
                    cached_packets = stats.cached_packets,
                    packets_forwarded = stats.packets_forwarded,
                    packets_received = stats.packets_received,
                    publisher_byte_rate = stats.publisher_byte_rate,
                    "Pipeline stats"
                );
            }
        }

        debug!("Stats sweep stopped");
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let pipelines: Vec<Arc<Pipeline>> = self
            .pipelines
            .write()
            .await
            .drain()
            .map(|(_, pipeline)| pipeline)
            .collect();

        info!(count = pipelines.len(), "Closing all pipelines");
        for pipeline in pipelines {
            pipeline.close().await;
        }
    }
}
