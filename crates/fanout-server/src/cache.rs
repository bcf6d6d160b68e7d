//! Short-horizon packet store for serving retransmission requests.
//!
//! Lookups use `peek`, so recency is never refreshed and the cache evicts in
//! insertion order.

use fanout_protocol::Ssrc;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use webrtc::rtp::packet::Packet;

pub struct RetransmitCache {
    packets: Mutex<LruCache<(Ssrc, u16), Packet>>,
}

impl RetransmitCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            packets: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn insert(&self, packet: &Packet) {
        let key = (packet.header.ssrc, packet.header.sequence_number);
        self.packets.lock().push(key, packet.clone());
    }

    pub fn get(&self, ssrc: Ssrc, sequence: u16) -> Option<Packet> {
        self.packets.lock().peek(&(ssrc, sequence)).cloned()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }
}
