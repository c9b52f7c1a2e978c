//! Bounded store of recently sent packets, indexed by sequence number.
//!
//! Every packet that may be retransmitted is copied in here before it first
//! leaves the sender, so a NACK response or a pacer callback can replay the
//! exact bytes that went out.

use bytes::BytesMut;
use std::collections::HashMap;

/// How a packet may be used after its first transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Do not keep a copy; the packet can never be retransmitted.
    DontStore,
    /// Keep a copy for NACK responses and redundant-payload padding.
    AllowRetransmission,
}

#[derive(Debug)]
struct StoredPacket {
    packet: BytesMut,
    sequence_number: u16,
    capture_time_ms: i64,
    last_send_time_ms: i64,
}

/// Fixed-capacity ring of stored packets with a sequence-number index.
/// Insertion order is eviction order.
#[derive(Debug, Default)]
pub struct PacketHistory {
    enabled: bool,
    slots: Vec<Option<StoredPacket>>,
    next_slot: usize,
    index: HashMap<u16, usize>,
}

impl PacketHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables storage. Enabling (re)allocates `capacity` slots;
    /// disabling drops everything.
    pub fn set_store_packets_status(&mut self, enable: bool, capacity: u16) {
        self.slots.clear();
        self.index.clear();
        self.next_slot = 0;
        self.enabled = enable;
        if enable {
            self.slots.resize_with(capacity as usize, || None);
        }
    }

    pub fn store_packets(&self) -> bool {
        self.enabled
    }

    /// Copies a packet into the ring, evicting the oldest entry when full.
    /// A `DontStore` packet is not recorded.
    pub fn put(
        &mut self,
        packet: &[u8],
        sequence_number: u16,
        capture_time_ms: i64,
        now_ms: i64,
        storage: StorageKind,
    ) {
        if !self.enabled || storage == StorageKind::DontStore || self.slots.is_empty() {
            return;
        }
        let slot = self.next_slot;
        if let Some(evicted) = self.slots[slot].take() {
            self.index.remove(&evicted.sequence_number);
        }
        // A reused sequence number must not leave a stale index entry behind.
        if let Some(old_slot) = self.index.insert(sequence_number, slot) {
            if old_slot != slot {
                self.slots[old_slot] = None;
            }
        }
        self.slots[slot] = Some(StoredPacket {
            packet: BytesMut::from(packet),
            sequence_number,
            capture_time_ms,
            last_send_time_ms: now_ms,
        });
        self.next_slot = (slot + 1) % self.slots.len();
    }

    /// Looks up a packet and marks it sent at `now_ms`.
    ///
    /// Returns `None` when the packet is absent, or when it was (re)sent less
    /// than `min_resend_age_ms` ago and `force_retransmit` is not set. The
    /// age floor keeps a NACK burst from re-flooding a response that is still
    /// in flight.
    pub fn get_and_mark_sent(
        &mut self,
        sequence_number: u16,
        now_ms: i64,
        min_resend_age_ms: i64,
        force_retransmit: bool,
    ) -> Option<(BytesMut, i64)> {
        let slot = *self.index.get(&sequence_number)?;
        let stored = self.slots[slot].as_mut()?;
        debug_assert_eq!(stored.sequence_number, sequence_number);
        if !force_retransmit && now_ms - stored.last_send_time_ms < min_resend_age_ms {
            return None;
        }
        stored.last_send_time_ms = now_ms;
        Some((stored.packet.clone(), stored.capture_time_ms))
    }

    /// The largest stored packet whose total length fits `max_size`, if any.
    pub fn get_best_fitting(&self, max_size: usize) -> Option<(BytesMut, i64)> {
        self.slots
            .iter()
            .flatten()
            .filter(|stored| stored.packet.len() <= max_size)
            .max_by_key(|stored| stored.packet.len())
            .map(|stored| (stored.packet.clone(), stored.capture_time_ms))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.index.len()
    }
}
