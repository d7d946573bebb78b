//! Buffer for stream packets that arrive before the handshake completes.

use crate::packet::{Packet, PacketKind};

/// Sequence-sorted packets awaiting establishment
///
/// Holds `Data` and `Fin` packets only; pure acknowledgements (empty data)
/// carry nothing worth replaying and are skipped.
#[derive(Debug, Default)]
pub struct EarlyData {
    packets: Vec<Packet>,
}

impl EarlyData {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in sequence order; returns false for duplicates and skipped packets
    pub fn insert(&mut self, packet: Packet) -> bool {
        match packet.kind() {
            PacketKind::Data if !packet.body.payload.is_empty() => {}
            PacketKind::Fin => {}
            _ => return false,
        }
        let seq = packet.header.seq;
        match self
            .packets
            .binary_search_by(|p| p.header.seq.wrapping_cmp(seq))
        {
            Ok(_) => {
                tracing::trace!("dropping duplicate early packet seq={}", seq);
                false
            }
            Err(pos) => {
                self.packets.insert(pos, packet);
                true
            }
        }
    }

    /// Number of buffered packets
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Take every packet in sequence order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PortAddr;
    use crate::seq::Seq;
    use proptest::prelude::*;

    fn packet(kind: PacketKind, seq: u32, payload: &[u8]) -> Packet {
        let mut p = Packet::new(kind, PortAddr::new("a", 1), PortAddr::new("b", 2));
        p.header.seq = Seq::new(seq);
        p.body.payload = payload.to_vec();
        p
    }

    #[test]
    fn test_duplicate_sequence_dropped() {
        let mut early = EarlyData::new();
        assert!(early.insert(packet(PacketKind::Data, 10, b"abc")));
        assert!(!early.insert(packet(PacketKind::Data, 10, b"abc")));
        assert_eq!(early.len(), 1);
    }

    #[test]
    fn test_acks_and_control_skipped() {
        let mut early = EarlyData::new();
        assert!(!early.insert(packet(PacketKind::Data, 10, b"")));
        assert!(!early.insert(packet(PacketKind::Heartbeat, 10, b"")));
        assert!(early.insert(packet(PacketKind::Fin, 13, b"")));
        assert_eq!(early.len(), 1);
    }

    #[test]
    fn test_drain_orders_across_wrap() {
        let mut early = EarlyData::new();
        early.insert(packet(PacketKind::Data, 2, b"cc"));
        early.insert(packet(PacketKind::Data, u32::MAX - 1, b"aa"));
        early.insert(packet(PacketKind::Data, 0, b"bb"));

        let seqs: Vec<u32> = early.drain().iter().map(|p| p.header.seq.get()).collect();
        assert_eq!(seqs, vec![u32::MAX - 1, 0, 2]);
        assert!(early.is_empty());
    }

    proptest! {
        #[test]
        fn drained_stream_is_sorted_and_unique(
            base in any::<u32>(),
            offsets in prop::collection::vec(0u32..1000, 1..50),
        ) {
            let mut early = EarlyData::new();
            for off in &offsets {
                early.insert(packet(PacketKind::Data, base.wrapping_add(*off), b"x"));
            }
            let drained = early.drain();
            let mut expected: Vec<u32> = offsets.clone();
            expected.sort_unstable();
            expected.dedup();
            let got: Vec<u32> = drained
                .iter()
                .map(|p| p.header.seq.get().wrapping_sub(base))
                .collect();
            prop_assert_eq!(got, expected);
        }
    }
}
