//! Stream layer interface and the default datagram transfer.
//!
//! A [`Transfer`] is created when a connection establishes and owns data
//! flow from then on. The connection keeps lifecycle, liveness and the
//! remote sender; the transfer reaches the wire only through a [`Link`].

use crate::packet::{Header, Packet, PacketKind};
use crate::sender::{Sender, Transmit};
use crate::seq::{Seq, SeqCounter};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Payload bytes per data packet
pub const DEFAULT_CHUNK_SIZE: usize = 1200;

/// First retransmission delay of an unacknowledged half-close
pub const DEFAULT_FIN_RTO: Duration = Duration::from_millis(500);

/// What a transfer reports back to its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// In-order bytes for the application
    Data(Vec<u8>),
    /// Everything queued so far is on the wire
    Drained,
    /// Our half-close was acknowledged
    HalfCloseSent,
    /// The peer half-closed
    PeerHalfClosed,
}

/// Parameters latched at establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    /// Connection runs over a stream socket
    pub use_tcp: bool,
    /// First sequence number expected from the peer
    pub expected_remote_seq: Seq,
}

/// A transfer's view of its connection
pub struct Link<'a> {
    seq: &'a mut SeqCounter,
    template: &'a Header,
    sender: &'a mut Sender,
    transmits: &'a mut VecDeque<Transmit>,
    events: &'a mut VecDeque<TransferEvent>,
    last_send: &'a mut Instant,
    now: Instant,
}

impl<'a> Link<'a> {
    /// Borrow the pieces of a connection a transfer may touch
    pub fn new(
        seq: &'a mut SeqCounter,
        template: &'a Header,
        sender: &'a mut Sender,
        transmits: &'a mut VecDeque<Transmit>,
        events: &'a mut VecDeque<TransferEvent>,
        last_send: &'a mut Instant,
        now: Instant,
    ) -> Self {
        Self {
            seq,
            template,
            sender,
            transmits,
            events,
            last_send,
            now,
        }
    }

    /// Current time
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Build a packet, allocating its sequence range
    pub fn packet(&mut self, kind: PacketKind, payload: Vec<u8>, ack: Seq) -> Packet {
        let mut header = self.template.clone();
        header.kind = kind;
        header.seq = self.seq.advance(kind.seq_cost() + payload.len());
        header.ack_seq = ack;
        let mut packet = Packet {
            header,
            body: Default::default(),
        };
        packet.body.payload = payload;
        packet
    }

    /// Post through the connection's remote sender
    pub fn post(&mut self, packet: Packet) -> bool {
        let posted = self.sender.post(packet, self.transmits);
        if posted {
            *self.last_send = self.now;
        }
        posted
    }

    /// Report to the connection
    pub fn emit(&mut self, event: TransferEvent) {
        self.events.push_back(event);
    }
}

/// Reliable-stream layer started on establishment
pub trait Transfer: Send + fmt::Debug {
    /// A `Data` or `Fin` packet arrived, or any packet carrying an ack
    fn on_packet(&mut self, link: &mut Link<'_>, packet: Packet);

    /// Queue application bytes; returns how many were accepted
    fn send(&mut self, link: &mut Link<'_>, data: &[u8]) -> usize;

    /// Emit our half-close; report `HalfCloseSent` once acknowledged
    fn send_half_close(&mut self, link: &mut Link<'_>);

    /// Next internal timer
    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    /// Run internal timers
    fn handle_timeout(&mut self, _link: &mut Link<'_>) {}

    /// The stream socket drained its send buffer
    fn on_drain(&mut self, link: &mut Link<'_>) {
        link.emit(TransferEvent::Drained);
    }

    /// Drop all state
    fn close(&mut self) {}
}

/// Creates a transfer for each established connection
pub trait TransferFactory: Send + Sync + fmt::Debug {
    /// New transfer
    fn create(&self, params: TransferParams) -> Box<dyn Transfer>;
}

/// Factory for [`DatagramTransfer`]
#[derive(Debug, Clone)]
pub struct DatagramTransferFactory {
    /// Payload bytes per data packet
    pub chunk_size: usize,
    /// First half-close retransmission delay
    pub fin_rto: Duration,
}

impl Default for DatagramTransferFactory {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fin_rto: DEFAULT_FIN_RTO,
        }
    }
}

impl TransferFactory for DatagramTransferFactory {
    fn create(&self, params: TransferParams) -> Box<dyn Transfer> {
        Box::new(DatagramTransfer::new(params, self.chunk_size, self.fin_rto))
    }
}

#[derive(Debug)]
struct PendingFin {
    packet: Packet,
    acked: bool,
    rto: Duration,
    deadline: Option<Instant>,
}

/// Minimal in-order transfer
///
/// Delivers data in sequence order through a reorder buffer and answers
/// every segment with a cumulative ack (an empty `Data` packet). Data is
/// never retransmitted; the half-close is, until acknowledged.
#[derive(Debug)]
pub struct DatagramTransfer {
    chunk_size: usize,
    fin_rto: Duration,
    expected: Seq,
    reorder: Vec<Packet>,
    peer_fin: bool,
    fin: Option<PendingFin>,
}

impl DatagramTransfer {
    /// New transfer expecting `params.expected_remote_seq` first
    #[must_use]
    pub fn new(params: TransferParams, chunk_size: usize, fin_rto: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            fin_rto,
            expected: params.expected_remote_seq,
            reorder: Vec::new(),
            peer_fin: false,
            fin: None,
        }
    }

    /// Next sequence expected from the peer
    #[must_use]
    pub fn expected(&self) -> Seq {
        self.expected
    }

    fn on_ack(&mut self, link: &mut Link<'_>, ack: Seq) {
        if let Some(fin) = self.fin.as_mut() {
            if !fin.acked && !ack.is_before(fin.packet.next_seq()) {
                fin.acked = true;
                fin.deadline = None;
                link.emit(TransferEvent::HalfCloseSent);
            }
        }
    }

    fn accept(&mut self, link: &mut Link<'_>, packet: Packet) {
        self.expected = packet.next_seq();
        match packet.kind() {
            PacketKind::Fin if !self.peer_fin => {
                self.peer_fin = true;
                link.emit(TransferEvent::PeerHalfClosed);
            }
            PacketKind::Data => link.emit(TransferEvent::Data(packet.body.payload)),
            _ => {}
        }
    }

    fn buffer(&mut self, packet: Packet) {
        let seq = packet.header.seq;
        if let Err(pos) = self
            .reorder
            .binary_search_by(|p| p.header.seq.wrapping_cmp(seq))
        {
            self.reorder.insert(pos, packet);
        }
    }

    fn ack(&mut self, link: &mut Link<'_>) {
        let ack = link.packet(PacketKind::Data, Vec::new(), self.expected);
        link.post(ack);
    }
}

impl Transfer for DatagramTransfer {
    fn on_packet(&mut self, link: &mut Link<'_>, packet: Packet) {
        self.on_ack(link, packet.header.ack_seq);
        match packet.kind() {
            PacketKind::Data if !packet.body.payload.is_empty() => {}
            PacketKind::Fin => {}
            _ => return,
        }

        let seq = packet.header.seq;
        if seq == self.expected {
            self.accept(link, packet);
            while let Some(first) = self.reorder.first() {
                let first_seq = first.header.seq;
                if first_seq.is_after(self.expected) {
                    break;
                }
                let next = self.reorder.remove(0);
                if first_seq == self.expected {
                    self.accept(link, next);
                }
            }
        } else if seq.is_after(self.expected) {
            tracing::trace!("buffering out-of-order seq={} expected={}", seq, self.expected);
            self.buffer(packet);
        }
        self.ack(link);
    }

    fn send(&mut self, link: &mut Link<'_>, data: &[u8]) -> usize {
        if self.fin.is_some() || data.is_empty() {
            return 0;
        }
        for chunk in data.chunks(self.chunk_size) {
            let packet = link.packet(PacketKind::Data, chunk.to_vec(), self.expected);
            link.post(packet);
        }
        link.emit(TransferEvent::Drained);
        data.len()
    }

    fn send_half_close(&mut self, link: &mut Link<'_>) {
        if self.fin.is_some() {
            return;
        }
        let packet = link.packet(PacketKind::Fin, Vec::new(), self.expected);
        link.post(packet.clone());
        self.fin = Some(PendingFin {
            packet,
            acked: false,
            rto: self.fin_rto,
            deadline: Some(link.now() + self.fin_rto),
        });
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.fin.as_ref().and_then(|f| f.deadline)
    }

    fn handle_timeout(&mut self, link: &mut Link<'_>) {
        let now = link.now();
        let expected = self.expected;
        let Some(fin) = self.fin.as_mut() else {
            return;
        };
        if fin.acked || fin.deadline.is_none_or(|d| now < d) {
            return;
        }
        tracing::debug!("retransmitting half-close seq={}", fin.packet.header.seq);
        let mut packet = fin.packet.clone();
        packet.header.ack_seq = expected;
        fin.rto = fin.rto.saturating_mul(2);
        fin.deadline = Some(now + fin.rto);
        link.post(packet);
    }

    fn close(&mut self) {
        self.reorder.clear();
        self.fin = None;
    }
}
