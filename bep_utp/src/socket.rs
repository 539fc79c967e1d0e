//! Per connection uTP state machine and congestion controller.

use std::cmp;
use std::collections::VecDeque;

use bytes::Bytes;

use crate::buffer::PacketBuffer;
use crate::delay::DelayHistory;
use crate::error::UtpError;
use crate::mtu::MtuDiscovery;
use crate::packet::{PacketExtension, PacketType, UtpPacket, MAX_SACK_BYTES};

use bep_util::wrap;

/// Packets that fit in the receive reorder buffer.
const MAX_PACKETS_REORDER: usize = 512;

/// Duplicate acks on one sequence number before a fast resend.
const DUP_ACK_LIMIT: u32 = 3;

/// Fast resends allowed per selective ack message.
const SACK_RESEND_LIMIT: usize = 3;

/// Bytes the receive side will buffer.
const RECV_BUFFER_CAP: usize = 512 * 1024;

/// Delay target the controller steers towards, in microseconds.
const TARGET_DELAY_MICROS: i64 = 100_000;

/// Most cwnd bytes gained per control interval at full utilization.
const MAX_CWND_INCREASE_BYTES: i64 = 3000;

/// Floor for the retransmission timer, in milliseconds.
const MIN_TIMEOUT_MILLIS: u64 = 500;

/// Cap for the retransmission timer, in milliseconds.
const MAX_TIMEOUT_MILLIS: u64 = 60_000;

/// Fixed timeout while a SYN is outstanding.
const SYN_TIMEOUT_MILLIS: u64 = 3000;

/// Minimum spacing between multiplicative cwnd cuts.
const CWND_REDUCE_TIMER_MILLIS: u64 = 100;

/// Retransmits before giving up on a data packet.
const NUM_RESENDS: u32 = 3;

/// Retransmits before giving up on a SYN.
const SYN_RESENDS: u32 = 2;

/// Retransmits before giving up on a FIN.
const FIN_RESENDS: u32 = 2;

/// Millis spent in ErrorWait before the socket can be reaped.
const ERROR_WAIT_MILLIS: u64 = 1000;

/// Connection states of a uTP socket.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SocketState {
    /// Fresh socket, neither side has spoken.
    None,
    /// Our SYN is in flight.
    SynSent,
    /// Stream established in both directions.
    Connected,
    /// Our FIN is in flight, draining acknowledgments.
    FinSent,
    /// Terminal error or close, lingering before deletion.
    ErrorWait,
    /// Ready to be reaped by the multiplexer.
    Deleting,
}

/// Events surfaced to the layer driving the socket.
#[derive(Debug)]
pub enum UtpEvent {
    /// The three way handshake completed.
    Connected,
    /// In order payload bytes arrived.
    Data(Bytes),
    /// The peer finished its sending side.
    Eof,
    /// The stream shut down cleanly.
    Closed,
    /// The stream failed.
    Error(UtpError),
}

/// Running totals exported by a socket.
#[derive(Copy, Clone, Default, Debug)]
pub struct UtpStats {
    pub packets_in: u64,
    pub packets_out: u64,
    pub packets_resent: u64,
    pub invalid_packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One sent packet retained until it is acknowledged.
struct OutboundPacket {
    packet_type: PacketType,
    payload: Bytes,
    num_transmissions: u32,
    need_resend: bool,
    mtu_probe: bool,
    send_time_micros: u32,
}

//----------------------------------------------------------------------------//

/// The uTP connection state machine.
///
/// The socket is purely reactive: `incoming_packet`, `write`, `close`, and
/// `tick` mutate state and append serialized datagrams to an outgoing
/// queue plus events to an event queue, both drained by the multiplexer.
/// It performs no I/O and keeps no clock of its own; callers pass the
/// current wire timestamp (wrapping microseconds) and a monotonic
/// millisecond clock.
pub struct UtpSocket {
    state: SocketState,
    send_id: u16,
    recv_id: u16,

    /// Next sequence number we will send.
    seq_nr: u16,
    /// Highest cumulatively acked sequence number of ours.
    acked_seq_nr: u16,
    /// Last in order sequence number received from the peer.
    ack_nr: u16,
    /// Holes at or past this sequence number were already fast resent.
    fast_resend_seq_nr: u16,
    /// Sequence number the last cwnd cut was charged against.
    loss_seq_nr: u16,
    /// Sequence number of the peer's FIN, once seen.
    eof_seq_nr: Option<u16>,
    /// Sequence number of our FIN, once sent.
    fin_seq_nr: Option<u16>,

    /// Peer's advertised receive window.
    adv_wnd: u32,
    /// Congestion window in 16.16 fixed point bytes.
    cwnd: i64,
    slow_start: bool,
    ssthresh: i64,
    bytes_in_flight: usize,
    /// The last send attempt was limited by cwnd, not by the application.
    cwnd_limited: bool,

    outbuf: PacketBuffer<OutboundPacket>,
    inbuf: PacketBuffer<Bytes>,

    /// User bytes waiting to be segmented.
    send_queue: VecDeque<Bytes>,
    send_queue_bytes: usize,
    /// At most one partially filled segment held back by Nagle.
    nagle_buf: Vec<u8>,

    mtu: MtuDiscovery,

    /// Smoothed round trip estimate, milliseconds.
    rtt_mean_millis: u64,
    rtt_dev_millis: u64,
    /// Monotonic deadline of the retransmission timer.
    timeout_at: Option<u64>,
    num_timeouts: u32,

    /// Delay we observe on packets from the peer, echoed back to them.
    reply_micro: u32,
    /// Our view of the peer to us path, for diagnostics.
    own_delay: DelayHistory,
    /// Peer reported one way delay of our packets, drives the cwnd.
    their_delay: DelayHistory,

    deferred_ack: bool,
    dup_ack_count: u32,

    /// Throttle for multiplicative decreases.
    last_cwnd_reduce_millis: u64,
    /// Monotonic time ErrorWait was entered.
    error_wait_since: u64,

    close_reason: Option<u16>,

    out_queue: Vec<Vec<u8>>,
    events: Vec<UtpEvent>,
    stats: UtpStats,
}

impl UtpSocket {
    fn new(send_id: u16, recv_id: u16, seq_start: u16) -> UtpSocket {
        let mtu = MtuDiscovery::new();
        let initial_cwnd = (mtu.mss() as i64) << 16;

        UtpSocket {
            state: SocketState::None,
            send_id,
            recv_id,
            seq_nr: seq_start,
            acked_seq_nr: seq_start.wrapping_sub(1),
            ack_nr: 0,
            fast_resend_seq_nr: seq_start,
            loss_seq_nr: seq_start.wrapping_sub(1),
            eof_seq_nr: None,
            fin_seq_nr: None,
            adv_wnd: mtu.mss() as u32,
            cwnd: initial_cwnd,
            slow_start: true,
            ssthresh: (RECV_BUFFER_CAP as i64) << 16,
            bytes_in_flight: 0,
            cwnd_limited: false,
            outbuf: PacketBuffer::new(MAX_PACKETS_REORDER),
            inbuf: PacketBuffer::new(MAX_PACKETS_REORDER),
            send_queue: VecDeque::new(),
            send_queue_bytes: 0,
            nagle_buf: Vec::new(),
            mtu,
            rtt_mean_millis: 0,
            rtt_dev_millis: 0,
            timeout_at: None,
            num_timeouts: 0,
            reply_micro: 0,
            own_delay: DelayHistory::new(),
            their_delay: DelayHistory::new(),
            deferred_ack: false,
            dup_ack_count: 0,
            last_cwnd_reduce_millis: 0,
            error_wait_since: 0,
            close_reason: None,
            out_queue: Vec::new(),
            events: Vec::new(),
            stats: UtpStats::default(),
        }
    }

    /// Create the initiating side of a connection, the SYN goes out
    /// immediately.
    pub fn new_outgoing(recv_id: u16, seq_start: u16, now_micros: u32, now_millis: u64) -> UtpSocket {
        let mut socket = UtpSocket::new(recv_id.wrapping_add(1), recv_id, seq_start);

        socket.state = SocketState::SynSent;
        // The SYN carries the receive id so the peer can address us.
        socket.send_reliable(PacketType::Syn, Bytes::new(), now_micros, now_millis);

        socket
    }

    /// Create the accepting side of a connection from a received SYN.
    pub fn new_incoming(syn: &UtpPacket, seq_start: u16, now_micros: u32, now_millis: u64) -> UtpSocket {
        debug_assert_eq!(PacketType::Syn, syn.packet_type);

        let mut socket = UtpSocket::new(syn.conn_id, syn.conn_id.wrapping_add(1), seq_start);

        socket.state = SocketState::Connected;
        socket.ack_nr = syn.seq_nr;
        socket.adv_wnd = syn.wnd_size;
        socket.reply_micro = now_micros.wrapping_sub(syn.timestamp_micros);
        socket.send_ack(now_micros);

        socket
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn recv_id(&self) -> u16 {
        self.recv_id
    }

    pub fn send_id(&self) -> u16 {
        self.send_id
    }

    pub fn stats(&self) -> UtpStats {
        self.stats
    }

    pub fn is_deleting(&self) -> bool {
        self.state == SocketState::Deleting
    }

    /// Serialized datagrams ready to go on the wire.
    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::replace(&mut self.out_queue, Vec::new())
    }

    /// Events for the layer above.
    pub fn take_events(&mut self) -> Vec<UtpEvent> {
        std::mem::replace(&mut self.events, Vec::new())
    }

    /// Bytes accepted for sending but not yet acknowledged end to end.
    pub fn unsent_bytes(&self) -> usize {
        self.send_queue_bytes + self.nagle_buf.len() + self.bytes_in_flight
    }

    //------------------------------------------------------------------------//

    /// Queue user bytes and push as much as the windows allow.
    pub fn write(&mut self, data: Bytes, now_micros: u32, now_millis: u64) {
        if data.is_empty() {
            return;
        }
        match self.state {
            SocketState::SynSent | SocketState::Connected => {}
            _ => return,
        }

        self.send_queue_bytes += data.len();
        self.send_queue.push_back(data);

        if self.state == SocketState::Connected {
            self.try_send_queue(now_micros, now_millis);
        }
    }

    /// Close our sending side.
    ///
    /// Pending user writes are flushed first; the FIN consumes a sequence
    /// number and is retransmitted like data.
    pub fn close(&mut self, reason: Option<u16>, now_micros: u32, now_millis: u64) {
        match self.state {
            SocketState::Connected => {
                self.close_reason = reason;
                self.try_send_queue(now_micros, now_millis);
                self.flush_nagle(now_micros, now_millis);

                self.fin_seq_nr = Some(self.seq_nr);
                self.send_reliable(PacketType::Fin, Bytes::new(), now_micros, now_millis);
                self.state = SocketState::FinSent;
            }
            SocketState::SynSent | SocketState::None => {
                self.events.push(UtpEvent::Error(UtpError::OperationAborted));
                self.enter_error_wait(now_millis);
            }
            _ => {}
        }
    }

    /// Flush a deferred acknowledgment, the drained notification hook.
    pub fn flush_deferred_ack(&mut self, now_micros: u32) {
        if self.deferred_ack {
            self.send_ack(now_micros);
        }
    }

    /// Drive timers: retransmission, deferred acks, and teardown.
    pub fn tick(&mut self, now_micros: u32, now_millis: u64) {
        if self.deferred_ack {
            self.send_ack(now_micros);
        }

        match self.state {
            SocketState::ErrorWait => {
                if now_millis.saturating_sub(self.error_wait_since) >= ERROR_WAIT_MILLIS {
                    self.state = SocketState::Deleting;
                }
                return;
            }
            SocketState::Deleting | SocketState::None => return,
            _ => {}
        }

        if let Some(deadline) = self.timeout_at {
            if now_millis >= deadline {
                self.on_timeout(now_micros, now_millis);
            }
        }
    }

    //------------------------------------------------------------------------//

    /// Feed one validated datagram into the state machine.
    pub fn incoming_packet(&mut self, packet: UtpPacket, now_micros: u32, now_millis: u64) {
        // SYN uses the reverse id, everything else must match our recv id.
        let id_ok = match packet.packet_type {
            PacketType::Syn => packet.conn_id == self.send_id,
            _ => packet.conn_id == self.recv_id,
        };
        if !id_ok {
            self.stats.invalid_packets += 1;
            return;
        }

        self.stats.packets_in += 1;

        match packet.packet_type {
            PacketType::Reset => {
                self.events.push(UtpEvent::Error(UtpError::ConnectionReset));
                self.enter_error_wait(now_millis);
                return;
            }
            PacketType::Syn => {
                // Duplicate SYN, our SYN-ACK was lost.
                if self.state == SocketState::Connected {
                    self.send_ack(now_micros);
                }
                return;
            }
            _ => {}
        }

        // Record the one way delay of this packet for the echo field.
        self.reply_micro = now_micros.wrapping_sub(packet.timestamp_micros);
        self.own_delay.add_sample(self.reply_micro, u64::from(now_micros));

        self.adv_wnd = packet.wnd_size;

        // A responsive peer resets the timeout ladder.
        self.num_timeouts = 0;

        self.process_acks(&packet, now_micros, now_millis);

        match self.state {
            SocketState::SynSent => {
                if packet.packet_type == PacketType::State
                    && wrap::seq_less(self.acked_seq_nr.wrapping_sub(1), packet.ack_nr)
                {
                    // The SYN-ACK; their first data packet will follow the
                    // sequence number carried here.
                    self.state = SocketState::Connected;
                    self.ack_nr = packet.seq_nr.wrapping_sub(1);
                    self.events.push(UtpEvent::Connected);

                    self.try_send_queue(now_micros, now_millis);
                }
            }
            SocketState::Connected | SocketState::FinSent => {
                match packet.packet_type {
                    PacketType::Data => self.process_data(packet, now_micros),
                    PacketType::Fin => self.process_fin(packet, now_micros, now_millis),
                    _ => {}
                }

                // An opened window may unblock queued data.
                if self.state == SocketState::Connected {
                    self.try_send_queue(now_micros, now_millis);
                }
            }
            _ => {}
        }

        self.reschedule_timeout(now_millis);
    }

    /// Process the cumulative ack, duplicate acks, and any SACK bitmask.
    fn process_acks(&mut self, packet: &UtpPacket, now_micros: u32, now_millis: u64) {
        let mut acked_bytes = 0usize;
        let flight_before = self.bytes_in_flight;

        // Cumulative portion: everything at or before ack_nr.
        while wrap::seq_less(self.acked_seq_nr, packet.ack_nr) {
            let seq = self.acked_seq_nr.wrapping_add(1);

            if let Some(out_packet) = self.outbuf.remove(seq) {
                acked_bytes += out_packet.payload.len();
                if !out_packet.need_resend {
                    self.bytes_in_flight -= out_packet.payload.len();
                }

                // Karn's rule: only first transmissions sample the RTT.
                if out_packet.num_transmissions == 1 {
                    let sample_millis =
                        u64::from(now_micros.wrapping_sub(out_packet.send_time_micros)) / 1000;
                    self.update_rtt(sample_millis);
                }

                if out_packet.mtu_probe {
                    self.mtu.probe_acked(seq);
                }
            }

            self.acked_seq_nr = seq;
            self.dup_ack_count = 0;
        }

        // Duplicate ack counting on the exact cumulative sequence number.
        if packet.packet_type == PacketType::State
            && packet.ack_nr == self.acked_seq_nr
            && acked_bytes == 0
            && self.outbuf.contains(self.acked_seq_nr.wrapping_add(1))
        {
            self.dup_ack_count += 1;

            if self.dup_ack_count == DUP_ACK_LIMIT {
                let resend_seq = self.acked_seq_nr.wrapping_add(1);
                self.resend_packet(resend_seq, now_micros);
                self.experienced_loss(resend_seq, now_millis);
                self.dup_ack_count = 0;
            }
        }

        // Grow on the cumulative progress before loss processing so a cut
        // in the same packet is not immediately papered over.
        if acked_bytes > 0 {
            self.maybe_grow_cwnd(acked_bytes, flight_before);
        }

        if let Some(sack) = packet.sack() {
            self.process_sack(sack, packet.ack_nr, now_micros, now_millis);
        }

        // Our FIN was acknowledged, the stream is fully closed.
        if let Some(fin_seq) = self.fin_seq_nr {
            if self.state == SocketState::FinSent && wrap::seq_less_equal(fin_seq, self.acked_seq_nr) {
                self.events.push(UtpEvent::Closed);
                self.enter_error_wait(now_millis);
            }
        }
    }

    /// Handle a selective ack bitmask anchored past the cumulative ack.
    ///
    /// Bit i covers sequence number ack_nr + 2 + i. Holes followed by later
    /// set bits are fast resent, tail gaps are left to the retransmission
    /// timer.
    fn process_sack(&mut self, sack: &[u8], ack_nr: u16, now_micros: u32, now_millis: u64) {
        let mut acked_count = 0u32;
        let mut highest_acked = None;

        let base = ack_nr.wrapping_add(2);
        for (byte_index, byte) in sack.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let seq = wrap::seq_add(base, (byte_index * 8 + bit) as u16);

                // Bits at or before the cumulative ack are stale.
                if wrap::seq_less_equal(seq, self.acked_seq_nr) {
                    continue;
                }

                acked_count += 1;
                highest_acked = Some(seq);

                if let Some(out_packet) = self.outbuf.remove(seq) {
                    if !out_packet.need_resend {
                        self.bytes_in_flight -= out_packet.payload.len();
                    }
                    if out_packet.mtu_probe {
                        self.mtu.probe_acked(seq);
                    }
                }
            }
        }

        let highest_acked = match highest_acked {
            Some(seq) => seq,
            None => return,
        };

        // Enough packets past the hole arrived, resend what is missing.
        if acked_count > DUP_ACK_LIMIT {
            let mut resent = 0;
            let mut seq = self.acked_seq_nr.wrapping_add(1);
            let mut lost_seq = None;

            while wrap::seq_less(seq, highest_acked) && resent < SACK_RESEND_LIMIT {
                if self.outbuf.contains(seq) && wrap::seq_less_equal(self.fast_resend_seq_nr, seq) {
                    self.resend_packet(seq, now_micros);
                    lost_seq = Some(seq);
                    resent += 1;
                }
                seq = seq.wrapping_add(1);
            }

            if let Some(lost_seq) = lost_seq {
                self.fast_resend_seq_nr = lost_seq.wrapping_add(1);
                self.experienced_loss(lost_seq, now_millis);
            }
        }
    }

    /// In order and out of order data delivery.
    fn process_data(&mut self, packet: UtpPacket, now_micros: u32) {
        if self.recv_window_exceeded(packet.seq_nr) {
            self.stats.invalid_packets += 1;
            return;
        }

        let next_seq = self.ack_nr.wrapping_add(1);

        if packet.seq_nr == next_seq {
            self.deliver(packet.payload);
            self.ack_nr = next_seq;
            self.drain_reorder_buffer();
            self.deferred_ack = true;
        } else if wrap::seq_less(self.ack_nr, packet.seq_nr) {
            // Out of order, park it and tell the sender what we have.
            self.inbuf.insert(packet.seq_nr, packet.payload);
            self.send_ack(now_micros);
        } else {
            // Duplicate of something already delivered, just re ack.
            self.deferred_ack = true;
        }

        self.maybe_deliver_eof();
    }

    fn process_fin(&mut self, packet: UtpPacket, now_micros: u32, _now_millis: u64) {
        if self.eof_seq_nr.is_none() {
            self.eof_seq_nr = Some(packet.seq_nr);
        }
        if packet.close_reason().is_some() && self.close_reason.is_none() {
            self.close_reason = packet.close_reason();
        }

        self.maybe_deliver_eof();
        self.send_ack(now_micros);
    }

    /// Once every byte before the FIN arrived, surface the end of stream.
    fn maybe_deliver_eof(&mut self) {
        let eof_seq = match self.eof_seq_nr {
            Some(seq) => seq,
            None => return,
        };

        if self.ack_nr.wrapping_add(1) == eof_seq {
            self.ack_nr = eof_seq;
            self.eof_seq_nr = None;
            self.events.push(UtpEvent::Eof);
            self.deferred_ack = true;
        }
    }

    fn deliver(&mut self, payload: Bytes) {
        self.stats.bytes_received += payload.len() as u64;

        if !payload.is_empty() {
            self.events.push(UtpEvent::Data(payload));
        }
    }

    fn drain_reorder_buffer(&mut self) {
        loop {
            let next_seq = self.ack_nr.wrapping_add(1);

            match self.inbuf.remove(next_seq) {
                Some(payload) => {
                    self.deliver(payload);
                    self.ack_nr = next_seq;
                }
                None => break,
            }
        }
    }

    /// Sequence numbers further out than the receive window are dropped.
    fn recv_window_exceeded(&self, seq: u16) -> bool {
        let window = cmp::max(16, RECV_BUFFER_CAP / 1100) as u16;

        wrap::seq_distance(self.ack_nr, seq) > window
    }

    //------------------------------------------------------------------------//

    /// Push queued user bytes within the congestion and peer windows.
    fn try_send_queue(&mut self, now_micros: u32, now_millis: u64) {
        self.cwnd_limited = false;

        loop {
            let available = self.nagle_buf.len() + self.send_queue_bytes;
            if available == 0 {
                break;
            }

            let probing = self.mtu.wants_probe(self.cwnd_bytes()) && available >= self.mtu.probe_payload();
            let target = if probing { self.mtu.probe_payload() } else { self.mtu.mss() };
            let segment_len = cmp::min(target, available);

            // Nagle: hold a short segment while anything is in flight.
            if segment_len < target && self.bytes_in_flight > 0 {
                self.coalesce_into_nagle();
                break;
            }

            let window = cmp::min(self.cwnd_bytes(), self.adv_wnd as usize);
            if self.bytes_in_flight + segment_len > window {
                self.cwnd_limited = true;
                break;
            }

            let payload = self.assemble_segment(segment_len);
            let seq = self.seq_nr;
            self.send_reliable(PacketType::Data, payload, now_micros, now_millis);

            if probing {
                self.mtu.probe_sent(seq);
                if let Some(out_packet) = self.outbuf.get_mut(seq) {
                    out_packet.mtu_probe = true;
                }
            }
        }
    }

    /// Move every queued byte into the Nagle buffer.
    fn coalesce_into_nagle(&mut self) {
        while let Some(chunk) = self.send_queue.pop_front() {
            self.send_queue_bytes -= chunk.len();
            self.nagle_buf.extend_from_slice(&chunk);
        }
    }

    /// Ship the Nagle buffer even when short, used before a FIN.
    fn flush_nagle(&mut self, now_micros: u32, now_millis: u64) {
        self.coalesce_into_nagle();
        if self.nagle_buf.is_empty() {
            return;
        }

        let payload = Bytes::from(std::mem::replace(&mut self.nagle_buf, Vec::new()));
        self.send_reliable(PacketType::Data, payload, now_micros, now_millis);
    }

    /// Take exactly `length` bytes from the Nagle buffer and send queue.
    fn assemble_segment(&mut self, length: usize) -> Bytes {
        let mut segment = Vec::with_capacity(length);

        if !self.nagle_buf.is_empty() {
            let take = cmp::min(length, self.nagle_buf.len());
            segment.extend_from_slice(&self.nagle_buf[..take]);
            self.nagle_buf.drain(..take);
        }

        while segment.len() < length {
            let mut chunk = self.send_queue.pop_front().expect("bep_utp: Send Queue Under Accounted");
            let take = cmp::min(length - segment.len(), chunk.len());

            let taken = chunk.split_to(take);
            segment.extend_from_slice(&taken);
            self.send_queue_bytes -= take;

            if !chunk.is_empty() {
                self.send_queue.push_front(chunk);
            }
        }

        Bytes::from(segment)
    }

    /// Send a packet that consumes a sequence number and awaits an ack.
    fn send_reliable(&mut self, packet_type: PacketType, payload: Bytes, now_micros: u32, now_millis: u64) {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);

        let packet = self.build_packet(packet_type, seq, payload.clone(), now_micros);
        self.transmit(&packet);

        self.bytes_in_flight += payload.len();
        self.outbuf.insert(
            seq,
            OutboundPacket {
                packet_type,
                payload,
                num_transmissions: 1,
                need_resend: false,
                mtu_probe: false,
                send_time_micros: now_micros,
            },
        );

        self.reschedule_timeout(now_millis);
    }

    /// Retransmit the packet stored at the given sequence number.
    fn resend_packet(&mut self, seq: u16, now_micros: u32) {
        let (packet_type, payload, was_marked) = {
            let out_packet = match self.outbuf.get_mut(seq) {
                Some(out_packet) => out_packet,
                None => return,
            };

            let was_marked = out_packet.need_resend;
            out_packet.need_resend = false;
            out_packet.num_transmissions += 1;
            out_packet.send_time_micros = now_micros;
            out_packet.mtu_probe = false;

            (out_packet.packet_type, out_packet.payload.clone(), was_marked)
        };

        // A packet waiting for resend was out of the flight accounting,
        // the retransmission puts it back.
        if was_marked {
            self.bytes_in_flight += payload.len();
        }

        let packet = self.build_packet(packet_type, seq, payload, now_micros);
        self.transmit(&packet);
        self.stats.packets_resent += 1;
    }

    /// Sum the flight bytes from the send buffer state.
    fn recompute_bytes_in_flight(&mut self) {
        let mut flight = 0;

        let mut seq = self.acked_seq_nr.wrapping_add(1);
        while seq != self.seq_nr {
            if let Some(out_packet) = self.outbuf.get(seq) {
                if !out_packet.need_resend {
                    flight += out_packet.payload.len();
                }
            }
            seq = seq.wrapping_add(1);
        }

        self.bytes_in_flight = flight;
    }

    /// Immediate ST_STATE carrying the current ack and SACK state.
    fn send_ack(&mut self, now_micros: u32) {
        self.deferred_ack = false;

        let packet = self.build_packet(PacketType::State, self.seq_nr, Bytes::new(), now_micros);
        self.transmit(&packet);
    }

    /// Build a packet with the current header fields.
    fn build_packet(&self, packet_type: PacketType, seq: u16, payload: Bytes, now_micros: u32) -> UtpPacket {
        let mut extensions = Vec::new();

        if let Some(sack) = self.build_sack() {
            extensions.push(PacketExtension::Sack(sack));
        }
        if packet_type == PacketType::Fin || packet_type == PacketType::Reset {
            if let Some(reason) = self.close_reason {
                extensions.push(PacketExtension::CloseReason(reason));
            }
        }

        // The SYN addresses the peer with our receive id.
        let conn_id = match packet_type {
            PacketType::Syn => self.recv_id,
            _ => self.send_id,
        };

        UtpPacket {
            packet_type,
            conn_id,
            timestamp_micros: now_micros,
            timestamp_diff_micros: self.reply_micro,
            wnd_size: self.recv_window(),
            seq_nr: seq,
            ack_nr: self.ack_nr,
            extensions,
            payload,
        }
    }

    /// Bitmask of out of order packets held past the cumulative ack.
    fn build_sack(&self) -> Option<Vec<u8>> {
        if self.inbuf.is_empty() {
            return None;
        }

        let base = self.ack_nr.wrapping_add(2);
        let mut mask = vec![0u8; MAX_SACK_BYTES];
        let mut last_byte = 0;

        for offset in 0..(MAX_SACK_BYTES * 8) as u16 {
            if self.inbuf.contains(wrap::seq_add(base, offset)) {
                let byte_index = (offset / 8) as usize;
                mask[byte_index] |= 1 << (offset % 8);
                last_byte = byte_index;
            }
        }

        mask.truncate(((last_byte / 4) + 1) * 4);
        Some(mask)
    }

    fn recv_window(&self) -> u32 {
        // Parked out of order payloads count against the buffer.
        let mut buffered = 0;
        let base = self.ack_nr.wrapping_add(1);
        for seq in self.inbuf.occupied_range(base, base.wrapping_add(MAX_PACKETS_REORDER as u16)) {
            if let Some(payload) = self.inbuf.get(seq) {
                buffered += payload.len();
            }
        }

        (RECV_BUFFER_CAP - cmp::min(buffered, RECV_BUFFER_CAP)) as u32
    }

    fn transmit(&mut self, packet: &UtpPacket) {
        let mut buffer = Vec::with_capacity(packet.wire_len());
        packet
            .write_bytes(&mut buffer)
            .expect("bep_utp: Failed To Serialize Packet Into Vec");

        self.stats.packets_out += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;
        self.out_queue.push(buffer);
    }

    //------------------------------------------------------------------------//

    fn cwnd_bytes(&self) -> usize {
        (self.cwnd >> 16) as usize
    }

    /// LEDBAT style window update on acknowledged bytes.
    fn maybe_grow_cwnd(&mut self, acked_bytes: usize, flight_before: usize) {
        // Growing without being the bottleneck would inflate the window
        // indefinitely while the application idles.
        if !self.cwnd_limited && flight_before + self.mtu.mss() < self.cwnd_bytes() {
            return;
        }

        let delay = i64::from(self.their_delay.queuing_delay());
        let target = TARGET_DELAY_MICROS;

        if self.slow_start {
            if delay >= target || self.cwnd + ((acked_bytes as i64) << 16) >= self.ssthresh {
                self.slow_start = false;
                self.ssthresh = self.cwnd;
            } else {
                self.cwnd += (acked_bytes as i64) << 16;
                return;
            }
        }

        let off_target = target - delay;
        let flight = cmp::max(flight_before, 1) as i64;

        let window_factor = ((acked_bytes as i64) << 16) / flight;
        let delay_factor = (off_target << 16) / target;
        let scaled_gain = ((window_factor * delay_factor) >> 16) * MAX_CWND_INCREASE_BYTES;

        self.cwnd += scaled_gain;

        let floor = (self.mtu.mss() as i64) << 16;
        if self.cwnd < floor {
            self.cwnd = floor;
        }
    }

    /// Multiplicative decrease, throttled and charged to a sequence number.
    fn experienced_loss(&mut self, seq: u16, now_millis: u64) {
        // Only one cut per window of data; the triggering sequence number
        // must be beyond the last cut.
        if !wrap::seq_less(self.loss_seq_nr, seq) {
            return;
        }
        if now_millis.saturating_sub(self.last_cwnd_reduce_millis) < CWND_REDUCE_TIMER_MILLIS {
            return;
        }

        self.cwnd /= 2;
        let floor = (self.mtu.mss() as i64) << 16;
        if self.cwnd < floor {
            self.cwnd = floor;
        }

        // Half the pre cut window, which is where the cut landed.
        self.ssthresh = self.cwnd;
        self.slow_start = false;
        self.loss_seq_nr = self.seq_nr;
        self.last_cwnd_reduce_millis = now_millis;
    }

    fn update_rtt(&mut self, sample_millis: u64) {
        if self.rtt_mean_millis == 0 {
            self.rtt_mean_millis = sample_millis;
            self.rtt_dev_millis = sample_millis / 2;
            return;
        }

        let err = sample_millis as i64 - self.rtt_mean_millis as i64;
        self.rtt_mean_millis = (self.rtt_mean_millis as i64 + err / 8) as u64;
        self.rtt_dev_millis = (self.rtt_dev_millis as i64 + (err.abs() - self.rtt_dev_millis as i64) / 4) as u64;
    }

    /// Current retransmission timeout per the ladder.
    fn packet_timeout(&self) -> u64 {
        if self.state == SocketState::SynSent {
            return SYN_TIMEOUT_MILLIS;
        }

        let base = cmp::max(MIN_TIMEOUT_MILLIS, self.rtt_mean_millis + 2 * self.rtt_dev_millis);
        let backoff = if self.num_timeouts > 0 {
            (1u64 << (self.num_timeouts - 1)) * 1000
        } else {
            0
        };

        cmp::min(base + backoff, MAX_TIMEOUT_MILLIS)
    }

    fn reschedule_timeout(&mut self, now_millis: u64) {
        if self.outbuf.is_empty() {
            self.timeout_at = None;
        } else {
            self.timeout_at = Some(now_millis + self.packet_timeout());
        }
    }

    /// The retransmission timer fired.
    fn on_timeout(&mut self, now_micros: u32, now_millis: u64) {
        self.num_timeouts += 1;

        let resend_limit = match self.state {
            SocketState::SynSent => SYN_RESENDS,
            SocketState::FinSent => FIN_RESENDS,
            _ => NUM_RESENDS,
        };
        if self.num_timeouts > resend_limit {
            self.events.push(UtpEvent::Error(UtpError::Timeout));
            self.enter_error_wait(now_millis);
            return;
        }

        // A timeout that reaps only the MTU probe indicts the probe size,
        // not the path.
        let next_seq = self.acked_seq_nr.wrapping_add(1);
        let only_probe = self.outbuf.len() == 1 && self.mtu.is_probe(next_seq);
        if only_probe {
            self.mtu.probe_failed();
            self.num_timeouts -= 1;
        } else {
            // Collapse the window and fall back to slow start.
            self.cwnd = (self.mtu.mss() as i64) << 16;
            self.ssthresh = self.cwnd / 2;
            self.slow_start = true;
        }

        // Everything unacked is presumed lost.
        let mut seq = next_seq;
        while seq != self.seq_nr {
            if let Some(out_packet) = self.outbuf.get_mut(seq) {
                out_packet.need_resend = true;
            }
            seq = seq.wrapping_add(1);
        }
        self.recompute_bytes_in_flight();

        // Resend the oldest outstanding packet; the rest follow as the
        // acks come back.
        self.resend_packet(next_seq, now_micros);
        self.reschedule_timeout(now_millis);
    }

    fn enter_error_wait(&mut self, now_millis: u64) {
        if self.state == SocketState::ErrorWait || self.state == SocketState::Deleting {
            return;
        }

        self.state = SocketState::ErrorWait;
        self.error_wait_since = now_millis;
        self.timeout_at = None;
        self.deferred_ack = false;
        self.outbuf.clear();
        self.inbuf.clear();
        self.send_queue.clear();
        self.send_queue_bytes = 0;
        self.nagle_buf.clear();
        self.bytes_in_flight = 0;
    }

    /// Structural invariants, exercised by the unit tests.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        let mut flight = 0;

        let mut seq = self.acked_seq_nr.wrapping_add(1);
        while seq != self.seq_nr {
            if let Some(out_packet) = self.outbuf.get(seq) {
                if !out_packet.need_resend {
                    flight += out_packet.payload.len();
                }
            }
            seq = seq.wrapping_add(1);
        }

        assert_eq!(self.bytes_in_flight, flight);
        assert!(self.cwnd_bytes() >= self.mtu.mss() || self.state == SocketState::ErrorWait);
    }
}

#[cfg(test)]
mod tests {
    use super::{SocketState, UtpEvent, UtpSocket};
    use crate::error::UtpError;
    use crate::packet::{PacketExtension, PacketType, UtpPacket};

    use bytes::Bytes;
    use nom::IResult;

    fn parse(bytes: &[u8]) -> UtpPacket {
        match UtpPacket::from_bytes(bytes) {
            IResult::Done(_, packet) => packet,
            other => panic!("Failed To Parse Test Packet: {:?}", other),
        }
    }

    /// Pump every outgoing datagram of `from` into `to`.
    fn shuttle(from: &mut UtpSocket, to: &mut UtpSocket, now_micros: u32, now_millis: u64) -> usize {
        let datagrams = from.take_outgoing();
        let count = datagrams.len();

        for datagram in datagrams {
            to.incoming_packet(parse(&datagram), now_micros, now_millis);
        }

        count
    }

    fn connect_pair() -> (UtpSocket, UtpSocket) {
        let mut initiator = UtpSocket::new_outgoing(100, 500, 0, 0);
        assert_eq!(SocketState::SynSent, initiator.state());

        let syn = parse(&initiator.take_outgoing().pop().unwrap());
        assert_eq!(PacketType::Syn, syn.packet_type);
        assert_eq!(100, syn.conn_id);
        assert_eq!(500, syn.seq_nr);

        let mut acceptor = UtpSocket::new_incoming(&syn, 8000, 0, 0);
        assert_eq!(SocketState::Connected, acceptor.state());
        assert_eq!(101, acceptor.recv_id());
        assert_eq!(100, acceptor.send_id());

        let syn_ack = parse(&acceptor.take_outgoing().pop().unwrap());
        assert_eq!(PacketType::State, syn_ack.packet_type);
        assert_eq!(500, syn_ack.ack_nr);
        assert_eq!(100, syn_ack.conn_id);

        initiator.incoming_packet(syn_ack, 100, 0);
        assert_eq!(SocketState::Connected, initiator.state());

        let events = initiator.take_events();
        assert!(events.iter().any(|event| match event {
            UtpEvent::Connected => true,
            _ => false,
        }));

        (initiator, acceptor)
    }

    /// Craft an ST_STATE addressed to the given socket.
    fn state_packet(to: &UtpSocket, ack_nr: u16, extensions: Vec<PacketExtension>) -> UtpPacket {
        UtpPacket {
            packet_type: PacketType::State,
            conn_id: to.recv_id(),
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            wnd_size: 1 << 20,
            seq_nr: 9999,
            ack_nr,
            extensions,
            payload: Bytes::new(),
        }
    }

    /// Craft an ST_DATA addressed to the given socket.
    fn data_packet(to: &UtpSocket, seq_nr: u16, payload: &[u8]) -> UtpPacket {
        UtpPacket {
            packet_type: PacketType::Data,
            conn_id: to.recv_id(),
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            wnd_size: 1 << 20,
            seq_nr,
            ack_nr: to.seq_nr.wrapping_sub(1),
            extensions: Vec::new(),
            payload: Bytes::from(payload.to_vec()),
        }
    }

    fn received_data(events: Vec<UtpEvent>) -> Vec<u8> {
        let mut data = Vec::new();

        for event in events {
            if let UtpEvent::Data(payload) = event {
                data.extend_from_slice(&payload);
            }
        }

        data
    }

    #[test]
    fn positive_handshake_both_sides() {
        let (initiator, acceptor) = connect_pair();

        initiator.check_invariants();
        acceptor.check_invariants();
    }

    #[test]
    fn positive_in_order_transfer() {
        let (mut a, mut b) = connect_pair();
        let payload = vec![0xA5u8; 400];

        a.write(Bytes::from(payload.clone()), 1000, 1);
        assert_eq!(1, shuttle(&mut a, &mut b, 1100, 1));

        assert_eq!(payload, received_data(b.take_events()));
        b.flush_deferred_ack(1200);
        shuttle(&mut b, &mut a, 1300, 1);

        assert_eq!(0, a.bytes_in_flight);
        a.check_invariants();
        b.check_invariants();
    }

    #[test]
    fn positive_nagle_holds_short_segments() {
        let (mut a, _b) = connect_pair();

        // First short write ships immediately, nothing is in flight.
        a.write(Bytes::from(vec![1u8; 100]), 1000, 1);
        assert_eq!(1, a.take_outgoing().len());

        // Further short writes coalesce while the first is unacked.
        a.write(Bytes::from(vec![2u8; 50]), 2000, 2);
        a.write(Bytes::from(vec![3u8; 60]), 3000, 3);
        assert_eq!(0, a.take_outgoing().len());

        // The ack releases the coalesced segment in one piece.
        let ack = state_packet(&a, a.seq_nr.wrapping_sub(1), Vec::new());
        a.incoming_packet(ack, 4000, 4);

        let sent = a.take_outgoing();
        assert_eq!(1, sent.len());
        assert_eq!(110, parse(&sent[0]).payload.len());
        a.check_invariants();
    }

    #[test]
    fn positive_out_of_order_reorder_and_sack() {
        let (_a, mut b) = connect_pair();
        let next = b.ack_nr.wrapping_add(1);

        // In order packet delivers immediately.
        b.incoming_packet(data_packet(&b, next, b"first"), 1000, 1);
        assert_eq!(b"first".to_vec(), received_data(b.take_events()));

        // A gap parks the payload and forces an immediate sack.
        b.incoming_packet(data_packet(&b, next.wrapping_add(2), b"third"), 2000, 2);
        assert!(received_data(b.take_events()).is_empty());

        let acks = b.take_outgoing();
        let sack_packet = parse(acks.last().unwrap());
        let sack = sack_packet.sack().expect("Expected A Sack On The Out Of Order Ack");
        // Bit zero covers ack_nr + 2, exactly the parked packet.
        assert_eq!(1, sack[0] & 1);

        // Filling the gap drains the reorder buffer in order.
        b.incoming_packet(data_packet(&b, next.wrapping_add(1), b"second"), 3000, 3);
        assert_eq!(b"secondthird".to_vec(), received_data(b.take_events()));
        b.check_invariants();
    }

    #[test]
    fn positive_sack_triggers_selective_retransmit() {
        let (mut a, _b) = connect_pair();
        let mss = a.mtu.mss();

        // Open the window wide enough for ten segments.
        a.cwnd = ((12 * mss) as i64) << 16;
        a.write(Bytes::from(vec![7u8; 10 * mss]), 1000, 1);

        let sent = a.take_outgoing();
        assert_eq!(10, sent.len());
        let first_seq = parse(&sent[0]).seq_nr;
        let cwnd_before = a.cwnd_bytes();

        // Peer reports seven packets past the holes at +0 and +2.
        // Bitmask base is ack_nr + 2: bits 2..=8 cover seq +3 through +9.
        let mask = vec![0b1111_1100u8, 0b0000_0001, 0, 0];
        let sack_state = state_packet(&a, first_seq.wrapping_sub(1), vec![PacketExtension::Sack(mask)]);
        a.incoming_packet(sack_state, 2000, 500);

        // The holes were fast resent, up to the per message limit.
        let resent: Vec<u16> = a.take_outgoing().iter().map(|datagram| parse(datagram).seq_nr).collect();
        assert!(resent.contains(&first_seq));
        assert!(resent.contains(&first_seq.wrapping_add(2)));

        // One multiplicative decrease, slow start over.
        assert_eq!(cwnd_before / 2, a.cwnd_bytes());
        assert_eq!(a.cwnd, a.ssthresh);
        assert!(!a.slow_start);
        a.check_invariants();
    }

    #[test]
    fn positive_sack_tail_gap_not_resent() {
        let (mut a, _b) = connect_pair();
        let mss = a.mtu.mss();

        a.cwnd = ((12 * mss) as i64) << 16;
        a.write(Bytes::from(vec![7u8; 10 * mss]), 1000, 1);

        let sent = a.take_outgoing();
        let first_seq = parse(&sent[0]).seq_nr;

        // Only four packets acked, the tail past them is a gap but has no
        // later acks vouching for its loss.
        let mask = vec![0b0011_1100u8, 0, 0, 0];
        let sack_state = state_packet(&a, first_seq.wrapping_sub(1), vec![PacketExtension::Sack(mask)]);
        a.incoming_packet(sack_state, 2000, 500);

        let resent: Vec<u16> = a.take_outgoing().iter().map(|datagram| parse(datagram).seq_nr).collect();
        // Holes before the highest ack go out again, the tail stays put.
        assert!(resent.contains(&first_seq));
        assert!(!resent.iter().any(|&seq| seq == first_seq.wrapping_add(6)));
        a.check_invariants();
    }

    #[test]
    fn positive_duplicate_acks_fast_resend() {
        let (mut a, _b) = connect_pair();
        let mss = a.mtu.mss();

        a.cwnd = ((4 * mss) as i64) << 16;
        a.write(Bytes::from(vec![9u8; 2 * mss]), 1000, 1);
        let sent = a.take_outgoing();
        assert_eq!(2, sent.len());
        let first_seq = parse(&sent[0]).seq_nr;

        // Three duplicate acks for the packet before the hole.
        for round in 0..3 {
            let dup = state_packet(&a, first_seq.wrapping_sub(1), Vec::new());
            a.incoming_packet(dup, 2000 + round, 500);
        }

        let resent: Vec<u16> = a.take_outgoing().iter().map(|datagram| parse(datagram).seq_nr).collect();
        assert!(resent.contains(&first_seq));
        a.check_invariants();
    }

    #[test]
    fn positive_timeout_ladder_to_error_wait() {
        let (mut a, _b) = connect_pair();

        a.write(Bytes::from(vec![1u8; 100]), 1000, 1);
        assert_eq!(1, a.take_outgoing().len());

        let mut now_millis = 1;
        for _ in 0..super::NUM_RESENDS {
            now_millis = a.timeout_at.expect("Expected A Pending Timeout");
            a.tick(0, now_millis);

            assert_eq!(SocketState::Connected, a.state());
            assert_eq!(1, a.take_outgoing().len());
        }

        // One past the resend budget tears the stream down.
        now_millis = a.timeout_at.expect("Expected A Pending Timeout");
        a.tick(0, now_millis);

        assert_eq!(SocketState::ErrorWait, a.state());
        assert!(a.take_events().iter().any(|event| match event {
            UtpEvent::Error(UtpError::Timeout) => true,
            _ => false,
        }));

        // The linger expires into Deleting for the multiplexer to reap.
        a.tick(0, now_millis + super::ERROR_WAIT_MILLIS);
        assert!(a.is_deleting());
    }

    #[test]
    fn positive_syn_timeout_is_fixed() {
        let mut a = UtpSocket::new_outgoing(42, 700, 0, 0);
        a.take_outgoing();

        assert_eq!(Some(super::SYN_TIMEOUT_MILLIS), a.timeout_at);

        a.tick(0, super::SYN_TIMEOUT_MILLIS);
        let resent = a.take_outgoing();
        assert_eq!(1, resent.len());
        assert_eq!(PacketType::Syn, parse(&resent[0]).packet_type);
    }

    #[test]
    fn positive_fin_handshake() {
        let (mut a, mut b) = connect_pair();

        a.close(None, 1000, 1);
        assert_eq!(SocketState::FinSent, a.state());

        shuttle(&mut a, &mut b, 1100, 1);
        assert!(b.take_events().iter().any(|event| match event {
            UtpEvent::Eof => true,
            _ => false,
        }));

        // The FIN ack closes our side cleanly.
        shuttle(&mut b, &mut a, 1200, 2);
        assert_eq!(SocketState::ErrorWait, a.state());
        assert!(a.take_events().iter().any(|event| match event {
            UtpEvent::Closed => true,
            _ => false,
        }));
    }

    #[test]
    fn positive_reset_enters_error_wait() {
        let (mut a, _b) = connect_pair();

        let reset = UtpPacket {
            packet_type: PacketType::Reset,
            conn_id: a.recv_id(),
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            wnd_size: 0,
            seq_nr: 0,
            ack_nr: 0,
            extensions: Vec::new(),
            payload: Bytes::new(),
        };
        a.incoming_packet(reset, 1000, 1);

        assert_eq!(SocketState::ErrorWait, a.state());
        assert!(a.take_events().iter().any(|event| match event {
            UtpEvent::Error(UtpError::ConnectionReset) => true,
            _ => false,
        }));
    }

    #[test]
    fn negative_wrong_conn_id_dropped() {
        let (mut a, _b) = connect_pair();

        let mut bogus = data_packet(&a, a.ack_nr.wrapping_add(1), b"spoof");
        bogus.conn_id = a.recv_id().wrapping_add(7);
        a.incoming_packet(bogus, 1000, 1);

        assert!(a.take_events().is_empty());
        assert_eq!(1, a.stats().invalid_packets);
    }

    #[test]
    fn negative_data_outside_window_dropped() {
        let (_a, mut b) = connect_pair();

        let wild_seq = b.ack_nr.wrapping_add(20_000);
        b.incoming_packet(data_packet(&b, wild_seq, b"way out"), 1000, 1);

        assert!(received_data(b.take_events()).is_empty());
        assert_eq!(1, b.stats().invalid_packets);
    }
}
