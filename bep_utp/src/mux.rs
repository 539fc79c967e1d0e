//! Demultiplexing of uTP streams over one UDP socket.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use futures::{Async, Future, Poll, Sink, StartSend, Stream};
use nom::IResult;
use tokio_core::net::UdpSocket;
use tokio_core::reactor::{Handle, Timeout};

use crate::error::UtpError;
use crate::packet::{PacketType, UtpPacket};
use crate::socket::{UtpEvent, UtpSocket};

use bep_util::trans::{SequentialIds, TransactionIds};

/// Millis between timer sweeps over the sockets.
const TICK_INTERVAL_MILLIS: u64 = 100;

/// Buffered commands before the user sink applies backpressure.
const COMMAND_CAPACITY: usize = 128;

/// Receive buffer large enough for any datagram we accept.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Handle identifying one uTP stream to the user.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct UtpToken(u64);

/// Messages that can be sent to the `UtpSocketManager`.
#[derive(Debug)]
pub enum IUtpMessage {
    /// Open a stream to the given peer.
    Connect(SocketAddr),
    /// Queue bytes on the given stream.
    Send(UtpToken, Bytes),
    /// Close the sending side of the given stream.
    Close(UtpToken),
}

/// Messages that can be received from the `UtpSocketManager`.
#[derive(Debug)]
pub enum OUtpMessage {
    /// An outgoing connection completed its handshake.
    Connected(UtpToken, SocketAddr),
    /// A peer opened a stream to us.
    Incoming(UtpToken, SocketAddr),
    /// In order bytes arrived on a stream.
    Data(UtpToken, Bytes),
    /// The peer finished its sending side of a stream.
    Eof(UtpToken),
    /// A stream shut down cleanly.
    Closed(UtpToken),
    /// A stream failed.
    Error(UtpToken, UtpError),
}

/// User facing handle: a `Sink` of commands and a `Stream` of events.
///
/// The actual socket work happens on a driver future spawned onto the
/// caller's event loop; every stream is identified by the token handed
/// out in `Connected`/`Incoming`.
pub struct UtpSocketManager {
    send: Sender<IUtpMessage>,
    recv: UnboundedReceiver<OUtpMessage>,
    local_addr: SocketAddr,
}

impl UtpSocketManager {
    /// Bind a UDP socket and spawn the multiplexer onto the event loop.
    pub fn new(bind: SocketAddr, handle: &Handle) -> io::Result<UtpSocketManager> {
        let udp = UdpSocket::bind(&bind, handle)?;
        let local_addr = udp.local_addr()?;

        let (cmd_send, cmd_recv) = mpsc::channel(COMMAND_CAPACITY);
        let (event_send, event_recv) = mpsc::unbounded();

        handle.spawn(MuxDriver::new(udp, handle.clone(), cmd_recv, event_send));

        Ok(UtpSocketManager { send: cmd_send, recv: event_recv, local_addr })
    }

    /// Address the underlying UDP socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Sink for UtpSocketManager {
    type SinkItem = IUtpMessage;
    type SinkError = ();

    fn start_send(&mut self, item: IUtpMessage) -> StartSend<IUtpMessage, ()> {
        self.send.start_send(item).map_err(|_| ())
    }

    fn poll_complete(&mut self) -> Poll<(), ()> {
        self.send.poll_complete().map_err(|_| ())
    }
}

impl Stream for UtpSocketManager {
    type Item = OUtpMessage;
    type Error = ();

    fn poll(&mut self) -> Poll<Option<OUtpMessage>, ()> {
        self.recv.poll()
    }
}

//----------------------------------------------------------------------------//

struct SocketEntry {
    socket: UtpSocket,
    token: UtpToken,
    addr: SocketAddr,
}

/// The multiplexer driver, one per bound UDP socket.
///
/// Runs entirely on the event loop thread: drains user commands, routes
/// datagrams to the socket matching (remote address, connection id),
/// sweeps timers every hundred milliseconds, and flushes queued
/// datagrams while respecting UDP would block.
struct MuxDriver {
    udp: UdpSocket,
    handle: Handle,
    commands: Receiver<IUtpMessage>,
    events: UnboundedSender<OUtpMessage>,
    sockets: HashMap<(SocketAddr, u16), SocketEntry>,
    tokens: HashMap<UtpToken, (SocketAddr, u16)>,
    token_ids: SequentialIds,
    tick: Timeout,
    started: Instant,
    recv_buffer: Vec<u8>,
    pending_sends: VecDeque<(Vec<u8>, SocketAddr)>,
    shutting_down: bool,
    invalid_packets: u64,
}

impl MuxDriver {
    fn new(
        udp: UdpSocket,
        handle: Handle,
        commands: Receiver<IUtpMessage>,
        events: UnboundedSender<OUtpMessage>,
    ) -> MuxDriver {
        let tick = Timeout::new(Duration::from_millis(TICK_INTERVAL_MILLIS), &handle)
            .expect("bep_utp: Failed To Create Mux Tick Timer");

        MuxDriver {
            udp,
            handle,
            commands,
            events,
            sockets: HashMap::new(),
            tokens: HashMap::new(),
            token_ids: SequentialIds::new(),
            tick,
            started: Instant::now(),
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
            pending_sends: VecDeque::new(),
            shutting_down: false,
            invalid_packets: 0,
        }
    }

    fn now_micros(&self) -> u32 {
        let elapsed = self.started.elapsed();

        (elapsed.as_secs() as u32)
            .wrapping_mul(1_000_000)
            .wrapping_add(elapsed.subsec_micros())
    }

    fn now_millis(&self) -> u64 {
        let elapsed = self.started.elapsed();

        elapsed.as_secs() * 1000 + u64::from(elapsed.subsec_millis())
    }

    fn post_event(&self, event: OUtpMessage) {
        // The user may already be gone during shutdown.
        let _ = self.events.unbounded_send(event);
    }

    fn handle_command(&mut self, command: IUtpMessage, now_micros: u32, now_millis: u64) {
        match command {
            IUtpMessage::Connect(addr) => {
                // Pick a receive id not already in use for this peer.
                let mut recv_id = rand::random::<u16>();
                while self.sockets.contains_key(&(addr, recv_id)) {
                    recv_id = recv_id.wrapping_add(1);
                }
                let seq_start = rand::random::<u16>();

                let socket = UtpSocket::new_outgoing(recv_id, seq_start, now_micros, now_millis);
                let token = UtpToken(self.token_ids.generate());

                self.sockets.insert((addr, recv_id), SocketEntry { socket, token, addr });
                self.tokens.insert(token, (addr, recv_id));
            }
            IUtpMessage::Send(token, data) => match self.tokens.get(&token) {
                Some(key) => {
                    let entry = self.sockets.get_mut(key).expect("bep_utp: Token Maps To A Missing Socket");
                    entry.socket.write(data, now_micros, now_millis);
                }
                None => self.post_event(OUtpMessage::Error(token, UtpError::OperationAborted)),
            },
            IUtpMessage::Close(token) => {
                if let Some(key) = self.tokens.get(&token) {
                    let entry = self.sockets.get_mut(key).expect("bep_utp: Token Maps To A Missing Socket");
                    entry.socket.close(None, now_micros, now_millis);
                }
            }
        }
    }

    fn handle_datagram(&mut self, length: usize, addr: SocketAddr, now_micros: u32, now_millis: u64) {
        let packet = {
            let bytes = &self.recv_buffer[..length];

            match UtpPacket::from_bytes(bytes) {
                IResult::Done(_, packet) => packet,
                _ => {
                    self.invalid_packets += 1;
                    return;
                }
            }
        };

        // Normal packets carry the receiving socket's id; a SYN carries
        // the id the new connection will be keyed under, minus one.
        if let Some(entry) = self.sockets.get_mut(&(addr, packet.conn_id)) {
            entry.socket.incoming_packet(packet, now_micros, now_millis);
            return;
        }

        if packet.packet_type == PacketType::Syn {
            let key = (addr, packet.conn_id.wrapping_add(1));

            if let Some(entry) = self.sockets.get_mut(&key) {
                // Duplicate SYN, the socket re acks.
                entry.socket.incoming_packet(packet, now_micros, now_millis);
                return;
            }

            let seq_start = rand::random::<u16>();
            let socket = UtpSocket::new_incoming(&packet, seq_start, now_micros, now_millis);
            let token = UtpToken(self.token_ids.generate());

            info!("Accepted Incoming Utp Stream From {}", addr);
            self.sockets.insert(key, SocketEntry { socket, token, addr });
            self.tokens.insert(token, key);
            self.post_event(OUtpMessage::Incoming(token, addr));
            return;
        }

        // A stream we know nothing about, tell the peer to go away.
        self.invalid_packets += 1;
        if packet.packet_type != PacketType::Reset {
            let reset = UtpPacket {
                packet_type: PacketType::Reset,
                conn_id: packet.conn_id,
                timestamp_micros: now_micros,
                timestamp_diff_micros: 0,
                wnd_size: 0,
                seq_nr: rand::random::<u16>(),
                ack_nr: packet.seq_nr,
                extensions: Vec::new(),
                payload: Bytes::new(),
            };

            let mut buffer = Vec::with_capacity(reset.wire_len());
            reset
                .write_bytes(&mut buffer)
                .expect("bep_utp: Failed To Serialize Reset Packet");
            self.pending_sends.push_back((buffer, addr));
        }
    }

    /// Drain socket outputs: deferred acks, datagrams, events, reaping.
    fn collect_socket_output(&mut self, now_micros: u32) {
        let mut reaped = Vec::new();

        for (key, entry) in self.sockets.iter_mut() {
            entry.socket.flush_deferred_ack(now_micros);

            for datagram in entry.socket.take_outgoing() {
                self.pending_sends.push_back((datagram, entry.addr));
            }

            for event in entry.socket.take_events() {
                let msg = match event {
                    UtpEvent::Connected => OUtpMessage::Connected(entry.token, entry.addr),
                    UtpEvent::Data(payload) => OUtpMessage::Data(entry.token, payload),
                    UtpEvent::Eof => OUtpMessage::Eof(entry.token),
                    UtpEvent::Closed => OUtpMessage::Closed(entry.token),
                    UtpEvent::Error(err) => OUtpMessage::Error(entry.token, err),
                };

                let _ = self.events.unbounded_send(msg);
            }

            if entry.socket.is_deleting() {
                reaped.push((*key, entry.token));
            }
        }

        for (key, token) in reaped {
            self.sockets.remove(&key);
            self.tokens.remove(&token);
        }
    }

    /// Push pending datagrams until the UDP socket pushes back.
    fn flush_sends(&mut self) {
        while let Some((datagram, addr)) = self.pending_sends.pop_front() {
            match self.udp.send_to(&datagram, &addr) {
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.pending_sends.push_front((datagram, addr));
                    return;
                }
                Err(err) => {
                    // A datagram the path will not carry is dropped; the
                    // retransmission timer picks up the slack and the MTU
                    // search backs off through the probe timeout.
                    debug!("Dropping Undeliverable Datagram To {}: {}", addr, err);
                }
            }
        }
    }
}

impl Future for MuxDriver {
    type Item = ();
    type Error = ();

    fn poll(&mut self) -> Poll<(), ()> {
        let now_micros = self.now_micros();
        let now_millis = self.now_millis();

        // User commands; the channel closing starts the shutdown.
        loop {
            match self.commands.poll() {
                Ok(Async::Ready(Some(command))) => self.handle_command(command, now_micros, now_millis),
                Ok(Async::Ready(None)) | Err(()) => {
                    if !self.shutting_down {
                        self.shutting_down = true;
                        for entry in self.sockets.values_mut() {
                            entry.socket.close(None, now_micros, now_millis);
                        }
                    }
                    break;
                }
                Ok(Async::NotReady) => break,
            }
        }

        // Incoming datagrams until the socket would block.
        loop {
            match self.udp.recv_from(&mut self.recv_buffer) {
                Ok((length, addr)) => self.handle_datagram(length, addr, now_micros, now_millis),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("Udp Receive Error: {}", err);
                    break;
                }
            }
        }

        // Timer sweep.
        match self.tick.poll() {
            Ok(Async::Ready(())) => {
                for entry in self.sockets.values_mut() {
                    entry.socket.tick(now_micros, now_millis);
                }

                self.tick = Timeout::new(Duration::from_millis(TICK_INTERVAL_MILLIS), &self.handle)
                    .expect("bep_utp: Failed To Rearm Mux Tick Timer");
                // Poll once so the fresh timer registers with the loop.
                let _ = self.tick.poll();
            }
            Ok(Async::NotReady) => {}
            Err(err) => debug!("Mux Tick Timer Error: {}", err),
        }

        self.collect_socket_output(now_micros);
        self.flush_sends();

        if self.shutting_down && self.sockets.is_empty() && self.pending_sends.is_empty() {
            Ok(Async::Ready(()))
        } else {
            Ok(Async::NotReady)
        }
    }
}
