/// Smallest datagram every IPv4 path must carry.
const MTU_FLOOR: usize = 576;

/// Ethernet sized default ceiling.
const MTU_CEILING: usize = 1500;

/// Probing stops once the search space is this narrow.
const MTU_CONVERGE_BYTES: usize = 10;

/// Bytes of IPv4 plus UDP headers ahead of the uTP header.
const IP_UDP_OVERHEAD: usize = 28;

/// Binary search over the path MTU.
///
/// The floor starts at the IPv4 minimum and the ceiling at the interface
/// MTU; probes go out at the midpoint with fragmentation disallowed. An
/// acknowledged probe raises the floor, a lost one lowers the ceiling,
/// and the search stops when the two converge.
pub struct MtuDiscovery {
    floor: usize,
    ceiling: usize,
    current: usize,
    /// Sequence number of the in flight probe, if any.
    probe_seq: Option<u16>,
    done: bool,
}

impl MtuDiscovery {
    pub fn new() -> MtuDiscovery {
        MtuDiscovery::with_ceiling(MTU_CEILING)
    }

    /// Start a search bounded by the interface MTU.
    pub fn with_ceiling(ceiling: usize) -> MtuDiscovery {
        let mut mtu = MtuDiscovery {
            floor: MTU_FLOOR,
            ceiling,
            current: 0,
            probe_seq: None,
            done: false,
        };
        mtu.recompute();

        mtu
    }

    fn recompute(&mut self) {
        if self.ceiling < self.floor {
            // A retransmit storm drove the ceiling under the floor,
            // restart the search from scratch.
            self.floor = MTU_FLOOR;
            self.done = false;
        }

        if self.ceiling - self.floor < MTU_CONVERGE_BYTES {
            self.current = self.floor;
            self.ceiling = self.floor;
            self.done = true;
        } else {
            self.current = (self.floor + self.ceiling) / 2;
        }
    }

    /// Datagram size the next probe should use.
    pub fn probe_size(&self) -> usize {
        self.current
    }

    /// Established link MTU, the floor of the remaining search space.
    pub fn mtu(&self) -> usize {
        if self.done {
            self.current
        } else {
            self.floor
        }
    }

    /// Largest uTP payload a non probe segment may carry.
    pub fn mss(&self) -> usize {
        self.mtu() - IP_UDP_OVERHEAD - crate::packet::HEADER_SIZE
    }

    /// Largest uTP payload the current probe size may carry.
    pub fn probe_payload(&self) -> usize {
        self.probe_size() - IP_UDP_OVERHEAD - crate::packet::HEADER_SIZE
    }

    /// True when a probe should be attached to the next full segment.
    pub fn wants_probe(&self, cwnd_bytes: usize) -> bool {
        !self.done && self.probe_seq.is_none() && cwnd_bytes > 3 * self.floor
    }

    /// Record the probe that just went out.
    pub fn probe_sent(&mut self, seq: u16) {
        debug_assert!(self.probe_seq.is_none());
        self.probe_seq = Some(seq);
    }

    /// True if the given sequence number is the in flight probe.
    pub fn is_probe(&self, seq: u16) -> bool {
        self.probe_seq == Some(seq)
    }

    /// An acknowledgment for the probe raises the floor.
    pub fn probe_acked(&mut self, seq: u16) -> bool {
        if !self.is_probe(seq) {
            return false;
        }

        self.probe_seq = None;
        self.floor = self.current;
        self.recompute();

        true
    }

    /// A lost probe, or an ICMP fragmentation error, lowers the ceiling.
    pub fn probe_failed(&mut self) {
        self.probe_seq = None;
        self.ceiling = self.current - 1;
        self.recompute();
    }

    /// The network reported the given datagram size does not fit.
    pub fn packet_too_big(&mut self, size: usize) {
        self.ceiling = size - 1;
        self.probe_seq = None;
        self.done = false;
        self.recompute();
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
