//! Host-facing capsule protocol over UDP.
//!
//! Hosts announce themselves with system-control capsules; the server
//! tracks up to [`MAX_PEERS`] of them in a fixed-capacity slot arena
//! keyed by source address, drops a peer after
//! [`DEFAULT_PEER_TIMEOUT_MS`] without one, and pushes a batched status
//! datagram (system + operators + encoders) to each active peer on a
//! fixed period.

use std::net::{SocketAddr, UdpSocket};

use tracing::{debug, info, warn};

use fluvia_shared::capsules::{
    ByteStruct, ByteStructLen, CapsuleHeader, EncoderStatus, OperatorControl, OperatorStatus,
    SystemControl, SystemStatus, ENCODER_STATUS_MAGIC, OPERATOR_CONTROL_MAGIC,
    OPERATOR_STATUS_MAGIC, SYSTEM_CONTROL_MAGIC, SYSTEM_STATUS_MAGIC,
};
use fluvia_shared::PROTOCOL_VERSION;

use crate::clock::Clock;
use crate::rig::Rig;

/// The maximum size of a transmitted or received message.
pub const MSG_BUF_BYTES: usize = 256;

/// The maximum number of peers supported at once.
pub const MAX_PEERS: usize = 5;

/// The interval at which status is pushed to each peer.
pub const DEFAULT_STATUS_INTERVAL_MS: u32 = 250;

/// The time after which a silent peer is abandoned.
pub const DEFAULT_PEER_TIMEOUT_MS: u32 = 30_000;

/// Datagram access behind a seam so that peer handling can be driven
/// deterministically in tests.
pub trait DatagramSocket {
    /// Receive one datagram, if any is pending. Never blocks.
    fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)>;

    /// Send one datagram.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), String>;
}

/// Non-blocking UDP socket.
pub struct UdpCapsuleSocket {
    socket: UdpSocket,
}

impl UdpCapsuleSocket {
    pub fn bind(addr: &str) -> Result<Self, String> {
        let socket =
            UdpSocket::bind(addr).map_err(|e| format!("Unable to bind UDP socket: {e}"))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| format!("Unable to set UDP socket to nonblocking mode: {e}"))?;

        info!("Listening for capsules at {addr}");
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpCapsuleSocket {
    fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        self.socket.recv_from(buf).ok()
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), String> {
        self.socket
            .send_to(buf, addr)
            .map(|_| ())
            .map_err(|e| format!("Failed to send UDP packet: {e}"))
    }
}

/// Information on one peer to which we are sending status.
struct Peer {
    active: bool,
    addr: SocketAddr,

    // Clock time of the last valid system-control capsule.
    last_rx_ms: u32,

    // Clock time at which status was last sent (0 = never).
    last_status_sent_ms: u32,

    // The sequence number to go in the next status message.
    tx_seq: u8,

    // The sequence number from the last control message.
    rx_seq: u8,
}

impl Peer {
    fn vacant() -> Self {
        Self {
            active: false,
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            last_rx_ms: 0,
            last_status_sent_ms: 0,
            tx_seq: 0,
            rx_seq: 0,
        }
    }
}

pub struct CapsuleServer {
    system_id: u16,
    status_interval_ms: u32,
    peer_timeout_ms: u32,

    peers: [Peer; MAX_PEERS],
    txbuf: [u8; MSG_BUF_BYTES],
}

impl CapsuleServer {
    pub fn new(system_id: u16, status_interval_ms: u32, peer_timeout_ms: u32) -> Self {
        Self {
            system_id,
            status_interval_ms,
            peer_timeout_ms,
            peers: [
                Peer::vacant(),
                Peer::vacant(),
                Peer::vacant(),
                Peer::vacant(),
                Peer::vacant(),
            ],
            txbuf: [0; MSG_BUF_BYTES],
        }
    }

    /// The addresses of the currently active peers.
    pub fn active_peers(&self) -> Vec<SocketAddr> {
        self.peers
            .iter()
            .filter(|p| p.active)
            .map(|p| p.addr)
            .collect()
    }

    /// One service pass: drain datagrams, expire peers, push status.
    pub fn work(&mut self, socket: &mut dyn DatagramSocket, clock: &dyn Clock, rig: &mut Rig) {
        let mut rxbuf = [0_u8; MSG_BUF_BYTES];
        while let Some((n, addr)) = socket.recv_from(&mut rxbuf) {
            if n > MSG_BUF_BYTES {
                // Oversize datagram; ignore.
                continue;
            }
            self.process_datagram(&rxbuf[..n], addr, clock, rig);
        }

        self.drop_stale_peers(clock);
        self.push_status(socket, clock, rig);
    }

    /// Process all valid capsules in one datagram.
    fn process_datagram(&mut self, data: &[u8], addr: SocketAddr, clock: &dyn Clock, rig: &mut Rig) {
        let mut offset = 0;
        while offset < data.len() {
            match self.process_capsule(&data[offset..], addr, clock, rig) {
                Some(used) => offset += used,
                // A malformed capsule poisons the rest of the datagram.
                None => break,
            }
        }
    }

    /// Process the capsule at the front of `data`, returning the number
    /// of bytes it occupied, or None on a malformed capsule.
    fn process_capsule(
        &mut self,
        data: &[u8],
        addr: SocketAddr,
        clock: &dyn Clock,
        rig: &mut Rig,
    ) -> Option<usize> {
        if data.len() < CapsuleHeader::BYTE_LEN {
            warn!("control capsule too short to be valid");
            return None;
        }
        let header = CapsuleHeader::read_bytes(&data[..CapsuleHeader::BYTE_LEN]);

        let total = CapsuleHeader::BYTE_LEN + header.bytes_after as usize;
        if total > data.len() {
            warn!("capsule byte count longer than message");
            return None;
        }
        let payload = &data[CapsuleHeader::BYTE_LEN..total];

        match header.magic {
            SYSTEM_CONTROL_MAGIC => {
                if header.instance != PROTOCOL_VERSION {
                    warn!(
                        "bad message protocol version ({:02X}); ignoring",
                        header.instance
                    );
                    return None;
                }
                if payload.len() != SystemControl::BYTE_LEN {
                    warn!(
                        "bad system control capsule byte count ({}); ignoring",
                        payload.len()
                    );
                    return None;
                }
                let capsule = SystemControl::read_bytes(payload);
                self.register_peer(addr, &capsule, clock);
            }

            OPERATOR_CONTROL_MAGIC => {
                if payload.len() != OperatorControl::BYTE_LEN {
                    warn!(
                        "bad operator control capsule byte count ({}); ignoring",
                        payload.len()
                    );
                    return None;
                }
                if header.instance >= rig.operator_count() {
                    // Not a full-message failure.
                    warn!("unknown operator instance ({}); ignoring", header.instance);
                } else {
                    debug!("operator control capsule for operator {}", header.instance);
                    rig.control(header.instance, &OperatorControl::read_bytes(payload));
                }
            }

            magic => {
                warn!("unrecognized capsule magic number ({magic:04X}); ignoring");
            }
        }

        Some(total)
    }

    /// Track the sender of a system-control capsule.
    fn register_peer(&mut self, addr: SocketAddr, capsule: &SystemControl, clock: &dyn Clock) {
        let now = clock.milliseconds();

        // Look for the peer, and for a free slot in case it is new.
        let mut this_peer: Option<usize> = None;
        let mut available_slot: Option<usize> = None;
        for (slot, peer) in self.peers.iter().enumerate() {
            if peer.active && peer.addr == addr {
                this_peer = Some(slot);
            }
            if !peer.active && available_slot.is_none() {
                available_slot = Some(slot);
            }
        }

        let slot = match this_peer {
            Some(slot) => {
                self.peers[slot].last_rx_ms = now;
                slot
            }
            None => {
                let Some(slot) = available_slot else {
                    // Peer table is full; can't add.
                    warn!("peer table full; ignoring {addr}");
                    return;
                };
                let peer = &mut self.peers[slot];
                peer.active = true;
                peer.addr = addr;
                peer.last_rx_ms = now;
                peer.last_status_sent_ms = 0;
                peer.tx_seq = (now % 0xFF) as u8;

                info!("New peer at {addr}");
                slot
            }
        };

        // Remember the control sequence number to echo in status.
        self.peers[slot].rx_seq = capsule.seq;
    }

    fn drop_stale_peers(&mut self, clock: &dyn Clock) {
        let now = clock.milliseconds();
        for peer in self.peers.iter_mut() {
            if peer.active && now.wrapping_sub(peer.last_rx_ms) > self.peer_timeout_ms {
                info!("Dropping peer at {}", peer.addr);
                peer.active = false;
            }
        }
    }

    /// Push one status batch to each peer that is due.
    fn push_status(&mut self, socket: &mut dyn DatagramSocket, clock: &dyn Clock, rig: &mut Rig) {
        let now = clock.milliseconds();

        for slot in 0..MAX_PEERS {
            {
                let peer = &self.peers[slot];
                if !peer.active
                    || (peer.last_status_sent_ms != 0
                        && now.wrapping_sub(peer.last_status_sent_ms) < self.status_interval_ms)
                {
                    continue;
                }
            }

            // Check that the worst-case batch fits the buffer.
            let bytes_required = (CapsuleHeader::BYTE_LEN + SystemStatus::BYTE_LEN)
                + rig.operator_count() as usize
                    * (CapsuleHeader::BYTE_LEN + OperatorStatus::BYTE_LEN)
                + rig.encoder_count() as usize
                    * (CapsuleHeader::BYTE_LEN + EncoderStatus::BYTE_LEN);
            if bytes_required > MSG_BUF_BYTES {
                warn!("status batch would not fit buffer; skipping");
                continue;
            }

            self.peers[slot].last_status_sent_ms = now;

            // System status capsule.
            let mut next = 0;
            let header = CapsuleHeader {
                bytes_after: SystemStatus::BYTE_LEN as u8,
                instance: PROTOCOL_VERSION,
                magic: SYSTEM_STATUS_MAGIC,
            };
            header.write_bytes(&mut self.txbuf[next..next + CapsuleHeader::BYTE_LEN]);
            next += CapsuleHeader::BYTE_LEN;

            let status = SystemStatus {
                seq: self.peers[slot].tx_seq,
                rx_seq: self.peers[slot].rx_seq,
                system_id: self.system_id,
                ms: now,
            };
            self.peers[slot].tx_seq = self.peers[slot].tx_seq.wrapping_add(1);
            status.write_bytes(&mut self.txbuf[next..next + SystemStatus::BYTE_LEN]);
            next += SystemStatus::BYTE_LEN;

            // One capsule per equipped operator.
            for instance in 0..rig.operator_count() {
                if let Some(oscd) = rig.operator_status(instance) {
                    let header = CapsuleHeader {
                        bytes_after: OperatorStatus::BYTE_LEN as u8,
                        instance,
                        magic: OPERATOR_STATUS_MAGIC,
                    };
                    header.write_bytes(&mut self.txbuf[next..next + CapsuleHeader::BYTE_LEN]);
                    next += CapsuleHeader::BYTE_LEN;
                    oscd.write_bytes(
                        &mut self.txbuf
                            [next..next + OperatorStatus::BYTE_LEN],
                    );
                    next += OperatorStatus::BYTE_LEN;
                }
            }

            // One capsule per reporting encoder.
            for instance in 0..rig.encoder_count() {
                if let Some(escd) = rig.encoder_status(instance) {
                    let header = CapsuleHeader {
                        bytes_after: EncoderStatus::BYTE_LEN as u8,
                        instance,
                        magic: ENCODER_STATUS_MAGIC,
                    };
                    header.write_bytes(&mut self.txbuf[next..next + CapsuleHeader::BYTE_LEN]);
                    next += CapsuleHeader::BYTE_LEN;
                    escd.write_bytes(
                        &mut self.txbuf
                            [next..next + EncoderStatus::BYTE_LEN],
                    );
                    next += EncoderStatus::BYTE_LEN;
                }
            }

            let addr = self.peers[slot].addr;
            if let Err(e) = socket.send_to(&self.txbuf[..next], addr) {
                warn!("status send to {addr} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rig::{EncoderSources, OPERATOR_COUNT};
    use fluvia_shared::capsules::{OperatorCommand, OperatorStatus, SystemCommand};
    use std::cell::Cell;
    use std::collections::VecDeque;

    struct TestClock(Cell<u32>);

    impl TestClock {
        fn new() -> Self {
            // Start past zero so "never sent" is unambiguous.
            Self(Cell::new(1000))
        }

        fn advance(&self, ms: u32) {
            self.0.set(self.0.get() + ms);
        }
    }

    impl Clock for TestClock {
        fn milliseconds(&self) -> u32 {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct TestSocket {
        rx: VecDeque<(Vec<u8>, SocketAddr)>,
        tx: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl DatagramSocket for TestSocket {
        fn recv_from(&mut self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
            let (data, addr) = self.rx.pop_front()?;
            buf[..data.len()].copy_from_slice(&data);
            Some((data.len(), addr))
        }

        fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<(), String> {
            self.tx.push((buf.to_vec(), addr));
            Ok(())
        }
    }

    fn host_addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 8, 10], port))
    }

    fn system_control(seq: u8) -> Vec<u8> {
        let mut buf = vec![0_u8; CapsuleHeader::BYTE_LEN + SystemControl::BYTE_LEN];
        CapsuleHeader {
            bytes_after: SystemControl::BYTE_LEN as u8,
            instance: PROTOCOL_VERSION,
            magic: SYSTEM_CONTROL_MAGIC,
        }
        .write_bytes(&mut buf[..CapsuleHeader::BYTE_LEN]);
        SystemControl {
            seq,
            rx_seq: 0,
            command: SystemCommand::Nop,
            reserved: 0,
            ms: 0,
        }
        .write_bytes(&mut buf[CapsuleHeader::BYTE_LEN..]);
        buf
    }

    fn operator_control(instance: u8, occ: &OperatorControl) -> Vec<u8> {
        let mut buf = vec![0_u8; CapsuleHeader::BYTE_LEN + OperatorControl::BYTE_LEN];
        CapsuleHeader {
            bytes_after: OperatorControl::BYTE_LEN as u8,
            instance,
            magic: OPERATOR_CONTROL_MAGIC,
        }
        .write_bytes(&mut buf[..CapsuleHeader::BYTE_LEN]);
        occ.write_bytes(&mut buf[CapsuleHeader::BYTE_LEN..]);
        buf
    }

    fn fixture() -> (CapsuleServer, TestSocket, TestClock, Rig) {
        (
            CapsuleServer::new(0x1234, DEFAULT_STATUS_INTERVAL_MS, DEFAULT_PEER_TIMEOUT_MS),
            TestSocket::default(),
            TestClock::new(),
            Rig::new(None, EncoderSources::default()),
        )
    }

    #[test]
    fn test_peer_registration_and_status_push() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        socket.rx.push_back((system_control(7), host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        assert_eq!(server.active_peers(), vec![host_addr(9000)]);
        assert_eq!(socket.tx.len(), 1);

        let (data, addr) = &socket.tx[0];
        assert_eq!(*addr, host_addr(9000));

        // Leading capsule is the system status with our id and the
        // peer's control sequence number echoed.
        let header = CapsuleHeader::read_bytes(&data[..CapsuleHeader::BYTE_LEN]);
        assert_eq!(header.magic, SYSTEM_STATUS_MAGIC);
        assert_eq!(header.instance, PROTOCOL_VERSION);
        let status = SystemStatus::read_bytes(&data[CapsuleHeader::BYTE_LEN..]);
        assert_eq!(status.system_id, 0x1234);
        assert_eq!(status.rx_seq, 7);

        // One operator-status capsule per equipped operator follows.
        let mut offset = CapsuleHeader::BYTE_LEN + SystemStatus::BYTE_LEN;
        for instance in 0..OPERATOR_COUNT as u8 {
            let h = CapsuleHeader::read_bytes(&data[offset..offset + CapsuleHeader::BYTE_LEN]);
            assert_eq!(h.magic, OPERATOR_STATUS_MAGIC);
            assert_eq!(h.instance, instance);
            offset += CapsuleHeader::BYTE_LEN + OperatorStatus::BYTE_LEN;
        }
        // No encoders are equipped, so the batch ends here.
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_status_period_is_respected() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        socket.rx.push_back((system_control(0), host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);
        assert_eq!(socket.tx.len(), 1);

        // Not yet due.
        clock.advance(100);
        server.work(&mut socket, &clock, &mut rig);
        assert_eq!(socket.tx.len(), 1);

        // Due again.
        clock.advance(DEFAULT_STATUS_INTERVAL_MS);
        server.work(&mut socket, &clock, &mut rig);
        assert_eq!(socket.tx.len(), 2);
    }

    #[test]
    fn test_peer_timeout_boundary() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        socket.rx.push_back((system_control(0), host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        // Still present 29 999 ms after the last control capsule.
        clock.advance(29_999);
        server.work(&mut socket, &clock, &mut rig);
        assert_eq!(server.active_peers(), vec![host_addr(9000)]);

        // Gone at 30 001 ms.
        clock.advance(2);
        server.work(&mut socket, &clock, &mut rig);
        assert!(server.active_peers().is_empty());
    }

    #[test]
    fn test_peer_table_capacity() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        for port in 0..(MAX_PEERS as u16 + 2) {
            socket
                .rx
                .push_back((system_control(0), host_addr(9000 + port)));
        }
        server.work(&mut socket, &clock, &mut rig);
        assert_eq!(server.active_peers().len(), MAX_PEERS);
    }

    #[test]
    fn test_operator_control_dispatches_to_rig() {
        let (mut server, mut socket, clock, mut rig) = fixture();
        // Calibrate the pump so its move is not gated off.
        rig.work(clock.milliseconds());

        let occ = OperatorControl {
            requested_value: 4800,
            command: OperatorCommand::Move,
            reserved: 0,
            time_to_achieve: 2000,
        };
        socket
            .rx
            .push_back((operator_control(3, &occ), host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        let status = rig.operator_status(3).unwrap();
        assert_eq!(status.requested_value, 4800);
        assert_eq!(status.time_to_achieve, 2000);
    }

    #[test]
    fn test_unknown_instance_does_not_poison_datagram() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        // An out-of-range operator capsule followed by a valid system
        // control in the same datagram: the peer must still register.
        let occ = OperatorControl {
            requested_value: 1,
            command: OperatorCommand::Move,
            reserved: 0,
            time_to_achieve: 0,
        };
        let mut datagram = operator_control(9, &occ);
        datagram.extend_from_slice(&system_control(0));
        socket.rx.push_back((datagram, host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        assert_eq!(server.active_peers().len(), 1);
    }

    #[test]
    fn test_unknown_magic_does_not_poison_datagram() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        let mut datagram = vec![0_u8; CapsuleHeader::BYTE_LEN];
        CapsuleHeader {
            bytes_after: 0,
            instance: 0,
            magic: 0x5858,
        }
        .write_bytes(&mut datagram);
        datagram.extend_from_slice(&system_control(0));
        socket.rx.push_back((datagram, host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        assert_eq!(server.active_peers().len(), 1);
    }

    #[test]
    fn test_truncated_capsule_poisons_rest_of_datagram() {
        let (mut server, mut socket, clock, mut rig) = fixture();

        // A capsule whose length runs past the datagram end aborts
        // processing, including the control capsule behind it.
        let mut datagram = vec![0_u8; CapsuleHeader::BYTE_LEN];
        CapsuleHeader {
            bytes_after: 200,
            instance: 0,
            magic: OPERATOR_CONTROL_MAGIC,
        }
        .write_bytes(&mut datagram);
        datagram.extend_from_slice(&system_control(0));
        socket.rx.push_back((datagram, host_addr(9000)));
        server.work(&mut socket, &clock, &mut rig);

        assert!(server.active_peers().is_empty());
    }
}
