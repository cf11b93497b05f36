//! Framed message transport over a 9-data-bit serial channel.
//!
//! The 9th data bit distinguishes control characters from payload bytes,
//! so a payload byte may take any value 0-255 without colliding with the
//! framing markers and no escaping is needed. Two control codes are
//! defined: start-of-message and end-of-message. Everything else on the
//! control plane is ignored.
//!
//! One framing state machine serves both ends of the link. The driver
//! unit calls [`FrameLink::service`] from its motor tick loop, which
//! moves at most one character in each direction per call; the
//! supervisor uses [`FrameLink::pump_rx`] to drain its receive side and
//! [`write_frame`] to push a whole frame through a transport that is
//! allowed to block briefly per character.

/// Start-of-message control code.
pub const STX: u8 = 0x02;

/// End-of-message control code.
pub const ETX: u8 = 0x03;

/// The largest message payload carried on the link.
pub const MAX_FRAME_PAYLOAD: usize = 32;

/// One 9-bit character on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Char9 {
    /// 9th bit set: a framing control code.
    Control(u8),
    /// 9th bit clear: a payload byte.
    Data(u8),
}

/// Character-at-a-time access to a 9-bit serial channel.
///
/// Two disciplines of adapter implement this: a register-poll adapter on
/// the driver unit that never blocks, and a supervisor-side adapter that
/// may block briefly in `send` to pace characters for the far end.
pub trait ByteTransport {
    /// Fetch one received character, if any.
    fn poll(&mut self) -> Option<Char9>;

    /// Whether the channel can accept another character right now.
    fn can_send(&mut self) -> bool;

    /// Queue one character for transmission.
    fn send(&mut self, c: Char9);
}

/// Framing state machine: accumulates one inbound message and drains one
/// outbound message, one character at a time.
pub struct FrameLink {
    rx_buf: [u8; MAX_FRAME_PAYLOAD],
    rx_valid: usize,
    rx_in_progress: bool,
    rx_complete: bool,

    tx_buf: [u8; MAX_FRAME_PAYLOAD],
    tx_valid: usize,
    tx_sent: usize,
    tx_sent_stx: bool,
}

impl Default for FrameLink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameLink {
    pub fn new() -> Self {
        Self {
            rx_buf: [0; MAX_FRAME_PAYLOAD],
            rx_valid: 0,
            rx_in_progress: false,
            rx_complete: false,
            tx_buf: [0; MAX_FRAME_PAYLOAD],
            tx_valid: 0,
            tx_sent: 0,
            tx_sent_stx: false,
        }
    }

    /// Whether a new message can be submitted for transmission.
    pub fn clear_to_send(&self) -> bool {
        self.tx_valid == 0
    }

    /// Submit a message for transmission.
    ///
    /// Returns false if a message is already in flight or the payload
    /// exceeds [`MAX_FRAME_PAYLOAD`]. Empty messages are eaten.
    pub fn send(&mut self, payload: &[u8]) -> bool {
        if self.tx_valid != 0 || payload.len() > MAX_FRAME_PAYLOAD {
            return false;
        }
        if payload.is_empty() {
            return true;
        }

        self.tx_buf[..payload.len()].copy_from_slice(payload);
        self.tx_valid = payload.len();
        self.tx_sent = 0;
        true
    }

    /// If a complete message has been received, copy it out.
    ///
    /// Returns the number of bytes copied, or 0 if no complete message is
    /// present. Consuming a message invalidates it.
    pub fn receive(&mut self, buf: &mut [u8]) -> usize {
        if !self.rx_complete {
            return 0;
        }

        let n = buf.len().min(self.rx_valid);
        buf[..n].copy_from_slice(&self.rx_buf[..n]);

        self.rx_valid = 0;
        self.rx_complete = false;
        n
    }

    /// Process at most one received character and transmit at most one
    /// character. Strictly non-blocking; called once per driver tick.
    pub fn service(&mut self, transport: &mut dyn ByteTransport) {
        if let Some(c) = transport.poll() {
            self.accept(c);
        }
        self.pump_tx_once(transport);
    }

    /// Drain every character the transport has available right now.
    pub fn pump_rx(&mut self, transport: &mut dyn ByteTransport) {
        while let Some(c) = transport.poll() {
            self.accept(c);
        }
    }

    /// Feed one received character into the framing state machine.
    pub fn accept(&mut self, c: Char9) {
        match c {
            Char9::Control(STX) => {
                // Start a new message, discarding any in progress.
                self.rx_complete = false;
                self.rx_valid = 0;
                self.rx_in_progress = true;
            }
            Char9::Control(ETX) => {
                // Complete a message in progress.
                if self.rx_in_progress {
                    self.rx_complete = true;
                    self.rx_in_progress = false;
                }
            }
            // Unknown control characters are ignored.
            Char9::Control(_) => {}
            Char9::Data(byte) => {
                if self.rx_in_progress && self.rx_valid < MAX_FRAME_PAYLOAD {
                    self.rx_buf[self.rx_valid] = byte;
                    self.rx_valid += 1;
                }
            }
        }
    }

    fn pump_tx_once(&mut self, transport: &mut dyn ByteTransport) {
        if self.tx_valid == 0 || !transport.can_send() {
            return;
        }

        if self.tx_sent == 0 && !self.tx_sent_stx {
            transport.send(Char9::Control(STX));
            self.tx_sent_stx = true;
        } else if self.tx_sent == self.tx_valid {
            transport.send(Char9::Control(ETX));
            self.tx_sent = 0;
            self.tx_valid = 0;
            self.tx_sent_stx = false;
        } else {
            transport.send(Char9::Data(self.tx_buf[self.tx_sent]));
            self.tx_sent += 1;
        }
    }
}

/// Push a whole frame through a transport immediately.
///
/// The transport is allowed to block briefly per character; this is the
/// supervisor-side transmit discipline.
pub fn write_frame(transport: &mut dyn ByteTransport, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }

    put(transport, Char9::Control(STX));
    for &byte in payload {
        put(transport, Char9::Data(byte));
    }
    put(transport, Char9::Control(ETX));
}

fn put(transport: &mut dyn ByteTransport, c: Char9) {
    while !transport.can_send() {}
    transport.send(c);
}
