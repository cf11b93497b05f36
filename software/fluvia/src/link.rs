//! Supervisor end of the framed serial link to the driver unit.
//!
//! Transmission pushes a whole frame through the transport immediately
//! (the transport adapter may block briefly per character to pace the
//! far end); reception drains whatever characters have arrived. One
//! link is shared by every operator, so it is handed around as
//! `Rc<RefCell<LinkMaster>>` within the single-threaded supervisor
//! loop.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use fluvia_shared::link::{write_frame, ByteTransport, FrameLink, MAX_FRAME_PAYLOAD};
use fluvia_shared::wire::{self, Command};

/// Shared handle to the one link master.
pub type SharedLink = Rc<RefCell<LinkMaster>>;

pub struct LinkMaster {
    transport: Box<dyn ByteTransport + Send>,
    frame: FrameLink,
}

impl LinkMaster {
    pub fn new(transport: Box<dyn ByteTransport + Send>) -> Self {
        Self {
            transport,
            frame: FrameLink::new(),
        }
    }

    /// Wrap a link master for sharing among operators.
    pub fn shared(transport: Box<dyn ByteTransport + Send>) -> SharedLink {
        Rc::new(RefCell::new(Self::new(transport)))
    }

    /// Transmit one message.
    pub fn send(&mut self, payload: &[u8]) {
        write_frame(self.transport.as_mut(), payload);
    }

    /// Encode and transmit one actuator command.
    pub fn send_command(&mut self, instance: u8, cmd: Command) {
        let mut buf = [0_u8; MAX_FRAME_PAYLOAD];
        let n = wire::encode_command(instance, cmd, &mut buf);
        debug!("TX {:02X?}", &buf[..n]);
        self.send(&buf[..n]);
    }

    /// Copy out the next complete received message, if any.
    ///
    /// Returns the number of bytes copied; 0 when nothing is pending.
    pub fn receive(&mut self, buf: &mut [u8]) -> usize {
        self.frame.pump_rx(self.transport.as_mut());
        self.frame.receive(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fluvia_shared::channel::channel_pair;

    #[test]
    fn test_command_round_trip() {
        let (near, mut far) = channel_pair();
        let mut master = LinkMaster::new(Box::new(near));

        master.send_command(
            1,
            Command::Move {
                target: 7016,
                interval: 2,
            },
        );

        let mut link = FrameLink::new();
        link.pump_rx(&mut far);
        let mut msg = [0_u8; MAX_FRAME_PAYLOAD];
        let n = link.receive(&mut msg);
        assert_eq!(
            wire::parse_command(&msg[..n]),
            Some((
                1,
                Command::Move {
                    target: 7016,
                    interval: 2
                }
            ))
        );
    }
}
