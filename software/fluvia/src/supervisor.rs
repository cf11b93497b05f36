//! Top-level supervisor loop.
//!
//! One unsynchronized cooperative pass every ~10 ms: service the host
//! capsule protocol, drain the driver link, advance calibration.
//! Nothing in the pass blocks; socket reads are non-blocking and link
//! reads only drain what has arrived.

use std::thread;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::Prefs;
use crate::net::{CapsuleServer, DatagramSocket, UdpCapsuleSocket};
use crate::rig::Rig;

/// The supervisor loop cadence.
const WORK_PERIOD_MS: u64 = 10;

pub struct Supervisor {
    rig: Rig,
    server: CapsuleServer,
    socket: Box<dyn DatagramSocket>,
    clock: Box<dyn Clock>,
}

impl Supervisor {
    /// Stand up a supervisor on a real UDP socket and wall clock.
    pub fn new(prefs: &Prefs, rig: Rig) -> Result<Self, String> {
        let socket = UdpCapsuleSocket::bind(&prefs.bind_addr)?;
        Ok(Self::with_parts(
            prefs,
            rig,
            Box::new(socket),
            Box::new(SystemClock::new()),
        ))
    }

    /// Assemble from explicit parts (simulation and tests).
    pub fn with_parts(
        prefs: &Prefs,
        rig: Rig,
        socket: Box<dyn DatagramSocket>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let server = CapsuleServer::new(
            prefs.system_id,
            prefs.status_interval_ms,
            prefs.peer_timeout_ms,
        );
        Self {
            rig,
            server,
            socket,
            clock,
        }
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn rig_mut(&mut self) -> &mut Rig {
        &mut self.rig
    }

    /// One cooperative service pass.
    pub fn work_once(&mut self) {
        self.server
            .work(self.socket.as_mut(), self.clock.as_ref(), &mut self.rig);
        self.rig.work(self.clock.milliseconds());
    }

    /// Run the service loop forever.
    pub fn run(&mut self) {
        loop {
            self.work_once();
            thread::sleep(Duration::from_millis(WORK_PERIOD_MS));
        }
    }
}
