//! Hardware-out-of-the-loop run: the driver unit ticking on its own
//! thread with simulated motors, the supervisor servicing it over the
//! in-memory serial channel, and a scripted host talking UDP capsules.
//!
//! ```sh
//! cargo run --example hootl
//! ```

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fluvia::encoder::MillivoltSource;
use fluvia::link::LinkMaster;
use fluvia::net::UdpCapsuleSocket;
use fluvia::rig::{EncoderSources, OPERATOR_PITCH};
use fluvia::{Prefs, Rig, Supervisor, SystemClock};
use fluvia_driver::sim::SimStepperIo;
use fluvia_driver::{DriverUnit, SpeedDriver, StepperDriver};
use fluvia_shared::capsules::{
    ByteStruct, ByteStructLen, CapsuleHeader, OperatorCommand, OperatorControl, SystemCommand,
    SystemControl, OPERATOR_CONTROL_MAGIC, SYSTEM_CONTROL_MAGIC,
};
use fluvia_shared::channel::channel_pair;
use fluvia_shared::PROTOCOL_VERSION;

fn main() -> Result<(), String> {
    fluvia::logging::init_logging(None)?;

    // Serial channel between the two units.
    let (near, far) = channel_pair();

    // Driver unit with simulated motors on its own thread, ticking
    // fast (the 250 us tick is a deadline, not a duty cycle).
    let mut unit = DriverUnit::new(Box::new(far));
    let (io, _pitch) = SimStepperIo::new();
    unit.attach_stepper(0, StepperDriver::new(0, false, 4, Box::new(io)));
    let (io, _roll) = SimStepperIo::new();
    unit.attach_stepper(1, StepperDriver::new(1, false, 4, Box::new(io)));
    let (io, pipe) = SimStepperIo::new();
    unit.attach_stepper(2, StepperDriver::new(2, true, 4, Box::new(io)));
    let (io, _pump) = fluvia_driver::sim::SimSpeedIo::new();
    unit.attach_speeder(3, SpeedDriver::new(3, 40, Box::new(io)));

    let done = Arc::new(AtomicBool::new(false));
    let driver_done = done.clone();
    let pipe_for_driver = pipe.clone();
    let driver = thread::spawn(move || {
        while !driver_done.load(Ordering::Relaxed) {
            unit.run(100);

            // Play the part of the standpipe's top limit switch.
            {
                let mut state = pipe_for_driver.lock().unwrap();
                if state.step_pulses >= 2456 {
                    state.max_limit = true;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    });

    // The pitch encoder reports a fixed -0.45 degrees until calibrated.
    struct FixedAdc(Arc<Mutex<Option<u16>>>);
    impl MillivoltSource for FixedAdc {
        fn read_millivolts(&mut self) -> Option<u16> {
            *self.0.lock().unwrap()
        }
    }
    let pitch_mv = Arc::new(Mutex::new(Some(2667_u16)));
    let sources = EncoderSources {
        pitch: Some(Box::new(FixedAdc(pitch_mv.clone()))),
        ..Default::default()
    };

    // Supervisor on a real UDP socket.
    let prefs = Prefs {
        bind_addr: "127.0.0.1:40000".to_owned(),
        ..Default::default()
    };
    let rig = Rig::new(Some(LinkMaster::shared(Box::new(near))), sources);
    let socket = UdpCapsuleSocket::bind(&prefs.bind_addr)?;
    let mut supervisor =
        Supervisor::with_parts(&prefs, rig, Box::new(socket), Box::new(SystemClock::new()));

    // Scripted host: announce, then ask pitch for +1.80 degrees over
    // five seconds.
    let host = UdpSocket::bind("127.0.0.1:0").map_err(|e| e.to_string())?;
    host.set_nonblocking(true).map_err(|e| e.to_string())?;

    // Run the supervisor loop for ten seconds, echoing what the host
    // hears back. The host repeats its request once a second; the
    // first few land before calibration finishes and are ignored.
    let mut status_buf = [0_u8; 512];
    for pass in 0..1000_u32 {
        if pass % 100 == 0 {
            let mut datagram = Vec::new();
            push_system_control(&mut datagram, (pass / 100) as u8);
            push_operator_move(&mut datagram, OPERATOR_PITCH as u8, 180, 5000);
            host.send_to(&datagram, "127.0.0.1:40000")
                .map_err(|e| e.to_string())?;
        }

        supervisor.work_once();

        // A little way in, the encoder "fails"; status falls back to
        // the open-loop step-derived position and tracks the motion.
        if pass == 150 {
            *pitch_mv.lock().unwrap() = None;
        }

        if let Ok((n, _)) = host.recv_from(&mut status_buf) {
            if pass % 25 == 0 {
                let op = supervisor
                    .rig_mut()
                    .operator_status(OPERATOR_PITCH as u8)
                    .expect("pitch is equipped");
                println!(
                    "host got {n}-byte status batch; pitch at {} (requested {})",
                    op.current_value, op.requested_value
                );
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    done.store(true, Ordering::Relaxed);
    driver.join().map_err(|_| "driver thread panicked".to_owned())?;
    Ok(())
}

fn push_system_control(buf: &mut Vec<u8>, seq: u8) {
    let start = buf.len();
    buf.resize(start + CapsuleHeader::BYTE_LEN + SystemControl::BYTE_LEN, 0);
    CapsuleHeader {
        bytes_after: SystemControl::BYTE_LEN as u8,
        instance: PROTOCOL_VERSION,
        magic: SYSTEM_CONTROL_MAGIC,
    }
    .write_bytes(&mut buf[start..start + CapsuleHeader::BYTE_LEN]);
    SystemControl {
        seq,
        rx_seq: 0,
        command: SystemCommand::Nop,
        reserved: 0,
        ms: 0,
    }
    .write_bytes(&mut buf[start + CapsuleHeader::BYTE_LEN..]);
}

fn push_operator_move(buf: &mut Vec<u8>, instance: u8, value: i16, ms: u32) {
    let start = buf.len();
    buf.resize(start + CapsuleHeader::BYTE_LEN + OperatorControl::BYTE_LEN, 0);
    CapsuleHeader {
        bytes_after: OperatorControl::BYTE_LEN as u8,
        instance,
        magic: OPERATOR_CONTROL_MAGIC,
    }
    .write_bytes(&mut buf[start..start + CapsuleHeader::BYTE_LEN]);
    OperatorControl {
        requested_value: value,
        command: OperatorCommand::Move,
        reserved: 0,
        time_to_achieve: ms,
    }
    .write_bytes(&mut buf[start + CapsuleHeader::BYTE_LEN..]);
}
