//! The driver unit: every equipped actuator plus the driver end of the
//! serial link, all serviced from one cooperative 250 microsecond tick.

use tracing::{debug, warn};

use crate::speed::SpeedDriver;
use crate::stepper::StepperDriver;
use fluvia_shared::link::{ByteTransport, FrameLink, MAX_FRAME_PAYLOAD};
use fluvia_shared::wire::{self, Command, StatusRecord};

/// Stepper instances 0..3: pitch, roll, standpipe.
pub const STEPPER_COUNT: usize = 3;

/// Speed-controller instances follow the steppers: 3 = pump.
pub const SPEEDER_COUNT: usize = 1;

/// Ticks between status reports (250 ms at 4 ticks/ms).
pub const STATUS_INTERVAL_TICKS: u32 = 1000;

/// Ticks between actuator log lines (1 s at 4 ticks/ms).
pub const LOG_INTERVAL_TICKS: u32 = 4000;

/// The driver unit model. [`tick`] must be called exactly once per
/// 250 microsecond tick and never blocks: each call works every
/// actuator once, moves at most one link character each way, and
/// handles at most one complete command frame.
///
/// [`tick`]: DriverUnit::tick
pub struct DriverUnit {
    transport: Box<dyn ByteTransport + Send>,
    link: FrameLink,

    steppers: [Option<StepperDriver>; STEPPER_COUNT],
    speeders: [Option<SpeedDriver>; SPEEDER_COUNT],

    // Tick counters for periodic maintenance.
    loop_status: u32,
    loop_log: u32,
}

impl DriverUnit {
    /// A unit with no actuators attached.
    pub fn new(transport: Box<dyn ByteTransport + Send>) -> Self {
        Self {
            transport,
            link: FrameLink::new(),
            steppers: [None, None, None],
            speeders: [None],
            loop_status: 0,
            loop_log: 0,
        }
    }

    /// Equip a stepper axis. `instance` must be below [`STEPPER_COUNT`].
    pub fn attach_stepper(&mut self, instance: usize, stepper: StepperDriver) {
        assert!(instance < STEPPER_COUNT, "bad stepper instance");
        self.steppers[instance] = Some(stepper);
    }

    /// Equip a speed-controlled axis. `instance` counts from
    /// [`STEPPER_COUNT`].
    pub fn attach_speeder(&mut self, instance: usize, speeder: SpeedDriver) {
        assert!(
            (STEPPER_COUNT..STEPPER_COUNT + SPEEDER_COUNT).contains(&instance),
            "bad speeder instance"
        );
        self.speeders[instance - STEPPER_COUNT] = Some(speeder);
    }

    pub fn stepper(&self, instance: usize) -> Option<&StepperDriver> {
        self.steppers.get(instance)?.as_ref()
    }

    pub fn speeder(&self, instance: usize) -> Option<&SpeedDriver> {
        self.speeders.get(instance.checked_sub(STEPPER_COUNT)?)?.as_ref()
    }

    /// Do periodic work; call exactly once per tick.
    pub fn tick(&mut self) {
        // Service the actuators.
        for stepper in self.steppers.iter_mut().flatten() {
            stepper.work();
        }
        for speeder in self.speeders.iter_mut().flatten() {
            speeder.work();
        }

        // Service the serial link and any completed command.
        self.link.service(self.transport.as_mut());
        self.process_command();

        // Report status every 1000 ticks (250 ms).
        self.loop_status += 1;
        if self.loop_status == STATUS_INTERVAL_TICKS {
            self.report_status();
            self.loop_status = 0;
        }

        // Log actuator state every 4000 ticks (1 s).
        self.loop_log += 1;
        if self.loop_log == LOG_INTERVAL_TICKS {
            for stepper in self.steppers.iter().flatten() {
                stepper.log();
            }
            for speeder in self.speeders.iter().flatten() {
                speeder.log();
            }
            self.loop_log = 0;
        }
    }

    /// Run the tick loop a fixed number of times (simulation use).
    pub fn run(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    fn process_command(&mut self) {
        let mut msg = [0_u8; MAX_FRAME_PAYLOAD];
        let n = self.link.receive(&mut msg);
        if n == 0 {
            return;
        }

        let Some((instance, cmd)) = wire::parse_command(&msg[..n]) else {
            warn!("dropping bad command message ({n} bytes)");
            return;
        };

        let instance = instance as usize;
        if instance < STEPPER_COUNT {
            let Some(stepper) = self.steppers[instance].as_mut() else {
                warn!("command for unequipped stepper {instance}");
                return;
            };
            match cmd {
                Command::Move { target, interval } => {
                    debug!("telling operator {instance} to move to {target} (interval {interval})");
                    stepper.move_to(target, interval as u32);
                }
                Command::Stop => {
                    debug!("stopping operator {instance}");
                    stepper.stop();
                }
                Command::Reset { position } => {
                    debug!("resetting operator {instance} position to step {position}");
                    stepper.reset_position(position);
                }
            }
        } else if instance < STEPPER_COUNT + SPEEDER_COUNT {
            let Some(speeder) = self.speeders[instance - STEPPER_COUNT].as_mut() else {
                warn!("command for unequipped speeder {instance}");
                return;
            };
            match cmd {
                Command::Move { target, interval } => {
                    debug!(
                        "telling operator {instance} to change speed to {target} (interval {interval})"
                    );
                    speeder.change_speed(target, interval as u32);
                }
                Command::Stop => {
                    debug!("telling operator {instance} to hold speed");
                    speeder.hold_speed();
                }
                Command::Reset { .. } => {
                    // Speed controllers have no position register.
                }
            }
        } else {
            warn!("command for unknown operator instance {instance}");
        }
    }

    fn report_status(&mut self) {
        // Skip the report if a previous message is still draining.
        if !self.link.clear_to_send() {
            return;
        }

        let mut records = [StatusRecord::default(); STEPPER_COUNT + SPEEDER_COUNT];
        let mut count = 0;

        for (instance, stepper) in self.steppers.iter().enumerate() {
            if let Some(stepper) = stepper {
                records[count] = StatusRecord {
                    instance: instance as u8,
                    flags: stepper.flags(),
                    value: stepper.position(),
                };
                count += 1;
            }
        }
        for (slot, speeder) in self.speeders.iter().enumerate() {
            if let Some(speeder) = speeder {
                records[count] = StatusRecord {
                    instance: (STEPPER_COUNT + slot) as u8,
                    flags: speeder.flags(),
                    value: speeder.speed(),
                };
                count += 1;
            }
        }
        if count == 0 {
            return;
        }

        let mut msg = [0_u8; MAX_FRAME_PAYLOAD];
        let n = wire::encode_status(&records[..count], &mut msg);
        self.link.send(&msg[..n]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimSpeedIo, SimStepperIo};
    use fluvia_shared::channel::{channel_pair, ChannelTransport};
    use fluvia_shared::link::write_frame;

    fn unit() -> (DriverUnit, ChannelTransport) {
        let (near, far) = channel_pair();
        let mut unit = DriverUnit::new(Box::new(far));

        let (io, _) = SimStepperIo::new();
        unit.attach_stepper(0, StepperDriver::new(0, false, 0, Box::new(io)));
        let (io, _) = SimStepperIo::new();
        unit.attach_stepper(2, StepperDriver::new(2, true, 0, Box::new(io)));
        let (io, _) = SimSpeedIo::new();
        unit.attach_speeder(3, SpeedDriver::new(3, 0, Box::new(io)));

        (unit, near)
    }

    fn send_command(t: &mut ChannelTransport, instance: u8, cmd: Command) {
        let mut buf = [0_u8; MAX_FRAME_PAYLOAD];
        let n = wire::encode_command(instance, cmd, &mut buf);
        write_frame(t, &buf[..n]);
    }

    #[test]
    fn test_move_command_reaches_stepper() {
        let (mut unit, mut host) = unit();
        send_command(
            &mut host,
            0,
            Command::Move {
                target: 4,
                interval: 1,
            },
        );

        // Plenty of ticks to drain the frame, settle, and move 4 steps.
        unit.run(64);
        assert_eq!(unit.stepper(0).unwrap().position(), 4);
    }

    #[test]
    fn test_speed_command_routes_past_steppers() {
        let (mut unit, mut host) = unit();
        send_command(
            &mut host,
            3,
            Command::Move {
                target: 2,
                interval: 1,
            },
        );

        unit.run(64);
        assert_eq!(unit.speeder(3).unwrap().speed(), 2);
    }

    #[test]
    fn test_corrupt_command_is_ignored() {
        let (mut unit, mut host) = unit();
        let mut buf = [0_u8; MAX_FRAME_PAYLOAD];
        let n = wire::encode_command(
            0,
            Command::Move {
                target: 100,
                interval: 1,
            },
            &mut buf,
        );
        buf[1] ^= 0x40;
        write_frame(&mut host, &buf[..n]);

        unit.run(64);
        assert_eq!(unit.stepper(0).unwrap().position(), 0);
    }

    #[test]
    fn test_status_reports_equipped_actuators() {
        let (mut unit, mut host) = unit();
        unit.run(STATUS_INTERVAL_TICKS + MAX_FRAME_PAYLOAD as u32);

        // Collect the frame the unit sent back.
        let mut link = FrameLink::new();
        link.pump_rx(&mut host);
        let mut msg = [0_u8; MAX_FRAME_PAYLOAD];
        let n = link.receive(&mut msg);
        assert_ne!(n, 0);

        let mut records = [StatusRecord::default(); 4];
        let count = wire::parse_status(&msg[..n], &mut records).unwrap();

        // Stepper 1 is unequipped, so three records: 0, 2, 3.
        assert_eq!(count, 3);
        assert_eq!(records[0].instance, 0);
        assert_eq!(records[1].instance, 2);
        assert_eq!(records[2].instance, 3);
    }
}
