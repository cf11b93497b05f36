//! The rig model: every operator and encoder on the machine, the
//! per-axis calibration state machines, and the ingestion of driver
//! status messages.
//!
//! Axes are fixed at build time: three steppers (pitch, roll,
//! downstream standpipe) and the pump, with analog angle encoders on
//! pitch and roll plus a two-axis tilt sensor on the bed itself.

use once_cell::sync::Lazy;
use tracing::{info, warn};

use fluvia_shared::capsules::{
    flags, EncoderStatus, OperatorCommand, OperatorControl, OperatorStatus,
};
use fluvia_shared::link::MAX_FRAME_PAYLOAD;
use fluvia_shared::wire::{self, StatusRecord};

use crate::calibration::{CalMethod, CalState, Calibration};
use crate::encoder::{Encoder, MillivoltSource, TableMappedEncoder};
use crate::link::SharedLink;
use crate::operator::{Conversion, Operator};
use crate::table::Table;

// Operator indices, which are also the instance ids on both protocols.
pub const OPERATOR_PITCH: usize = 0;
pub const OPERATOR_ROLL: usize = 1;
pub const OPERATOR_PIPE: usize = 2;
pub const OPERATOR_PUMP: usize = 3;
pub const OPERATOR_COUNT: usize = 4;

// Encoder indices.
pub const ENCODER_PITCH: usize = 0;
pub const ENCODER_ROLL: usize = 1;
pub const ENCODER_TILT_PITCH: usize = 2;
pub const ENCODER_TILT_ROLL: usize = 3;
pub const ENCODER_COUNT: usize = 4;

// Lookup table from pitch motor position to pitch angle in hundredths
// of degrees.
static PITCH_STEP_TO_ANGLE: Lazy<Table> = Lazy::new(|| Table::interpolated(&[(0, -45), (12628, 360)]));

// Lookup table from pitch encoder millivolts to pitch angle in
// hundredths of degrees.
static PITCH_MV_TO_ANGLE: Lazy<Table> = Lazy::new(|| Table::interpolated(&[(1197, 360), (2667, -45)]));

// Lookup table from roll motor position to roll angle in hundredths of
// degrees, surveyed point by point across the travel.
static ROLL_STEP_TO_ANGLE: Lazy<Table> = Lazy::new(|| {
    Table::interpolated(&[
        (-8764, -370),
        (-8201, -340),
        (-7954, -300),
        (-6064, -250),
        (-5096, -200),
        (-4477, -150),
        (-2261, -100),
        (-1935, -50),
        (0, 0),
        (1001, 50),
        (1518, 100),
        (3836, 150),
        (4162, 200),
        (6266, 250),
        (7020, 300),
        (7369, 340),
        (8809, 370),
    ])
});

// Lookup table from roll encoder millivolts to roll angle in hundredths
// of degrees.
static ROLL_MV_TO_ANGLE: Lazy<Table> = Lazy::new(|| {
    Table::interpolated(&[
        (1542, 370),
        (1679, 340),
        (1710, 300),
        (1777, 250),
        (1964, 200),
        (1993, 150),
        (2199, 100),
        (2247, 50),
        (2342, 0),
        (2506, -50),
        (2535, -100),
        (2732, -150),
        (2787, -200),
        (2873, -250),
        (3041, -300),
        (3063, -340),
        (3109, -370),
    ])
});

// Lookup table from standpipe motor position to height in tenths of
// millimeters. The standpipe travels 8 mm to 100 mm between limit
// switches, 2456 steps (26.69 steps/mm).
static PIPE_STEP_TO_MM: Lazy<Table> = Lazy::new(|| Table::interpolated(&[(0, 80), (2456, 1000)]));

// Lookup table from pump output level (0..255) to flow in tenths of
// mL/sec.
static PUMP_SPEED_TO_FLOW: Lazy<Table> = Lazy::new(|| Table::interpolated(&[(0, 0), (255, 9600)]));

// Lookup tables from the bed tilt sensor millivolts to angle in
// hundredths of degrees.
static TILT_PITCH_MV_TO_ANGLE: Lazy<Table> =
    Lazy::new(|| Table::interpolated(&[(500, 2500), (4500, -2500)]));
static TILT_ROLL_MV_TO_ANGLE: Lazy<Table> =
    Lazy::new(|| Table::interpolated(&[(500, -2500), (4500, 2500)]));

/// ADC attachments for the equipped encoders; unequipped are None.
#[derive(Default)]
pub struct EncoderSources {
    pub pitch: Option<Box<dyn MillivoltSource>>,
    pub roll: Option<Box<dyn MillivoltSource>>,
    pub tilt_pitch: Option<Box<dyn MillivoltSource>>,
    pub tilt_roll: Option<Box<dyn MillivoltSource>>,
}

pub struct Rig {
    operators: [Option<Operator>; OPERATOR_COUNT],
    encoders: [Option<Box<dyn Encoder>>; ENCODER_COUNT],
    calibrations: [Calibration; OPERATOR_COUNT],

    // Which status encoder closes each operator's loop.
    operator_encoder: [Option<usize>; OPERATOR_COUNT],

    link: Option<SharedLink>,
}

impl Rig {
    /// Build the standard four-axis rig.
    ///
    /// With no link, every axis is simulated locally; with no encoder
    /// source, that axis runs open-loop.
    pub fn new(link: Option<SharedLink>, sources: EncoderSources) -> Self {
        let operators = [
            Some(Operator::new(
                OPERATOR_PITCH as u8,
                "pitch",
                Conversion::Table(&PITCH_STEP_TO_ANGLE),
                link.clone(),
                1,      // 4,000 steps/sec
                0xFFFF, // 16 secs/step
            )),
            Some(Operator::new(
                OPERATOR_ROLL as u8,
                "roll",
                Conversion::Table(&ROLL_STEP_TO_ANGLE),
                link.clone(),
                1,
                0xFFFF,
            )),
            Some(Operator::new(
                OPERATOR_PIPE as u8,
                "pipe",
                Conversion::Table(&PIPE_STEP_TO_MM),
                link.clone(),
                1,
                0xFFFF,
            )),
            Some(Operator::new(
                OPERATOR_PUMP as u8,
                "pump",
                Conversion::Table(&PUMP_SPEED_TO_FLOW),
                link.clone(),
                16, // 250 levels/sec
                0xFFFF,
            )),
        ];

        let encoders: [Option<Box<dyn Encoder>>; ENCODER_COUNT] = [
            sources.pitch.map(|src| {
                Box::new(TableMappedEncoder::new("pitch", src, &PITCH_MV_TO_ANGLE))
                    as Box<dyn Encoder>
            }),
            sources.roll.map(|src| {
                Box::new(TableMappedEncoder::new("roll", src, &ROLL_MV_TO_ANGLE))
                    as Box<dyn Encoder>
            }),
            sources.tilt_pitch.map(|src| {
                Box::new(TableMappedEncoder::new(
                    "tilt-pitch",
                    src,
                    &TILT_PITCH_MV_TO_ANGLE,
                )) as Box<dyn Encoder>
            }),
            sources.tilt_roll.map(|src| {
                Box::new(TableMappedEncoder::new(
                    "tilt-roll",
                    src,
                    &TILT_ROLL_MV_TO_ANGLE,
                )) as Box<dyn Encoder>
            }),
        ];

        let calibrations = [
            Calibration::new(CalMethod::EncoderReference {
                encoder: ENCODER_PITCH,
            }),
            Calibration::new(CalMethod::EncoderReference {
                encoder: ENCODER_ROLL,
            }),
            Calibration::new(CalMethod::SeekMaxLimit),
            Calibration::new(CalMethod::Immediate),
        ];

        let operator_encoder = [Some(ENCODER_PITCH), Some(ENCODER_ROLL), None, None];

        Self {
            operators,
            encoders,
            calibrations,
            operator_encoder,
            link,
        }
    }

    pub fn operator_count(&self) -> u8 {
        OPERATOR_COUNT as u8
    }

    pub fn encoder_count(&self) -> u8 {
        ENCODER_COUNT as u8
    }

    pub fn operator(&self, instance: usize) -> Option<&Operator> {
        self.operators.get(instance)?.as_ref()
    }

    pub fn calibration_state(&self, instance: usize) -> CalState {
        self.calibrations[instance].state
    }

    /// Un-calibrate every axis, as at startup.
    pub fn initialize(&mut self) {
        for cal in self.calibrations.iter_mut() {
            cal.reset();
        }
    }

    /// Handle one operator control capsule from a host.
    pub fn control(&mut self, instance: u8, occ: &OperatorControl) {
        let idx = instance as usize;
        if idx >= OPERATOR_COUNT {
            return;
        }

        // Reset is special: it restarts calibration for the axis rather
        // than reaching the operator directly.
        if occ.command == OperatorCommand::Reset {
            self.calibrations[idx].reset();
            return;
        }

        // Motion commands are ignored until the axis is calibrated.
        if !self.calibrations[idx].is_calibrated() {
            return;
        }

        if let Some(op) = self.operators[idx].as_mut() {
            op.control(occ);
        }
    }

    /// Produce the status capsule payload for one operator.
    pub fn operator_status(&mut self, instance: u8) -> Option<OperatorStatus> {
        let idx = instance as usize;
        let op = self.operators.get_mut(idx)?.as_mut()?;
        let enc = match self.operator_encoder[idx] {
            Some(e) => self.encoders[e].as_deref_mut(),
            None => None,
        };
        Some(op.status(enc))
    }

    /// Produce the status capsule payload for one encoder.
    pub fn encoder_status(&mut self, instance: u8) -> Option<EncoderStatus> {
        self.encoders.get_mut(instance as usize)?.as_mut()?.status()
    }

    /// Periodic service: drain driver status, simulate motion when no
    /// driver is attached, and advance calibration.
    pub fn work(&mut self, now_ms: u32) {
        self.service_link();

        if self.link.is_none() {
            for op in self.operators.iter_mut().flatten() {
                op.work(now_ms);
            }
        }

        self.work_calibration();
    }

    /// Drain framed status messages from the driver unit.
    fn service_link(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };

        let mut msg = [0_u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = link.borrow_mut().receive(&mut msg);
            if n == 0 {
                break;
            }

            let mut records = [StatusRecord::default(); 8];
            let Some(count) = wire::parse_status(&msg[..n], &mut records) else {
                warn!("dropping corrupt driver status message ({n} bytes)");
                continue;
            };
            for record in &records[..count] {
                let idx = record.instance as usize;
                match self.operators.get_mut(idx).and_then(|op| op.as_mut()) {
                    Some(op) => op.driver_status(record.flags, record.value),
                    None => warn!("status for unknown operator instance {idx}"),
                }
            }
        }
    }

    fn work_calibration(&mut self) {
        for idx in 0..OPERATOR_COUNT {
            let Calibration { method, state } = self.calibrations[idx];
            match (method, state) {
                (CalMethod::Immediate, CalState::Uncalibrated) => {
                    if let Some(op) = self.operators[idx].as_mut() {
                        op.post_stop();
                        self.calibrations[idx].state = CalState::Calibrated;
                    }
                }

                (CalMethod::SeekMaxLimit, CalState::Uncalibrated) => {
                    if let Some(op) = self.operators[idx].as_mut() {
                        // Zero the register, then run at the limit
                        // switch; the driver stops there on its own.
                        op.post_stop();
                        op.post_reset(0);
                        op.post_move_immediate(i16::MAX);

                        info!("moving {} to maximum position", op.name());
                        self.calibrations[idx].state = CalState::Calibrating;
                    }
                }

                (CalMethod::SeekMaxLimit, CalState::Calibrating) => {
                    if let Some(op) = self.operators[idx].as_mut() {
                        if op.driver_flags() & flags::STEPPER_MAX_LIMIT_STOP != 0 {
                            // Pin the step register to the top of travel.
                            let step = op.step_bounds().1;
                            op.post_reset(step);

                            info!("{} calibrated at step {}", op.name(), step);
                            self.calibrations[idx].state = CalState::Calibrated;
                        }
                    }
                }

                (CalMethod::EncoderReference { encoder }, CalState::Uncalibrated) => {
                    let value = self.encoders[encoder]
                        .as_mut()
                        .and_then(|enc| enc.value_pu());
                    if let Some(op) = self.operators[idx].as_mut() {
                        op.post_stop();

                        // Pin the step register wherever the encoder
                        // says the axis is sitting.
                        if let Some(pu) = value {
                            let step = op.pu_to_step(pu);
                            op.post_reset(step);

                            info!("{} calibrated at step {} ({} PU)", op.name(), step, pu);
                            self.calibrations[idx].state = CalState::Calibrated;
                        }
                    }
                }

                _ => {}
            }
        }
    }
}
