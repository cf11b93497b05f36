//! Operators map physical-unit requests onto motor step targets and
//! per-step tick intervals.
//!
//! One `Operator` serves every axis kind; what used to vary by subclass
//! is carried by a [`Conversion`] strategy chosen at construction, plus
//! the presence or absence of a link to the driver unit. With no link
//! attached, motion is simulated locally at the same rate, once per
//! supervisor loop.

use tracing::{debug, warn};

use fluvia_shared::capsules::{OperatorCommand, OperatorControl, OperatorStatus};
use fluvia_shared::wire::Command;
use fluvia_shared::TICKS_PER_MS;

use crate::encoder::Encoder;
use crate::link::SharedLink;
use crate::table::Table;

/// Physical-unit/step conversion strategy.
#[derive(Clone, Copy, Debug)]
pub enum Conversion {
    /// Straight linear ramp between matched endpoints.
    Ramp {
        min_step: i16,
        max_step: i16,
        min_pu: i16,
        max_pu: i16,
    },
    /// Calibration table mapping motor step (x) to physical unit (y).
    Table(&'static Table),
}

impl Conversion {
    fn pu_to_step(&self, pu: i16) -> i16 {
        match self {
            Conversion::Ramp {
                min_step,
                max_step,
                min_pu,
                max_pu,
            } => Table::interpolate(pu, *min_pu, *max_pu, *min_step, *max_step),
            Conversion::Table(table) => table.map_y_to_x(pu),
        }
    }

    fn step_to_pu(&self, step: i16) -> i16 {
        match self {
            Conversion::Ramp {
                min_step,
                max_step,
                min_pu,
                max_pu,
            } => Table::interpolate(step, *min_step, *max_step, *min_pu, *max_pu),
            Conversion::Table(table) => table.map_x_to_y(step),
        }
    }

    fn step_bounds(&self) -> (i16, i16) {
        match self {
            Conversion::Ramp {
                min_step, max_step, ..
            } => (*min_step, *max_step),
            Conversion::Table(table) => table.x_bounds(),
        }
    }

    fn pu_bounds(&self) -> (i16, i16) {
        match self {
            Conversion::Ramp { min_pu, max_pu, .. } => (*min_pu, *max_pu),
            Conversion::Table(table) => table.y_bounds(),
        }
    }
}

pub struct Operator {
    // The instance ID, which is also the wire index on both protocols.
    instance: u8,

    // The instance name, for logging.
    name: &'static str,

    conversion: Conversion,

    // The serial link to the driver unit; absent in simulation.
    link: Option<SharedLink>,

    // Motor position limits, in steps.
    min_pos_step: i16,
    max_pos_step: i16,

    // Physical-unit limits.
    min_pos_pu: i16,
    max_pos_pu: i16,

    // The fastest and slowest allowed step rates. A minimum of 1 is
    // 4,000 steps/sec; the maximum is capped at 0xFFFF (16 s/step) so
    // the interval fits the wire format.
    min_ticks_per_step: u16,
    max_ticks_per_step: u16,

    // Raw motor step, reported by the driver (or simulated locally).
    current_pos_step: i16,

    // The absolute step value the motor is expected to move to.
    requested_pos_step: i16,

    // If nonzero, the requested ticks per step for the current move.
    ticks_per_step: u16,

    // The last requested value, in physical units.
    requested_pos_pu: i16,

    // The time in which the request should be achieved, in ms.
    requested_time_to_achieve: u32,

    // The clock time at which movement was last simulated.
    last_work_clock_ms: u32,

    // Flag byte from the last driver status record.
    driver_flags: u8,
}

impl Operator {
    pub fn new(
        instance: u8,
        name: &'static str,
        conversion: Conversion,
        link: Option<SharedLink>,
        min_ticks_per_step: u16,
        max_ticks_per_step: u16,
    ) -> Self {
        let (min_pos_step, max_pos_step) = conversion.step_bounds();
        let (min_pos_pu, max_pos_pu) = conversion.pu_bounds();

        Self {
            instance,
            name,
            conversion,
            link,
            min_pos_step,
            max_pos_step,
            min_pos_pu,
            max_pos_pu,
            min_ticks_per_step,
            max_ticks_per_step,
            current_pos_step: 0,
            requested_pos_step: 0,
            ticks_per_step: 0,
            requested_pos_pu: 0,
            requested_time_to_achieve: 0,
            last_work_clock_ms: 0,
            driver_flags: 0,
        }
    }

    pub fn instance(&self) -> u8 {
        self.instance
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Flag byte from the driver (or simulation thereof).
    pub fn driver_flags(&self) -> u8 {
        self.driver_flags
    }

    pub fn current_step(&self) -> i16 {
        self.current_pos_step
    }

    pub fn requested_step(&self) -> i16 {
        self.requested_pos_step
    }

    pub fn ticks_per_step(&self) -> u16 {
        self.ticks_per_step
    }

    /// The motor travel limits, in steps.
    pub fn step_bounds(&self) -> (i16, i16) {
        (self.min_pos_step, self.max_pos_step)
    }

    /// Convert a physical-unit value to a motor step.
    pub fn pu_to_step(&self, pu: i16) -> i16 {
        self.conversion.pu_to_step(pu)
    }

    /// Handle one control capsule.
    pub fn control(&mut self, occ: &OperatorControl) {
        match occ.command {
            OperatorCommand::Nop => {}
            OperatorCommand::Move => self.control_move(occ),
            OperatorCommand::Stop => self.control_stop(),
            OperatorCommand::Reset => self.control_reset(occ.requested_value),
            OperatorCommand::Unknown(cmd) => {
                warn!("control [{}]: requested unknown command {cmd}", self.name);
            }
            _ => {}
        }
    }

    fn control_move(&mut self, occ: &OperatorControl) {
        // Save the new request, capped to the physical range.
        let capped = occ.requested_value < self.min_pos_pu || occ.requested_value > self.max_pos_pu;
        self.requested_pos_pu = occ.requested_value.clamp(self.min_pos_pu, self.max_pos_pu);
        self.requested_time_to_achieve = occ.time_to_achieve;

        // Convert to a motor step.
        self.requested_pos_step = self.conversion.pu_to_step(self.requested_pos_pu);

        // Determine the number of ticks per step that will reach the
        // target in the requested time.
        let steps_to_move =
            (self.requested_pos_step as i32 - self.current_pos_step as i32).unsigned_abs();
        let mut ticks = self.min_ticks_per_step as u32;
        if steps_to_move != 0 {
            ticks = self
                .requested_time_to_achieve
                .saturating_mul(TICKS_PER_MS)
                / steps_to_move;
        }
        let ticks = ticks
            .max(self.min_ticks_per_step as u32)
            .min(self.max_ticks_per_step as u32)
            .min(u16::MAX as u32);
        self.ticks_per_step = ticks as u16;

        debug!(
            "control [{}]: requested {} {}in {} ms",
            self.name,
            self.requested_pos_pu,
            if capped { "(capped) " } else { "" },
            self.requested_time_to_achieve
        );
        debug!(
            "              {} -> {} at {} ticks/step",
            self.current_pos_step, self.requested_pos_step, self.ticks_per_step
        );

        // With driver hardware, generate a move request; otherwise the
        // move is simulated in work().
        if let Some(link) = &self.link {
            link.borrow_mut().send_command(
                self.instance,
                Command::Move {
                    target: self.requested_pos_step,
                    interval: self.ticks_per_step,
                },
            );
        }
    }

    fn control_stop(&mut self) {
        self.ticks_per_step = 0;

        debug!("control [{}]: requested stop/hold", self.name);

        if let Some(link) = &self.link {
            link.borrow_mut().send_command(self.instance, Command::Stop);
        }
    }

    fn control_reset(&mut self, step: i16) {
        // The requested value is an absolute step number here, not a
        // physical unit.
        self.ticks_per_step = 0;
        self.requested_pos_step = step;

        debug!("control [{}]: requested reset to step {}", self.name, step);

        if let Some(link) = &self.link {
            link.borrow_mut()
                .send_command(self.instance, Command::Reset { position: step });
        } else {
            self.current_pos_step = step;
        }
    }

    /// Ingest one driver status record.
    pub fn driver_status(&mut self, flags: u8, position: i16) {
        self.driver_flags = flags;
        self.current_pos_step = position;
    }

    /// Produce a status capsule payload.
    ///
    /// The value comes from the attached encoder when it is reporting;
    /// otherwise it is derived open-loop from the last known step.
    pub fn status(&mut self, encoder: Option<&mut (dyn Encoder + '_)>) -> OperatorStatus {
        let current_value = encoder
            .and_then(|enc| enc.value_pu())
            .unwrap_or_else(|| self.conversion.step_to_pu(self.current_pos_step));

        OperatorStatus {
            current_value,
            flags: self.driver_flags as u16,
            requested_value: self.requested_pos_pu,
            reserved: 0,
            time_to_achieve: self.requested_time_to_achieve,
        }
    }

    /// Simulate movement; does nothing when a real driver is attached.
    pub fn work(&mut self, now_ms: u32) {
        if self.link.is_some() {
            return;
        }

        // How long has it been since the last run?
        if self.last_work_clock_ms == 0 {
            self.last_work_clock_ms = now_ms;
            return;
        }
        let mut elapsed_ticks = now_ms.wrapping_sub(self.last_work_clock_ms) * TICKS_PER_MS;
        if elapsed_ticks == 0 {
            elapsed_ticks = 1;
        }
        self.last_work_clock_ms = now_ms;

        if self.ticks_per_step == 0 {
            return;
        }

        // Are we already there?
        if self.current_pos_step == self.requested_pos_step {
            debug!(
                "simulator [{}]: reached position {} at {} ms",
                self.name, self.current_pos_step, now_ms
            );
            self.ticks_per_step = 0;
            return;
        }

        // How far should we have moved in the elapsed time?
        let mut move_steps = (elapsed_ticks / self.ticks_per_step as u32) as i32;
        if move_steps == 0 {
            move_steps = 1;
        }

        let increase = self.current_pos_step < self.requested_pos_step;
        let mut pos = self.current_pos_step as i32 + if increase { move_steps } else { -move_steps };

        // Stop when the requested step is reached.
        if increase {
            pos = pos.min(self.requested_pos_step as i32);
        } else {
            pos = pos.max(self.requested_pos_step as i32);
        }

        // Fail-safe; requests are already capped to the step limits.
        pos = pos.clamp(self.min_pos_step as i32, self.max_pos_step as i32);
        self.current_pos_step = pos as i16;

        debug!(
            "simulator [{}]: {} ticks elapsed, moved {} steps to step {}",
            self.name, elapsed_ticks, move_steps, self.current_pos_step
        );
    }

    /// Post an immediate move request in physical units.
    pub fn post_move_immediate(&mut self, pu: i16) {
        let occ = OperatorControl {
            requested_value: pu,
            command: OperatorCommand::Move,
            reserved: 0,
            time_to_achieve: 0,
        };
        self.control(&occ);
    }

    /// Post a stop request.
    pub fn post_stop(&mut self) {
        let occ = OperatorControl {
            command: OperatorCommand::Stop,
            ..Default::default()
        };
        self.control(&occ);
    }

    /// Post a position-register reset to an absolute step.
    pub fn post_reset(&mut self, step: i16) {
        let occ = OperatorControl {
            requested_value: step,
            command: OperatorCommand::Reset,
            ..Default::default()
        };
        self.control(&occ);
    }
}
