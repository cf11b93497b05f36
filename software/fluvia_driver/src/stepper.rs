//! Per-tick state machine for one stepper axis.

use tracing::debug;

use crate::STARTUP_WAIT_TICKS;
use fluvia_shared::capsules::flags::*;

/// Hardware attachment for one stepper axis.
///
/// Implementations translate these semantic operations to real signal
/// polarities (see [`crate::pins::StepperPins`]) or to simulated state.
/// Inputs that are not fitted on a given axis return `None`.
pub trait StepperIo {
    /// Energize or de-energize the motor.
    fn set_enabled(&mut self, enabled: bool);

    /// Latch the rotation direction for subsequent steps.
    fn set_direction_cw(&mut self, cw: bool);

    /// Emit one step pulse.
    fn pulse_step(&mut self);

    /// Whether the motor driver is reporting a fault.
    fn fault_active(&mut self) -> bool;

    /// Whether the minimum-travel limit switch is made.
    fn min_limit_active(&mut self) -> Option<bool>;

    /// Whether the maximum-travel limit switch is made.
    fn max_limit_active(&mut self) -> Option<bool>;

    /// Whether the jog-increment switch is pressed.
    fn jog_increment_active(&mut self) -> Option<bool>;

    /// Whether the jog-decrement switch is pressed.
    fn jog_decrement_active(&mut self) -> Option<bool>;

    /// Whether jogging is currently permitted (true when no jog-enable
    /// switch is fitted).
    fn jog_enabled(&mut self) -> bool;
}

/// Stepper axis driver. All motion happens one step per [`work`] tick;
/// commands only update the request registers.
///
/// [`work`]: StepperDriver::work
pub struct StepperDriver {
    io: Box<dyn StepperIo + Send>,

    // The instance number, for logging.
    instance: u8,

    // true if position values increase in the clockwise direction.
    pos_is_cw: bool,

    // Ticks between steps, plus 1, while jogging (0 disables jogging).
    jog_interval: u32,

    // The current position, in motor steps.
    current_pos: i16,

    // The intended position, in motor steps.
    target_pos: i16,

    // Ticks between steps, plus 1 (0 = stopped; 1 = every tick).
    interval: u32,

    // The current flag values (STEPPER_* bits).
    flags: u8,

    // The latched state of the direction output.
    direction_cw: bool,

    // Ticks until the next step.
    wait_ticks: u32,

    // The jog intent on the previous tick.
    previous_jog: i8,

    // The flags on the previous tick.
    previous_flags: u8,
}

impl StepperDriver {
    pub fn new(instance: u8, pos_is_cw: bool, jog_interval: u32, mut io: Box<dyn StepperIo + Send>) -> Self {
        // Start with the motor de-energized, pointing counterclockwise.
        io.set_enabled(false);
        io.set_direction_cw(false);

        Self {
            io,
            instance,
            pos_is_cw,
            jog_interval,
            current_pos: 0,
            target_pos: 0,
            interval: 0,
            flags: 0,
            direction_cw: false,
            wait_ticks: 0,
            previous_jog: 0,
            // Force the first flag transition to log.
            previous_flags: 0xFF,
        }
    }

    /// Set the requested position and step rate.
    ///
    /// `interval` is the number of ticks between steps, plus one; a value
    /// of 1 steps every tick and 0 is ignored, as is a request for the
    /// position already targeted.
    pub fn move_to(&mut self, pos: i16, mut interval: u32) {
        if pos == self.target_pos || interval == 0 {
            return;
        }

        // A move may not outrun the configured jog rate.
        if self.jog_interval != 0 && interval < self.jog_interval {
            interval = self.jog_interval;
        }

        self.target_pos = pos;
        self.interval = interval;

        // Take action on the next tick.
        self.wait_ticks = 0;
        self.flags |= STEPPER_MOVING;

        debug!(
            "MOT{}: moving to {} at {} ticks/step",
            self.instance, pos, interval
        );
    }

    /// Stop moving and stay at the current position.
    pub fn stop(&mut self) {
        self.target_pos = self.current_pos;
        self.interval = 0;

        debug!("MOT{}: stopping motion", self.instance);
    }

    /// Reset the position register without moving the motor.
    pub fn reset_position(&mut self, pos: i16) {
        self.target_pos = pos;
        self.current_pos = pos;
        self.interval = 0;

        debug!("MOT{}: resetting position to {}", self.instance, pos);
    }

    pub fn position(&self) -> i16 {
        self.current_pos
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Log the axis state.
    pub fn log(&self) {
        if self.interval != 0 {
            let interval = if self.previous_jog != 0 {
                self.jog_interval
            } else {
                self.interval
            };
            debug!(
                "MOT{}: at step {}, wait {}, interval {} [{}]",
                self.instance,
                self.current_pos,
                self.wait_ticks,
                interval,
                stepper_flag_text(self.flags)
            );
        } else {
            debug!(
                "MOT{}: at step {} [{}]",
                self.instance,
                self.current_pos,
                stepper_flag_text(self.flags)
            );
        }
    }

    /// Do motion; call exactly once per tick.
    pub fn work(&mut self) {
        // Sample the fault and limit inputs.
        let fault = self.io.fault_active();
        self.flags = with_flag(self.flags, STEPPER_FAULT, fault);
        if let Some(active) = self.io.min_limit_active() {
            self.flags = with_flag(self.flags, STEPPER_MIN_LIMIT, active);
        }
        if let Some(active) = self.io.max_limit_active() {
            self.flags = with_flag(self.flags, STEPPER_MAX_LIMIT, active);
        }

        // Once off a limit, the "stopped there" indication can clear.
        if self.flags & STEPPER_MIN_LIMIT == 0 {
            self.flags &= !STEPPER_MIN_LIMIT_STOP;
        }
        if self.flags & STEPPER_MAX_LIMIT == 0 {
            self.flags &= !STEPPER_MAX_LIMIT_STOP;
        }

        // Determine the jog intent.
        let mut jog: i8 = 0;
        if self.jog_interval != 0 && self.io.jog_enabled() {
            if self.io.jog_increment_active().unwrap_or(false) {
                jog = 1;
            } else if self.io.jog_decrement_active().unwrap_or(false) {
                jog = -1;
            }
        }
        if jog != self.previous_jog {
            let mode = match jog {
                0 => "off",
                j if j > 0 => "inc",
                _ => "dec",
            };
            debug!("MOT{}: jog {} at step {}", self.instance, mode, self.current_pos);
            self.previous_jog = jog;
        }

        // Are we not moving?
        if jog == 0 && (self.target_pos == self.current_pos || self.interval == 0) {
            // Regardless of why, make the settings consistent.
            self.target_pos = self.current_pos;
            self.interval = 0;
            self.flags &= !STEPPER_MOVING;

            // Turn off the motor if enabled.
            if self.flags & STEPPER_ENABLED != 0 {
                self.io.set_enabled(false);
                self.flags &= !STEPPER_ENABLED;
            }
        }
        // Do we need to enable the motor?
        else if self.flags & STEPPER_ENABLED == 0 {
            self.io.set_enabled(true);
            self.flags |= STEPPER_ENABLED;

            // Impose the startup settling delay.
            self.wait_ticks = STARTUP_WAIT_TICKS;
        }
        // Is it not yet time to move?
        else if self.wait_ticks != 0 {
            self.wait_ticks -= 1;
        }
        // Time to move.
        else {
            let pos_decreasing = jog < 0 || (jog == 0 && self.target_pos < self.current_pos);
            let move_cw = pos_decreasing ^ self.pos_is_cw;

            // Are we faulted?
            if self.flags & STEPPER_FAULT != 0 {
                self.target_pos = self.current_pos;
                self.flags |= STEPPER_FAULT_STOP;
            }
            // Are we at the limit on the side being approached?
            else if pos_decreasing && self.flags & STEPPER_MIN_LIMIT != 0 {
                self.target_pos = self.current_pos;
                self.flags |= STEPPER_MIN_LIMIT_STOP;
            } else if !pos_decreasing && self.flags & STEPPER_MAX_LIMIT != 0 {
                self.target_pos = self.current_pos;
                self.flags |= STEPPER_MAX_LIMIT_STOP;
            } else {
                self.flags &=
                    !(STEPPER_FAULT_STOP | STEPPER_MIN_LIMIT_STOP | STEPPER_MAX_LIMIT_STOP);

                // Set the direction.
                if move_cw != self.direction_cw {
                    self.direction_cw = move_cw;
                    self.io.set_direction_cw(move_cw);
                }

                // Do the step.
                self.io.pulse_step();
                self.current_pos = if pos_decreasing {
                    self.current_pos.saturating_sub(1)
                } else {
                    self.current_pos.saturating_add(1)
                };

                // When do we move again?
                self.wait_ticks = if jog != 0 {
                    self.jog_interval - 1
                } else {
                    self.interval - 1
                };
            }
        }

        if self.flags != self.previous_flags {
            debug!(
                "MOT{}: flags: {}",
                self.instance,
                stepper_flag_text(self.flags)
            );
            self.previous_flags = self.flags;
        }
    }
}

fn with_flag(flags: u8, bit: u8, on: bool) -> u8 {
    if on {
        flags | bit
    } else {
        flags & !bit
    }
}

pub(crate) fn stepper_flag_text(flags: u8) -> String {
    let names = [
        (STEPPER_ENABLED, "ENABLED"),
        (STEPPER_MOVING, "MOVING"),
        (STEPPER_FAULT, "FAULT"),
        (STEPPER_MIN_LIMIT, "MINLIM"),
        (STEPPER_MAX_LIMIT, "MAXLIM"),
        (STEPPER_FAULT_STOP, "FAULT-STOP"),
        (STEPPER_MIN_LIMIT_STOP, "MINLIM-STOP"),
        (STEPPER_MAX_LIMIT_STOP, "MAXLIM-STOP"),
    ];
    let mut text = String::new();
    for (bit, name) in names {
        if flags & bit != 0 {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(name);
        }
    }
    text
}
