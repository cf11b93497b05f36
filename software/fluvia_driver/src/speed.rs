//! Per-tick state machine for the PWM speed-controlled pump.
//!
//! Same shape as the stepper machine with the PWM level standing in for
//! position: a saturating ramp bounded at 0 and 255, with no direction
//! output or limit switches. The enable output additionally tracks the
//! level, so the pump is only energized while its speed is nonzero.

use tracing::debug;

use crate::STARTUP_WAIT_TICKS;
use fluvia_shared::capsules::flags::*;

/// The saturation ceiling of the PWM level.
pub const MAX_SPEED: i16 = 255;

/// Hardware attachment for one speed-controlled axis.
pub trait SpeedIo {
    /// Energize or de-energize the motor driver.
    fn set_enabled(&mut self, enabled: bool);

    /// Write the PWM output level.
    fn set_level(&mut self, level: u8);

    /// Whether the jog-increment switch is pressed.
    fn jog_increment_active(&mut self) -> Option<bool>;

    /// Whether the jog-decrement switch is pressed.
    fn jog_decrement_active(&mut self) -> Option<bool>;

    /// Whether jogging is currently permitted.
    fn jog_enabled(&mut self) -> bool;
}

/// Speed-controller driver. The level ramps one count per governed tick
/// toward the target; commands only update the request registers.
pub struct SpeedDriver {
    io: Box<dyn SpeedIo + Send>,

    // The instance number, for logging.
    instance: u8,

    // Ticks between level changes, plus 1, while jogging (0 disables jogging).
    jog_interval: u32,

    // The current speed, as a PWM level (0..=255).
    current_speed: i16,

    // The intended speed, as a PWM level (0..=255).
    target_speed: i16,

    // Ticks between level changes, plus 1 (0 = holding; 1 = every tick).
    interval: u32,

    // The current flag values (SPEED_* bits).
    flags: u8,

    // Ticks until the next level change.
    wait_ticks: u32,

    // The jog intent on the previous tick.
    previous_jog: i8,

    // The flags on the previous tick.
    previous_flags: u8,
}

impl SpeedDriver {
    pub fn new(instance: u8, jog_interval: u32, mut io: Box<dyn SpeedIo + Send>) -> Self {
        // Start with the pump de-energized.
        io.set_enabled(false);

        Self {
            io,
            instance,
            jog_interval,
            current_speed: 0,
            target_speed: 0,
            interval: 0,
            flags: 0,
            wait_ticks: 0,
            previous_jog: 0,
            // Force the first flag transition to log.
            previous_flags: 0xFF,
        }
    }

    /// Set the requested speed and ramp rate.
    ///
    /// `interval` is the number of ticks between level changes, plus one;
    /// 0 is ignored, as is a request for the speed already targeted.
    pub fn change_speed(&mut self, speed: i16, mut interval: u32) {
        if speed == self.target_speed || interval == 0 {
            return;
        }

        // A ramp may not outrun the configured jog rate.
        if self.jog_interval != 0 && interval < self.jog_interval {
            interval = self.jog_interval;
        }

        self.target_speed = speed.clamp(0, MAX_SPEED);
        self.interval = interval;

        // Take action on the next tick.
        self.wait_ticks = 0;
        self.flags |= SPEED_CHANGING;

        debug!(
            "SPD{}: changing speed to {} at {} ticks/step",
            self.instance, self.target_speed, interval
        );
    }

    /// Stop ramping and hold the current speed.
    pub fn hold_speed(&mut self) {
        self.target_speed = self.current_speed;
        self.interval = 0;

        debug!("SPD{}: holding speed", self.instance);
    }

    pub fn speed(&self) -> i16 {
        self.current_speed
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
                "SPD{}: at speed {}, wait {}, interval {}",
                self.instance, self.current_speed, self.wait_ticks, interval
            );
        } else {
            debug!("SPD{}: at speed {}", self.instance, self.current_speed);
        }
    }

    /// Do the ramp; call exactly once per tick.
    pub fn work(&mut self) {
        // Saturation stands in for limit switches.
        self.flags = with_flag(self.flags, SPEED_LOWER_LIMIT, self.current_speed <= 0);
        self.flags = with_flag(self.flags, SPEED_UPPER_LIMIT, self.current_speed >= MAX_SPEED);

        // Off a saturation bound, the "stopped there" indication can clear.
        if self.flags & SPEED_LOWER_LIMIT == 0 {
            self.flags &= !SPEED_LOWER_LIMIT_STOP;
        }
        if self.flags & SPEED_UPPER_LIMIT == 0 {
            self.flags &= !SPEED_UPPER_LIMIT_STOP;
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
            debug!(
                "SPD{}: jog {} at speed {}",
                self.instance, mode, self.current_speed
            );
            self.previous_jog = jog;
        }

        // Are we not changing speed?
        if jog == 0 && (self.target_speed == self.current_speed || self.interval == 0) {
            // Regardless of why, make the settings consistent. Unlike the
            // stepper, the driver stays energized while holding a nonzero
            // level; de-energizing is handled below at zero speed.
            self.target_speed = self.current_speed;
            self.interval = 0;
            self.flags &= !SPEED_CHANGING;
        }
        // Do we need to enable the driver?
        else if self.flags & SPEED_ENABLED == 0 {
            self.io.set_enabled(true);
            self.flags |= SPEED_ENABLED;

            // Impose the startup settling delay.
            self.wait_ticks = STARTUP_WAIT_TICKS;
        }
        // Is it not yet time to change speed?
        else if self.wait_ticks != 0 {
            self.wait_ticks -= 1;
        }
        // Time to change speed.
        else {
            let speed_decreasing = jog < 0 || (jog == 0 && self.target_speed < self.current_speed);

            // Are we at a saturation bound?
            if speed_decreasing && self.current_speed == 0 {
                self.target_speed = self.current_speed;
                self.flags |= SPEED_LOWER_LIMIT_STOP;
            } else if !speed_decreasing && self.current_speed == MAX_SPEED {
                self.target_speed = self.current_speed;
                self.flags |= SPEED_UPPER_LIMIT_STOP;
            } else {
                self.flags &= !(SPEED_LOWER_LIMIT_STOP | SPEED_UPPER_LIMIT_STOP);

                // Adjust the level.
                self.current_speed += if speed_decreasing { -1 } else { 1 };
                self.current_speed = self.current_speed.clamp(0, MAX_SPEED);
                self.io.set_level(self.current_speed as u8);

                // When do we change again?
                self.wait_ticks = if jog != 0 {
                    self.jog_interval - 1
                } else {
                    self.interval - 1
                };
            }
        }

        // The enable output tracks the level: energized only while the
        // speed is nonzero or a change toward nonzero is in progress.
        if self.current_speed == 0
            && self.flags & SPEED_CHANGING == 0
            && self.flags & SPEED_ENABLED != 0
        {
            debug!("SPD{}: disabling motor", self.instance);
            self.io.set_enabled(false);
            self.flags &= !SPEED_ENABLED;
        }
        if self.current_speed != 0 && self.flags & SPEED_ENABLED == 0 {
            debug!("SPD{}: enabling motor", self.instance);
            self.io.set_enabled(true);
            self.flags |= SPEED_ENABLED;
        }

        if self.flags != self.previous_flags {
            debug!(
                "SPD{}: flags: {}",
                self.instance,
                speed_flag_text(self.flags)
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

pub(crate) fn speed_flag_text(flags: u8) -> String {
    let names = [
        (SPEED_ENABLED, "EN"),
        (SPEED_CHANGING, "CHANGING"),
        (SPEED_LOWER_LIMIT, "SLOWLIM"),
        (SPEED_UPPER_LIMIT, "FASTLIM"),
        (SPEED_LOWER_LIMIT_STOP, "SLOWLIM-STOP"),
        (SPEED_UPPER_LIMIT_STOP, "FASTLIM-STOP"),
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimSpeedIo;

    #[test]
    fn test_ramp_up_and_hold() {
        let (io, state) = SimSpeedIo::new();
        let mut s = SpeedDriver::new(3, 0, Box::new(io));

        s.change_speed(3, 1);
        // Enable tick, settling delay, then one count per tick.
        for _ in 0..=STARTUP_WAIT_TICKS {
            s.work();
        }
        assert_eq!(s.speed(), 0);
        assert!(state.lock().unwrap().enabled);

        for expect in 1..=3 {
            s.work();
            assert_eq!(s.speed(), expect);
            assert_eq!(state.lock().unwrap().level, expect as u8);
        }

        // Holding at a nonzero level keeps the driver energized.
        s.work();
        assert_eq!(s.flags() & SPEED_CHANGING, 0);
        assert_ne!(s.flags() & SPEED_ENABLED, 0);
        assert!(state.lock().unwrap().enabled);
    }

    #[test]
    fn test_ramp_to_zero_de_energizes() {
        let (io, state) = SimSpeedIo::new();
        let mut s = SpeedDriver::new(3, 0, Box::new(io));

        s.change_speed(2, 1);
        for _ in 0..(STARTUP_WAIT_TICKS + 3) {
            s.work();
        }
        assert_eq!(s.speed(), 2);

        s.change_speed(0, 1);
        s.work();
        s.work();
        assert_eq!(s.speed(), 0);

        // Reaching zero and finishing the change turns the driver off.
        s.work();
        assert_eq!(s.flags() & SPEED_ENABLED, 0);
        assert!(!state.lock().unwrap().enabled);
        assert_ne!(s.flags() & SPEED_LOWER_LIMIT, 0);
    }

    #[test]
    fn test_target_is_clamped() {
        let (io, _state) = SimSpeedIo::new();
        let mut s = SpeedDriver::new(3, 0, Box::new(io));

        s.change_speed(1000, 1);
        for _ in 0..=STARTUP_WAIT_TICKS {
            s.work();
        }
        for _ in 0..MAX_SPEED {
            s.work();
        }
        assert_eq!(s.speed(), MAX_SPEED);

        // Saturated at the top: the upper stop latches once the ramp
        // tries to go beyond.
        s.work();
        assert_ne!(s.flags() & SPEED_UPPER_LIMIT, 0);
    }

    #[test]
    fn test_jog_decrement_saturates_at_zero() {
        let (io, state) = SimSpeedIo::new();
        let mut s = SpeedDriver::new(3, 2, Box::new(io));

        state.lock().unwrap().jog_decrement = true;
        for _ in 0..=STARTUP_WAIT_TICKS {
            s.work();
        }
        // Already at zero: the lower stop latches instead of wrapping.
        s.work();
        assert_eq!(s.speed(), 0);
        assert_ne!(s.flags() & SPEED_LOWER_LIMIT_STOP, 0);
    }

    #[test]
    fn test_hold_speed_freezes_ramp() {
        let (io, _state) = SimSpeedIo::new();
        let mut s = SpeedDriver::new(3, 0, Box::new(io));

        s.change_speed(100, 1);
        for _ in 0..(STARTUP_WAIT_TICKS + 6) {
            s.work();
        }
        let level = s.speed();
        assert!(level > 0);

        s.hold_speed();
        for _ in 0..10 {
            s.work();
        }
        assert_eq!(s.speed(), level);
    }
}
