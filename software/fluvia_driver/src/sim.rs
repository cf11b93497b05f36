//! Software-simulated hardware attachments.
//!
//! These stand in for the real pin adapters when the driver unit runs
//! hardware-out-of-the-loop: tests and simulations twiddle the shared
//! state to play the part of switches and watch the outputs the state
//! machines produce.

use std::sync::{Arc, Mutex};

use crate::speed::SpeedIo;
use crate::stepper::StepperIo;

/// Observable/controllable state of a simulated stepper axis.
#[derive(Debug)]
pub struct StepperState {
    // Outputs driven by the state machine.
    pub enabled: bool,
    pub direction_cw: bool,
    pub step_pulses: u32,

    // Inputs controlled by the simulation.
    pub fault: bool,
    pub min_limit: bool,
    pub max_limit: bool,
    pub jog_increment: bool,
    pub jog_decrement: bool,
    pub jog_enabled: bool,
}

impl Default for StepperState {
    fn default() -> Self {
        Self {
            enabled: false,
            direction_cw: false,
            step_pulses: 0,
            fault: false,
            min_limit: false,
            max_limit: false,
            jog_increment: false,
            jog_decrement: false,
            // No jog-enable switch fitted: jogging permitted.
            jog_enabled: true,
        }
    }
}

/// Simulated stepper attachment.
pub struct SimStepperIo {
    state: Arc<Mutex<StepperState>>,
}

impl SimStepperIo {
    /// Create an attachment along with a handle to its shared state.
    pub fn new() -> (Self, Arc<Mutex<StepperState>>) {
        let state = Arc::new(Mutex::new(StepperState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl StepperIo for SimStepperIo {
    fn set_enabled(&mut self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    fn set_direction_cw(&mut self, cw: bool) {
        self.state.lock().unwrap().direction_cw = cw;
    }

    fn pulse_step(&mut self) {
        self.state.lock().unwrap().step_pulses += 1;
    }

    fn fault_active(&mut self) -> bool {
        self.state.lock().unwrap().fault
    }

    fn min_limit_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().min_limit)
    }

    fn max_limit_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().max_limit)
    }

    fn jog_increment_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().jog_increment)
    }

    fn jog_decrement_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().jog_decrement)
    }

    fn jog_enabled(&mut self) -> bool {
        self.state.lock().unwrap().jog_enabled
    }
}

/// Observable/controllable state of a simulated speed-controlled axis.
#[derive(Debug)]
pub struct SpeedState {
    // Outputs driven by the state machine.
    pub enabled: bool,
    pub level: u8,

    // Inputs controlled by the simulation.
    pub jog_increment: bool,
    pub jog_decrement: bool,
    pub jog_enabled: bool,
}

impl Default for SpeedState {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 0,
            jog_increment: false,
            jog_decrement: false,
            jog_enabled: true,
        }
    }
}

/// Simulated speed-controller attachment.
pub struct SimSpeedIo {
    state: Arc<Mutex<SpeedState>>,
}

impl SimSpeedIo {
    /// Create an attachment along with a handle to its shared state.
    pub fn new() -> (Self, Arc<Mutex<SpeedState>>) {
        let state = Arc::new(Mutex::new(SpeedState::default()));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl SpeedIo for SimSpeedIo {
    fn set_enabled(&mut self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
    }

    fn set_level(&mut self, level: u8) {
        self.state.lock().unwrap().level = level;
    }

    fn jog_increment_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().jog_increment)
    }

    fn jog_decrement_active(&mut self) -> Option<bool> {
        Some(self.state.lock().unwrap().jog_decrement)
    }

    fn jog_enabled(&mut self) -> bool {
        self.state.lock().unwrap().jog_enabled
    }
}
