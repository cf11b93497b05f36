#![doc = include_str!("../README.md")]

pub mod pins;
pub mod sim;
pub mod speed;
pub mod stepper;
pub mod unit;

pub use speed::{SpeedDriver, SpeedIo};
pub use stepper::{StepperDriver, StepperIo};
pub use unit::DriverUnit;

/// The number of ticks between enabling a motor and the first step.
pub const STARTUP_WAIT_TICKS: u32 = 10;
