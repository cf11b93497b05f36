#![doc = include_str!("../README.md")]

pub mod calibration;
pub mod clock;
pub mod config;
pub mod encoder;
pub mod link;
pub mod logging;
pub mod net;
pub mod operator;
pub mod rig;
pub mod supervisor;
pub mod table;

pub use clock::{Clock, SystemClock};
pub use config::Prefs;
pub use operator::{Conversion, Operator};
pub use rig::Rig;
pub use supervisor::Supervisor;
pub use table::Table;
