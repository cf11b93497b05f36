//! `embedded-hal` pin adapters for the actuator hardware seams.
//!
//! These map the semantic operations of [`StepperIo`]/[`SpeedIo`] onto
//! real signal polarities:
//!
//! * stepper EN is low-active, pump EN is high-active
//! * DIR low means clockwise
//! * FAULT closes to ground on fault (low-active)
//! * limit switches are high-active
//! * jog switches are low-active; the jog-enable level is configurable
//!
//! Optional inputs that are not fitted on an axis are `None`.

use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::pwm::SetDutyCycle;

use crate::speed::SpeedIo;
use crate::stepper::StepperIo;

/// Jog-enable gate: the input pin and the level at which jogging is
/// permitted (true = high).
pub struct JogEnable<P> {
    pub pin: P,
    pub active_high: bool,
}

/// Pin set for one stepper axis.
pub struct StepperPins<En, Dir, Step, Fault, Lim, Jog, JogEn> {
    pub en: En,
    pub dir: Dir,
    pub step: Step,
    pub fault: Fault,
    pub min_limit: Option<Lim>,
    pub max_limit: Option<Lim>,
    pub jog_increment: Option<Jog>,
    pub jog_decrement: Option<Jog>,
    pub jog_enable: Option<JogEnable<JogEn>>,
}

impl<En, Dir, Step, Fault, Lim, Jog, JogEn> StepperIo
    for StepperPins<En, Dir, Step, Fault, Lim, Jog, JogEn>
where
    En: OutputPin,
    Dir: OutputPin,
    Step: OutputPin,
    Fault: InputPin,
    Lim: InputPin,
    Jog: InputPin,
    JogEn: InputPin,
{
    fn set_enabled(&mut self, enabled: bool) {
        // EN is low-active.
        let _ = if enabled {
            self.en.set_low()
        } else {
            self.en.set_high()
        };
    }

    fn set_direction_cw(&mut self, cw: bool) {
        let _ = if cw {
            self.dir.set_low()
        } else {
            self.dir.set_high()
        };
    }

    fn pulse_step(&mut self) {
        let _ = self.step.set_high();
        let _ = self.step.set_low();
    }

    fn fault_active(&mut self) -> bool {
        self.fault.is_low().unwrap_or(false)
    }

    fn min_limit_active(&mut self) -> Option<bool> {
        self.min_limit.as_mut().map(|p| p.is_high().unwrap_or(false))
    }

    fn max_limit_active(&mut self) -> Option<bool> {
        self.max_limit.as_mut().map(|p| p.is_high().unwrap_or(false))
    }

    fn jog_increment_active(&mut self) -> Option<bool> {
        self.jog_increment
            .as_mut()
            .map(|p| p.is_low().unwrap_or(false))
    }

    fn jog_decrement_active(&mut self) -> Option<bool> {
        self.jog_decrement
            .as_mut()
            .map(|p| p.is_low().unwrap_or(false))
    }

    fn jog_enabled(&mut self) -> bool {
        match self.jog_enable.as_mut() {
            None => true,
            Some(gate) => gate.pin.is_high().unwrap_or(false) == gate.active_high,
        }
    }
}

/// Pin set for one speed-controlled axis.
pub struct SpeedPins<En, Pwm, Jog, JogEn> {
    pub en: En,
    pub pwm: Pwm,
    pub jog_increment: Option<Jog>,
    pub jog_decrement: Option<Jog>,
    pub jog_enable: Option<JogEnable<JogEn>>,
}

impl<En, Pwm, Jog, JogEn> SpeedIo for SpeedPins<En, Pwm, Jog, JogEn>
where
    En: OutputPin,
    Pwm: SetDutyCycle,
    Jog: InputPin,
    JogEn: InputPin,
{
    fn set_enabled(&mut self, enabled: bool) {
        // EN is high-active.
        let _ = if enabled {
            self.en.set_high()
        } else {
            self.en.set_low()
        };
    }

    fn set_level(&mut self, level: u8) {
        let _ = self.pwm.set_duty_cycle_fraction(level as u16, u8::MAX as u16);
    }

    fn jog_increment_active(&mut self) -> Option<bool> {
        self.jog_increment
            .as_mut()
            .map(|p| p.is_low().unwrap_or(false))
    }

    fn jog_decrement_active(&mut self) -> Option<bool> {
        self.jog_decrement
            .as_mut()
            .map(|p| p.is_low().unwrap_or(false))
    }

    fn jog_enabled(&mut self) -> bool {
        match self.jog_enable.as_mut() {
            None => true,
            Some(gate) => gate.pin.is_high().unwrap_or(false) == gate.active_high,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::convert::Infallible;
    use std::sync::{Arc, Mutex};

    /// A pin remembering its level, readable and writable.
    #[derive(Clone)]
    struct TestPin(Arc<Mutex<bool>>);

    impl TestPin {
        fn new(high: bool) -> Self {
            Self(Arc::new(Mutex::new(high)))
        }

        fn get(&self) -> bool {
            *self.0.lock().unwrap()
        }
    }

    impl embedded_hal::digital::ErrorType for TestPin {
        type Error = Infallible;
    }

    impl OutputPin for TestPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            *self.0.lock().unwrap() = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            *self.0.lock().unwrap() = true;
            Ok(())
        }
    }

    impl InputPin for TestPin {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.get())
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.get())
        }
    }

    fn pins() -> (
        StepperPins<TestPin, TestPin, TestPin, TestPin, TestPin, TestPin, TestPin>,
        TestPin,
        TestPin,
    ) {
        let en = TestPin::new(true);
        let fault = TestPin::new(true);
        let p = StepperPins {
            en: en.clone(),
            dir: TestPin::new(true),
            step: TestPin::new(false),
            fault: fault.clone(),
            min_limit: None,
            max_limit: Some(TestPin::new(false)),
            jog_increment: None,
            jog_decrement: None,
            jog_enable: Some(JogEnable {
                pin: TestPin::new(false),
                active_high: false,
            }),
        };
        (p, en, fault)
    }

    #[test]
    fn test_stepper_polarities() {
        let (mut p, en, fault) = pins();

        // EN is low-active.
        p.set_enabled(true);
        assert!(!en.get());
        p.set_enabled(false);
        assert!(en.get());

        // FAULT is low-active (pulled high when healthy).
        assert!(!p.fault_active());
        let _ = fault.clone().set_low();
        assert!(p.fault_active());

        // Unfitted inputs read as absent, fitted ones as inactive.
        assert_eq!(p.min_limit_active(), None);
        assert_eq!(p.max_limit_active(), Some(false));
        assert_eq!(p.jog_increment_active(), None);

        // Jog gate at its active level (low).
        assert!(p.jog_enabled());
    }
}
