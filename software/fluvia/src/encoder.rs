//! Position encoders reporting in physical units.
//!
//! The ADC hardware (an I2C register wrapper) lives behind the
//! [`MillivoltSource`] seam; an encoder composes a source with a
//! millivolt-to-physical-unit calibration table. A source that fails to
//! read is "not reporting" and the operator falls back to open-loop
//! step-derived position.

use fluvia_shared::capsules::EncoderStatus;

use crate::table::Table;

/// A raw analog reading, in millivolts.
pub trait MillivoltSource {
    /// Read the sensor; None if the ADC did not produce a sample.
    fn read_millivolts(&mut self) -> Option<u16>;
}

/// An encoder that reports a physical-unit value.
pub trait Encoder {
    /// The current value in physical units; None when not reporting.
    fn value_pu(&mut self) -> Option<i16>;

    /// Status capsule payload; None when not reporting.
    fn status(&mut self) -> Option<EncoderStatus>;
}

/// A linear encoder read through an ADC, mapped to physical units by a
/// calibration table.
pub struct TableMappedEncoder {
    name: &'static str,
    source: Box<dyn MillivoltSource>,
    table: &'static Table,
}

impl TableMappedEncoder {
    pub fn new(name: &'static str, source: Box<dyn MillivoltSource>, table: &'static Table) -> Self {
        Self {
            name,
            source,
            table,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn read(&mut self) -> Option<(i16, u16)> {
        let mv = self.source.read_millivolts()?;
        let clamped = mv.min(i16::MAX as u16) as i16;
        Some((self.table.map_x_to_y(clamped), mv))
    }
}

impl Encoder for TableMappedEncoder {
    fn value_pu(&mut self) -> Option<i16> {
        self.read().map(|(pu, _)| pu)
    }

    fn status(&mut self) -> Option<EncoderStatus> {
        self.read().map(|(pu, mv)| EncoderStatus {
            current_value: pu,
            millivolts: mv,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::{Arc, Mutex};

    static MV_TO_ANGLE: Lazy<Table> = Lazy::new(|| Table::interpolated(&[(1197, 360), (2667, -45)]));

    /// Source handing out scripted readings.
    pub struct FakeAdc(pub Arc<Mutex<Option<u16>>>);

    impl MillivoltSource for FakeAdc {
        fn read_millivolts(&mut self) -> Option<u16> {
            *self.0.lock().unwrap()
        }
    }

    #[test]
    fn test_reports_through_table() {
        let reading = Arc::new(Mutex::new(Some(1197_u16)));
        let mut enc =
            TableMappedEncoder::new("pitch", Box::new(FakeAdc(reading.clone())), &MV_TO_ANGLE);

        assert_eq!(enc.value_pu(), Some(360));

        let status = enc.status().unwrap();
        assert_eq!(status.current_value, 360);
        assert_eq!(status.millivolts, 1197);
    }

    #[test]
    fn test_not_reporting() {
        let reading = Arc::new(Mutex::new(None));
        let mut enc = TableMappedEncoder::new("roll", Box::new(FakeAdc(reading)), &MV_TO_ANGLE);

        assert_eq!(enc.value_pu(), None);
        assert!(enc.status().is_none());
    }
}
