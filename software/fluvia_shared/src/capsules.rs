//! UDP capsule formats exchanged between the supervisor and its host peers.
//!
//! Every message is a sequence of capsules. Each capsule starts with a
//! [`CapsuleHeader`] followed by `bytes_after` bytes of payload. All
//! multi-byte fields are big-endian on the wire.

use crate::enum_with_unknown;
use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};

/// Version stamped into the `instance` field of system capsules.
pub const PROTOCOL_VERSION: u8 = 1;

// Capsule magic numbers.
pub const SYSTEM_CONTROL_MAGIC: u16 = 0x4543; // 'EC'
pub const SYSTEM_STATUS_MAGIC: u16 = 0x4553; // 'ES'
pub const OPERATOR_CONTROL_MAGIC: u16 = 0x5043; // 'PC'
pub const OPERATOR_STATUS_MAGIC: u16 = 0x5053; // 'PS'

/// Collides with [`SYSTEM_STATUS_MAGIC`] on the wire; deployed receivers
/// disambiguate by payload length and position within the status batch,
/// so the value is kept as-is for compatibility.
pub const ENCODER_STATUS_MAGIC: u16 = 0x4553;

/// The first word of any capsule.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct CapsuleHeader {
    /// The number of bytes of payload following this header.
    pub bytes_after: u8,

    /// For system capsules, the protocol version; for operator and
    /// encoder capsules, the zero-based instance index.
    pub instance: u8,

    /// One of the capsule magic numbers.
    pub magic: u16,
}

/// Host-to-supervisor system capsule. Receiving one of these is what
/// registers (or refreshes) the sender in the supervisor's peer list.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_be]
pub struct SystemControl {
    /// Incrementing sequence number.
    pub seq: u8,

    /// Sequence number of the last status message received by the host.
    pub rx_seq: u8,

    /// See [`SystemCommand`].
    pub command: SystemCommand,

    /// Unused.
    pub reserved: u8,

    /// Sender's clock in milliseconds. Reserved for time synchronization.
    pub ms: u32,
}

/// Supervisor-to-host system capsule, one per status batch.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_be]
pub struct SystemStatus {
    /// Incrementing sequence number, tracked per peer.
    pub seq: u8,

    /// Sequence number of the last control message received from the peer.
    pub rx_seq: u8,

    /// The 16-bit system identifier from the preferences store.
    pub system_id: u16,

    /// Supervisor clock in milliseconds.
    pub ms: u32,
}

/// Host request addressed at one operator.
#[derive(ByteStruct, Clone, Copy, Debug, Default)]
#[byte_struct_be]
pub struct OperatorControl {
    /// The requested value in the axis' smallest resolvable unit
    /// (hundredths of degrees, tenths of mm, tenths of mL/s).
    /// For a `Reset`, this is an absolute motor step number instead.
    pub requested_value: i16,

    /// See [`OperatorCommand`].
    pub command: OperatorCommand,

    /// Unused.
    pub reserved: u8,

    /// The number of milliseconds in which `requested_value` should be
    /// achieved (0 = as soon as possible).
    pub time_to_achieve: u32,
}

/// Per-operator entry in the periodic status batch.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct OperatorStatus {
    /// The current value in the axis' smallest resolvable unit.
    pub current_value: i16,

    /// The driver flag byte, widened to 16 bits.
    pub flags: u16,

    /// The last requested value.
    pub requested_value: i16,

    /// Unused.
    pub reserved: u16,

    /// The time-to-achieve from the last move request.
    pub time_to_achieve: u32,
}

/// Per-encoder entry in the periodic status batch.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_be]
pub struct EncoderStatus {
    /// The current value in the encoder's physical unit.
    pub current_value: i16,

    /// The raw sensor reading in millivolts, for diagnostics.
    pub millivolts: u16,
}

enum_with_unknown!(
    /// System-level command carried by [`SystemControl`].
    #[derive(Default)]
    #[non_exhaustive]
    pub enum SystemCommand(u8) {
        #[default]
        Nop = 0,
    }
);

impl ByteStructLen for SystemCommand {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for SystemCommand {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = u8::from(*self);
    }
}

enum_with_unknown!(
    /// Operator command carried by [`OperatorControl`].
    #[derive(Default)]
    #[non_exhaustive]
    pub enum OperatorCommand(u8) {
        /// Do nothing.
        #[default]
        Nop = 0,
        /// Take `time_to_achieve` ms to move to `requested_value` (0 = ASAP).
        Move = 1,
        /// Stop moving, leaving the operator at its current position.
        Stop = 2,
        /// Reset the current position register to `requested_value`
        /// (a motor step) without moving the motor.
        Reset = 3,
    }
);

impl ByteStructLen for OperatorCommand {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for OperatorCommand {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = u8::from(*self);
    }
}

/// Actuator flag bytes as reported in driver status records and echoed
/// through operator-status capsules.
pub mod flags {
    // Stepper driver flag byte.
    pub const STEPPER_ENABLED: u8 = 0x80; // motor is enabled
    pub const STEPPER_MOVING: u8 = 0x40; // move request is active
    pub const STEPPER_FAULT: u8 = 0x20; // current fault indication
    pub const STEPPER_MIN_LIMIT: u8 = 0x10; // minimum limit switch indication
    pub const STEPPER_MAX_LIMIT: u8 = 0x08; // maximum limit switch indication
    pub const STEPPER_FAULT_STOP: u8 = 0x04; // stopped due to motor fault
    pub const STEPPER_MIN_LIMIT_STOP: u8 = 0x02; // stopped by minimum limit switch
    pub const STEPPER_MAX_LIMIT_STOP: u8 = 0x01; // stopped by maximum limit switch

    // Speed-controller flag byte.
    pub const SPEED_ENABLED: u8 = 0x80; // driver is enabled
    pub const SPEED_CHANGING: u8 = 0x40; // speed change request is active
    pub const SPEED_LOWER_LIMIT: u8 = 0x10; // at minimum speed
    pub const SPEED_UPPER_LIMIT: u8 = 0x08; // at maximum speed
    pub const SPEED_LOWER_LIMIT_STOP: u8 = 0x02; // holding after reaching minimum
    pub const SPEED_UPPER_LIMIT_STOP: u8 = 0x01; // holding after reaching maximum
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(CapsuleHeader::BYTE_LEN, 4);
        assert_eq!(SystemControl::BYTE_LEN, 8);
        assert_eq!(SystemStatus::BYTE_LEN, 8);
        assert_eq!(OperatorControl::BYTE_LEN, 8);
        assert_eq!(OperatorStatus::BYTE_LEN, 12);
        assert_eq!(EncoderStatus::BYTE_LEN, 4);
    }

    #[test]
    fn test_header_byte_order() {
        let h = CapsuleHeader {
            bytes_after: OperatorControl::BYTE_LEN as u8,
            instance: 2,
            magic: OPERATOR_CONTROL_MAGIC,
        };
        let mut buf = [0_u8; CapsuleHeader::BYTE_LEN];
        h.write_bytes(&mut buf);

        // Magic lands on the wire most-significant byte first.
        assert_eq!(buf, [8, 2, 0x50, 0x43]);
        assert_eq!(CapsuleHeader::read_bytes(&buf), h);
    }

    #[test]
    fn test_operator_control_round_trip() {
        let occ = OperatorControl {
            requested_value: -180,
            command: OperatorCommand::Move,
            reserved: 0,
            time_to_achieve: 5000,
        };
        let mut buf = [0_u8; OperatorControl::BYTE_LEN];
        occ.write_bytes(&mut buf);

        let back = OperatorControl::read_bytes(&buf);
        assert_eq!(back.requested_value, -180);
        assert_eq!(back.command, OperatorCommand::Move);
        assert_eq!(back.time_to_achieve, 5000);
    }

    #[test]
    fn test_unknown_command_is_preserved() {
        let cmd = OperatorCommand::from(9_u8);
        assert_eq!(cmd, OperatorCommand::Unknown(9));
        assert_eq!(u8::from(cmd), 9);
    }
}
