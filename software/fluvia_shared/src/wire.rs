//! Command and status messages carried on the framed driver link.
//!
//! Commands run supervisor -> driver, one per frame, each closed with an
//! 8-bit CRC over the preceding bytes:
//!
//! * Move:  `[instance << 4 | 0x1, target(i16 be), interval(u16 be), crc]`
//! * Stop:  `[instance << 4 | 0x2, crc]`
//! * Reset: `[instance << 4 | 0x3, position(i16 be), crc]`
//!
//! Status runs driver -> supervisor: one 4-byte record per equipped
//! actuator (`instance, flags, value(i16 be)`), then one trailing CRC
//! over all of the records. A message whose checksum does not match is
//! discarded in full; no partial application.

use crate::checksum::{crc8, verify};

pub const OPCODE_MOVE: u8 = 0x1;
pub const OPCODE_STOP: u8 = 0x2;
pub const OPCODE_RESET: u8 = 0x3;

pub const MOVE_FRAME_BYTES: usize = 6;
pub const STOP_FRAME_BYTES: usize = 2;
pub const RESET_FRAME_BYTES: usize = 4;

/// Bytes per actuator record in a status message.
pub const STATUS_RECORD_BYTES: usize = 4;

/// One actuator intent, addressed to an instance on the driver unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Move to `target` steps (or PWM level), one step per `interval`
    /// ticks. An interval of 1 steps every tick; 0 never moves.
    Move { target: i16, interval: u16 },
    /// Halt at the current position/level.
    Stop,
    /// Reset the position register without moving the motor.
    Reset { position: i16 },
}

/// One actuator entry in a status message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusRecord {
    pub instance: u8,
    pub flags: u8,
    /// Step position for steppers, PWM level for speed controllers.
    pub value: i16,
}

/// Encode a command frame into `out`, returning the number of bytes
/// written. `out` must hold at least [`MOVE_FRAME_BYTES`].
pub fn encode_command(instance: u8, cmd: Command, out: &mut [u8]) -> usize {
    let n = match cmd {
        Command::Move { target, interval } => {
            out[0] = (instance << 4) | OPCODE_MOVE;
            out[1..3].copy_from_slice(&target.to_be_bytes());
            out[3..5].copy_from_slice(&interval.to_be_bytes());
            MOVE_FRAME_BYTES
        }
        Command::Stop => {
            out[0] = (instance << 4) | OPCODE_STOP;
            STOP_FRAME_BYTES
        }
        Command::Reset { position } => {
            out[0] = (instance << 4) | OPCODE_RESET;
            out[1..3].copy_from_slice(&position.to_be_bytes());
            RESET_FRAME_BYTES
        }
    };
    out[n - 1] = crc8(&out[..n - 1]);
    n
}

/// Parse and checksum-verify a command frame.
///
/// Returns the addressed instance and the command, or None for a frame
/// that is malformed, carries an unknown opcode, or fails its checksum.
pub fn parse_command(frame: &[u8]) -> Option<(u8, Command)> {
    if frame.len() < STOP_FRAME_BYTES {
        return None;
    }
    let (payload, sum) = frame.split_at(frame.len() - 1);
    if !verify(payload, sum[0]) {
        return None;
    }

    let instance = (payload[0] >> 4) & 0x0F;
    let cmd = match (payload[0] & 0x0F, frame.len()) {
        (OPCODE_MOVE, MOVE_FRAME_BYTES) => Command::Move {
            target: i16::from_be_bytes([payload[1], payload[2]]),
            interval: u16::from_be_bytes([payload[3], payload[4]]),
        },
        (OPCODE_STOP, STOP_FRAME_BYTES) => Command::Stop,
        (OPCODE_RESET, RESET_FRAME_BYTES) => Command::Reset {
            position: i16::from_be_bytes([payload[1], payload[2]]),
        },
        _ => return None,
    };

    Some((instance, cmd))
}

/// Encode a status message into `out`, returning the number of bytes
/// written (`4 * records.len() + 1`).
pub fn encode_status(records: &[StatusRecord], out: &mut [u8]) -> usize {
    let mut n = 0;
    for r in records {
        out[n] = r.instance;
        out[n + 1] = r.flags;
        out[n + 2..n + 4].copy_from_slice(&r.value.to_be_bytes());
        n += STATUS_RECORD_BYTES;
    }
    out[n] = crc8(&out[..n]);
    n + 1
}

/// Parse and checksum-verify a status message into `out`, returning the
/// number of records, or None for a malformed or corrupt message (in
/// which case nothing can be trusted and the whole message is dropped).
pub fn parse_status(frame: &[u8], out: &mut [StatusRecord]) -> Option<usize> {
    if frame.is_empty() || (frame.len() - 1) % STATUS_RECORD_BYTES != 0 {
        return None;
    }
    let (payload, sum) = frame.split_at(frame.len() - 1);
    if !verify(payload, sum[0]) {
        return None;
    }

    let count = payload.len() / STATUS_RECORD_BYTES;
    if count > out.len() {
        return None;
    }
    for (i, chunk) in payload.chunks_exact(STATUS_RECORD_BYTES).enumerate() {
        out[i] = StatusRecord {
            instance: chunk[0],
            flags: chunk[1],
            value: i16::from_be_bytes([chunk[2], chunk[3]]),
        };
    }
    Some(count)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_move_round_trip() {
        let mut buf = [0_u8; MOVE_FRAME_BYTES];
        let n = encode_command(
            2,
            Command::Move {
                target: -1234,
                interval: 7,
            },
            &mut buf,
        );
        assert_eq!(n, MOVE_FRAME_BYTES);
        assert_eq!(buf[0], 0x21);

        let (instance, cmd) = parse_command(&buf).unwrap();
        assert_eq!(instance, 2);
        assert_eq!(
            cmd,
            Command::Move {
                target: -1234,
                interval: 7
            }
        );
    }

    #[test]
    fn test_stop_and_reset_round_trip() {
        let mut buf = [0_u8; MOVE_FRAME_BYTES];

        let n = encode_command(0, Command::Stop, &mut buf);
        assert_eq!(n, STOP_FRAME_BYTES);
        assert_eq!(parse_command(&buf[..n]), Some((0, Command::Stop)));

        let n = encode_command(3, Command::Reset { position: 2456 }, &mut buf);
        assert_eq!(n, RESET_FRAME_BYTES);
        assert_eq!(
            parse_command(&buf[..n]),
            Some((3, Command::Reset { position: 2456 }))
        );
    }

    #[test]
    fn test_corrupt_command_is_rejected() {
        let mut buf = [0_u8; MOVE_FRAME_BYTES];
        let n = encode_command(
            1,
            Command::Move {
                target: 100,
                interval: 4,
            },
            &mut buf,
        );

        let mut corrupt = buf;
        corrupt[2] ^= 0x01;
        assert_eq!(parse_command(&corrupt[..n]), None);

        // Truncation is also rejected.
        assert_eq!(parse_command(&buf[..n - 1]), None);
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let mut buf = [0x1F_u8, 0];
        buf[1] = crate::checksum::crc8(&buf[..1]);
        assert_eq!(parse_command(&buf), None);
    }

    #[test]
    fn test_status_round_trip() {
        let records = [
            StatusRecord {
                instance: 0,
                flags: 0xC0,
                value: -5,
            },
            StatusRecord {
                instance: 2,
                flags: 0x01,
                value: 2456,
            },
            StatusRecord {
                instance: 3,
                flags: 0x80,
                value: 255,
            },
        ];
        let mut buf = [0_u8; 32];
        let n = encode_status(&records, &mut buf);
        assert_eq!(n, 3 * STATUS_RECORD_BYTES + 1);

        let mut out = [StatusRecord::default(); 8];
        assert_eq!(parse_status(&buf[..n], &mut out), Some(3));
        assert_eq!(&out[..3], &records);
    }

    #[test]
    fn test_corrupt_status_is_dropped_whole() {
        let records = [StatusRecord {
            instance: 1,
            flags: 0,
            value: 10,
        }];
        let mut buf = [0_u8; 32];
        let n = encode_status(&records, &mut buf);

        let mut out = [StatusRecord::default(); 8];
        for byte in 0..n {
            let mut corrupt = buf;
            corrupt[byte] ^= 0x10;
            assert_eq!(parse_status(&corrupt[..n], &mut out), None);
        }
    }
}
