//! Register map, command framing, and CRC for the module chain protocol.
//!
//! Every frame on the half-duplex link is three bytes long before framing:
//!
//! ```text
//! ┌──────────────┬──────────┬──────┐
//! │ Command byte │ Register │ Data │
//! └──────────────┴──────────┴──────┘
//! ```
//!
//! The command byte is either the broadcast code `0x7F` or a module address
//! shifted left by one; its low bit selects write mode. Write-mode frames get
//! a CRC-8 appended before transmission and are echoed back by the addressed
//! module as the same three bytes with the low bit of byte 0 set, plus an
//! echo CRC (4 bytes total). A read of `n` data bytes is answered with
//! command-echo, register, length, the `n` bytes, and a CRC over everything
//! preceding it.

// ── Chain limits ─────────────────────────────────────────────

/// Highest assignable module address; also the number of module slots.
pub const MAX_MODULE_ADDR: usize = 0x3E;

/// Capacity of the I/O session frame buffer.
pub const MAX_IO_BUF: usize = 40;

// ── Command byte ─────────────────────────────────────────────

/// Low bit of the command byte clear: register read.
pub const CMD_READ: u8 = 0x00;

/// Low bit of the command byte set: register write (CRC appended on send).
pub const CMD_WRITE: u8 = 0x01;

/// Command byte addressing every module on the chain at once.
pub const BROADCAST: u8 = 0x7F;

/// Command byte for a read addressed to `addr` (1-based chain address).
pub const fn module_read(addr: u8) -> u8 {
    addr << 1 // write bit clear
}

/// Command byte for a write addressed to `addr` (1-based chain address).
pub const fn module_write(addr: u8) -> u8 {
    (addr << 1) | CMD_WRITE
}

// ── Register map ─────────────────────────────────────────────

pub const REG_DEV_STATUS: u8 = 0x00;
pub const REG_GPAI: u8 = 0x01;
pub const REG_VCELL1: u8 = 0x03;
pub const REG_TEMPERATURE1: u8 = 0x0F;
pub const REG_TEMPERATURE2: u8 = 0x11;
pub const REG_ALERT_STATUS: u8 = 0x20;
pub const REG_FAULT_STATUS: u8 = 0x21;
pub const REG_COV_FAULT: u8 = 0x22;
pub const REG_CUV_FAULT: u8 = 0x23;
pub const REG_ADC_CTRL: u8 = 0x30;
pub const REG_IO_CTRL: u8 = 0x31;
pub const REG_BAL_CTRL: u8 = 0x32;
pub const REG_BAL_TIME: u8 = 0x33;
pub const REG_ADC_CONV: u8 = 0x34;
pub const REG_ADDR_CTRL: u8 = 0x3B;
pub const REG_RESET: u8 = 0x3C;

/// Status-register data byte selecting every bit.
pub const DATA_SELECT_ALL: u8 = 0xFF;

/// Status-register data byte clearing every selected bit.
pub const DATA_CLEAR: u8 = 0x00;

/// Magic byte written to [`REG_RESET`] to reset the whole chain.
pub const RESET_MAGIC: u8 = 0xA5;

/// Length of a write-mode echo: three echoed bytes plus the echo CRC.
pub const WRITE_ECHO_LEN: usize = 4;

// ── CRC-8 ────────────────────────────────────────────────────

/// CRC-8, polynomial 0x07, init 0, no reflection, no final XOR.
///
/// Covers the full frame of a write request (appended as the last byte) and
/// all but the last byte of a read reply (compared against the last byte).
pub fn crc8(data: &[u8]) -> u8 {
    const GENERATOR: u8 = 0x07;
    let mut crc: u8 = 0;

    for byte in data {
        crc ^= byte;

        for _ in 0..8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ GENERATOR;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_chain_reset_echo() {
        // Broadcast reset is echoed as 7F 3C A5 57 on the wire.
        assert_eq!(crc8(&[BROADCAST, REG_RESET, RESET_MAGIC]), 0x57);
    }

    #[test]
    fn crc_matches_status_clear_echoes() {
        assert_eq!(crc8(&[BROADCAST, REG_ALERT_STATUS, DATA_SELECT_ALL]), 0x7D);
        assert_eq!(crc8(&[BROADCAST, REG_ALERT_STATUS, DATA_CLEAR]), 0x8E);
        assert_eq!(crc8(&[BROADCAST, REG_FAULT_STATUS, DATA_SELECT_ALL]), 0x68);
        assert_eq!(crc8(&[BROADCAST, REG_FAULT_STATUS, DATA_CLEAR]), 0x9B);
    }

    #[test]
    fn crc_matches_address_assignment_echo() {
        // The module echoes the written frame's CRC byte unchanged, so the
        // trailing 0x8B of the echo 81 3B 81 8B is the CRC of 01 3B 81.
        assert_eq!(crc8(&[CMD_WRITE, REG_ADDR_CTRL, 0x81]), 0x8B);
    }

    #[test]
    fn verifier_sees_zero_over_frame_including_crc() {
        let mut frame = [BROADCAST, REG_RESET, RESET_MAGIC, 0x00];
        frame[3] = crc8(&frame[..3]);
        assert_eq!(crc8(&frame), 0);
    }

    #[test]
    fn command_bytes_encode_address_and_direction() {
        assert_eq!(module_read(1), 0x02);
        assert_eq!(module_write(1), 0x03);
        assert_eq!(module_read(0x3E), 0x7C);
        assert_eq!(BROADCAST & CMD_WRITE, CMD_WRITE); // broadcasts are writes
    }
}
