//! Port trait — the hexagonal boundary between the driver core and the
//! physical link.
//!
//! ```text
//!   UART adapter ──▶ LinkPort ──▶ Bms::service_link (core)
//! ```
//!
//! The core never touches hardware directly: a transport adapter implements
//! [`LinkPort`] and [`crate::Bms::service_link`] runs the documented
//! `tx_available`/`tx_flush`/`set_rx` handshake against it. Integration tests
//! implement the same trait over a scripted reply table.

use crate::error::LinkError;

/// Byte transport for the half-duplex module chain link.
pub trait LinkPort {
    /// Transmit one complete outbound frame.
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Poll for one received byte; `None` when nothing is pending.
    fn read_byte(&mut self) -> Result<Option<u8>, LinkError>;
}
