//! ESP-IDF UART implementation of [`LinkPort`].
//!
//! Binds the driver to a hardware UART using raw `esp-idf-sys` calls, the
//! same oneshot style as the peripheral bring-up: configure once, then
//! non-blocking reads from the driver's ring buffer. The Tesla module chain
//! runs 612 500 baud, 8N1.

use core::ffi::c_void;
use core::ptr;

use esp_idf_svc::sys::{
    ESP_OK, TickType_t, uart_config_t, uart_driver_install, uart_param_config, uart_port_t,
    uart_read_bytes, uart_set_pin, uart_word_length_t_UART_DATA_8_BITS, uart_write_bytes,
    uart_hw_flowcontrol_t_UART_HW_FLOWCTRL_DISABLE, uart_parity_t_UART_PARITY_DISABLE,
    uart_stop_bits_t_UART_STOP_BITS_1,
};
use log::info;

use crate::error::{Error, LinkError};
use crate::ports::LinkPort;

/// Chain link baud rate.
const CHAIN_BAUD: i32 = 612_500;

/// Driver-side receive ring buffer. The largest chain reply is 22 bytes;
/// the ESP-IDF UART driver requires a minimum of 128.
const RX_RING_BYTES: i32 = 256;

/// UART transport for the module chain.
pub struct UartLink {
    port: uart_port_t,
}

impl UartLink {
    /// Configure `port` for the chain link on the given GPIOs and install
    /// the UART driver.
    pub fn new(port: uart_port_t, tx_gpio: i32, rx_gpio: i32) -> Result<Self, Error> {
        let cfg = uart_config_t {
            baud_rate: CHAIN_BAUD,
            data_bits: uart_word_length_t_UART_DATA_8_BITS,
            parity: uart_parity_t_UART_PARITY_DISABLE,
            stop_bits: uart_stop_bits_t_UART_STOP_BITS_1,
            flow_ctrl: uart_hw_flowcontrol_t_UART_HW_FLOWCTRL_DISABLE,
            ..Default::default()
        };

        // SAFETY: one-shot configuration of a UART this adapter exclusively
        // owns; called before any read/write on the port.
        let rc = unsafe { uart_param_config(port, &cfg) };
        if rc != ESP_OK as i32 {
            return Err(Error::Init("uart_param_config failed"));
        }

        let rc = unsafe { uart_set_pin(port, tx_gpio, rx_gpio, -1, -1) };
        if rc != ESP_OK as i32 {
            return Err(Error::Init("uart_set_pin failed"));
        }

        let rc = unsafe { uart_driver_install(port, RX_RING_BYTES, 0, 0, ptr::null_mut(), 0) };
        if rc != ESP_OK as i32 {
            return Err(Error::Init("uart_driver_install failed"));
        }

        info!("uart_link: UART{port} up at {CHAIN_BAUD} baud (tx={tx_gpio} rx={rx_gpio})");
        Ok(Self { port })
    }
}

impl LinkPort for UartLink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        // SAFETY: frame points at valid initialised bytes for frame.len().
        let written =
            unsafe { uart_write_bytes(self.port, frame.as_ptr().cast::<c_void>(), frame.len()) };

        if written < 0 || written as usize != frame.len() {
            return Err(LinkError::WriteFailed);
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Option<u8>, LinkError> {
        let mut byte = 0u8;
        // SAFETY: one-byte destination, zero-tick timeout keeps this
        // non-blocking as the tick loop requires.
        let got = unsafe {
            uart_read_bytes(
                self.port,
                (&raw mut byte).cast::<c_void>(),
                1,
                0 as TickType_t,
            )
        };

        match got {
            1 => Ok(Some(byte)),
            0 => Ok(None),
            _ => Err(LinkError::ReadFailed),
        }
    }
}
