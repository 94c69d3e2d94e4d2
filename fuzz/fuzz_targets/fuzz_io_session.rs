//! Fuzz target: the I/O session under arbitrary operation interleavings.
//!
//! Decodes fuzz bytes into task-side and transport-side operations in any
//! order, including misuse no task would produce, and verifies:
//! - No panics
//! - The buffer roles are never both open
//! - The reply never outgrows the session buffer
//!
//! cargo fuzz run fuzz_io_session

#![no_main]

use libfuzzer_sys::fuzz_target;
use tbms::io::{DEFAULT_IO_TIMEOUT, IoSession};
use tbms::protocol::MAX_IO_BUF;

fuzz_target!(|data: &[u8]| {
    let mut io = IoSession::new(DEFAULT_IO_TIMEOUT);
    let mut bytes = data.iter().copied();

    while let Some(op) = bytes.next() {
        match op % 6 {
            0 => {
                let a = bytes.next().unwrap_or(0x7F);
                let b = bytes.next().unwrap_or(0);
                let c = bytes.next().unwrap_or(0);
                let reply_len = usize::from(bytes.next().unwrap_or(4)) % 24;
                io.send(&[a, b, c], reply_len);
            }
            1 => {
                let expected = usize::from(bytes.next().unwrap_or(2)) % 24;
                io.recv(expected);
            }
            2 => io.tx_flush(),
            3 => io.set_rx(bytes.next().unwrap_or(0)),
            4 => {
                io.rx_done();
            }
            _ => io.update(u32::from(bytes.next().unwrap_or(1))),
        }

        assert!(!(io.tx_available() && io.rx_available()));
        assert!(io.reply().len() <= MAX_IO_BUF);
    }
});
