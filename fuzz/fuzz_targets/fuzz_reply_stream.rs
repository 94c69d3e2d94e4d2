//! Fuzz target: the full driver against an arbitrary reply stream.
//!
//! Plays the transport role with fuzz bytes as the chain's replies and runs
//! the real tick loop.
//!
//! Invariants checked:
//! - No panics under any reply byte sequence
//! - The transport windows are never both open on the same tick
//! - Accessors stay total (value or NaN) for every slot
//!
//! cargo fuzz run fuzz_reply_stream

#![no_main]

use libfuzzer_sys::fuzz_target;
use tbms::{Bms, BmsConfig};

fuzz_target!(|data: &[u8]| {
    let mut bms = Bms::new(BmsConfig::default());
    let mut feed = data.iter().copied();

    // Enough ticks to get through the settle delay, establishment against
    // whatever the fuzz bytes pretend to be, and several timeout cycles.
    for _ in 0..20_000u32 {
        if bms.tx_available() {
            bms.tx_flush();
        }
        if bms.rx_available() {
            if let Some(byte) = feed.next() {
                bms.set_rx(byte);
            }
        }
        bms.update(1);

        assert!(!(bms.tx_available() && bms.rx_available()));
    }

    for id in 0..70 {
        let _ = bms.module_voltage(id);
        let _ = bms.module_cell_voltage(id, id % 8);
        let _ = bms.module_temp1(id);
        let _ = bms.module_temp2(id);
    }
});
