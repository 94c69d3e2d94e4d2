//! Chain driver firmware entry point.
//!
//! Boots ESP-IDF, brings up the UART link to the module chain, and runs the
//! 1 ms tick loop: service the link, advance the driver, report telemetry
//! once a second of sweeps has settled.

#![deny(unused_must_use)]

use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use log::{info, warn};

use tbms::adapters::uart_link::UartLink;
use tbms::{Bms, BmsConfig};

/// UART and pins wired to the head of the module chain.
const CHAIN_UART: esp_idf_svc::sys::uart_port_t = 1;
const CHAIN_TX_GPIO: i32 = 17;
const CHAIN_RX_GPIO: i32 = 16;

/// Ticks between telemetry reports (1 ms tick → every 10 s).
const REPORT_EVERY_TICKS: u32 = 10_000;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!(
        "tbms v{} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_TIMESTAMP").unwrap_or("dev")
    );

    let mut link = UartLink::new(CHAIN_UART, CHAIN_TX_GPIO, CHAIN_RX_GPIO)?;
    let mut bms = Bms::new(BmsConfig::default());

    let mut ticks: u32 = 0;
    loop {
        if let Err(e) = bms.service_link(&mut link) {
            warn!("link service failed: {e}");
        }
        bms.update(1);

        ticks = ticks.wrapping_add(1);
        if ticks % REPORT_EVERY_TICKS == 0 {
            report(&bms);
        }

        FreeRtos::delay_ms(1);
    }
}

fn report(bms: &Bms) {
    info!(
        "state={:?} ready={} modules={}",
        bms.state(),
        bms.is_ready(),
        bms.modules_count()
    );

    for id in 0..usize::from(bms.modules_count()) {
        info!(
            "module {id}: {:.3} V, {:.1} °C / {:.1} °C, cells {:.3}..{:.3} V",
            bms.module_voltage(id),
            bms.module_temp1(id),
            bms.module_temp2(id),
            (0..6)
                .map(|c| bms.module_cell_voltage(id, c))
                .fold(f32::INFINITY, f32::min),
            (0..6)
                .map(|c| bms.module_cell_voltage(id, c))
                .fold(f32::NEG_INFINITY, f32::max),
        );
    }
}
