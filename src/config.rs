//! Driver configuration parameters.
//!
//! All tunable parameters for the chain driver. The struct is serde-derived
//! so embedders can persist overrides (NVS, file, provisioning channel);
//! loading and storing them is the embedder's concern.

use serde::{Deserialize, Serialize};

use crate::io::{DEFAULT_IO_TIMEOUT, Ticks};

/// Core driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BmsConfig {
    // --- Balancing ---
    /// Cell voltage above which its balance resistor latches on (V).
    pub balance_voltage: f32,
    /// Width of the release band below `balance_voltage` (V).
    pub balance_hysteresis: f32,
    /// Seconds written to the on-module balance timer each sweep.
    pub balance_time_secs: u8,

    // --- Timing (in the tick unit fed to `Bms::update`) ---
    /// Inactivity timeout for one link exchange.
    pub io_timeout_ticks: Ticks,
    /// Settle delay before discovery starts after a reset.
    pub settle_ticks: Ticks,
    /// Back-off after a failed establishment task before retrying it.
    pub retry_backoff_ticks: Ticks,
    /// Rest between full telemetry sweeps.
    pub sweep_rest_ticks: Ticks,
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self {
            // Balancing
            balance_voltage: 3.9,
            balance_hysteresis: 0.04,
            balance_time_secs: 130,

            // Timing (1 ms ticks at the natural update cadence)
            io_timeout_ticks: DEFAULT_IO_TIMEOUT,
            settle_ticks: 1000,
            retry_backoff_ticks: 1000,
            sweep_rest_ticks: 1000,
        }
    }
}
