//! Top-level supervisor: connection establishment, the telemetry sweep loop,
//! and recovery.
//!
//! ```text
//!            ┌────────┐  settle 1 s   ┌──────────────────────┐
//!  reset ──▶ │  Init  │ ────────────▶ │ EstablishConnection  │
//!            └────────┘               │ discover → setup →   │
//!                ▲                    │ clear faults         │
//!                │ any I/O timeout    └──────────┬───────────┘
//!                │ (or empty chain)              │ all tasks ok
//!            ┌───┴──────────────────────────┐    │
//!            │   ConnectionEstablished      │ ◀──┘
//!            │   per module: values →       │
//!            │   balance → status,          │
//!            │   then rest 1 s              │
//!            └──────────────────────────────┘
//! ```
//!
//! The supervisor is advanced exclusively by [`Bms::update`]: one call per
//! tick, `delta` in the same unit as the configured timeouts. Establishment
//! tasks that fault are retried in place after a back-off; an I/O timeout
//! anywhere collapses every cursor and drops the whole driver back to
//! `Init`. Individual tasks never retry on their own.

use log::{info, warn};

use crate::config::BmsConfig;
use crate::error::LinkError;
use crate::io::{IoSession, IoState, Ticks};
use crate::module::{CELLS_PER_MODULE, ModuleTable};
use crate::ports::LinkPort;
use crate::protocol::MAX_MODULE_ADDR;
use crate::tasks::{ESTABLISH_SEQUENCE, TaskCursor, TaskEvent};

// ── Supervisor state ─────────────────────────────────────────

/// Externally observable driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmsState {
    /// Settling before (re)discovery; everything forgotten.
    Init,
    /// Walking the establishment task list.
    EstablishConnection,
    /// Chain is up; the periodic sweep loop is running.
    ConnectionEstablished,
}

impl BmsState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::EstablishConnection => "ESTABLISH_CONNECTION",
            Self::ConnectionEstablished => "CONNECTION_ESTABLISHED",
        }
    }
}

/// Position inside the supervisor routine that must survive across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SupervisorCursor {
    /// Fresh entry into the current state.
    #[default]
    Start,
    /// Init: waiting out the settle delay.
    InitSettle,
    /// Establishment: waiting out the back-off after a task fault.
    RetryBackoff,
    /// Sweep: `phase` in flight for the currently selected module.
    Sweep { phase: SweepPhase },
    /// Sweep: resting between full sweeps.
    SweepRest,
}

/// Fixed per-module task order within a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepPhase {
    ReadValues,
    Balance,
    ReadStatus,
}

// ── Driver ───────────────────────────────────────────────────

/// The chain driver instance. Owns the I/O session, the module table, and
/// every resumption cursor; the embedder owns the transport and the clock.
pub struct Bms {
    state: BmsState,
    cursor: SupervisorCursor,

    /// Cursor of the protocol task currently in flight.
    pub(crate) task: TaskCursor,
    /// Index into [`ESTABLISH_SEQUENCE`].
    establish_index: usize,

    pub(crate) io: IoSession,
    pub(crate) modules: ModuleTable,
    /// Module slot currently being serviced by the sweep.
    mod_sel: usize,

    timer: Ticks,
    /// True once a full sweep has completed since the last reset.
    ready: bool,

    pub(crate) config: BmsConfig,
}

impl Bms {
    pub fn new(config: BmsConfig) -> Self {
        Self {
            state: BmsState::Init,
            cursor: SupervisorCursor::Start,
            task: TaskCursor::Start,
            establish_index: 0,
            io: IoSession::new(config.io_timeout_ticks),
            modules: ModuleTable::new(),
            mod_sel: 0,
            timer: 0,
            ready: false,
            config,
        }
    }

    // ── Timebase ─────────────────────────────────────────────

    /// Advance the driver by `delta` ticks. Call at a steady cadence; 1 ms
    /// per tick is the natural choice with the default configuration.
    pub fn update(&mut self, delta: Ticks) {
        self.timer = self.timer.saturating_add(delta);
        self.io.update(delta);

        // Sole recovery path: a stalled exchange takes the whole driver
        // down to Init, cursors and all.
        if self.io.state() == IoState::Timeout {
            warn!("link timeout, dropping to {}", BmsState::Init.name());
            self.task = TaskCursor::Start;
            self.cursor = SupervisorCursor::Start;
            self.ready = false;
            self.enter_state(BmsState::Init);
        }

        match self.state {
            BmsState::Init => self.run_init(),
            BmsState::EstablishConnection => self.run_establish(),
            BmsState::ConnectionEstablished => self.run_sweep(),
        }
    }

    fn enter_state(&mut self, next: BmsState) {
        if self.state != next {
            info!("{} -> {}", self.state.name(), next.name());
            self.state = next;
        }
    }

    // ── Supervisor states ────────────────────────────────────

    fn run_init(&mut self) {
        match self.cursor {
            SupervisorCursor::InitSettle => {
                if self.timer < self.config.settle_ticks {
                    return;
                }
                self.modules.reset();
                self.establish_index = 0;
                self.task = TaskCursor::Start;
                self.cursor = SupervisorCursor::Start;
                self.enter_state(BmsState::EstablishConnection);
            }
            _ => {
                self.ready = false;
                self.timer = 0;
                self.cursor = SupervisorCursor::InitSettle;
            }
        }
    }

    fn run_establish(&mut self) {
        if self.cursor == SupervisorCursor::RetryBackoff {
            if self.timer >= self.config.retry_backoff_ticks {
                self.cursor = SupervisorCursor::Start;
            }
            return;
        }

        let Some(&task) = ESTABLISH_SEQUENCE.get(self.establish_index) else {
            self.enter_state(BmsState::ConnectionEstablished);
            return;
        };

        match self.run_establish_task(task) {
            TaskEvent::Pending => {}
            TaskEvent::ExitOk => self.establish_index += 1,
            TaskEvent::ExitFault => {
                warn!(
                    "{task:?} faulted, retrying in {} ticks",
                    self.config.retry_backoff_ticks
                );
                self.timer = 0;
                self.cursor = SupervisorCursor::RetryBackoff;
            }
        }
    }

    fn run_sweep(&mut self) {
        let mut phase = match self.cursor {
            SupervisorCursor::SweepRest => {
                if self.timer >= self.config.sweep_rest_ticks {
                    self.cursor = SupervisorCursor::Start;
                }
                return;
            }
            SupervisorCursor::Sweep { phase } => phase,
            _ => {
                if self.modules.count() == 0 {
                    // Nothing answered the walk: start over from scratch.
                    warn!("no modules on the chain, restarting discovery");
                    self.cursor = SupervisorCursor::Start;
                    self.enter_state(BmsState::Init);
                    return;
                }
                self.mod_sel = 0;
                SweepPhase::ReadValues
            }
        };

        loop {
            if self.mod_sel >= MAX_MODULE_ADDR {
                // Sweep complete: the pack is proven readable end to end.
                self.ready = true;
                self.timer = 0;
                self.cursor = SupervisorCursor::SweepRest;
                return;
            }
            if !self.modules.exists(self.mod_sel) {
                self.mod_sel += 1;
                phase = SweepPhase::ReadValues;
                continue;
            }

            let event = match phase {
                SweepPhase::ReadValues => self.task_read_module_values(self.mod_sel),
                SweepPhase::Balance => self.task_balance_cells(self.mod_sel),
                SweepPhase::ReadStatus => self.task_read_module_status(self.mod_sel),
            };

            if event == TaskEvent::Pending {
                self.cursor = SupervisorCursor::Sweep { phase };
                return;
            }

            // Faults from periodic tasks need no handling here: the next
            // sweep retries implicitly.
            phase = match phase {
                SweepPhase::ReadValues => SweepPhase::Balance,
                SweepPhase::Balance => SweepPhase::ReadStatus,
                SweepPhase::ReadStatus => {
                    self.mod_sel += 1;
                    SweepPhase::ReadValues
                }
            };
        }
    }

    // ── Transport surface ────────────────────────────────────

    /// True iff an outbound frame is waiting for the transport.
    pub fn tx_available(&self) -> bool {
        self.io.tx_available()
    }

    /// The staged outbound frame. Meaningful only while [`Self::tx_available`].
    pub fn tx_buf(&self) -> &[u8] {
        self.io.tx_buf()
    }

    pub fn tx_len(&self) -> usize {
        self.io.tx_len()
    }

    /// The transport acknowledges it has taken the outbound frame.
    pub fn tx_flush(&mut self) {
        self.io.tx_flush();
    }

    /// True iff the driver is soliciting one more reply byte.
    pub fn rx_available(&self) -> bool {
        self.io.rx_available()
    }

    /// Feed one byte received from the link. Bytes offered while
    /// [`Self::rx_available`] is false are stale and are discarded.
    pub fn set_rx(&mut self, byte: u8) {
        self.io.set_rx(byte);
    }

    /// Run the transport handshake against a [`LinkPort`]: push a staged
    /// frame out, pull at most one pending reply byte in. Call once per tick
    /// alongside [`Self::update`].
    pub fn service_link<L: LinkPort>(&mut self, link: &mut L) -> Result<(), LinkError> {
        if self.io.tx_available() {
            link.write_frame(self.io.tx_buf())?;
            self.io.tx_flush();
        }

        if self.io.rx_available() {
            if let Some(byte) = link.read_byte()? {
                self.io.set_rx(byte);
            }
        }

        Ok(())
    }

    // ── Public accessors ─────────────────────────────────────

    /// Current supervisor state.
    pub fn state(&self) -> BmsState {
        self.state
    }

    /// True iff a full sweep has completed and no module reports faults.
    pub fn is_ready(&self) -> bool {
        self.ready && !self.has_faults()
    }

    /// True if any discovered module reports fault, COV, or CUV bits.
    ///
    /// Status bytes start at 0xFF, so this holds true until the first status
    /// read of every module has actually landed.
    pub fn has_faults(&self) -> bool {
        self.modules.any_faults()
    }

    /// Number of modules discovered on the chain.
    pub fn modules_count(&self) -> u8 {
        self.modules.count()
    }

    /// Pack-segment voltage of module `id`, NaN when it does not exist.
    pub fn module_voltage(&self, id: usize) -> f32 {
        self.modules.get(id).map_or(f32::NAN, |m| m.voltage)
    }

    /// Voltage of `cell` (0..6) on module `id`, NaN when either is absent.
    pub fn module_cell_voltage(&self, id: usize, cell: usize) -> f32 {
        if cell >= CELLS_PER_MODULE {
            return f32::NAN;
        }
        self.modules.get(id).map_or(f32::NAN, |m| m.cells[cell].voltage)
    }

    /// First thermistor temperature of module `id` (°C), NaN when absent.
    pub fn module_temp1(&self, id: usize) -> f32 {
        self.modules.get(id).map_or(f32::NAN, |m| m.temp1)
    }

    /// Second thermistor temperature of module `id` (°C), NaN when absent.
    pub fn module_temp2(&self, id: usize) -> f32 {
        self.modules.get(id).map_or(f32::NAN, |m| m.temp2)
    }
}

// ── Tests ────────────────────────────────────────────────────
