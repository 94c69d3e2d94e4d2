//! Protocol tasks: the multi-round-trip conversations with the chain.
//!
//! Each task drives the I/O session through one or more send/receive steps
//! and is polled once per tick. A poll returns [`TaskEvent::Pending`] until
//! the conversation finishes with `ExitOk` or `ExitFault`, at which point the
//! shared [`TaskCursor`] is back at `Start` and the next poll would run the
//! task from the beginning.
//!
//! Resumption works the same way as in the I/O session: no call stack
//! survives a poll boundary, so everything a task needs to pick up where it
//! left off lives in the cursor variant (or on the [`Bms`] itself, like the
//! module being serviced). A task never exits with I/O in flight: it either
//! completes the exchange or cuts it short with `rx_done`.

use log::{debug, error, info};

use crate::bms::Bms;
use crate::module::{cell_voltage, pack_voltage, thermistor_celsius};
use crate::protocol::{
    BROADCAST, CMD_READ, CMD_WRITE, DATA_CLEAR, DATA_SELECT_ALL, REG_ADC_CONV, REG_ADC_CTRL,
    REG_ADDR_CTRL, REG_ALERT_STATUS, REG_BAL_CTRL, REG_BAL_TIME, REG_DEV_STATUS, REG_FAULT_STATUS,
    REG_GPAI, REG_IO_CTRL, REG_RESET, RESET_MAGIC, WRITE_ECHO_LEN, crc8, module_read, module_write,
};

// ── Task outcome ─────────────────────────────────────────────

/// Result of one task poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The conversation is still in progress; poll again next tick.
    Pending,
    /// The task ran to completion.
    ExitOk,
    /// The chain answered with something the task cannot accept.
    ExitFault,
}

// ── Resumption cursor ────────────────────────────────────────

/// Position inside the task currently in flight.
///
/// Only one task runs at a time, so a single cursor on the [`Bms`] serves
/// them all; every exit path puts it back to `Start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum TaskCursor {
    /// No conversation in progress; the next poll starts from the top.
    #[default]
    Start,
    /// Address assignment: draining the trailing status bytes of a probe.
    Drain,
    /// Address assignment: writing ADDR_CTRL for `slot`.
    Assign { slot: u8 },
    /// Position inside a fixed send sequence (fault clearing, value reads,
    /// balancing).
    Seq { step: u8 },
}

// ── Establishment dispatch ───────────────────────────────────

/// The one-shot tasks that must all succeed before the sweep loop starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EstablishTask {
    Discover,
    SetupBoards,
    ClearFaults,
}

/// Establishment order: reset the chain, walk it assigning addresses, wipe
/// the stale fault latches.
pub(crate) const ESTABLISH_SEQUENCE: [EstablishTask; 3] = [
    EstablishTask::Discover,
    EstablishTask::SetupBoards,
    EstablishTask::ClearFaults,
];

// ── Wire constants ───────────────────────────────────────────

/// ADC_CTRL: auto mode, convert every input (pack, 6 cells, both temps).
const ADC_CTRL_ALL_CHANNELS: u8 = 0b0011_1101;

/// IO_CTRL: route the temperature measurement VSS pins.
const IO_CTRL_TEMP_VSS: u8 = 0b0000_0011;

/// Data bytes in a full values read: 9 big-endian words.
const VALUES_DATA_LEN: u8 = 0x12;

/// Full values reply: header (3) + data (18) + CRC.
const VALUES_REPLY_LEN: usize = 22;

/// Status read: ALERT_STATUS through CUV_FAULT.
const STATUS_READ_LEN: u8 = 4;

/// Status reply: header (3) + the four status bytes.
const STATUS_REPLY_LEN: usize = 7;

/// DEV_STATUS probe replies are bare three-byte frames.
const PROBE_REPLY_LEN: usize = 3;

/// Data byte flag committing an ADDR_CTRL write.
const ADDR_COMMIT: u8 = 0x80;

fn chain_addr(id: usize) -> u8 {
    (id + 1) as u8
}

fn word(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

// ── Tasks ────────────────────────────────────────────────────

impl Bms {
    pub(crate) fn run_establish_task(&mut self, task: EstablishTask) -> TaskEvent {
        match task {
            EstablishTask::Discover => self.task_discover(),
            EstablishTask::SetupBoards => self.task_setup_boards(),
            EstablishTask::ClearFaults => self.task_clear_faults(),
        }
    }

    /// Broadcast a chain reset and check that the string echoes it back.
    ///
    /// Any live chain loops the magic write around to the head; a matching
    /// echo proves the link is wired and at least the near end is powered.
    pub(crate) fn task_discover(&mut self) -> TaskEvent {
        const RESET_CMD: [u8; 3] = [BROADCAST, REG_RESET, RESET_MAGIC];
        const RESET_ECHO: [u8; 4] = [BROADCAST, REG_RESET, RESET_MAGIC, 0x57];

        if !self.io.send(&RESET_CMD, RESET_ECHO.len()) {
            return TaskEvent::Pending;
        }

        if self.io.validate_reply(&RESET_ECHO) {
            info!("chain reset acknowledged");
            TaskEvent::ExitOk
        } else {
            TaskEvent::ExitFault
        }
    }

    /// Walk the chain assigning addresses, one module per pass.
    ///
    /// An unaddressed module answers a DEV_STATUS probe with `80 00 01`
    /// (plus two trailing status bytes that arrive a beat later); once every
    /// module is addressed the probe comes back as `00 00 01` and the walk is
    /// done. Each pass claims the lowest free slot, writes its address with
    /// the commit flag, checks the echo, and restarts from the probe.
    pub(crate) fn task_setup_boards(&mut self) -> TaskEvent {
        const PROBE: [u8; 3] = [CMD_READ, REG_DEV_STATUS, 1];
        const HEAD_UNADDRESSED: [u8; 3] = [0x80, 0x00, 0x01];
        const CHAIN_END: [u8; 3] = [0x00, 0x00, 0x01];

        loop {
            match self.task {
                TaskCursor::Start => {
                    if !self.io.send(&PROBE, PROBE_REPLY_LEN) {
                        return TaskEvent::Pending;
                    }
                    if !self.io.validate_reply(&HEAD_UNADDRESSED) {
                        if self.io.validate_reply(&CHAIN_END) {
                            info!("chain walk done, {} modules addressed", self.modules.count());
                            return TaskEvent::ExitOk;
                        }
                        return TaskEvent::ExitFault;
                    }
                    self.task = TaskCursor::Drain;
                }

                TaskCursor::Drain => {
                    if !self.io.recv(2) {
                        return TaskEvent::Pending;
                    }
                    let Some(slot) = self.modules.first_free_slot() else {
                        self.task = TaskCursor::Start;
                        return TaskEvent::ExitFault;
                    };
                    self.task = TaskCursor::Assign { slot: slot as u8 };
                }

                TaskCursor::Assign { slot } => {
                    let addr = slot + 1;
                    let assign = [CMD_WRITE, REG_ADDR_CTRL, addr | ADDR_COMMIT];
                    if !self.io.send(&assign, WRITE_ECHO_LEN) {
                        return TaskEvent::Pending;
                    }

                    self.task = TaskCursor::Start;
                    let echo = [CMD_WRITE | 0x80, REG_ADDR_CTRL, addr | ADDR_COMMIT];
                    if !self.io.validate_reply(&echo) {
                        return TaskEvent::ExitFault;
                    }
                    self.io.rx_done();

                    self.modules.claim(usize::from(slot));
                    info!("module claimed slot {slot} (chain address {addr})");

                    // Restart to address the next module in line.
                    return TaskEvent::Pending;
                }

                TaskCursor::Seq { .. } => {
                    // Foreign cursor (stale after a forced reset): restart.
                    self.task = TaskCursor::Start;
                }
            }
        }
    }

    /// Select-then-clear both latch registers on every module at once.
    pub(crate) fn task_clear_faults(&mut self) -> TaskEvent {
        const SEQUENCE: [[u8; 3]; 4] = [
            [BROADCAST, REG_ALERT_STATUS, DATA_SELECT_ALL],
            [BROADCAST, REG_ALERT_STATUS, DATA_CLEAR],
            [BROADCAST, REG_FAULT_STATUS, DATA_SELECT_ALL],
            [BROADCAST, REG_FAULT_STATUS, DATA_CLEAR],
        ];

        let mut step = match self.task {
            TaskCursor::Seq { step } => step,
            _ => 0,
        };

        loop {
            if !self.io.send(&SEQUENCE[usize::from(step)], WRITE_ECHO_LEN) {
                self.task = TaskCursor::Seq { step };
                return TaskEvent::Pending;
            }
            step += 1;
            if usize::from(step) == SEQUENCE.len() {
                self.task = TaskCursor::Start;
                return TaskEvent::ExitOk;
            }
        }
    }

    /// Read the four status bytes (alerts, faults, COV, CUV) of one module.
    pub(crate) fn task_read_module_status(&mut self, id: usize) -> TaskEvent {
        let read = [module_read(chain_addr(id)), REG_ALERT_STATUS, STATUS_READ_LEN];
        if !self.io.send(&read, STATUS_REPLY_LEN) {
            return TaskEvent::Pending;
        }

        let reply = self.io.reply();
        let (alerts, faults) = (reply[3], reply[4]);
        let (cov, cuv) = (reply[5], reply[6]);

        let module = self.modules.slot_mut(id);
        let changed =
            module.faults != faults || module.cov_faults != cov || module.cuv_faults != cuv;
        module.alerts = alerts;
        module.faults = faults;
        module.cov_faults = cov;
        module.cuv_faults = cuv;

        if changed && module.has_faults() {
            error!("module {id}: faults={faults:#04x} cov={cov:#04x} cuv={cuv:#04x}");
        }

        TaskEvent::ExitOk
    }

    /// Refresh pack voltage, cell voltages, and both temperatures of one
    /// module: arm all ADC channels, route the thermistor pins, trigger a
    /// conversion, then read the nine result words in one go.
    pub(crate) fn task_read_module_values(&mut self, id: usize) -> TaskEvent {
        let addr = chain_addr(id);

        let mut step = match self.task {
            TaskCursor::Seq { step } => step,
            _ => 0,
        };

        loop {
            let (frame, reply_len) = match step {
                0 => (
                    [module_write(addr), REG_ADC_CTRL, ADC_CTRL_ALL_CHANNELS],
                    WRITE_ECHO_LEN,
                ),
                1 => (
                    [module_write(addr), REG_IO_CTRL, IO_CTRL_TEMP_VSS],
                    WRITE_ECHO_LEN,
                ),
                2 => ([module_write(addr), REG_ADC_CONV, 0x01], WRITE_ECHO_LEN),
                _ => (
                    [module_read(addr), REG_GPAI, VALUES_DATA_LEN],
                    VALUES_REPLY_LEN,
                ),
            };

            if !self.io.send(&frame, reply_len) {
                self.task = TaskCursor::Seq { step };
                return TaskEvent::Pending;
            }
            if step == 3 {
                break;
            }
            step += 1;
        }

        self.apply_values_reply(id);
        self.task = TaskCursor::Start;
        TaskEvent::ExitOk
    }

    /// Decode a completed values reply into the module record.
    ///
    /// A frame that fails the CRC or does not answer the query we asked is
    /// dropped without touching the stored values; the next sweep re-reads.
    fn apply_values_reply(&mut self, id: usize) {
        let reply = self.io.reply();
        let head = [module_read(chain_addr(id)), REG_GPAI, VALUES_DATA_LEN];

        if reply.len() != VALUES_REPLY_LEN
            || reply[..3] != head
            || reply[VALUES_REPLY_LEN - 1] != crc8(&reply[..VALUES_REPLY_LEN - 1])
        {
            debug!("module {id}: discarding corrupt values frame ({} bytes)", reply.len());
            return;
        }

        let mut frame = [0u8; VALUES_REPLY_LEN];
        frame.copy_from_slice(reply);

        let module = self.modules.slot_mut(id);
        module.voltage = pack_voltage(word(&frame, 3));
        for (i, cell) in module.cells.iter_mut().enumerate() {
            cell.voltage = cell_voltage(word(&frame, 5 + 2 * i));
        }
        module.temp1 = thermistor_celsius(word(&frame, 17));
        module.temp2 = thermistor_celsius(word(&frame, 19));
    }

    /// Re-evaluate the balance latches of one module and, when any cell
    /// needs bleeding, push the mask to its balance controller.
    ///
    /// BAL_CTRL is always zeroed first: the on-module balance timer only
    /// re-arms on a rising write, so the reset must precede the new mask.
    pub(crate) fn task_balance_cells(&mut self, id: usize) -> TaskEvent {
        let addr = chain_addr(id);

        let mut step = match self.task {
            TaskCursor::Seq { step } => step,
            _ => {
                let threshold = self.config.balance_voltage;
                let hysteresis = self.config.balance_hysteresis;
                let module = self.modules.slot_mut(id);
                let prev = module.balance_bits;
                let mask = module.refresh_balance_mask(threshold, hysteresis);

                if mask != prev {
                    debug!("module {id}: balance mask {prev:#08b} -> {mask:#08b}");
                }
                if mask == 0 {
                    return TaskEvent::ExitOk;
                }
                0
            }
        };

        loop {
            let frame = match step {
                0 => [module_write(addr), REG_BAL_CTRL, 0],
                1 => [module_write(addr), REG_BAL_TIME, self.config.balance_time_secs],
                _ => [
                    module_write(addr),
                    REG_BAL_CTRL,
                    self.modules.slot_mut(id).balance_bits,
                ],
            };

            if !self.io.send(&frame, WRITE_ECHO_LEN) {
                self.task = TaskCursor::Seq { step };
                return TaskEvent::Pending;
            }
            step += 1;
            if step == 3 {
                self.task = TaskCursor::Start;
                return TaskEvent::ExitOk;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
