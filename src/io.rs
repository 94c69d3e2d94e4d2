//! Cooperative I/O session for the half-duplex module chain link.
//!
//! Frames exactly one outstanding request/response exchange. The session sits
//! between two callers with very different shapes:
//!
//! ```text
//!  tasks (tick-polled)                 transport (ISR or main loop)
//!  ───────────────────                 ────────────────────────────
//!  send(frame, reply_len) ──┐      ┌── tx_available / tx_buf / tx_flush
//!  recv(expected_len)     ──┤ IoSession
//!  rx_done()              ──┘      └── rx_available / set_rx(byte)
//! ```
//!
//! The `ready` flag together with the state acts as a two-role mutex over the
//! shared frame buffer: while `WaitForSend ∧ ready` the transport owns it for
//! reading the outbound frame, while `WaitForReply ∧ ready` it owns it for
//! appending one reply byte. At every other instant the session owns it.
//!
//! `send` and `recv` are cooperative: they return `false` on every poll until
//! the full round trip is complete, resuming from a stored cursor rather than
//! a call stack. An inactivity timer moves the session to `Timeout` when a
//! reply stalls; `Timeout` is sticky for one tick (so the supervisor can
//! observe it) and self-heals on the next [`IoSession::update`].

use heapless::Vec;
use log::warn;

use crate::protocol::{CMD_WRITE, MAX_IO_BUF, crc8};

/// Link time units. The embedder defines the scale by feeding the same unit
/// to [`crate::Bms::update`] and the configured timeout (milliseconds is the
/// natural choice).
pub type Ticks = u32;

/// Inactivity timeout applied to a stalled exchange, in ticks.
pub const DEFAULT_IO_TIMEOUT: Ticks = 100;

// ── Session state ────────────────────────────────────────────

/// Externally observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    /// No exchange staged.
    Idle,
    /// Outbound frame staged; waiting for the transport to take it.
    WaitForSend,
    /// Frame sent; collecting reply bytes.
    WaitForReply,
    /// Reply complete (or aborted); visible for one poll.
    RxDone,
    /// The exchange stalled past the timeout. Sticky until the next update.
    Timeout,
}

impl IoState {
    /// Human-readable name for log lines.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::WaitForSend => "WAIT_FOR_SEND",
            Self::WaitForReply => "WAIT_FOR_REPLY",
            Self::RxDone => "RX_DONE",
            Self::Timeout => "TIMEOUT",
        }
    }
}

// ── Resumption cursors ───────────────────────────────────────

/// Where the send routine resumes on its next poll.
#[derive(Debug, Clone, Copy)]
enum TxPhase {
    /// Frame staged; waiting for `tx_flush`.
    AwaitFlush { reply_len: usize },
    /// Frame taken; the inner receive is running.
    AwaitReply { reply_len: usize },
}

/// Where the receive routine resumes on its next poll.
#[derive(Debug, Clone, Copy)]
enum RxPhase {
    /// Soliciting bytes until `expected` have arrived.
    Collect { expected: usize },
    /// All bytes in; `RxDone` held for one poll before returning to `Idle`.
    Settle,
}

// ── Session ──────────────────────────────────────────────────

pub struct IoSession {
    state: IoState,

    tx_cursor: Option<TxPhase>,
    rx_cursor: Option<RxPhase>,

    /// Handshake flag: "the transport has work to do right now".
    ready: bool,

    /// Holds the outbound frame while `WaitForSend`, the accumulating reply
    /// while `WaitForReply`.
    buf: Vec<u8, MAX_IO_BUF>,

    timer: Ticks,
    timeout: Ticks,
}

impl IoSession {
    pub fn new(timeout: Ticks) -> Self {
        Self {
            state: IoState::Idle,
            tx_cursor: None,
            rx_cursor: None,
            ready: false,
            buf: Vec::new(),
            timer: 0,
            timeout,
        }
    }

    /// Drop any exchange in flight and return to `Idle`. The configured
    /// timeout is preserved.
    pub fn reset(&mut self) {
        self.state = IoState::Idle;
        self.tx_cursor = None;
        self.rx_cursor = None;
        self.ready = false;
        self.buf.clear();
        self.timer = 0;
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    /// True while a cooperative routine holds a resumption cursor.
    pub fn in_flight(&self) -> bool {
        self.tx_cursor.is_some() || self.rx_cursor.is_some()
    }

    /// Current inactivity timer value.
    pub fn timer(&self) -> Ticks {
        self.timer
    }

    // ── Transport surface ────────────────────────────────────

    /// True iff an outbound frame is staged and not yet taken.
    pub fn tx_available(&self) -> bool {
        self.state == IoState::WaitForSend && self.ready
    }

    /// The staged outbound frame. Meaningful only while [`Self::tx_available`].
    pub fn tx_buf(&self) -> &[u8] {
        &self.buf
    }

    /// Length of the staged outbound frame.
    pub fn tx_len(&self) -> usize {
        self.buf.len()
    }

    /// The transport acknowledges it has taken the outbound frame.
    pub fn tx_flush(&mut self) {
        if self.state == IoState::WaitForSend {
            self.ready = false;
        }
    }

    /// True iff the session is soliciting one more reply byte.
    pub fn rx_available(&self) -> bool {
        self.state == IoState::WaitForReply && self.ready
    }

    /// Append one received byte. Bytes offered outside the receive window
    /// are stale (late echoes, line noise) and are discarded.
    pub fn set_rx(&mut self, byte: u8) {
        if !self.rx_available() {
            return;
        }
        self.ready = false;

        if self.buf.push(byte).is_err() {
            // A reply longer than the buffer means the expected-length
            // bookkeeping is broken. Integration bug, not a link condition.
            panic!("link reply overflowed the session buffer");
        }
    }

    // ── Task surface ─────────────────────────────────────────

    /// Cooperatively receive `expected_len` bytes.
    ///
    /// First poll arms the receive window; each following poll re-solicits
    /// the transport and returns `false` until the reply is complete, then
    /// holds `RxDone` for one poll and finally returns `true` from `Idle`
    /// with the cursor cleared.
    pub fn recv(&mut self, expected_len: usize) -> bool {
        match self.rx_cursor {
            None => {
                self.ready = false;
                self.buf.clear();
                self.timer = 0;
                self.state = IoState::WaitForReply;
                self.rx_cursor = Some(RxPhase::Collect {
                    expected: expected_len,
                });
                self.collect(expected_len);
                false
            }
            Some(RxPhase::Collect { expected }) => {
                self.collect(expected);
                false
            }
            Some(RxPhase::Settle) => {
                self.state = IoState::Idle;
                self.rx_cursor = None;
                true
            }
        }
    }

    fn collect(&mut self, expected: usize) {
        self.ready = true;
        if self.buf.len() >= expected {
            self.ready = false;
            self.state = IoState::RxDone;
            self.rx_cursor = Some(RxPhase::Settle);
        }
    }

    /// Cooperatively send `payload` and await a reply of `expected_reply_len`
    /// bytes.
    ///
    /// If the first payload byte has the write bit set, the staged frame gets
    /// a CRC-8 appended. Returns `true` exactly once, when the full round
    /// trip has completed; `false` on every earlier poll.
    pub fn send(&mut self, payload: &[u8], expected_reply_len: usize) -> bool {
        match self.tx_cursor {
            None => {
                assert!(!payload.is_empty(), "cannot send an empty frame");
                self.buf.clear();
                if self.buf.extend_from_slice(payload).is_err() {
                    panic!("frame exceeds the session buffer");
                }

                // Register writes carry a CRC over the full frame.
                if payload[0] & CMD_WRITE != 0 {
                    self.buf[0] |= CMD_WRITE;
                    let crc = crc8(&self.buf);
                    if self.buf.push(crc).is_err() {
                        panic!("frame exceeds the session buffer");
                    }
                }

                self.ready = true;
                self.timer = 0;
                self.state = IoState::WaitForSend;
                self.tx_cursor = Some(TxPhase::AwaitFlush {
                    reply_len: expected_reply_len,
                });
                false
            }
            Some(TxPhase::AwaitFlush { reply_len }) => {
                if self.ready {
                    return false; // transport has not taken the frame yet
                }
                self.tx_cursor = Some(TxPhase::AwaitReply { reply_len });
                self.recv(reply_len);
                false
            }
            Some(TxPhase::AwaitReply { reply_len }) => {
                if !self.recv(reply_len) {
                    return false;
                }
                self.state = IoState::Idle;
                self.tx_cursor = None;
                true
            }
        }
    }

    /// Cooperative abort of the receive side.
    ///
    /// No-op (returning `true`) when no receive is in flight; otherwise both
    /// cursors are dropped and the session lands in `RxDone`, letting a task
    /// finish an exchange the moment a short header has validated.
    pub fn rx_done(&mut self) -> bool {
        if self.rx_cursor.is_none() {
            return true;
        }

        self.tx_cursor = None;
        self.rx_cursor = None;
        self.ready = false;
        self.state = IoState::RxDone;
        false
    }

    /// Byte-wise compare of the reply prefix against `expected`.
    pub fn validate_reply(&self, expected: &[u8]) -> bool {
        self.buf.len() >= expected.len() && self.buf[..expected.len()] == *expected
    }

    /// The accumulated reply bytes.
    pub fn reply(&self) -> &[u8] {
        &self.buf
    }

    // ── Timebase ─────────────────────────────────────────────

    /// Advance the inactivity timer by `delta` ticks.
    ///
    /// A sticky `Timeout` from the previous tick self-heals here. The timer
    /// only runs while both cursors are live (a full send-and-reply exchange
    /// in flight); otherwise it is pinned to zero.
    pub fn update(&mut self, delta: Ticks) {
        if self.state == IoState::Timeout {
            self.reset();
        }

        self.timer = self.timer.saturating_add(delta);
        if self.tx_cursor.is_none() || self.rx_cursor.is_none() {
            self.timer = 0;
        }

        if self.timer >= self.timeout && self.state != IoState::Timeout {
            warn!(
                "io: exchange stalled in {} for {} ticks, flagging timeout",
                self.state.name(),
                self.timer
            );
            self.state = IoState::Timeout;
            self.ready = false;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
