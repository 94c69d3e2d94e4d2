//! End-to-end scenarios against a scripted chain.
//!
//! Each test wires a [`ScriptedLink`] to the driver and runs the real tick
//! loop (`service_link`, then `update(1)`) exactly as the target binary
//! does, asserting on the transmitted frames and the externally observable
//! driver state.

mod scripted_link;

use scripted_link::ScriptedLink;
use tbms::protocol::crc8;
use tbms::{Bms, BmsConfig, BmsState};

// ── Wire fixtures ─────────────────────────────────────────────

const DISCOVER_FRAME: [u8; 4] = [0x7F, 0x3C, 0xA5, 0x57];
const PROBE_FRAME: [u8; 3] = [0x00, 0x00, 0x01];
const CHAIN_END: [u8; 3] = [0x00, 0x00, 0x01];

/// The echo a write-mode frame comes back as: low bit forced on, bit 7 set
/// for addressed writes (broadcasts echo verbatim), CRC of the sent frame.
fn write_echo(frame: [u8; 3]) -> Vec<u8> {
    let mut sent = frame;
    sent[0] |= 0x01;
    let crc = crc8(&sent);
    let head = if sent[0] == 0x7F { 0x7F } else { sent[0] | 0x80 };
    vec![head, sent[1], sent[2], crc]
}

/// Reply stream for a clean establishment over a single-module chain.
fn establishment_one_module() -> Vec<u8> {
    let mut replies = Vec::new();
    replies.extend_from_slice(&DISCOVER_FRAME);
    // Probe: unaddressed head + the two trailing status bytes.
    replies.extend_from_slice(&[0x80, 0x00, 0x01, 0x61, 0x35]);
    // ADDR_CTRL write echo for chain address 1.
    replies.extend_from_slice(&[0x81, 0x3B, 0x81, 0x8B]);
    // Second probe: end of chain.
    replies.extend_from_slice(&CHAIN_END);
    // Clear-faults broadcast echoes.
    replies.extend(write_echo([0x7F, 0x20, 0xFF]));
    replies.extend(write_echo([0x7F, 0x20, 0x00]));
    replies.extend(write_echo([0x7F, 0x21, 0xFF]));
    replies.extend(write_echo([0x7F, 0x21, 0x00]));
    replies
}

/// Reply stream for one full values/balance/status pass over module 0,
/// with cells well below the balance threshold and clean status latches.
fn sweep_one_module() -> Vec<u8> {
    let mut replies = Vec::new();
    replies.extend(write_echo([0x03, 0x30, 0x3D])); // ADC_CTRL
    replies.extend(write_echo([0x03, 0x31, 0x03])); // IO_CTRL
    replies.extend(write_echo([0x03, 0x34, 0x01])); // ADC_CONV
    // GPAI read: 16.877 V pack, ~3.46 V cells, 23.57 °C on thermistor 1.
    replies.extend_from_slice(&[
        0x02, 0x01, 0x12, 0x20, 0x67, 0x23, 0x76, 0x22, 0xA2, 0x00, 0x01, 0x24, 0xFD, 0x25, 0xE7,
        0x00, 0x00, 0x10, 0x42, 0x00, 0x04, 0xBD,
    ]);
    // No balancing traffic: every cell is under threshold.
    // Status read: all four latch bytes clean.
    replies.extend_from_slice(&[0x02, 0x20, 0x04, 0x00, 0x00, 0x00, 0x00]);
    replies
}

// ── Tick-loop helpers ─────────────────────────────────────────

/// Run the driver until `pred` holds, up to `budget` ticks. Returns whether
/// the predicate was reached.
fn run_until(
    bms: &mut Bms,
    link: &mut ScriptedLink,
    budget: u32,
    pred: impl Fn(&Bms, &ScriptedLink) -> bool,
) -> bool {
    for _ in 0..budget {
        if pred(bms, link) {
            return true;
        }
        bms.service_link(link).expect("scripted link never fails");
        bms.update(1);
    }
    pred(bms, link)
}

// ── Scenarios ─────────────────────────────────────────────────

#[test]
fn discovery_leads_into_the_chain_walk() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::with_replies(&DISCOVER_FRAME);

    assert!(
        run_until(&mut bms, &mut link, 5_000, |_, l| l.sent.len() >= 2),
        "driver never probed the chain head"
    );

    assert_eq!(link.sent[0], DISCOVER_FRAME.to_vec());
    assert_eq!(link.sent[1], PROBE_FRAME.to_vec());
}

#[test]
fn empty_chain_sends_the_driver_back_to_init() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::new();
    link.queue(&DISCOVER_FRAME);
    link.queue(&CHAIN_END); // first probe already reports end-of-chain
    link.queue(&write_echo([0x7F, 0x20, 0xFF]));
    link.queue(&write_echo([0x7F, 0x20, 0x00]));
    link.queue(&write_echo([0x7F, 0x21, 0xFF]));
    link.queue(&write_echo([0x7F, 0x21, 0x00]));

    assert!(
        run_until(&mut bms, &mut link, 10_000, |b, l| {
            l.sent.len() == 6 && b.state() == BmsState::Init
        }),
        "driver did not give up on the empty chain"
    );
    assert_eq!(bms.modules_count(), 0);
}

#[test]
fn single_module_establishment() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::with_replies(&establishment_one_module());

    assert!(
        run_until(&mut bms, &mut link, 10_000, |b, _| {
            b.state() == BmsState::ConnectionEstablished
        }),
        "connection was never established"
    );

    assert_eq!(bms.modules_count(), 1);
    // The full establishment conversation, frame by frame.
    assert_eq!(
        link.sent,
        vec![
            DISCOVER_FRAME.to_vec(),
            PROBE_FRAME.to_vec(),
            vec![0x01, 0x3B, 0x81, 0x8B],
            PROBE_FRAME.to_vec(),
            vec![0x7F, 0x20, 0xFF, 0x7D],
            vec![0x7F, 0x20, 0x00, 0x8E],
            vec![0x7F, 0x21, 0xFF, 0x68],
            vec![0x7F, 0x21, 0x00, 0x9B],
        ]
    );
    assert_eq!(link.unconsumed(), 0);
}

#[test]
fn two_module_chain_is_walked_to_the_end() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::new();
    link.queue(&DISCOVER_FRAME);
    link.queue(&[0x80, 0x00, 0x01, 0x61, 0x35]);
    link.queue(&[0x81, 0x3B, 0x81, 0x8B]);
    link.queue(&[0x80, 0x00, 0x01, 0x61, 0x35]);
    link.queue(&[0x81, 0x3B, 0x82, 0x8B]);
    link.queue(&CHAIN_END);
    link.queue(&write_echo([0x7F, 0x20, 0xFF]));
    link.queue(&write_echo([0x7F, 0x20, 0x00]));
    link.queue(&write_echo([0x7F, 0x21, 0xFF]));
    link.queue(&write_echo([0x7F, 0x21, 0x00]));

    assert!(
        run_until(&mut bms, &mut link, 10_000, |b, _| {
            b.state() == BmsState::ConnectionEstablished
        }),
        "connection was never established"
    );

    assert_eq!(bms.modules_count(), 2);
    // Both assignment writes went out, addresses 1 and 2.
    assert!(link.sent.contains(&vec![0x01, 0x3B, 0x81, 0x8B]));
    assert!(link.sent.contains(&vec![0x01, 0x3B, 0x82, crc8(&[0x01, 0x3B, 0x82])]));
}

#[test]
fn full_sweep_decodes_telemetry_and_reports_ready() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::with_replies(&establishment_one_module());
    link.queue(&sweep_one_module());

    assert!(
        run_until(&mut bms, &mut link, 20_000, |b, _| b.is_ready()),
        "driver never finished a clean sweep"
    );

    assert!((bms.module_voltage(0) - 16.877).abs() < 0.001);
    assert!((bms.module_temp1(0) - 23.57).abs() < 0.01);
    assert!((bms.module_cell_voltage(0, 0) - 3.4632).abs() < 0.0005);
    assert!(!bms.has_faults());
    assert_eq!(link.unconsumed(), 0);

    // Cells sat below threshold, so the sweep carried no balance writes.
    assert!(!link.sent.iter().any(|f| f.len() >= 2 && f[1] == 0x32));
}

#[test]
fn silent_chain_times_out_and_discovery_restarts() {
    let mut bms = Bms::new(BmsConfig::default());
    let mut link = ScriptedLink::with_replies(&establishment_one_module());
    link.queue(&sweep_one_module());

    assert!(
        run_until(&mut bms, &mut link, 20_000, |b, _| b.is_ready()),
        "driver never finished a clean sweep"
    );

    // The chain goes dead: the next sweep's first exchange stalls, the
    // driver drops everything and resets.
    assert!(
        run_until(&mut bms, &mut link, 5_000, |b, _| {
            b.state() == BmsState::Init
        }),
        "timeout never dropped the driver to INIT"
    );
    assert!(!bms.is_ready());

    // After the settle delay, discovery starts over from scratch.
    let discover_count_before = link
        .sent
        .iter()
        .filter(|f| f.as_slice() == DISCOVER_FRAME)
        .count();
    assert!(
        run_until(&mut bms, &mut link, 5_000, |_, l| {
            l.sent
                .iter()
                .filter(|f| f.as_slice() == DISCOVER_FRAME)
                .count()
                > discover_count_before
        }),
        "discovery never restarted after the timeout"
    );
    // The module table was wiped on the way back out of INIT.
    assert_eq!(bms.modules_count(), 0);
}
