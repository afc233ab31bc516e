//! ARP anomaly detection over the capture stream.
//!
//! The detector is an observer: it consumes the same frames the sniffer
//! sees, maintains three fixed-size caches, and emits typed alerts. It never
//! modifies the traffic path. Alerts are events, not errors; rendering them
//! to stdout is a property of whatever sink receives them.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;

use pnet::util::MacAddr;
use serde::Serialize;

use crate::config;
use crate::core::decode::{ETHERTYPE_ARP, ETHERTYPE_QINQ, ETHERTYPE_VLAN};

/// ARP operation, with unknown codes carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArpOp {
    Request,
    Reply,
    Other(u16),
}

/// A structured ARP observation extracted from one frame.
///
/// This is a second, independent ARP parser beside the decoder's: the
/// detector needs only the classic IPv4-over-Ethernet fields plus the VLAN
/// stack, and must reject everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpEvent {
    /// Outer-to-inner VLAN IDs, at most two (QinQ).
    pub vlan_ids: Vec<u16>,
    pub op: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpEvent {
    /// Parse a raw Ethernet frame, skipping up to two VLAN tags. Returns
    /// `None` for non-ARP frames and for ARP that is not IPv4-over-Ethernet
    /// with the classic 6/4 address lengths.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        if frame.len() < 14 {
            return None;
        }
        let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        let mut offset = 14;
        let mut vlan_ids = Vec::new();

        while (ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ) && vlan_ids.len() < 2
        {
            if frame.len() < offset + 4 {
                return None;
            }
            vlan_ids.push(u16::from_be_bytes([frame[offset], frame[offset + 1]]) & 0x0fff);
            ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
            offset += 4;
        }

        if ethertype != ETHERTYPE_ARP || frame.len() < offset + 28 {
            return None;
        }
        let arp = &frame[offset..];

        let hrd = u16::from_be_bytes([arp[0], arp[1]]);
        let pro = u16::from_be_bytes([arp[2], arp[3]]);
        if hrd != 1 || pro != 0x0800 || arp[4] != 6 || arp[5] != 4 {
            return None;
        }

        let op = match u16::from_be_bytes([arp[6], arp[7]]) {
            1 => ArpOp::Request,
            2 => ArpOp::Reply,
            n => ArpOp::Other(n),
        };

        Some(Self {
            vlan_ids,
            op,
            sender_mac: MacAddr::new(arp[8], arp[9], arp[10], arp[11], arp[12], arp[13]),
            sender_ip: Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]),
            target_mac: MacAddr::new(arp[18], arp[19], arp[20], arp[21], arp[22], arp[23]),
            target_ip: Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]),
        })
    }

    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }

    pub fn is_probe(&self) -> bool {
        self.op == ArpOp::Request && self.sender_ip == Ipv4Addr::UNSPECIFIED
    }

    pub fn target_mac_zero(&self) -> bool {
        self.target_mac == MacAddr::zero()
    }
}

/// An anomaly observed in the ARP stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ArpAlert {
    /// A known IP started answering with a different MAC.
    MappingChange {
        vlan_ids: Vec<u16>,
        ip: Ipv4Addr,
        old_mac: MacAddr,
        new_mac: MacAddr,
    },
    /// A known MAC started claiming a different IP.
    MacClaims {
        vlan_ids: Vec<u16>,
        mac: MacAddr,
        new_ip: Ipv4Addr,
        old_ip: Ipv4Addr,
    },
    /// One source queried many distinct targets.
    PossibleScan {
        vlan_ids: Vec<u16>,
        mac: MacAddr,
        unique_targets: usize,
    },
}

impl ArpAlert {
    fn vlan_ids(&self) -> &[u16] {
        match self {
            ArpAlert::MappingChange { vlan_ids, .. }
            | ArpAlert::MacClaims { vlan_ids, .. }
            | ArpAlert::PossibleScan { vlan_ids, .. } => vlan_ids,
        }
    }
}

impl fmt::Display for ArpAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vlan_ids() {
            [] => {}
            [a] => write!(f, "VLAN {a}: ")?,
            [a, b, ..] => write!(f, "VLAN {a}/{b}: ")?,
        }
        match self {
            ArpAlert::MappingChange {
                ip,
                old_mac,
                new_mac,
                ..
            } => write!(f, "[Alert] ARP mapping change for {ip}: {old_mac} -> {new_mac}"),
            ArpAlert::MacClaims {
                mac,
                new_ip,
                old_ip,
                ..
            } => write!(f, "[Notice] {mac} now also claims {new_ip} (was {old_ip})"),
            ArpAlert::PossibleScan {
                mac,
                unique_targets,
                ..
            } => write!(
                f,
                "[Notice] {mac} sent ARP requests to {unique_targets}+ unique targets (possible scan)"
            ),
        }
    }
}

#[derive(Debug)]
struct ScanWatch {
    mac: MacAddr,
    targets: Vec<Ipv4Addr>,
    notified: bool,
}

/// Stateful ARP observer with three FIFO-bounded caches.
///
/// Caches hold [`config::DETECTOR_CACHE_SIZE`] entries; the oldest entry is
/// evicted when a new one arrives at capacity. Access is single-threaded in
/// the sniffer's path, so there is no interior locking.
#[derive(Debug, Default)]
pub struct ArpDetector {
    /// IP → currently bound MAC, updated on replies.
    arp_seen: VecDeque<(Ipv4Addr, MacAddr)>,
    /// MAC → most recent IP claimed, updated on replies.
    mac_seen: VecDeque<(MacAddr, Ipv4Addr)>,
    /// Source MAC → distinct request targets.
    scan_table: VecDeque<ScanWatch>,
}

impl ArpDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one observation; returns whatever alerts it triggered.
    pub fn observe(&mut self, ev: &ArpEvent) -> Vec<ArpAlert> {
        match ev.op {
            ArpOp::Request => self.observe_request(ev),
            ArpOp::Reply => self.observe_reply(ev),
            ArpOp::Other(_) => Vec::new(),
        }
    }

    fn observe_reply(&mut self, ev: &ArpEvent) -> Vec<ArpAlert> {
        let mut alerts = Vec::new();

        match self.arp_seen.iter_mut().find(|(ip, _)| *ip == ev.sender_ip) {
            Some((ip, mac)) => {
                if *mac != ev.sender_mac {
                    alerts.push(ArpAlert::MappingChange {
                        vlan_ids: ev.vlan_ids.clone(),
                        ip: *ip,
                        old_mac: *mac,
                        new_mac: ev.sender_mac,
                    });
                    *mac = ev.sender_mac;
                }
            }
            None => {
                if self.arp_seen.len() >= config::DETECTOR_CACHE_SIZE {
                    self.arp_seen.pop_front();
                }
                self.arp_seen.push_back((ev.sender_ip, ev.sender_mac));
            }
        }

        match self.mac_seen.iter_mut().find(|(mac, _)| *mac == ev.sender_mac) {
            Some((_, ip)) => {
                if *ip != ev.sender_ip {
                    alerts.push(ArpAlert::MacClaims {
                        vlan_ids: ev.vlan_ids.clone(),
                        mac: ev.sender_mac,
                        new_ip: ev.sender_ip,
                        old_ip: *ip,
                    });
                    *ip = ev.sender_ip;
                }
            }
            None => {
                if self.mac_seen.len() >= config::DETECTOR_CACHE_SIZE {
                    self.mac_seen.pop_front();
                }
                self.mac_seen.push_back((ev.sender_mac, ev.sender_ip));
            }
        }

        alerts
    }

    fn observe_request(&mut self, ev: &ArpEvent) -> Vec<ArpAlert> {
        let entry = match self
            .scan_table
            .iter_mut()
            .position(|w| w.mac == ev.sender_mac)
        {
            Some(i) => &mut self.scan_table[i],
            None => {
                if self.scan_table.len() >= config::DETECTOR_CACHE_SIZE {
                    self.scan_table.pop_front();
                }
                self.scan_table.push_back(ScanWatch {
                    mac: ev.sender_mac,
                    targets: Vec::new(),
                    notified: false,
                });
                self.scan_table.back_mut().expect("just pushed")
            }
        };

        if !entry.targets.contains(&ev.target_ip) && entry.targets.len() < config::SCAN_TRACK_MAX
        {
            entry.targets.push(ev.target_ip);
        }

        // Fire once per threshold crossing, not per additional target.
        if entry.targets.len() >= config::SCAN_NOTICE_THRESHOLD && !entry.notified {
            entry.notified = true;
            return vec![ArpAlert::PossibleScan {
                vlan_ids: ev.vlan_ids.clone(),
                mac: ev.sender_mac,
                unique_targets: entry.targets.len(),
            }];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(sender_ip: [u8; 4], sender_mac: [u8; 6]) -> ArpEvent {
        ArpEvent {
            vlan_ids: Vec::new(),
            op: ArpOp::Reply,
            sender_mac: MacAddr::new(
                sender_mac[0],
                sender_mac[1],
                sender_mac[2],
                sender_mac[3],
                sender_mac[4],
                sender_mac[5],
            ),
            sender_ip: Ipv4Addr::from(sender_ip),
            target_mac: MacAddr::zero(),
            target_ip: Ipv4Addr::from(sender_ip),
        }
    }

    fn request(sender_mac: [u8; 6], target_ip: [u8; 4]) -> ArpEvent {
        ArpEvent {
            vlan_ids: Vec::new(),
            op: ArpOp::Request,
            sender_mac: MacAddr::new(
                sender_mac[0],
                sender_mac[1],
                sender_mac[2],
                sender_mac[3],
                sender_mac[4],
                sender_mac[5],
            ),
            sender_ip: Ipv4Addr::new(192, 168, 1, 50),
            target_mac: MacAddr::zero(),
            target_ip: Ipv4Addr::from(target_ip),
        }
    }

    #[test]
    fn test_mapping_change_alert_exactly_once() {
        let mut det = ArpDetector::new();
        assert!(det.observe(&reply([192, 168, 1, 1], [0xaa; 6])).is_empty());

        let alerts = det.observe(&reply([192, 168, 1, 1], [0xbb; 6]));
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].to_string(),
            "[Alert] ARP mapping change for 192.168.1.1: aa:aa:aa:aa:aa:aa -> bb:bb:bb:bb:bb:bb"
        );

        // Same binding again: the cache was updated, no further alert.
        assert!(det
            .observe(&reply([192, 168, 1, 1], [0xbb; 6]))
            .iter()
            .all(|a| !matches!(a, ArpAlert::MappingChange { .. })));
    }

    #[test]
    fn test_mac_claims_notice() {
        let mut det = ArpDetector::new();
        det.observe(&reply([192, 168, 1, 1], [0xcc; 6]));
        let alerts = det.observe(&reply([192, 168, 1, 99], [0xcc; 6]));
        assert!(alerts.iter().any(|a| a.to_string()
            == "[Notice] cc:cc:cc:cc:cc:cc now also claims 192.168.1.99 (was 192.168.1.1)"));
    }

    #[test]
    fn test_scan_notice_fires_once_at_threshold() {
        let mut det = ArpDetector::new();
        let mac = [0x02, 0, 0, 0, 0, 0x01];
        let mut notices = 0;
        for i in 0..15u8 {
            let alerts = det.observe(&request(mac, [10, 0, 0, i]));
            notices += alerts
                .iter()
                .filter(|a| matches!(a, ArpAlert::PossibleScan { .. }))
                .count();
            if i + 1 == config::SCAN_NOTICE_THRESHOLD as u8 {
                assert_eq!(notices, 1, "notice fires exactly at the 10th unique target");
            }
        }
        assert_eq!(notices, 1, "notice never repeats");
    }

    #[test]
    fn test_repeat_requests_do_not_count_twice() {
        let mut det = ArpDetector::new();
        let mac = [0x02, 0, 0, 0, 0, 0x02];
        for _ in 0..20 {
            assert!(det.observe(&request(mac, [10, 0, 0, 1])).is_empty());
        }
    }

    #[test]
    fn test_scan_notice_rendering() {
        let alert = ArpAlert::PossibleScan {
            vlan_ids: Vec::new(),
            mac: MacAddr::new(2, 0, 0, 0, 0, 9),
            unique_targets: 10,
        };
        assert_eq!(
            alert.to_string(),
            "[Notice] 02:00:00:00:00:09 sent ARP requests to 10+ unique targets (possible scan)"
        );
    }

    #[test]
    fn test_vlan_prefixes() {
        let mut alert = ArpAlert::MappingChange {
            vlan_ids: vec![7],
            ip: Ipv4Addr::new(10, 0, 0, 1),
            old_mac: MacAddr::zero(),
            new_mac: MacAddr::broadcast(),
        };
        assert!(alert.to_string().starts_with("VLAN 7: [Alert]"));
        if let ArpAlert::MappingChange { vlan_ids, .. } = &mut alert {
            *vlan_ids = vec![7, 8];
        }
        assert!(alert.to_string().starts_with("VLAN 7/8: [Alert]"));
    }

    #[test]
    fn test_cache_evicts_oldest_at_capacity() {
        let mut det = ArpDetector::new();
        for i in 0..(config::DETECTOR_CACHE_SIZE as u16 + 1) {
            det.observe(&reply(
                [10, 0, (i >> 8) as u8, (i & 0xff) as u8],
                [0xaa; 6],
            ));
        }
        assert_eq!(det.arp_seen.len(), config::DETECTOR_CACHE_SIZE);
        assert_eq!(det.arp_seen.front().unwrap().0, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_event_from_frame_rejects_non_arp() {
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        assert!(ArpEvent::from_frame(&frame).is_none());
    }

    #[test]
    fn test_event_from_vlan_tagged_frame() {
        let mut frame = vec![0u8; 14 + 4 + 28];
        frame[12..14].copy_from_slice(&0x8100u16.to_be_bytes());
        frame[14..16].copy_from_slice(&33u16.to_be_bytes());
        frame[16..18].copy_from_slice(&0x0806u16.to_be_bytes());
        frame[18..20].copy_from_slice(&1u16.to_be_bytes()); // hrd = Ethernet
        frame[20..22].copy_from_slice(&0x0800u16.to_be_bytes());
        frame[22] = 6;
        frame[23] = 4;
        frame[24..26].copy_from_slice(&2u16.to_be_bytes()); // reply
        let ev = ArpEvent::from_frame(&frame).unwrap();
        assert_eq!(ev.vlan_ids, vec![33]);
        assert_eq!(ev.op, ArpOp::Reply);
    }

    #[test]
    fn test_event_rejects_non_ipv4_arp() {
        let mut frame = vec![0u8; 42];
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        frame[14..16].copy_from_slice(&1u16.to_be_bytes());
        frame[16..18].copy_from_slice(&0x86ddu16.to_be_bytes()); // not IPv4
        frame[18] = 6;
        frame[19] = 4;
        assert!(ArpEvent::from_frame(&frame).is_none());
    }
}
