//! Layered protocol decoder.
//!
//! [`decode`] parses a raw frame into a [`DecodeTree`]: Ethernet, up to two
//! stacked 802.1Q/802.1ad tags, then ARP / IPv4 / IPv6 with their transport
//! layers, plus a terminal hex-dump block. Decoding never fails destructively;
//! malformed input becomes an `Error` layer so the failure stays observable.
//!
//! Well-known ports are a labelling hint, not truth: the decoder tags what a
//! port *suggests* and leaves the generic transport name otherwise.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::util::MacAddr;
use serde::Serialize;

use crate::core::dhcp;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88A8;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// One named protocol layer: ordered field/value pairs plus sub-layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    pub name: String,
    pub fields: Vec<(String, String)>,
    pub children: Vec<Layer>,
}

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Structured decode of one frame. Produced fresh per frame, never mutated
/// after construction; `decode` is pure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeTree {
    /// VLAN IDs in outer-to-inner order (empty for untagged frames).
    pub vlan_ids: Vec<u16>,
    pub layers: Vec<Layer>,
    /// One-line rendering of the most specific thing we understood.
    pub summary: String,
}

impl DecodeTree {
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }
}

/// Decode a raw frame. Always returns a tree; parse errors become an
/// `Error` layer rather than aborting.
pub fn decode(frame: &[u8]) -> DecodeTree {
    let mut layers = Vec::new();
    let mut vlan_ids = Vec::new();
    let mut summary = String::new();

    if frame.len() < 14 {
        let mut err = Layer::new("Error");
        err.field(
            "Reason",
            format!("frame shorter than Ethernet header ({} bytes)", frame.len()),
        );
        layers.push(err);
        layers.push(hex_dump_layer(frame));
        return DecodeTree {
            vlan_ids,
            layers,
            summary: "Malformed frame".into(),
        };
    }

    let dst = mac_at(frame, 0);
    let src = mac_at(frame, 6);
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = 14;

    let mut eth = Layer::new("Ethernet");
    eth.field("Destination MAC", dst.to_string());
    eth.field("Source MAC", src.to_string());
    eth.field("EtherType", format!("0x{ethertype:04x}"));
    layers.push(eth);

    // Up to two stacked tags (QinQ).
    while (ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ) && vlan_ids.len() < 2 {
        if frame.len() < offset + 4 {
            let mut err = Layer::new("Error");
            err.field("Reason", "truncated VLAN tag");
            layers.push(err);
            layers.push(hex_dump_layer(frame));
            return DecodeTree {
                vlan_ids,
                layers,
                summary: "Malformed frame".into(),
            };
        }
        let tci = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
        let vid = tci & 0x0fff;
        let mut vlan = Layer::new("802.1Q VLAN");
        vlan.field("TPID", format!("0x{ethertype:04x}"));
        vlan.field("VLAN ID", vid.to_string());
        layers.push(vlan);
        vlan_ids.push(vid);
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }

    let payload = &frame[offset..];
    match ethertype {
        ETHERTYPE_ARP => decode_arp(payload, &mut layers, &mut summary),
        ETHERTYPE_IPV4 => decode_ipv4(payload, &mut layers, &mut summary),
        ETHERTYPE_IPV6 => decode_ipv6(payload, &mut layers, &mut summary),
        other => {
            let mut data = Layer::new("Data");
            data.field("EtherType", format!("0x{other:04x}"));
            data.field("Length", payload.len().to_string());
            layers.push(data);
            summary = format!("Ethernet packet (Type 0x{other:04x})");
        }
    }

    layers.push(hex_dump_layer(frame));

    DecodeTree {
        vlan_ids,
        layers,
        summary,
    }
}

fn decode_arp(payload: &[u8], layers: &mut Vec<Layer>, summary: &mut String) {
    if payload.len() < 28 {
        let mut err = Layer::new("Error");
        err.field("Reason", format!("ARP payload too short ({} bytes)", payload.len()));
        layers.push(err);
        *summary = "ARP packet (truncated)".into();
        return;
    }

    let hrd = u16::from_be_bytes([payload[0], payload[1]]);
    let pro = u16::from_be_bytes([payload[2], payload[3]]);
    let hlen = payload[4];
    let plen = payload[5];
    let op = u16::from_be_bytes([payload[6], payload[7]]);
    let sender_mac = mac_at(payload, 8);
    let sender_ip = ipv4_at(payload, 14);
    let target_mac = mac_at(payload, 18);
    let target_ip = ipv4_at(payload, 24);

    let gratuitous = sender_ip == target_ip;
    let probe = op == 1 && sender_ip == Ipv4Addr::UNSPECIFIED;
    let target_mac_zero = target_mac == MacAddr::zero();

    let mut arp = Layer::new("ARP");
    arp.field("Hardware Type", hrd.to_string());
    arp.field("Protocol Type", format!("0x{pro:04x}"));
    arp.field("Hardware Size", hlen.to_string());
    arp.field("Protocol Size", plen.to_string());
    arp.field(
        "Opcode",
        match op {
            1 => format!("REQUEST ({op})"),
            2 => format!("REPLY ({op})"),
            _ => format!("other ({op})"),
        },
    );
    arp.field("Sender MAC", sender_mac.to_string());
    arp.field("Sender IP", sender_ip.to_string());
    arp.field("Target MAC", target_mac.to_string());
    arp.field("Target IP", target_ip.to_string());
    if gratuitous {
        arp.field("Gratuitous", "yes".to_string());
    }
    if probe {
        arp.field("Probe", "yes".to_string());
    }

    *summary = match op {
        1 => {
            if !target_mac_zero {
                arp.field("Anomaly", "target MAC set in request".to_string());
            }
            format!(
                "ARP who-has {target_ip} tell {sender_ip} ({sender_mac}){}",
                if probe { " [probe]" } else { "" }
            )
        }
        2 => {
            if target_mac_zero {
                arp.field("Anomaly", "target MAC zero in reply".to_string());
            }
            format!(
                "ARP {sender_ip} is-at {sender_mac}{}",
                if gratuitous { " [gratuitous]" } else { "" }
            )
        }
        _ => format!("ARP op {op} from {sender_ip} ({sender_mac}) to {target_ip}"),
    };
    arp.field("Summary", summary.clone());
    layers.push(arp);
}

fn decode_ipv4(payload: &[u8], layers: &mut Vec<Layer>, summary: &mut String) {
    if payload.len() < 20 {
        let mut err = Layer::new("Error");
        err.field("Reason", format!("IPv4 header too short ({} bytes)", payload.len()));
        layers.push(err);
        *summary = "IPv4 packet (truncated)".into();
        return;
    }

    let version = payload[0] >> 4;
    let ihl = (payload[0] & 0x0f) as usize * 4;
    let ttl = payload[8];
    let protocol = payload[9];
    let src = ipv4_at(payload, 12);
    let dst = ipv4_at(payload, 16);

    let mut ip = Layer::new("IPv4");
    ip.field("Version", version.to_string());
    ip.field("Header Length", format!("{ihl} bytes"));
    ip.field("TTL", ttl.to_string());
    ip.field("Protocol", protocol.to_string());
    ip.field("Source IP", src.to_string());
    ip.field("Destination IP", dst.to_string());

    if ihl < 20 || payload.len() < ihl {
        ip.field("Anomaly", "header length exceeds captured bytes".to_string());
        layers.push(ip);
        *summary = format!("IPv4 {src} \u{2192} {dst} (truncated)");
        return;
    }
    layers.push(ip);

    let transport = &payload[ihl..];
    decode_transport(protocol, transport, src.to_string(), dst.to_string(), false, layers, summary);
}

fn decode_ipv6(payload: &[u8], layers: &mut Vec<Layer>, summary: &mut String) {
    if payload.len() < 40 {
        let mut err = Layer::new("Error");
        err.field("Reason", format!("IPv6 header too short ({} bytes)", payload.len()));
        layers.push(err);
        *summary = "IPv6 packet (truncated)".into();
        return;
    }

    let next_header = payload[6];
    let hop_limit = payload[7];
    let src = ipv6_at(payload, 8);
    let dst = ipv6_at(payload, 24);

    let mut ip = Layer::new("IPv6");
    ip.field("Version", (payload[0] >> 4).to_string());
    ip.field(
        "Payload Length",
        u16::from_be_bytes([payload[4], payload[5]]).to_string(),
    );
    ip.field("Next Header", next_header.to_string());
    ip.field("Hop Limit", hop_limit.to_string());
    ip.field("Source IP", src.to_string());
    ip.field("Destination IP", dst.to_string());
    layers.push(ip);

    let transport = &payload[40..];
    decode_transport(next_header, transport, src.to_string(), dst.to_string(), true, layers, summary);
}

fn decode_transport(
    protocol: u8,
    transport: &[u8],
    src: String,
    dst: String,
    v6: bool,
    layers: &mut Vec<Layer>,
    summary: &mut String,
) {
    let suffix = if v6 { " (IPv6)" } else { "" };
    match protocol {
        IPPROTO_ICMP if !v6 => {
            let mut icmp = Layer::new("ICMP");
            if transport.len() >= 2 {
                icmp.field("Type", transport[0].to_string());
                icmp.field("Code", transport[1].to_string());
            }
            layers.push(icmp);
            *summary = format!("ICMP {src} \u{2192} {dst}");
        }
        IPPROTO_ICMPV6 if v6 => {
            let mut icmp = Layer::new("ICMPv6");
            if transport.len() >= 2 {
                icmp.field("Type", transport[0].to_string());
                icmp.field("Code", transport[1].to_string());
            }
            layers.push(icmp);
            *summary = format!("ICMPv6 {src} \u{2192} {dst}");
        }
        IPPROTO_TCP => {
            if transport.len() < 4 {
                let mut err = Layer::new("Error");
                err.field("Reason", "TCP header too short for ports".to_string());
                layers.push(err);
                *summary = format!("TCP {src} \u{2192} {dst} (truncated)");
                return;
            }
            let sport = u16::from_be_bytes([transport[0], transport[1]]);
            let dport = u16::from_be_bytes([transport[2], transport[3]]);
            let class = classify(sport, dport, tcp_port_label, "TCP");
            let mut tcp = Layer::new("TCP");
            tcp.field("Source Port", sport.to_string());
            tcp.field("Destination Port", dport.to_string());
            tcp.field("Classification", class.to_string());
            layers.push(tcp);
            *summary = format!("{class} {src}:{sport} \u{2192} {dst}:{dport}{suffix}");
        }
        IPPROTO_UDP => {
            if transport.len() < 8 {
                let mut err = Layer::new("Error");
                err.field("Reason", "UDP header too short".to_string());
                layers.push(err);
                *summary = format!("UDP {src} \u{2192} {dst} (truncated)");
                return;
            }
            let sport = u16::from_be_bytes([transport[0], transport[1]]);
            let dport = u16::from_be_bytes([transport[2], transport[3]]);
            let class = classify(sport, dport, udp_port_label, "UDP");
            let mut udp = Layer::new("UDP");
            udp.field("Source Port", sport.to_string());
            udp.field("Destination Port", dport.to_string());
            udp.field(
                "Length",
                u16::from_be_bytes([transport[4], transport[5]]).to_string(),
            );
            udp.field("Classification", class.to_string());
            if (sport == 67 || sport == 68 || dport == 67 || dport == 68)
                && transport.len() > 8
            {
                if let Some(bootp) = dhcp::decode_dhcp(&transport[8..]) {
                    udp.children.push(bootp);
                }
            }
            layers.push(udp);
            *summary = format!("{class} {src}:{sport} \u{2192} {dst}:{dport}{suffix}");
        }
        other => {
            let name = if v6 { "IPv6" } else { "IPv4" };
            let mut unknown = Layer::new("Data");
            unknown.field("Protocol", format!("{name} - Unknown Protocol {other}"));
            layers.push(unknown);
            *summary = format!("{name} {src} \u{2192} {dst} (Protocol {other})");
        }
    }
}

fn tcp_port_label(port: u16) -> Option<&'static str> {
    match port {
        80 => Some("HTTP"),
        443 => Some("HTTPS (TLS/SSL)"),
        21 => Some("FTP"),
        25 => Some("SMTP"),
        110 => Some("POP3"),
        143 => Some("IMAP"),
        22 => Some("SSH"),
        139 => Some("NetBIOS"),
        5060 | 5061 => Some("SIP"),
        _ => None,
    }
}

fn udp_port_label(port: u16) -> Option<&'static str> {
    match port {
        53 => Some("DNS"),
        67 | 68 => Some("DHCP"),
        123 => Some("NTP"),
        137 | 138 => Some("NetBIOS"),
        161 | 162 => Some("SNMP"),
        5060 | 5061 => Some("SIP"),
        _ => None,
    }
}

/// Classify a port pair. When both ports are well-known the smaller wins;
/// otherwise whichever matches the table; otherwise the generic name.
fn classify(
    src: u16,
    dst: u16,
    label: fn(u16) -> Option<&'static str>,
    generic: &'static str,
) -> &'static str {
    let (lo, hi) = if src <= dst { (src, dst) } else { (dst, src) };
    match (label(lo), label(hi)) {
        (Some(l), _) => l,
        (None, Some(h)) => h,
        (None, None) => generic,
    }
}

/// Render the classic hex dump: offset, 16 bytes per line, printable-ASCII gutter.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let offset = i * 16;
        let _ = write!(out, "{offset:04x}  ");
        for j in 0..16 {
            match chunk.get(j) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }
    out
}

fn hex_dump_layer(data: &[u8]) -> Layer {
    let mut layer = Layer::new("Hex Dump");
    layer.field("Length", data.len().to_string());
    layer.field("Content", hex_dump(data));
    layer
}

fn mac_at(data: &[u8], offset: usize) -> MacAddr {
    MacAddr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
        data[offset + 4],
        data[offset + 5],
    )
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

fn ipv6_at(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}
