//! Raw-ICMP traceroute engine.
//!
//! Sends TTL-limited echo requests over a Layer4 ICMP transport pair,
//! correlates Echo Reply / Time Exceeded responses by the echo id and
//! sequence (including the original echo embedded in Time Exceeded
//! payloads), measures round-trip times, and resolves responder names via
//! reverse DNS. Per-probe timeouts are data, not errors; only missing
//! privileges and unresolvable hostnames abort a trace.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{IcmpCodes, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;
use pnet::transport::{icmp_packet_iter, transport_channel, TransportChannelType, TransportProtocol};
use serde::Serialize;

use crate::config;
use crate::error::{Error, Result};

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Unreachable,
}

/// One hop's worth of probe results.
#[derive(Debug, Clone, Serialize)]
pub struct TracerouteHop {
    /// TTL of the probes that produced this hop (1-based).
    pub hop: u8,
    /// Responder address, if any probe got an answer.
    pub address: Option<Ipv4Addr>,
    /// Reverse-DNS name of the responder, if resolvable.
    pub hostname: Option<String>,
    /// Round-trip times in milliseconds for successful probes, probe order.
    pub rtts_ms: Vec<f64>,
    /// Per-probe outcome, probe order.
    pub statuses: Vec<ProbeStatus>,
}

impl TracerouteHop {
    fn new(hop: u8) -> Self {
        Self {
            hop,
            address: None,
            hostname: None,
            rtts_ms: Vec::new(),
            statuses: Vec::new(),
        }
    }

    /// Number of probes that got an answer at this hop.
    pub fn probe_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|s| **s == ProbeStatus::Ok)
            .count()
    }
}

impl fmt::Display for TracerouteHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:2} ", self.hop)?;
        match self.address {
            Some(addr) => write!(
                f,
                " {} ({addr})",
                self.hostname.as_deref().unwrap_or("*")
            )?,
            None => write!(f, " *")?,
        }
        let mut rtts = self.rtts_ms.iter();
        for status in &self.statuses {
            match status {
                ProbeStatus::Ok => {
                    if let Some(rtt) = rtts.next() {
                        write!(f, "  {rtt:.3} ms")?;
                    }
                }
                ProbeStatus::Timeout => write!(f, "  *")?,
                ProbeStatus::Unreachable => write!(f, "  !")?,
            }
        }
        Ok(())
    }
}

/// Full trace output.
#[derive(Debug, Clone, Serialize)]
pub struct TracerouteResult {
    pub target_host: String,
    pub target_ip: Ipv4Addr,
    /// TTL at which the target answered, or the hop limit if it never did.
    pub total_hops: u8,
    pub hops: Vec<TracerouteHop>,
    pub elapsed: Duration,
}

impl TracerouteResult {
    /// Short human summary of the run.
    pub fn summary(&self) -> String {
        let successful = self.hops.iter().filter(|h| h.probe_count() > 0).count();
        format!(
            "Target: {} ({})\nTotal hops: {}\nSuccessful hops: {successful}",
            self.target_host, self.target_ip, self.total_hops
        )
    }
}

/// Trace parameters; the defaults mirror the classic tool.
#[derive(Debug, Clone, Copy)]
pub struct TraceOptions {
    pub max_hops: u8,
    pub probes_per_hop: usize,
    pub timeout: Duration,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            max_hops: config::TRACE_MAX_HOPS,
            probes_per_hop: config::TRACE_PROBES_PER_HOP,
            timeout: Duration::from_secs(config::TRACE_TIMEOUT_SECS),
        }
    }
}

/// Resolve a hostname (or dotted quad) to its first IPv4 address.
pub fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    let addrs =
        dns_lookup::lookup_host(host).map_err(|_| Error::Dns(host.to_string()))?;
    addrs
        .into_iter()
        .find_map(|a| match a {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| Error::Dns(host.to_string()))
}

fn reverse_dns(addr: Ipv4Addr) -> Option<String> {
    dns_lookup::lookup_addr(&IpAddr::V4(addr)).ok()
}

/// Fill `buf` with a complete echo request: type 8, code 0, the given
/// id/seq, a deterministic payload pattern, and a correct checksum.
fn build_echo(buf: &mut [u8], id: u16, seq: u16) {
    for (i, byte) in buf[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    {
        let mut echo = MutableEchoRequestPacket::new(buf).expect("buffer fits echo header");
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(IcmpCodes::NoCode);
        echo.set_identifier(id);
        echo.set_sequence_number(seq);
        echo.set_checksum(0);
    }
    let sum = icmp::checksum(&IcmpPacket::new(buf).expect("buffer fits icmp header"));
    MutableEchoRequestPacket::new(buf)
        .expect("buffer fits echo header")
        .set_checksum(sum);
}

/// Does a Time Exceeded payload (the original IPv4 datagram) embed our echo?
fn embedded_echo_matches(datagram: &[u8], id: u16, seq: u16) -> bool {
    if datagram.len() < 20 {
        return false;
    }
    let ihl = ((datagram[0] & 0x0f) as usize) * 4;
    if ihl < 20 || datagram.len() < ihl + 8 {
        return false;
    }
    let echo = &datagram[ihl..];
    echo[0] == 8
        && u16::from_be_bytes([echo[4], echo[5]]) == id
        && u16::from_be_bytes([echo[6], echo[7]]) == seq
}

enum ProbeOutcome {
    Reached(Ipv4Addr, f64),
    Intermediate(Ipv4Addr, f64),
    Timeout,
    Unreachable,
}

/// Trace the route to `host`.
pub fn trace(host: &str, opts: &TraceOptions) -> Result<TracerouteResult> {
    let target_ip = resolve_host(host)?;

    let protocol =
        TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Icmp));
    // One socket pair: TTL is adjusted on the sender per hop, replies of
    // every type land on the receiver.
    let (mut tx, mut rx) =
        transport_channel(4096, protocol).map_err(|e| Error::from_socket_open("icmp", e))?;
    let mut responses = icmp_packet_iter(&mut rx);

    let id = (std::process::id() & 0xffff) as u16;
    let started = Instant::now();
    let mut hops = Vec::new();
    let mut total_hops = opts.max_hops;
    let mut reached = false;

    tracing::info!(
        "traceroute to {host} ({target_ip}), {} hops max, {} byte packets",
        opts.max_hops,
        config::TRACE_PACKET_SIZE
    );

    for ttl in 1..=opts.max_hops {
        tx.set_ttl(ttl)?;
        let mut hop = TracerouteHop::new(ttl);

        for probe in 0..opts.probes_per_hop {
            let seq = probe as u16;
            let mut buf = vec![0u8; config::TRACE_PACKET_SIZE];
            build_echo(&mut buf, id, seq);
            let echo = IcmpPacket::new(&buf).expect("built above");

            let sent_at = Instant::now();
            let outcome = if tx.send_to(echo, IpAddr::V4(target_ip)).is_err() {
                ProbeOutcome::Unreachable
            } else {
                let deadline = sent_at + opts.timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break ProbeOutcome::Timeout;
                    }
                    match responses.next_with_timeout(remaining) {
                        Ok(Some((packet, addr))) => {
                            let IpAddr::V4(from) = addr else { continue };
                            let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                            match packet.get_icmp_type() {
                                IcmpTypes::EchoReply => {
                                    if let Some(reply) = EchoReplyPacket::new(packet.packet()) {
                                        if reply.get_identifier() == id
                                            && reply.get_sequence_number() == seq
                                        {
                                            break ProbeOutcome::Reached(from, rtt_ms);
                                        }
                                    }
                                }
                                IcmpTypes::TimeExceeded => {
                                    if let Some(te) = TimeExceededPacket::new(packet.packet()) {
                                        if embedded_echo_matches(te.payload(), id, seq) {
                                            break ProbeOutcome::Intermediate(from, rtt_ms);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        Ok(None) => break ProbeOutcome::Timeout,
                        Err(_) => break ProbeOutcome::Unreachable,
                    }
                }
            };

            match outcome {
                ProbeOutcome::Reached(from, rtt_ms) => {
                    record_response(&mut hop, from, rtt_ms);
                    reached = true;
                }
                ProbeOutcome::Intermediate(from, rtt_ms) => {
                    record_response(&mut hop, from, rtt_ms);
                }
                ProbeOutcome::Timeout => hop.statuses.push(ProbeStatus::Timeout),
                ProbeOutcome::Unreachable => hop.statuses.push(ProbeStatus::Unreachable),
            }

            std::thread::sleep(Duration::from_millis(config::TRACE_PROBE_PACING_MS));
        }

        hops.push(hop);
        if reached {
            total_hops = ttl;
            break;
        }
    }

    Ok(TracerouteResult {
        target_host: host.to_string(),
        target_ip,
        total_hops,
        hops,
        elapsed: started.elapsed(),
    })
}

/// Record a successful probe, resolving the responder's name on first sight.
fn record_response(hop: &mut TracerouteHop, from: Ipv4Addr, rtt_ms: f64) {
    hop.statuses.push(ProbeStatus::Ok);
    hop.rtts_ms.push(rtt_ms);
    if hop.address.is_none() {
        hop.address = Some(from);
        hop.hostname = reverse_dns(from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn internet_checksum(data: &[u8]) -> u16 {
        let mut sum = 0u32;
        for chunk in data.chunks(2) {
            let word = match chunk {
                [a, b] => u16::from_be_bytes([*a, *b]) as u32,
                [a] => (*a as u32) << 8,
                _ => 0,
            };
            sum += word;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn test_echo_header_fields() {
        let mut buf = vec![0u8; config::TRACE_PACKET_SIZE];
        build_echo(&mut buf, 0x1234, 2);
        assert_eq!(buf[0], 8, "ICMP echo request type");
        assert_eq!(buf[1], 0, "code");
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 2);
        // Deterministic payload pattern.
        assert_eq!(buf[8], 0);
        assert_eq!(buf[9], 1);
    }

    #[test]
    fn test_echo_checksum_validates() {
        let mut buf = vec![0u8; config::TRACE_PACKET_SIZE];
        build_echo(&mut buf, 0xbeef, 1);
        // Recomputing the checksum over the packet with its checksum field
        // in place must yield zero (ones-complement property).
        assert_eq!(internet_checksum(&buf), 0);
    }

    fn embedded(id: u16, seq: u16, ihl_words: u8) -> Vec<u8> {
        let ihl = ihl_words as usize * 4;
        let mut datagram = vec![0u8; ihl + 8];
        datagram[0] = 0x40 | ihl_words;
        datagram[ihl] = 8; // embedded echo request
        datagram[ihl + 4..ihl + 6].copy_from_slice(&id.to_be_bytes());
        datagram[ihl + 6..ihl + 8].copy_from_slice(&seq.to_be_bytes());
        datagram
    }

    #[test]
    fn test_embedded_echo_matches() {
        assert!(embedded_echo_matches(&embedded(7, 1, 5), 7, 1));
        // Options-bearing header (IHL 6) still lines up.
        assert!(embedded_echo_matches(&embedded(7, 1, 6), 7, 1));
    }

    #[test]
    fn test_embedded_echo_rejects_wrong_id_or_seq() {
        assert!(!embedded_echo_matches(&embedded(7, 1, 5), 8, 1));
        assert!(!embedded_echo_matches(&embedded(7, 1, 5), 7, 2));
    }

    #[test]
    fn test_embedded_echo_rejects_truncated_datagram() {
        let datagram = embedded(7, 1, 5);
        assert!(!embedded_echo_matches(&datagram[..22], 7, 1));
        assert!(!embedded_echo_matches(&[], 7, 1));
    }

    #[test]
    fn test_hop_display_uses_stars_for_missing_data() {
        let mut hop = TracerouteHop::new(3);
        hop.statuses = vec![ProbeStatus::Timeout, ProbeStatus::Timeout];
        assert_eq!(hop.to_string(), " 3  *  *  *");

        let mut hop = TracerouteHop::new(1);
        hop.address = Some(Ipv4Addr::new(192, 168, 1, 1));
        hop.statuses = vec![ProbeStatus::Ok];
        hop.rtts_ms = vec![1.5];
        assert_eq!(hop.to_string(), " 1  * (192.168.1.1)  1.500 ms");
    }

    #[test]
    fn test_hop_probe_count_counts_only_ok() {
        let mut hop = TracerouteHop::new(2);
        hop.statuses = vec![ProbeStatus::Ok, ProbeStatus::Timeout, ProbeStatus::Ok];
        assert_eq!(hop.probe_count(), 2);
    }

    #[test]
    fn test_result_summary() {
        let result = TracerouteResult {
            target_host: "router.local".into(),
            target_ip: Ipv4Addr::new(192, 168, 1, 1),
            total_hops: 1,
            hops: vec![TracerouteHop {
                hop: 1,
                address: Some(Ipv4Addr::new(192, 168, 1, 1)),
                hostname: None,
                rtts_ms: vec![0.8],
                statuses: vec![ProbeStatus::Ok],
            }],
            elapsed: Duration::from_millis(450),
        };
        assert!(result.summary().contains("Total hops: 1"));
        assert!(result.summary().contains("Successful hops: 1"));
    }

    #[test]
    fn test_default_options_match_config() {
        let opts = TraceOptions::default();
        assert_eq!(opts.max_hops, config::TRACE_MAX_HOPS);
        assert_eq!(opts.probes_per_hop, config::TRACE_PROBES_PER_HOP);
        assert_eq!(opts.timeout, Duration::from_secs(config::TRACE_TIMEOUT_SECS));
    }
}
