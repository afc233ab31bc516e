//! Host inventory via the external LAN scanner helper.
//!
//! The helper is a separately executed process that prints `<ipv4> <mac>`
//! lines grouped into `Your Device:` / `Gateway (Router):` / `Other Devices:`
//! sections and exits 0. Its output is untrusted input: headers and blank
//! lines are skipped, unparseable lines are ignored, and absence of the
//! helper, a non-zero exit, or an empty result all fail the scan. Nothing is
//! ever fabricated.

use std::net::Ipv4Addr;
use std::process::Command;

use pnet::util::MacAddr;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};

/// One host seen on the LAN. Immutable after the scan that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub is_gateway: bool,
}

/// The atomic output of an inventory scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Devices in helper output order, first occurrence kept on duplicates.
    pub devices: Vec<Device>,
    pub gateway_ip: Ipv4Addr,
    pub interface: String,
}

/// Run the inventory helper and the default-route lookup, returning the
/// full scan result.
pub fn scan(helper: &str) -> Result<ScanResult> {
    let output = Command::new(helper)
        .output()
        .map_err(|e| Error::Inventory(format!("cannot run {helper}: {e}")))?;

    if !output.status.success() {
        return Err(Error::Inventory(format!(
            "{helper} exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let (devices, gateway_ip) = parse_scan_output(&stdout);

    if devices.is_empty() {
        return Err(Error::Inventory(format!("{helper} reported no devices")));
    }
    let gateway_ip = gateway_ip
        .ok_or_else(|| Error::Inventory(format!("{helper} reported no gateway")))?;

    let interface = default_interface()?;
    tracing::info!(
        "inventory: {} device(s), gateway {gateway_ip}, interface {interface}",
        devices.len()
    );

    Ok(ScanResult {
        devices,
        gateway_ip,
        interface,
    })
}

/// Parse the helper's section grammar. Returns the devices in output order
/// and the gateway IP if a gateway line was seen.
pub fn parse_scan_output(text: &str) -> (Vec<Device>, Option<Ipv4Addr>) {
    #[derive(PartialEq)]
    enum Section {
        SelfDevice,
        Gateway,
        Others,
    }

    let mut section = Section::SelfDevice;
    let mut devices: Vec<Device> = Vec::new();
    let mut gateway_ip = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty()
            || line.contains("Your Device:")
            || line.contains("IPV4")
            || line.contains("Scan complete")
        {
            continue;
        }
        if line.contains("Gateway (Router):") {
            section = Section::Gateway;
            continue;
        }
        if line.contains("Other Devices:") {
            section = Section::Others;
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(ip_str), Some(mac_str)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(ip), Ok(mac)) = (ip_str.parse::<Ipv4Addr>(), mac_str.parse::<MacAddr>())
        else {
            continue;
        };

        // Keep the first occurrence of a duplicated IP.
        if devices.iter().any(|d| d.ip == ip) {
            continue;
        }

        let is_gateway = section == Section::Gateway;
        if is_gateway && gateway_ip.is_none() {
            gateway_ip = Some(ip);
        }
        devices.push(Device {
            ip,
            mac,
            is_gateway,
        });
    }

    (devices, gateway_ip)
}

/// Resolve the default-route interface name.
///
/// Equivalent to `ip route | grep '^default' | awk '{print $5}' | head -n1`,
/// with the field extraction done in-process rather than trusting a pipeline.
pub fn default_interface() -> Result<String> {
    let output = Command::new("ip")
        .arg("route")
        .output()
        .map_err(|e| Error::Inventory(format!("cannot run ip route: {e}")))?;

    if !output.status.success() {
        return Err(Error::Inventory(format!(
            "ip route exited with {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_default_interface(&stdout)
        .ok_or_else(|| Error::Inventory("no default route found".into()))
}

/// Extract the interface name (fifth field) from the first `default` route line.
pub fn parse_default_interface(routes: &str) -> Option<String> {
    routes
        .lines()
        .find(|l| l.starts_with("default"))
        .and_then(|l| l.split_whitespace().nth(4))
        .map(str::to_string)
}

/// Parse a target-selection string against a device listing of `count` entries.
///
/// Accepts 1-based indices separated by spaces or commas (`"1 3 5"`), or
/// `"all"` / the literal index `count + 1` to select every device. Tokens
/// that are not positive numbers are skipped. The result is 0-based and
/// capped at [`config::MAX_TARGETS`].
pub fn parse_selection(input: &str, count: usize) -> Vec<usize> {
    let trimmed = input.trim();
    let select_all = trimmed.eq_ignore_ascii_case("all")
        || trimmed.parse::<usize>().is_ok_and(|n| n == count + 1);
    if select_all {
        if count > config::MAX_TARGETS {
            tracing::warn!(
                "selection limited to {} targets (requested {count})",
                config::MAX_TARGETS
            );
        }
        return (0..count.min(config::MAX_TARGETS)).collect();
    }

    let mut indices: Vec<usize> = trimmed
        .split([' ', ','])
        .filter_map(|tok| tok.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .map(|n| n - 1)
        .collect();
    if indices.len() > config::MAX_TARGETS {
        tracing::warn!(
            "selection limited to {} targets (requested {})",
            config::MAX_TARGETS,
            indices.len()
        );
        indices.truncate(config::MAX_TARGETS);
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Your Device:
IPV4 Address        MAC Address
192.168.1.23 aa:bb:cc:00:11:22

Gateway (Router):
192.168.1.1 de:ad:be:ef:00:01

Other Devices:
192.168.1.42 11:22:33:44:55:66
  192.168.1.77 66:55:44:33:22:11
garbage line that parses as nothing
192.168.1.42 99:99:99:99:99:99
Scan complete
";

    #[test]
    fn test_parse_sections_and_gateway() {
        let (devices, gateway) = parse_scan_output(SAMPLE);
        assert_eq!(gateway, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(devices.len(), 4);
        assert!(devices[1].is_gateway);
        assert!(!devices[0].is_gateway);
        assert_eq!(devices[2].ip, Ipv4Addr::new(192, 168, 1, 42));
    }

    #[test]
    fn test_parse_tolerates_leading_whitespace() {
        let (devices, _) = parse_scan_output(SAMPLE);
        assert!(devices.iter().any(|d| d.ip == Ipv4Addr::new(192, 168, 1, 77)));
    }

    #[test]
    fn test_parse_keeps_first_duplicate() {
        let (devices, _) = parse_scan_output(SAMPLE);
        let dup: Vec<_> = devices
            .iter()
            .filter(|d| d.ip == Ipv4Addr::new(192, 168, 1, 42))
            .collect();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].mac, "11:22:33:44:55:66".parse::<MacAddr>().unwrap());
    }

    #[test]
    fn test_parse_empty_output_yields_nothing() {
        let (devices, gateway) = parse_scan_output("Scan complete\n");
        assert!(devices.is_empty());
        assert!(gateway.is_none());
    }

    #[test]
    fn test_parse_default_interface() {
        let routes = "default via 192.168.1.1 dev wlp3s0 proto dhcp metric 600\n\
                      192.168.1.0/24 dev wlp3s0 proto kernel scope link\n";
        assert_eq!(parse_default_interface(routes).as_deref(), Some("wlp3s0"));
        assert_eq!(parse_default_interface("10.0.0.0/8 dev eth1\n"), None);
    }

    #[test]
    fn test_selection_individual_indices() {
        assert_eq!(parse_selection("1 3 5", 10), vec![0, 2, 4]);
        assert_eq!(parse_selection("2,4", 10), vec![1, 3]);
    }

    #[test]
    fn test_selection_all_keyword_and_sentinel_index() {
        assert_eq!(parse_selection("all", 3), vec![0, 1, 2]);
        // "N+1" is the ALL DEVICES entry in the listing.
        assert_eq!(parse_selection("4", 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_selection_skips_garbage_and_zero() {
        assert_eq!(parse_selection("0 x 2", 10), vec![1]);
        assert!(parse_selection("", 10).is_empty());
    }

    #[test]
    fn test_selection_all_respects_target_cap() {
        let sel = parse_selection("all", config::MAX_TARGETS + 30);
        assert_eq!(sel.len(), config::MAX_TARGETS);
    }
}
