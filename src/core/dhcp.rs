//! DHCP/BOOTP payload helper for the decoder.

use std::net::Ipv4Addr;

use crate::core::decode::Layer;

const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];
const HEADER_LEN: usize = 236;
const OPTIONS_MAX: usize = 312;
const OPTION_PAD: u8 = 0;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_END: u8 = 255;

/// Human name for a DHCP message type (option 53).
pub fn message_type(code: u8) -> &'static str {
    match code {
        1 => "DHCP Discover",
        2 => "DHCP Offer",
        3 => "DHCP Request",
        4 => "DHCP Decline",
        5 => "DHCP ACK",
        6 => "DHCP NAK",
        7 => "DHCP Release",
        8 => "DHCP Inform",
        _ => "Unknown",
    }
}

/// Decode a BOOTP/DHCP payload into a layer, or `None` when the payload is
/// too short or the magic cookie is missing.
pub fn decode_dhcp(payload: &[u8]) -> Option<Layer> {
    if payload.len() < HEADER_LEN + 4 {
        return None;
    }
    if payload[HEADER_LEN..HEADER_LEN + 4] != MAGIC_COOKIE {
        return None;
    }

    let xid = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let hlen = payload[2] as usize;

    let mut layer = Layer::new("DHCP");
    layer.field("Transaction ID", format!("0x{xid:08x}"));
    layer.field("Client IP", ipv4_field(payload, 12));
    layer.field("Your IP", ipv4_field(payload, 16));
    layer.field("Server IP", ipv4_field(payload, 20));
    layer.field("Gateway IP", ipv4_field(payload, 24));
    layer.field(
        "Client MAC",
        payload[28..28 + hlen.min(16)]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"),
    );

    // Option walk: [code, len, data...] until END, bounded by the payload
    // and the classic 312-byte options field.
    let options = &payload[HEADER_LEN + 4..];
    let end = options.len().min(OPTIONS_MAX - 4);
    let mut i = 0;
    while i < end {
        let code = options[i];
        i += 1;
        if code == OPTION_END {
            break;
        }
        if code == OPTION_PAD {
            continue;
        }
        if i >= end {
            break;
        }
        let len = options[i] as usize;
        i += 1;
        if i + len > end {
            break;
        }
        if code == OPTION_MSG_TYPE && len == 1 {
            let t = options[i];
            layer.field("Message Type", format!("{} ({t})", message_type(t)));
        }
        i += len;
    }

    Some(layer)
}

fn ipv4_field(payload: &[u8], offset: usize) -> String {
    Ipv4Addr::new(
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootp_with_options(options: &[u8]) -> Vec<u8> {
        let mut payload = vec![0u8; HEADER_LEN];
        payload[0] = 2; // BOOTREPLY
        payload[2] = 6; // hlen
        payload[4..8].copy_from_slice(&0xdeadbeefu32.to_be_bytes());
        payload[16..20].copy_from_slice(&[192, 168, 1, 42]); // yiaddr
        payload[28..34].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        payload.extend_from_slice(&MAGIC_COOKIE);
        payload.extend_from_slice(options);
        payload
    }

    #[test]
    fn test_decode_ack() {
        let layer = decode_dhcp(&bootp_with_options(&[53, 1, 5, 255])).unwrap();
        assert_eq!(layer.get("Transaction ID"), Some("0xdeadbeef"));
        assert_eq!(layer.get("Your IP"), Some("192.168.1.42"));
        assert_eq!(layer.get("Client MAC"), Some("11:22:33:44:55:66"));
        assert_eq!(layer.get("Message Type"), Some("DHCP ACK (5)"));
    }

    #[test]
    fn test_pad_options_skipped() {
        let layer = decode_dhcp(&bootp_with_options(&[0, 0, 53, 1, 3, 255])).unwrap();
        assert_eq!(layer.get("Message Type"), Some("DHCP Request (3)"));
    }

    #[test]
    fn test_missing_cookie_rejected() {
        let mut payload = vec![0u8; HEADER_LEN + 4];
        payload[HEADER_LEN] = 0x12;
        assert!(decode_dhcp(&payload).is_none());
    }

    #[test]
    fn test_short_payload_rejected() {
        assert!(decode_dhcp(&[0u8; 100]).is_none());
    }

    #[test]
    fn test_truncated_option_does_not_panic() {
        // Option claims 10 bytes of data but the payload ends first.
        let layer = decode_dhcp(&bootp_with_options(&[53, 10, 1])).unwrap();
        assert_eq!(layer.get("Message Type"), None);
    }

    #[test]
    fn test_message_type_table() {
        assert_eq!(message_type(1), "DHCP Discover");
        assert_eq!(message_type(6), "DHCP NAK");
        assert_eq!(message_type(99), "Unknown");
    }
}
