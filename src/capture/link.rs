//! Raw layer-2 socket handles over pnet's datalink channels.
//!
//! Each handle owns its own AF_PACKET socket, mirroring the engine's use of
//! one transmit socket (poisoner) and one receive socket (sniffer). The
//! receive handle puts the interface into promiscuous mode for its lifetime
//! and carries a short read timeout so the sniff loop can observe the
//! shutdown flag within [`config::RECV_TIMEOUT_MS`].

use std::io::ErrorKind;
use std::time::Duration;

use pnet::datalink::{self, Channel, ChannelType, Config, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::util::MacAddr;

use crate::config;
use crate::error::{Error, Result};

/// Transmit half: sends arbitrary Ethernet frames on the bound interface.
pub struct LinkTx {
    tx: Box<dyn DataLinkSender>,
}

/// Receive half: all EtherTypes, promiscuous, short timeout.
pub struct LinkRx {
    rx: Box<dyn DataLinkReceiver>,
}

/// Look up an interface by name and validate it can carry the session:
/// it must exist, be up, not be loopback, and have a MAC address.
pub fn resolve_interface(name: &str) -> Result<NetworkInterface> {
    let iface = datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;

    if iface.is_loopback() {
        return Err(Error::InterfaceDown(format!("{name}: loopback")));
    }
    if !iface.is_up() {
        return Err(Error::InterfaceDown(format!("{name}: interface is down")));
    }
    if iface.mac.is_none() {
        return Err(Error::InterfaceDown(format!("{name}: no MAC address")));
    }
    Ok(iface)
}

/// The interface's own MAC. `resolve_interface` guarantees presence.
pub fn local_mac(iface: &NetworkInterface) -> MacAddr {
    iface.mac.expect("validated by resolve_interface")
}

/// Open the transmit socket. This is also the session's privilege check:
/// without CAP_NET_RAW the open fails with `PrivilegeDenied`.
pub fn open_tx(iface: &NetworkInterface) -> Result<LinkTx> {
    let cfg = Config {
        channel_type: ChannelType::Layer2,
        ..Default::default()
    };
    match datalink::channel(iface, cfg) {
        Ok(Channel::Ethernet(tx, _)) => Ok(LinkTx { tx }),
        Ok(_) => Err(Error::Session(format!(
            "{}: unsupported datalink channel type",
            iface.name
        ))),
        Err(e) => Err(Error::from_socket_open(&iface.name, e)),
    }
}

/// Open the receive socket in promiscuous mode. Dropping the handle closes
/// the socket and releases the promiscuous bit.
pub fn open_rx(iface: &NetworkInterface) -> Result<LinkRx> {
    let cfg = Config {
        channel_type: ChannelType::Layer2,
        promiscuous: true,
        read_timeout: Some(Duration::from_millis(config::RECV_TIMEOUT_MS)),
        ..Default::default()
    };
    match datalink::channel(iface, cfg) {
        Ok(Channel::Ethernet(_, rx)) => Ok(LinkRx { rx }),
        Ok(_) => Err(Error::Session(format!(
            "{}: unsupported datalink channel type",
            iface.name
        ))),
        Err(e) => Err(Error::from_socket_open(&iface.name, e)),
    }
}

impl LinkTx {
    /// Send one frame. Distinguishes transient conditions (caller may
    /// retry next cycle) from hard failures via the error variant.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self.tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => match e.kind() {
                ErrorKind::NetworkDown | ErrorKind::NetworkUnreachable => {
                    Err(Error::InterfaceDown(e.to_string()))
                }
                _ => Err(Error::Io(e)),
            },
            None => Err(Error::Session("send buffer unavailable".into())),
        }
    }
}

impl LinkRx {
    /// Receive one frame, or `None` when the read timeout elapsed. Frames
    /// longer than [`config::MAX_FRAME_LEN`] are truncated to the cap.
    pub fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => {
                let len = frame.len().min(config::MAX_FRAME_LEN);
                Ok(Some(frame[..len].to_vec()))
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
