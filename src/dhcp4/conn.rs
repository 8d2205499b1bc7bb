//! DHCPv4 transports.
//!
//! Two ways to see DHCP traffic: own the server port (bound mode), or watch
//! it pass by on a raw capture channel without binding (snooper mode). The
//! snooper exists so this server can run next to the site's authoritative
//! DHCP server; its replies originate from an ephemeral source port, which
//! PXE firmwares accept.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use pnet::datalink::{self, Config, DataLinkReceiver, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet as _;
use tracing::debug;

use crate::error::ServerError;

/// A source of inbound DHCP requests and a sink for replies.
pub enum DhcpConn {
    Bound(UdpSocket),
    Snooper {
        rx: Box<dyn DataLinkReceiver>,
        /// Replies go out through a plain ephemeral socket.
        tx: UdpSocket,
        /// UDP destination port we are watching for.
        port: u16,
    },
}

impl DhcpConn {
    /// Bind the DHCP server port with broadcast enabled.
    pub fn bound(address: Ipv4Addr, port: u16) -> Result<Self, ServerError> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| ServerError::Bind {
                what: "DHCP",
                port,
                source,
            })?;
        socket.set_reuse_address(true).ok();
        socket
            .set_broadcast(true)
            .map_err(|source| ServerError::Bind {
                what: "DHCP",
                port,
                source,
            })?;
        socket
            .bind(&SocketAddrV4::new(address, port).into())
            .map_err(|source| ServerError::Bind {
                what: "DHCP",
                port,
                source,
            })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|source| ServerError::Bind {
                what: "DHCP",
                port,
                source,
            })?;

        Ok(Self::Bound(socket.into()))
    }

    /// Observe DHCP requests to `port` without binding it, via a raw capture
    /// channel on `interface` (or the first usable interface).
    ///
    /// Platforms without a raw-capture backend fail here with a clear error;
    /// the operator can fall back to bound mode.
    pub fn snooper(interface: Option<&str>, port: u16) -> Result<Self, ServerError> {
        let interface = pick_interface(interface)?;

        let config = Config {
            read_timeout: Some(Duration::from_millis(100)),
            ..Config::default()
        };
        let rx = match datalink::channel(&interface, config) {
            Ok(datalink::Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(ServerError::Interface(format!(
                    "{}: unsupported capture channel type",
                    interface.name
                )))
            }
            Err(e) => {
                return Err(ServerError::Interface(format!(
                    "cannot snoop DHCP on {}: {} (no-bind mode needs raw capture support)",
                    interface.name, e
                )))
            }
        };

        let tx = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|source| {
            ServerError::Bind {
                what: "DHCP reply",
                port: 0,
                source,
            }
        })?;
        tx.set_broadcast(true)?;

        Ok(Self::Snooper { rx, tx, port })
    }

    /// Wait up to ~100ms for a DHCP request. Returns `None` on a timeout
    /// tick so callers can poll their shutdown flag.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, ServerError> {
        match self {
            Self::Bound(socket) => match socket.recv_from(buf) {
                Ok((len, src)) => Ok(Some((len, src))),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    Ok(None)
                }
                Err(source) => Err(ServerError::Listener {
                    what: "DHCP",
                    source,
                }),
            },
            Self::Snooper { rx, port, .. } => match rx.next() {
                Ok(frame) => Ok(extract_dhcp(frame, *port, buf)),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    Ok(None)
                }
                Err(e) => {
                    // Capture hiccups are not fatal; the next frame may be fine.
                    debug!("DHCP snooper read error: {}", e);
                    Ok(None)
                }
            },
        }
    }

    /// Send a reply. In snooper mode this uses the ephemeral socket.
    pub fn send_to(&self, data: &[u8], dst: SocketAddr) -> std::io::Result<usize> {
        match self {
            Self::Bound(socket) => socket.send_to(data, dst),
            Self::Snooper { tx, .. } => tx.send_to(data, dst),
        }
    }
}

/// Copy the DHCP payload of a captured frame into `buf` if it is UDP traffic
/// to our port.
fn extract_dhcp(frame: &[u8], port: u16, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp = UdpPacket::new(ipv4.payload())?;
    if udp.get_destination() != port {
        return None;
    }

    let payload = udp.payload();
    if payload.len() > buf.len() {
        return None;
    }
    buf[..payload.len()].copy_from_slice(payload);

    let src = SocketAddr::new(IpAddr::V4(ipv4.get_source()), udp.get_source());
    Some((payload.len(), src))
}

/// Find the named interface, or the first one that is up, has addresses and
/// is not a loopback.
pub fn pick_interface(name: Option<&str>) -> Result<NetworkInterface, ServerError> {
    let interfaces = datalink::interfaces();
    match name {
        Some(name) => interfaces
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or_else(|| ServerError::Interface(name.to_string())),
        None => interfaces
            .into_iter()
            .find(|iface| iface.is_up() && !iface.is_loopback() && !iface.ips.is_empty())
            .ok_or_else(|| ServerError::Interface("no suitable interface found".to_string())),
    }
}

/// The IPv4 address clients should be pointed at, from the named interface
/// or the first usable one.
pub fn advertised_ipv4(interface: Option<&str>) -> Option<Ipv4Addr> {
    let iface = pick_interface(interface).ok()?;
    iface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
        _ => None,
    })
}
