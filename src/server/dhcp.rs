//! DHCPv4 listener: classify PXE clients and answer DISCOVERs with
//! ProxyDHCP offers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::dhcp4::{self, DhcpConn, DhcpMessageType, DhcpOption, Packet};
use crate::domain::{format_mac, Firmware, Machine, Phase};
use crate::error::{BootError, ServerError};
use crate::server::{Context, BOOT_MENU_LABEL};

const DHCP_CLIENT_PORT: u16 = 68;

/// A classified PXE request: the machine itself, and the firmware flavor we
/// should steer it with. The two differ only for clients already running
/// iPXE, where the machine keeps its hardware architecture but the next
/// stage is an HTTP script rather than another chainload.
pub(crate) struct Classified {
    pub machine: Machine,
    pub fwtype: Firmware,
}

/// Decide whether a request comes from a PXE client we can boot.
pub(crate) fn classify(packet: &Packet) -> Result<Classified, BootError> {
    if !packet.is_request() {
        return Err(BootError::UnsupportedClient("not a BOOTREQUEST".to_string()));
    }

    match packet.vendor_class_id() {
        Some(class) if class.starts_with("PXEClient") => {}
        _ => {
            return Err(BootError::UnsupportedClient(
                "vendor class is not PXEClient".to_string(),
            ))
        }
    }

    let arch = packet.client_arch().ok_or_else(|| {
        BootError::UnsupportedClient("no client architecture option".to_string())
    })?;
    let arch = Firmware::from_dhcp_arch(arch).ok_or_else(|| {
        BootError::UnsupportedClient(format!("unsupported client architecture {arch}"))
    })?;

    let mac = packet
        .mac()
        .ok_or_else(|| BootError::UnsupportedClient("unusable hardware address".to_string()))?;

    // A client that already runs iPXE identifies itself via user class and
    // skips straight to the boot script; everyone else gets chainloaded.
    let fwtype = if packet.user_class() == Some(b"iPXE".as_slice()) {
        Firmware::Ipxe
    } else {
        arch
    };

    Ok(Classified {
        machine: Machine { mac, arch },
        fwtype,
    })
}

/// Build a ProxyDHCP reply for a classified request.
///
/// Never assigns an address: yiaddr stays zero, the reply only names the
/// next boot stage. With `menu` set, the PXE vendor options (option 43) are
/// attached, which DISCOVER answers need and port-4011 answers must omit.
pub(crate) fn build_reply(
    request: &Packet,
    msg_type: DhcpMessageType,
    server_ip: Ipv4Addr,
    http_port: u16,
    classified: &Classified,
    menu: bool,
) -> Packet {
    let mac = format_mac(&classified.machine.mac);
    let file = match classified.fwtype {
        Firmware::Ipxe => format!(
            "http://{server_ip}:{http_port}/_/ipxe?arch={}&mac={mac}",
            classified.machine.arch.id()
        ),
        fwtype => format!("{mac}/{}", fwtype.id()),
    };

    let mut options = vec![
        DhcpOption::MessageType(msg_type),
        DhcpOption::ServerIdentifier(server_ip),
        DhcpOption::VendorClassId("PXEClient".to_string()),
    ];
    if let Some(uuid) = request.client_uuid() {
        options.push(DhcpOption::ClientUuid(uuid.to_vec()));
    }
    if menu {
        options.push(DhcpOption::VendorSpecific(dhcp4::pxe_vendor_options(
            BOOT_MENU_LABEL,
        )));
    }

    Packet {
        op: 2, // BOOTREPLY
        htype: request.htype,
        hlen: request.hlen,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        ciaddr: Ipv4Addr::UNSPECIFIED,
        yiaddr: Ipv4Addr::UNSPECIFIED,
        siaddr: server_ip,
        giaddr: request.giaddr,
        chaddr: request.chaddr,
        sname: Some(server_ip.to_string()),
        file: Some(file),
        options,
    }
}

/// The DHCP task: answer PXE DISCOVERs until shut down.
pub(crate) fn serve_dhcp(
    ctx: Arc<Context>,
    mut conn: DhcpConn,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    debug!("DHCP listener up");
    let mut buf = [0u8; 1500];

    while running.load(Ordering::SeqCst) {
        let (len, _src) = match conn.recv(&mut buf)? {
            Some(received) => received,
            None => continue,
        };

        let packet = match Packet::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!("DHCP: ignoring malformed packet: {}", e);
                continue;
            }
        };

        // Only DISCOVERs get ProxyDHCP offers; the authoritative server
        // handles the rest of the handshake.
        if packet.message_type() != Some(DhcpMessageType::Discover) {
            continue;
        }

        let classified = match classify(&packet) {
            Ok(c) => c,
            Err(e) => {
                debug!("DHCP: ignoring client: {}", e);
                continue;
            }
        };
        let mac = format_mac(&classified.machine.mac);

        if classified.fwtype != Firmware::Ipxe && !ctx.ipxe.contains_key(&classified.fwtype) {
            debug!(
                "DHCP: no iPXE binary configured for {} (client {})",
                classified.fwtype, mac
            );
            continue;
        }

        let server_ip = match ctx.server_ip() {
            Some(ip) => ip,
            None => {
                info!("DHCP: no advertisable interface address, ignoring {}", mac);
                continue;
            }
        };

        let reply = build_reply(
            &packet,
            DhcpMessageType::Offer,
            server_ip,
            ctx.http_port,
            &classified,
            true,
        );
        let dest = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT));
        if let Err(e) = conn.send_to(&reply.encode(), dest) {
            info!("DHCP: sending offer to {} failed: {}", mac, e);
            continue;
        }

        info!(
            "DHCP: offered {} ({}) boot file {:?}",
            mac,
            classified.machine.arch,
            reply.file.as_deref().unwrap_or("")
        );
        ctx.events.record(
            &mac,
            Phase::DhcpOffered,
            format!("Offering to boot {}", classified.fwtype),
        );
    }

    debug!("DHCP listener stopped");
    Ok(())
}
