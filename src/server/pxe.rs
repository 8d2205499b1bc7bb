//! PXE responder on port 4011.
//!
//! Some PXE firmwares follow their ProxyDHCP menu selection with a second
//! request to port 4011 and only boot from its answer. The reply repeats the
//! boot file but leaves out the vendor options, giving the client an
//! unambiguous TFTP target.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dhcp4::{DhcpMessageType, Packet};
use crate::domain::{format_mac, Firmware, Phase};
use crate::error::ServerError;
use crate::server::{dhcp, Context};

/// The PXE task: answer port-4011 boot requests until shut down.
pub(crate) fn serve_pxe(
    ctx: Arc<Context>,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .map_err(|source| ServerError::Listener {
            what: "PXE",
            source,
        })?;
    debug!("PXE responder up");

    let mut buf = [0u8; 1500];
    while running.load(Ordering::SeqCst) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(source) => {
                return Err(ServerError::Listener {
                    what: "PXE",
                    source,
                })
            }
        };

        let packet = match Packet::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!("PXE: ignoring malformed packet from {}: {}", src, e);
                continue;
            }
        };
        if packet.message_type() != Some(DhcpMessageType::Request) {
            continue;
        }

        let classified = match dhcp::classify(&packet) {
            Ok(c) => c,
            Err(e) => {
                debug!("PXE: ignoring client {}: {}", src, e);
                continue;
            }
        };
        let mac = format_mac(&classified.machine.mac);

        if classified.fwtype != Firmware::Ipxe && !ctx.ipxe.contains_key(&classified.fwtype) {
            debug!("PXE: no iPXE binary configured for {}", classified.fwtype);
            continue;
        }

        let server_ip = match ctx.server_ip() {
            Some(ip) => ip,
            None => {
                info!("PXE: no advertisable interface address, ignoring {}", mac);
                continue;
            }
        };

        let reply = dhcp::build_reply(
            &packet,
            DhcpMessageType::Ack,
            server_ip,
            ctx.http_port,
            &classified,
            false,
        );
        if let Err(e) = socket.send_to(&reply.encode(), src) {
            info!("PXE: sending ack to {} failed: {}", src, e);
            continue;
        }

        info!("PXE: pointed {} at {:?}", mac, reply.file.as_deref().unwrap_or(""));
        ctx.events.record(
            &mac,
            Phase::PxeResponded,
            format!("Sent boot file via PXE to {src}"),
        );
    }

    debug!("PXE responder stopped");
    Ok(())
}
