//! DHCPv6 responder.
//!
//! Advertises pool-reserved addresses together with a network boot URL
//! (option 59). Runs separately from the IPv4 server: UEFI firmwares on
//! v6-only networks fetch their boot payload over HTTP directly, so there is
//! no TFTP stage to steer here.

use std::net::{Ipv6Addr, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use crate::dhcp4::conn::pick_interface;
use crate::dhcp6::{duid_llt, AddressPool, Dhcp6Option, IaAddress, IaNa, MessageType, Packet};
use crate::error::ServerError;

/// All-DHCP-servers multicast group (RFC 3315).
const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);

const PORT_DHCPV6: u16 = 547;

/// Address lifetimes handed out with reservations, in seconds.
const PREFERRED_LIFETIME: u32 = 3600;
const VALID_LIFETIME: u32 = 7200;
const T1: u32 = 1800;
const T2: u32 = 2880;

/// Produces the boot file URL advertised in option 59.
pub trait BootConfiguration: Send + Sync {
    /// URL for a client presenting the given vendor class, or `None` to
    /// ignore the client.
    fn boot_url(&self, vendor_class: Option<&[u8]>) -> Option<String>;
}

/// A [`BootConfiguration`] that hands every client the same URL.
pub struct StaticBootUrl(pub String);

impl BootConfiguration for StaticBootUrl {
    fn boot_url(&self, _vendor_class: Option<&[u8]>) -> Option<String> {
        Some(self.0.clone())
    }
}

/// A standalone DHCPv6 boot responder.
pub struct ServerV6 {
    /// Link to serve on (default: first usable interface).
    pub interface: Option<String>,
    /// Port to listen on (default 547).
    pub port: u16,
    pub boot_config: Option<Arc<dyn BootConfiguration>>,
    /// Mandatory: this server does not manage address space itself.
    pub pool: Option<Arc<dyn AddressPool>>,

    shutdown: Mutex<Option<SyncSender<Option<ServerError>>>>,
}

impl ServerV6 {
    pub fn new() -> Self {
        Self {
            interface: None,
            port: 0,
            boot_config: None,
            pool: None,
            shutdown: Mutex::new(None),
        }
    }

    /// Listen for DHCPv6 boot solicitations and answer them.
    ///
    /// Blocks until a fatal error or [`ServerV6::shutdown`].
    pub fn serve(&self) -> Result<(), ServerError> {
        let pool = self.pool.clone().ok_or_else(|| {
            ServerError::Config("DHCPv6 requires an address pool".to_string())
        })?;
        let boot_config = self.boot_config.clone().ok_or_else(|| {
            ServerError::Config("DHCPv6 requires a boot configuration".to_string())
        })?;

        let port = if self.port == 0 { PORT_DHCPV6 } else { self.port };
        let interface = pick_interface(self.interface.as_deref())?;
        let link_layer = interface
            .mac
            .ok_or_else(|| {
                ServerError::Interface(format!("{} has no link-layer address", interface.name))
            })?
            .octets();

        let socket = open_socket(port, interface.index)?;

        // The server DUID is minted once per serve; every reply we send
        // until shutdown carries these exact bytes.
        let duid = duid_llt(&link_layer, SystemTime::now());

        let (tx, rx) = mpsc::sync_channel::<Option<ServerError>>(6);
        *self.shutdown.lock().unwrap() = Some(tx.clone());
        let running = Arc::new(AtomicBool::new(true));

        info!("DHCPv6: serving on {} port {}", interface.name, port);

        {
            let running = running.clone();
            let spawned = thread::Builder::new().name("dhcp6".to_string()).spawn(
                move || {
                    let _ = tx.send(serve_loop(socket, duid, pool, boot_config, running).err());
                },
            );
            if let Err(e) = spawned {
                *self.shutdown.lock().unwrap() = None;
                return Err(ServerError::Io(e));
            }
        }

        let result = rx.recv().unwrap_or(None);
        running.store(false, Ordering::SeqCst);
        *self.shutdown.lock().unwrap() = None;

        match result {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Make `serve()` return. Non-blocking and idempotent.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().as_ref() {
            let _ = tx.try_send(None);
        }
    }
}

impl Default for ServerV6 {
    fn default() -> Self {
        Self::new()
    }
}

fn open_socket(port: u16, interface_index: u32) -> Result<UdpSocket, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let bind_err = |source| ServerError::Bind {
        what: "DHCPv6",
        port,
        source,
    };

    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).ok();
    socket.set_only_v6(true).ok();
    socket
        .bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())
        .map_err(bind_err)?;
    socket
        .join_multicast_v6(&ALL_DHCP_SERVERS, interface_index)
        .map_err(bind_err)?;
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .map_err(bind_err)?;

    Ok(socket.into())
}

fn serve_loop(
    socket: UdpSocket,
    duid: Vec<u8>,
    pool: Arc<dyn AddressPool>,
    boot_config: Arc<dyn BootConfiguration>,
    running: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let mut buf = [0u8; 2048];

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
                    what: "DHCPv6",
                    source,
                })
            }
        };

        let packet = match Packet::parse(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                debug!("DHCPv6: ignoring malformed packet from {}: {}", src, e);
                continue;
            }
        };

        let Some(reply) = handle_packet(&packet, &duid, pool.as_ref(), boot_config.as_ref())
        else {
            continue;
        };

        if let Err(e) = socket.send_to(&reply.encode(), src) {
            info!("DHCPv6: reply to {} failed: {}", src, e);
            continue;
        }
        debug!("DHCPv6: answered {:?} from {}", packet.msg_type, src);
    }

    Ok(())
}

/// Build the reply for one inbound message, or `None` to stay silent.
fn handle_packet(
    packet: &Packet,
    duid: &[u8],
    pool: &dyn AddressPool,
    boot_config: &dyn BootConfiguration,
) -> Option<Packet> {
    let client_id = packet.client_id()?;

    let (reply_type, ia_nas) = match packet.msg_type {
        MessageType::Solicit => (MessageType::Advertise, reserve(packet, pool, client_id)?),
        // Requests and renewals confirm what the client already holds.
        MessageType::Request | MessageType::Renew => (
            MessageType::Reply,
            packet.ia_nas().into_iter().cloned().collect(),
        ),
        _ => return None,
    };

    let url = boot_config.boot_url(packet.vendor_class())?;

    let mut options = vec![
        Dhcp6Option::ClientId(client_id.to_vec()),
        Dhcp6Option::ServerId(duid.to_vec()),
    ];
    options.extend(ia_nas.into_iter().map(Dhcp6Option::IaNa));
    options.push(Dhcp6Option::BootfileUrl(url.into_bytes()));

    Some(Packet {
        msg_type: reply_type,
        txn_id: packet.txn_id,
        options,
    })
}

/// Reserve one address per requested IA_NA. A pool failure is transient:
/// stay silent and let the client resend.
fn reserve(packet: &Packet, pool: &dyn AddressPool, client_id: &[u8]) -> Option<Vec<IaNa>> {
    let requested = packet.ia_nas();
    let interface_ids: Vec<Vec<u8>> = requested.iter().map(|ia| ia.iaid.to_vec()).collect();

    let associations = match pool.reserve_addresses(client_id, &interface_ids) {
        Ok(a) => a,
        Err(e) => {
            debug!("DHCPv6: {}", e);
            return None;
        }
    };

    Some(
        requested
            .iter()
            .zip(associations)
            .map(|(ia, assoc)| IaNa {
                iaid: ia.iaid,
                t1: T1,
                t2: T2,
                addresses: vec![IaAddress {
                    address: assoc.address,
                    preferred_lifetime: PREFERRED_LIFETIME,
                    valid_lifetime: VALID_LIFETIME,
                }],
            })
            .collect(),
    )
}
