//! The boot orchestrator.
//!
//! [`Server`] owns the four sockets, the event log, the signing key, the
//! iPXE binary map and the injected [`Booter`](crate::booter::Booter), and
//! steers clients DHCP → TFTP → HTTP until they boot. [`ServerV6`] is the
//! standalone DHCPv6 responder.

mod dhcp;
mod http;
mod ipxe;
mod pxe;
mod tftp;
mod v6;

pub use v6::{BootConfiguration, ServerV6, StaticBootUrl};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::booter::Booter;
use crate::dhcp4::DhcpConn;
use crate::domain::{EventLog, Firmware};
use crate::error::ServerError;
use crate::tftp::TftpServer;
use crate::urlsign::{self, SigningKey};

/// Label shown in the PXE boot menu.
pub(crate) const BOOT_MENU_LABEL: &str = "Tinderbox";

const PORT_DHCP: u16 = 67;
const PORT_TFTP: u16 = 69;
const PORT_PXE: u16 = 4011;
const PORT_HTTP: u16 = 80;

/// First task error or a `None` posted by `shutdown()`.
type TaskResult = Option<ServerError>;

/// State shared by the protocol tasks for the lifetime of one serve.
pub(crate) struct Context {
    pub booter: Arc<dyn Booter>,
    pub ipxe: HashMap<Firmware, Vec<u8>>,
    pub key: SigningKey,
    pub events: EventLog,
    pub http_port: u16,
    pub pxelinux_assets: HashMap<String, PathBuf>,
    pub ui_assets_dir: Option<PathBuf>,
    /// Configured server address, when it names a concrete interface.
    pub fixed_ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
}

impl Context {
    /// The IPv4 address to advertise as siaddr / next-server.
    pub fn server_ip(&self) -> Option<Ipv4Addr> {
        self.fixed_ip
            .or_else(|| crate::dhcp4::conn::advertised_ipv4(self.interface.as_deref()))
    }
}

/// A Server boots machines using a Booter.
pub struct Server {
    pub booter: Arc<dyn Booter>,

    /// Address to listen on. The unspecified address listens everywhere and
    /// discovers the advertised IP from the interface table.
    pub address: Ipv4Addr,
    /// HTTP port for boot services (default 80).
    pub http_port: u16,

    /// The bootable firmwares and their associated iPXE binary.
    pub ipxe: HashMap<Firmware, Vec<u8>>,

    /// These can technically be changed for testing, but the protocols
    /// burned into client firmware hardcode them; change them in production
    /// and nothing will work.
    pub dhcp_port: u16,
    pub tftp_port: u16,
    pub pxe_port: u16,

    /// Listen for DHCP traffic without binding the DHCP port, so this
    /// server can coexist with the site's authoritative DHCP server.
    pub dhcp_no_bind: bool,

    /// Interface for snooping and address discovery (default: first usable).
    pub interface: Option<String>,

    /// Serve operator UI assets from this directory.
    pub ui_assets_dir: Option<PathBuf>,

    /// Extra assets served under `pxelinux.cfg/` over TFTP, for firmwares
    /// preconfigured to ask for PXELinux configs. The DHCP replies never
    /// advertise these paths.
    pub pxelinux_assets: HashMap<String, PathBuf>,

    shutdown: Mutex<Option<SyncSender<TaskResult>>>,
}

impl Server {
    pub fn new(booter: Arc<dyn Booter>) -> Self {
        Self {
            booter,
            address: Ipv4Addr::UNSPECIFIED,
            http_port: 0,
            ipxe: HashMap::new(),
            dhcp_port: 0,
            tftp_port: 0,
            pxe_port: 0,
            dhcp_no_bind: false,
            interface: None,
            ui_assets_dir: None,
            pxelinux_assets: HashMap::new(),
            shutdown: Mutex::new(None),
        }
    }

    /// Listen for machines attempting to boot and help them along.
    ///
    /// Blocks until a task hits a fatal error or [`Server::shutdown`] is
    /// called.
    pub fn serve(&self) -> Result<(), ServerError> {
        let dhcp_port = defaulted(self.dhcp_port, PORT_DHCP);
        let tftp_port = defaulted(self.tftp_port, PORT_TFTP);
        let pxe_port = defaulted(self.pxe_port, PORT_PXE);
        let http_port = defaulted(self.http_port, PORT_HTTP);

        if self.ipxe.is_empty() {
            warn!("no iPXE binaries configured; PXE clients will be ignored");
        }

        // Open all four listeners before starting anything; a failure here
        // drops the ones already opened.
        let dhcp = if self.dhcp_no_bind {
            DhcpConn::snooper(self.interface.as_deref(), dhcp_port)?
        } else {
            DhcpConn::bound(self.address, dhcp_port)?
        };
        let pxe = bind_udp(self.address, pxe_port, "PXE")?;
        let tftp = bind_udp(self.address, tftp_port, "TFTP")?;
        let http = TcpListener::bind(SocketAddr::from((self.address, http_port))).map_err(
            |source| ServerError::Bind {
                what: "HTTP",
                port: http_port,
                source,
            },
        )?;

        let ctx = Arc::new(Context {
            booter: self.booter.clone(),
            ipxe: self.ipxe.clone(),
            key: urlsign::generate_key(),
            events: EventLog::new(),
            http_port,
            pxelinux_assets: self.pxelinux_assets.clone(),
            ui_assets_dir: self.ui_assets_dir.clone(),
            fixed_ip: (self.address != Ipv4Addr::UNSPECIFIED).then_some(self.address),
            interface: self.interface.clone(),
        });

        // One slot per task, plus slack so shutdown stragglers can dump
        // their errors without blocking.
        let (tx, rx) = mpsc::sync_channel::<TaskResult>(6);
        *self.shutdown.lock().unwrap() = Some(tx.clone());

        let running = Arc::new(AtomicBool::new(true));
        let tftp_server =
            TftpServer::new(Arc::new(tftp::BootFileHandler::new(ctx.clone())));
        let tftp_flag = tftp_server.running_flag();

        debug!("starting boot server tasks");

        spawn_task("dhcp", &tx, {
            let ctx = ctx.clone();
            let running = running.clone();
            move || dhcp::serve_dhcp(ctx, dhcp, running)
        });
        spawn_task("pxe", &tx, {
            let ctx = ctx.clone();
            let running = running.clone();
            move || pxe::serve_pxe(ctx, pxe, running)
        });
        spawn_task("tftp", &tx, move || tftp_server.run(tftp));
        spawn_task("http", &tx, {
            let ctx = ctx.clone();
            let running = running.clone();
            move || http::serve_http(ctx, http, running)
        });

        // Wait for either a fatal error or shutdown(). Remaining tasks wind
        // down on their poll tick and dump spurious results into the
        // channel's slack, which nobody reads.
        let result = rx.recv().unwrap_or(None);
        running.store(false, Ordering::SeqCst);
        tftp_flag.store(false, Ordering::SeqCst);
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

fn defaulted(port: u16, fallback: u16) -> u16 {
    if port == 0 {
        fallback
    } else {
        port
    }
}

fn bind_udp(address: Ipv4Addr, port: u16, what: &'static str) -> Result<UdpSocket, ServerError> {
    UdpSocket::bind(SocketAddr::from((address, port))).map_err(|source| ServerError::Bind {
        what,
        port,
        source,
    })
}

fn spawn_task<F>(name: &str, tx: &SyncSender<TaskResult>, task: F)
where
    F: FnOnce() -> Result<(), ServerError> + Send + 'static,
{
    let tx = tx.clone();
    let tx_err = tx.clone();
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(task().err());
        });
    if let Err(e) = spawned {
        let _ = tx_err.try_send(Some(ServerError::Io(e)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booter::{BootSpec, StaticBooter};
    use std::time::Duration;

    fn test_server() -> Server {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(crate::booter::FileId::from("http://example.com/vmlinuz")),
            ..Default::default()
        })
        .unwrap();
        let mut server = Server::new(Arc::new(booter));
        server.address = Ipv4Addr::LOCALHOST;
        // Ephemeral ports; the well-known ones need privileges.
        [
            server.dhcp_port,
            server.tftp_port,
            server.pxe_port,
            server.http_port,
        ] = pick_ports();
        server.ipxe.insert(Firmware::EfiX64, b"fake-ipxe".to_vec());
        server
    }

    /// Four distinct free ports, picked while holding all four sockets so
    /// the OS cannot hand the same one out twice.
    fn pick_ports() -> [u16; 4] {
        let sockets: Vec<UdpSocket> = (0..4)
            .map(|_| UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap())
            .collect();
        let mut ports = [0u16; 4];
        for (port, socket) in ports.iter_mut().zip(&sockets) {
            *port = socket.local_addr().unwrap().port();
        }
        ports
    }

    #[test]
    fn test_serve_and_shutdown() {
        let server = Arc::new(test_server());
        let serving = server.clone();
        let handle = thread::spawn(move || serving.serve());

        // Give the tasks a moment to come up, then ask for shutdown.
        thread::sleep(Duration::from_millis(300));
        server.shutdown();

        let result = handle.join().unwrap();
        assert!(result.is_ok(), "serve returned {result:?}");
    }

    #[test]
    fn test_shutdown_before_serve_is_a_noop() {
        let server = test_server();
        server.shutdown();
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let server = test_server();
        // Occupy the TFTP port so serve() cannot bind it.
        let _holder = UdpSocket::bind((Ipv4Addr::LOCALHOST, server.tftp_port)).unwrap();
        let result = server.serve();
        assert!(matches!(
            result,
            Err(ServerError::Bind { what: "TFTP", .. })
        ));
    }
}
