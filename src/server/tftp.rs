//! TFTP glue: maps boot file paths to iPXE binaries and PXELinux assets.

use std::io::Read;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use macaddr::MacAddr;
use tracing::debug;

use crate::domain::{format_mac, Firmware, Phase};
use crate::error::TftpError;
use crate::server::Context;
use crate::tftp::Handler;

/// Resolves the two path shapes the boot chain uses:
/// `<mac>/<firmware-id>` for the stage-two iPXE binary, and
/// `pxelinux.cfg/<name>` for optionally configured PXELinux assets.
pub(crate) struct BootFileHandler {
    ctx: Arc<Context>,
}

impl BootFileHandler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Split a `<mac>/<firmware-id>` path.
fn parse_boot_path(path: &str) -> Result<(MacAddr, Firmware), TftpError> {
    let (mac, id) = path
        .split_once('/')
        .filter(|(_, rest)| !rest.contains('/'))
        .ok_or_else(|| TftpError::UnknownPath(path.to_string()))?;

    let mac = MacAddr::from_str(mac).map_err(|_| TftpError::UnknownPath(path.to_string()))?;
    let id = id
        .parse::<u16>()
        .map_err(|_| TftpError::UnknownPath(path.to_string()))?;
    let firmware =
        Firmware::from_id(id).ok_or_else(|| TftpError::NotFound(format!("firmware type {id}")))?;

    Ok((mac, firmware))
}

impl Handler for BootFileHandler {
    fn open(
        &self,
        path: &str,
        _client: SocketAddr,
    ) -> Result<(Box<dyn Read + Send>, Option<u64>), TftpError> {
        if let Some(name) = path.strip_prefix("pxelinux.cfg/") {
            if name.is_empty() || name.contains('/') {
                return Err(TftpError::UnknownPath(path.to_string()));
            }
            let asset = self
                .ctx
                .pxelinux_assets
                .get(name)
                .ok_or_else(|| TftpError::NotFound(format!("PXELinux asset {name:?}")))?;
            let bytes = std::fs::read(asset)?;
            let size = bytes.len() as u64;
            return Ok((Box::new(std::io::Cursor::new(bytes)), Some(size)));
        }

        let (_mac, firmware) = parse_boot_path(path)?;
        let bytes = self
            .ctx
            .ipxe
            .get(&firmware)
            .ok_or_else(|| TftpError::NotFound(format!("firmware type {}", firmware.id())))?
            .clone();
        let size = bytes.len() as u64;
        Ok((Box::new(std::io::Cursor::new(bytes)), Some(size)))
    }

    fn transfer_done(&self, path: &str, client: SocketAddr, _bytes: u64) {
        match parse_boot_path(path) {
            Ok((mac, _)) => {
                self.ctx.events.record(
                    &format_mac(&mac),
                    Phase::TftpSent,
                    format!("Sent iPXE to {client}"),
                );
            }
            // PXELinux requests are frequent and anonymous; keep them out of
            // the machine logs.
            Err(_) => debug!("TFTP: sent {:?} to {}", path, client),
        }
    }

    fn transfer_failed(&self, path: &str, client: SocketAddr, err: &TftpError) {
        if let Ok((mac, _)) = parse_boot_path(path) {
            self.ctx.events.record(
                &format_mac(&mac),
                Phase::Error,
                format!("TFTP transfer to {client} failed: {err}"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booter::{BootSpec, FileId, StaticBooter};
    use crate::domain::EventLog;
    use std::collections::HashMap;
    use std::io::Write;

    fn context() -> Arc<Context> {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from("k")),
            ..Default::default()
        })
        .unwrap();
        let mut ipxe = HashMap::new();
        ipxe.insert(Firmware::EfiX64, b"efi64-binary".to_vec());
        ipxe.insert(Firmware::X86Pc, b"bios-binary".to_vec());
        Arc::new(Context {
            booter: Arc::new(booter),
            ipxe,
            key: crate::urlsign::generate_key(),
            events: EventLog::new(),
            http_port: 80,
            pxelinux_assets: HashMap::new(),
            ui_assets_dir: None,
            fixed_ip: None,
            interface: None,
        })
    }

    fn client() -> SocketAddr {
        "127.0.0.1:2000".parse().unwrap()
    }

    fn read_all(handler: &BootFileHandler, path: &str) -> Vec<u8> {
        let (mut reader, size) = handler.open(path, client()).unwrap();
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).unwrap();
        assert_eq!(size, Some(bytes.len() as u64));
        bytes
    }

    #[test]
    fn test_firmware_path_returns_binary() {
        let handler = BootFileHandler::new(context());
        assert_eq!(read_all(&handler, "aa:bb:cc:dd:ee:ff/9"), b"efi64-binary");
        assert_eq!(read_all(&handler, "aa:bb:cc:dd:ee:ff/0"), b"bios-binary");
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        let handler = BootFileHandler::new(context());
        for path in [
            "no-slash",
            "aa:bb:cc:dd:ee:ff/9/extra",
            "not-a-mac/9",
            "aa:bb:cc:dd:ee:ff/ninety",
            "pxelinux.cfg/",
            "pxelinux.cfg/a/b",
        ] {
            assert!(
                matches!(
                    handler.open(path, client()),
                    Err(TftpError::UnknownPath(_))
                ),
                "{path:?} should be an unknown path"
            );
        }
    }

    #[test]
    fn test_unconfigured_firmware_is_not_found() {
        let handler = BootFileHandler::new(context());
        // Architecture 6 is valid but has no binary in the map.
        assert!(matches!(
            handler.open("aa:bb:cc:dd:ee:ff/6", client()),
            Err(TftpError::NotFound(_))
        ));
    }

    #[test]
    fn test_pxelinux_asset_served_when_configured() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"DEFAULT linux").unwrap();

        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from("k")),
            ..Default::default()
        })
        .unwrap();
        let mut assets = HashMap::new();
        assets.insert("default".to_string(), tmp.path().to_path_buf());
        let ctx = Arc::new(Context {
            booter: Arc::new(booter),
            ipxe: HashMap::new(),
            key: crate::urlsign::generate_key(),
            events: EventLog::new(),
            http_port: 80,
            pxelinux_assets: assets,
            ui_assets_dir: None,
            fixed_ip: None,
            interface: None,
        });

        let handler = BootFileHandler::new(ctx);
        assert_eq!(read_all(&handler, "pxelinux.cfg/default"), b"DEFAULT linux");
        assert!(matches!(
            handler.open("pxelinux.cfg/other", client()),
            Err(TftpError::NotFound(_))
        ));
    }

    #[test]
    fn test_transfer_done_records_event() {
        let ctx = context();
        let handler = BootFileHandler::new(ctx.clone());
        handler.transfer_done("aa:bb:cc:dd:ee:ff/9", client(), 1234);

        let events = ctx.events.snapshot("aa:bb:cc:dd:ee:ff");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].phase, Phase::TftpSent);
    }
}
