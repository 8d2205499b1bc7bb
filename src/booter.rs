//! The Booter capability: what should a machine boot, and where are the
//! bytes?
//!
//! The orchestrator owns a single injected [`Booter`] and consults it from
//! every protocol. Boot protocols are stateless, so [`Booter::boot_spec`] is
//! called multiple times over the course of one boot attempt and must be
//! idempotent.

use std::fmt;
use std::fs::File;
use std::io::Read;

use crate::domain::Machine;
use crate::error::BootError;

/// An opaque identifier a Booter uses to reference files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open boot file: a byte stream and its size, when known.
///
/// An unknown size is legal but discouraged; without Content-Length the
/// client firmware downloads are orders of magnitude slower.
pub struct BootFile {
    pub reader: Box<dyn Read + Send>,
    pub size: Option<u64>,
}

/// What a machine should boot.
///
/// Exactly one of `kernel`, `efi` or `ipxe_script` drives the boot; a spec
/// that sets none of them is rejected.
#[derive(Debug, Clone, Default)]
pub struct BootSpec {
    /// Kernel to boot.
    pub kernel: Option<FileId>,
    /// Init ramdisks for linux kernels.
    pub initrd: Vec<FileId>,
    /// EFI binary to chainload instead of a kernel.
    pub efi: Option<FileId>,
    /// Kernel command line template. `{{ID "x"}}` expands to a URL that
    /// resolves back to `read_boot_file("x")` when fetched.
    pub cmdline: String,
    /// Message to print on the client machine before booting.
    pub message: Option<String>,
    /// A raw iPXE script to run, overriding all of the above. When set, the
    /// boot succeeds or fails on the script's own terms.
    pub ipxe_script: Option<String>,
}

impl BootSpec {
    /// Check that the spec names something bootable.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.kernel.is_none() && self.efi.is_none() && self.ipxe_script.is_none() {
            return Err(BootError::BadPacket(
                "boot spec sets none of kernel, efi or ipxe script".to_string(),
            ));
        }
        Ok(())
    }
}

/// Provides boot instructions and files for machines.
pub trait Booter: Send + Sync {
    /// What should this machine boot? `Ok(None)` or `Err` makes the server
    /// ignore the machine's request for this attempt.
    fn boot_spec(&self, machine: &Machine) -> Result<Option<BootSpec>, BootError>;

    /// Open the bytes corresponding to an id handed out in a [`BootSpec`].
    fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BootError>;

    /// Store bytes under an id. Optional.
    fn write_boot_file(&self, _id: &FileId, _body: &mut dyn Read) -> Result<(), BootError> {
        Err(BootError::Unsupported)
    }
}

/// A Booter that serves the same fixed [`BootSpec`] to every machine.
///
/// File ids are interpreted as http(s) URLs (proxied with a blocking fetch)
/// or local filesystem paths.
pub struct StaticBooter {
    spec: BootSpec,
}

impl StaticBooter {
    pub fn new(spec: BootSpec) -> Result<Self, BootError> {
        spec.validate()?;
        Ok(Self { spec })
    }
}

impl Booter for StaticBooter {
    fn boot_spec(&self, _machine: &Machine) -> Result<Option<BootSpec>, BootError> {
        Ok(Some(self.spec.clone()))
    }

    fn read_boot_file(&self, id: &FileId) -> Result<BootFile, BootError> {
        let id_str = id.as_str();
        if id_str.starts_with("http://") || id_str.starts_with("https://") {
            let response =
                reqwest::blocking::get(id_str).map_err(|e| BootError::Upstream {
                    url: id_str.to_string(),
                    message: e.to_string(),
                })?;
            if !response.status().is_success() {
                return Err(BootError::Upstream {
                    url: id_str.to_string(),
                    message: format!("HTTP {}", response.status()),
                });
            }
            let size = response.content_length();
            return Ok(BootFile {
                reader: Box::new(response),
                size,
            });
        }

        let file = File::open(id_str).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BootError::NotFound(id_str.to_string())
            } else {
                BootError::Io(e)
            }
        })?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(BootFile {
            reader: Box::new(file),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Firmware;
    use macaddr::{MacAddr, MacAddr6};
    use std::io::Write;

    fn machine() -> Machine {
        Machine {
            mac: MacAddr::from(MacAddr6::new(0x52, 0x54, 0, 0x12, 0x34, 0x56)),
            arch: Firmware::EfiX64,
        }
    }

    #[test]
    fn test_empty_spec_rejected() {
        let result = StaticBooter::new(BootSpec::default());
        assert!(matches!(result, Err(BootError::BadPacket(_))));
    }

    #[test]
    fn test_kernel_spec_accepted() {
        let spec = BootSpec {
            kernel: Some(FileId::from("http://example.com/vmlinuz")),
            ..Default::default()
        };
        let booter = StaticBooter::new(spec).unwrap();
        let got = booter.boot_spec(&machine()).unwrap().unwrap();
        assert_eq!(
            got.kernel.unwrap().as_str(),
            "http://example.com/vmlinuz"
        );
    }

    #[test]
    fn test_boot_spec_is_idempotent() {
        let booter = StaticBooter::new(BootSpec {
            efi: Some(FileId::from("https://example.com/boot.efi")),
            ..Default::default()
        })
        .unwrap();
        let a = booter.boot_spec(&machine()).unwrap().unwrap();
        let b = booter.boot_spec(&machine()).unwrap().unwrap();
        assert_eq!(a.efi.unwrap().as_str(), b.efi.unwrap().as_str());
    }

    #[test]
    fn test_read_local_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"fake kernel bytes").unwrap();

        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from(tmp.path().to_str().unwrap())),
            ..Default::default()
        })
        .unwrap();

        let mut file = booter
            .read_boot_file(&FileId::from(tmp.path().to_str().unwrap()))
            .unwrap();
        assert_eq!(file.size, Some(17));
        let mut contents = Vec::new();
        file.reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"fake kernel bytes");
    }

    #[test]
    fn test_read_missing_file_is_not_found() {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from("/nonexistent/vmlinuz")),
            ..Default::default()
        })
        .unwrap();
        let result = booter.read_boot_file(&FileId::from("/nonexistent/vmlinuz"));
        assert!(matches!(result, Err(BootError::NotFound(_))));
    }

    #[test]
    fn test_write_is_unsupported_by_default() {
        let booter = StaticBooter::new(BootSpec {
            kernel: Some(FileId::from("k")),
            ..Default::default()
        })
        .unwrap();
        let mut body: &[u8] = b"data";
        assert!(matches!(
            booter.write_boot_file(&FileId::from("k"), &mut body),
            Err(BootError::Unsupported)
        ));
    }
}
