//! Machine and firmware domain models.

use std::fmt;

use macaddr::MacAddr;

/// Client firmware families we know how to boot.
///
/// The numeric identifiers are the DHCP option 93 client system architecture
/// values (RFC 4578). They double as the firmware index in TFTP boot file
/// paths and in the `arch` query parameter of the boot script URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Firmware {
    /// Classic x86 BIOS with PXE/UNDI support.
    X86Pc,
    /// 32-bit x86 processor running EFI.
    EfiIa32,
    /// EFI byte code interpreter. In practice every client that reports this
    /// is a 64-bit x86 machine.
    EfiBc,
    /// 64-bit x86 processor running EFI.
    EfiX64,
    /// The client is already running iPXE and only needs a boot script.
    /// Detected via the user class option, not option 93; has no wire id.
    Ipxe,
}

impl Firmware {
    /// Map a DHCP option 93 architecture value to a firmware family.
    pub fn from_dhcp_arch(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::X86Pc),
            6 => Some(Self::EfiIa32),
            7 => Some(Self::EfiBc),
            9 => Some(Self::EfiX64),
            _ => None,
        }
    }

    /// Parse a firmware index from a TFTP path segment or query parameter.
    pub fn from_id(id: u16) -> Option<Self> {
        Self::from_dhcp_arch(id)
    }

    /// The numeric identifier used on the wire.
    ///
    /// `Ipxe` is never placed on the wire; it maps to an out-of-band value
    /// that `from_id` will not accept.
    pub fn id(self) -> u16 {
        match self {
            Self::X86Pc => 0,
            Self::EfiIa32 => 6,
            Self::EfiBc => 7,
            Self::EfiX64 => 9,
            Self::Ipxe => u16::MAX,
        }
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::X86Pc => write!(f, "x86 BIOS"),
            Self::EfiIa32 => write!(f, "EFI x86"),
            Self::EfiBc => write!(f, "EFI BC"),
            Self::EfiX64 => write!(f, "EFI x64"),
            Self::Ipxe => write!(f, "iPXE"),
        }
    }
}

/// A machine that is attempting to boot. Transient, one per in-flight boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    /// Hardware address, 6 or 8 octets.
    pub mac: MacAddr,
    /// Hardware architecture reported by the client firmware.
    pub arch: Firmware,
}

/// Format a MAC address the way it appears in boot file paths and URLs:
/// lowercase, colon-separated.
pub fn format_mac(mac: &MacAddr) -> String {
    mac.to_string().to_lowercase()
}
