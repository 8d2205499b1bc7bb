//! DHCPv4 packet parsing and encoding.
//!
//! Implements the subset of RFC 2131/2132 needed to classify PXE clients and
//! answer them: no lease options, no relay agent handling.

use std::net::Ipv4Addr;

use macaddr::{MacAddr, MacAddr6, MacAddr8};

use crate::error::ParseError;

/// DHCP magic cookie: 0x63825363
const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Minimum DHCP packet size (fixed header without options)
const MIN_DHCP_SIZE: usize = 236;

/// Minimum on-the-wire reply size; short BOOTP replies confuse some PXE ROMs.
const MIN_REPLY_SIZE: usize = 300;

/// DHCP option codes
mod option_codes {
    pub const PAD: u8 = 0;
    pub const END: u8 = 255;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const VENDOR_CLASS_ID: u8 = 60;
    pub const USER_CLASS: u8 = 77;
    pub const CLIENT_ARCH: u8 = 93;
    pub const CLIENT_UUID: u8 = 97;
    pub const VENDOR_SPECIFIC: u8 = 43;
}

/// DHCP message types as defined in RFC 2131.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpMessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl DhcpMessageType {
    /// Parse from the DHCP option 53 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

impl std::fmt::Display for DhcpMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// The DHCP options this server reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Option 53: DHCP Message Type
    MessageType(DhcpMessageType),
    /// Option 54: Server Identifier
    ServerIdentifier(Ipv4Addr),
    /// Option 60: Vendor Class Identifier (e.g. "PXEClient:...")
    VendorClassId(String),
    /// Option 77: User Class ("iPXE" for chainloaded clients)
    UserClass(Vec<u8>),
    /// Option 93: Client System Architecture (RFC 4578)
    ClientArch(u16),
    /// Option 97: Client Machine Identifier (UUID/GUID)
    ClientUuid(Vec<u8>),
    /// Option 43: Vendor-specific information (PXE sub-options)
    VendorSpecific(Vec<u8>),
    /// Anything else (code, data); preserved but not interpreted.
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => option_codes::MESSAGE_TYPE,
            Self::ServerIdentifier(_) => option_codes::SERVER_ID,
            Self::VendorClassId(_) => option_codes::VENDOR_CLASS_ID,
            Self::UserClass(_) => option_codes::USER_CLASS,
            Self::ClientArch(_) => option_codes::CLIENT_ARCH,
            Self::ClientUuid(_) => option_codes::CLIENT_UUID,
            Self::VendorSpecific(_) => option_codes::VENDOR_SPECIFIC,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::MessageType(t) => vec![t.as_u8()],
            Self::ServerIdentifier(ip) => ip.octets().to_vec(),
            Self::VendorClassId(s) => s.as_bytes().to_vec(),
            Self::UserClass(data) => data.clone(),
            Self::ClientArch(arch) => arch.to_be_bytes().to_vec(),
            Self::ClientUuid(data) => data.clone(),
            Self::VendorSpecific(data) => data.clone(),
            Self::Unknown(_, data) => data.clone(),
        }
    }
}

/// A parsed DHCPv4 packet.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Operation: 1 = BOOTREQUEST, 2 = BOOTREPLY
    pub op: u8,
    /// Hardware type (1 = Ethernet)
    pub htype: u8,
    /// Hardware address length
    pub hlen: u8,
    /// Transaction ID
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    /// Raw client hardware address field, always 16 bytes on the wire.
    pub chaddr: [u8; 16],
    /// Server hostname, if set.
    pub sname: Option<String>,
    /// Boot filename, if set.
    pub file: Option<String>,
    pub options: Vec<DhcpOption>,
}

impl Packet {
    /// Parse a DHCP packet from the UDP payload.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < MIN_DHCP_SIZE {
            return Err(ParseError::PacketTooShort {
                expected: MIN_DHCP_SIZE,
                actual: data.len(),
            });
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let sname = parse_null_terminated(&data[44..108]);
        let file = parse_null_terminated(&data[108..236]);

        if data.len() < 240 {
            return Err(ParseError::PacketTooShort {
                expected: 240,
                actual: data.len(),
            });
        }
        if data[236..240] != DHCP_MAGIC_COOKIE {
            return Err(ParseError::InvalidMagicCookie);
        }

        let options = parse_options(&data[240..])?;

        Ok(Self {
            op,
            htype,
            hlen,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Serialize to wire format, padded to the BOOTP minimum of 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; 240];

        out[0] = self.op;
        out[1] = self.htype;
        out[2] = self.hlen;
        out[4..8].copy_from_slice(&self.xid.to_be_bytes());
        out[8..10].copy_from_slice(&self.secs.to_be_bytes());
        out[10..12].copy_from_slice(&self.flags.to_be_bytes());
        out[12..16].copy_from_slice(&self.ciaddr.octets());
        out[16..20].copy_from_slice(&self.yiaddr.octets());
        out[20..24].copy_from_slice(&self.siaddr.octets());
        out[24..28].copy_from_slice(&self.giaddr.octets());
        out[28..44].copy_from_slice(&self.chaddr);

        if let Some(ref sname) = self.sname {
            let bytes = sname.as_bytes();
            let len = bytes.len().min(63);
            out[44..44 + len].copy_from_slice(&bytes[..len]);
        }
        if let Some(ref file) = self.file {
            let bytes = file.as_bytes();
            let len = bytes.len().min(127);
            out[108..108 + len].copy_from_slice(&bytes[..len]);
        }

        out[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        for opt in &self.options {
            let payload = opt.payload();
            out.push(opt.code());
            out.push(payload.len() as u8);
            out.extend_from_slice(&payload);
        }
        out.push(option_codes::END);

        while out.len() < MIN_REPLY_SIZE {
            out.push(0);
        }
        out
    }

    /// Returns true if this is a client request (BOOTREQUEST).
    pub fn is_request(&self) -> bool {
        self.op == 1
    }

    /// The client hardware address, honoring the hardware address length.
    ///
    /// Only 6- and 8-octet addresses are meaningful here; anything else is
    /// not a machine we can build boot paths for.
    pub fn mac(&self) -> Option<MacAddr> {
        match self.hlen {
            6 => {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(&self.chaddr[..6]);
                Some(MacAddr::from(MacAddr6::from(octets)))
            }
            8 => {
                let mut octets = [0u8; 8];
                octets.copy_from_slice(&self.chaddr[..8]);
                Some(MacAddr::from(MacAddr8::from(octets)))
            }
            _ => None,
        }
    }

    /// Get the DHCP message type from options.
    pub fn message_type(&self) -> Option<DhcpMessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Get the vendor class identifier (option 60).
    pub fn vendor_class_id(&self) -> Option<&str> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::VendorClassId(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Get the user class (option 77).
    pub fn user_class(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::UserClass(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Get the client architecture (option 93).
    pub fn client_arch(&self) -> Option<u16> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientArch(arch) => Some(*arch),
            _ => None,
        })
    }

    /// Get the client machine identifier (option 97).
    pub fn client_uuid(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ClientUuid(data) => Some(data.as_slice()),
            _ => None,
        })
    }
}

/// Parse a null-terminated string field, returning None if empty.
fn parse_null_terminated(data: &[u8]) -> Option<String> {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    if end == 0 {
        return None;
    }
    String::from_utf8(data[..end].to_vec()).ok()
}

/// Parse the options section.
fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>, ParseError> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let code = data[offset];

        if code == option_codes::PAD {
            offset += 1;
            continue;
        }
        if code == option_codes::END {
            break;
        }

        if offset + 1 >= data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: "option length missing".to_string(),
            });
        }

        let len = data[offset + 1] as usize;
        if offset + 2 + len > data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: format!(
                    "option data truncated: expected {} bytes, have {}",
                    len,
                    data.len() - offset - 2
                ),
            });
        }

        let payload = &data[offset + 2..offset + 2 + len];
        if let Some(option) = parse_option(code, payload) {
            options.push(option);
        }
        offset += 2 + len;
    }

    Ok(options)
}

fn parse_option(code: u8, data: &[u8]) -> Option<DhcpOption> {
    match code {
        option_codes::MESSAGE_TYPE => {
            if data.is_empty() {
                return None;
            }
            DhcpMessageType::from_u8(data[0]).map(DhcpOption::MessageType)
        }
        option_codes::SERVER_ID => {
            if data.len() < 4 {
                return None;
            }
            Some(DhcpOption::ServerIdentifier(Ipv4Addr::new(
                data[0], data[1], data[2], data[3],
            )))
        }
        option_codes::VENDOR_CLASS_ID => String::from_utf8(data.to_vec())
            .ok()
            .map(DhcpOption::VendorClassId),
        option_codes::USER_CLASS => Some(DhcpOption::UserClass(data.to_vec())),
        option_codes::CLIENT_ARCH => {
            if data.len() < 2 {
                return None;
            }
            Some(DhcpOption::ClientArch(u16::from_be_bytes([
                data[0], data[1],
            ])))
        }
        option_codes::CLIENT_UUID => Some(DhcpOption::ClientUuid(data.to_vec())),
        option_codes::VENDOR_SPECIFIC => Some(DhcpOption::VendorSpecific(data.to_vec())),
        _ => Some(DhcpOption::Unknown(code, data.to_vec())),
    }
}

/// Build the option 43 payload for a ProxyDHCP offer.
///
/// Sub-option 6 (discovery control) is set to 8, telling the firmware to skip
/// boot server discovery and use the boot file we name. Sub-options 8 and 9
/// provide a single-entry boot menu and a zero-timeout prompt so firmwares
/// that insist on a menu select it immediately.
pub fn pxe_vendor_options(menu_label: &str) -> Vec<u8> {
    let label = menu_label.as_bytes();
    let mut out = Vec::with_capacity(16 + 2 * label.len());

    // Discovery control: boot from the filename, no multicast discovery.
    out.extend_from_slice(&[6, 1, 8]);

    // Boot menu: one entry, server type 0.
    out.push(8);
    out.push(3 + label.len() as u8);
    out.extend_from_slice(&[0, 0]);
    out.push(label.len() as u8);
    out.extend_from_slice(label);

    // Menu prompt with timeout 0 for immediate selection.
    out.push(9);
    out.push(1 + label.len() as u8);
    out.push(0);
    out.extend_from_slice(label);

    out.push(255);
    out
}
