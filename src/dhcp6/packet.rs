//! DHCPv6 packet parsing and encoding.

use std::net::Ipv6Addr;

use crate::error::ParseError;

/// DHCPv6 option codes (RFC 3315, RFC 5970).
mod option_codes {
    pub const CLIENT_ID: u16 = 1;
    pub const SERVER_ID: u16 = 2;
    pub const IA_NA: u16 = 3;
    pub const IA_ADDRESS: u16 = 5;
    pub const VENDOR_CLASS: u16 = 16;
    pub const BOOTFILE_URL: u16 = 59;
}

/// DHCPv6 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit,
    Advertise,
    Request,
    Renew,
    Reply,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Solicit,
            2 => Self::Advertise,
            3 => Self::Request,
            5 => Self::Renew,
            7 => Self::Reply,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Solicit => 1,
            Self::Advertise => 2,
            Self::Request => 3,
            Self::Renew => 5,
            Self::Reply => 7,
            Self::Unknown(v) => v,
        }
    }
}

/// An address inside an IA_NA (option 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaAddress {
    pub address: Ipv6Addr,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

/// Identity Association for Non-temporary Addresses (option 3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IaNa {
    pub iaid: [u8; 4],
    pub t1: u32,
    pub t2: u32,
    pub addresses: Vec<IaAddress>,
}

/// The DHCPv6 options this server reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dhcp6Option {
    ClientId(Vec<u8>),
    ServerId(Vec<u8>),
    IaNa(IaNa),
    VendorClass(Vec<u8>),
    BootfileUrl(Vec<u8>),
    Unknown(u16, Vec<u8>),
}

impl Dhcp6Option {
    fn code(&self) -> u16 {
        match self {
            Self::ClientId(_) => option_codes::CLIENT_ID,
            Self::ServerId(_) => option_codes::SERVER_ID,
            Self::IaNa(_) => option_codes::IA_NA,
            Self::VendorClass(_) => option_codes::VENDOR_CLASS,
            Self::BootfileUrl(_) => option_codes::BOOTFILE_URL,
            Self::Unknown(code, _) => *code,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::ClientId(data) | Self::ServerId(data) => data.clone(),
            Self::VendorClass(data) | Self::BootfileUrl(data) => data.clone(),
            Self::Unknown(_, data) => data.clone(),
            Self::IaNa(ia) => {
                let mut out = Vec::with_capacity(12 + ia.addresses.len() * 28);
                out.extend_from_slice(&ia.iaid);
                out.extend_from_slice(&ia.t1.to_be_bytes());
                out.extend_from_slice(&ia.t2.to_be_bytes());
                for addr in &ia.addresses {
                    out.extend_from_slice(&option_codes::IA_ADDRESS.to_be_bytes());
                    out.extend_from_slice(&24u16.to_be_bytes());
                    out.extend_from_slice(&addr.address.octets());
                    out.extend_from_slice(&addr.preferred_lifetime.to_be_bytes());
                    out.extend_from_slice(&addr.valid_lifetime.to_be_bytes());
                }
                out
            }
        }
    }
}

/// A parsed DHCPv6 packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub msg_type: MessageType,
    /// 3-byte transaction id, echoed in replies.
    pub txn_id: [u8; 3],
    pub options: Vec<Dhcp6Option>,
}

impl Packet {
    /// Parse a DHCPv6 message from the UDP payload.
    ///
    /// Relay messages (types 12 and 13) have a different header layout and
    /// are rejected; this server only answers directly connected clients.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 4 {
            return Err(ParseError::PacketTooShort {
                expected: 4,
                actual: data.len(),
            });
        }
        if data[0] == 12 || data[0] == 13 {
            return Err(ParseError::NotDhcp);
        }

        let msg_type = MessageType::from_u8(data[0]);
        let txn_id = [data[1], data[2], data[3]];
        let options = parse_options(&data[4..])?;

        Ok(Self {
            msg_type,
            txn_id,
            options,
        })
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(self.msg_type.as_u8());
        out.extend_from_slice(&self.txn_id);
        for opt in &self.options {
            let payload = opt.payload();
            out.extend_from_slice(&opt.code().to_be_bytes());
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }

    /// Get the client identifier (option 1).
    pub fn client_id(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::ClientId(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Get the vendor class (option 16) as raw bytes.
    pub fn vendor_class(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|opt| match opt {
            Dhcp6Option::VendorClass(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// All IA_NA options in the message.
    pub fn ia_nas(&self) -> Vec<&IaNa> {
        self.options
            .iter()
            .filter_map(|opt| match opt {
                Dhcp6Option::IaNa(ia) => Some(ia),
                _ => None,
            })
            .collect()
    }
}

fn parse_options(data: &[u8]) -> Result<Vec<Dhcp6Option>, ParseError> {
    let mut options = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: "option header truncated".to_string(),
            });
        }
        let code = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if offset + 4 + len > data.len() {
            return Err(ParseError::InvalidOption {
                offset,
                message: format!(
                    "option data truncated: expected {} bytes, have {}",
                    len,
                    data.len() - offset - 4
                ),
            });
        }

        let payload = &data[offset + 4..offset + 4 + len];
        options.push(parse_option(code, payload, offset)?);
        offset += 4 + len;
    }

    Ok(options)
}

fn parse_option(code: u16, data: &[u8], offset: usize) -> Result<Dhcp6Option, ParseError> {
    let opt = match code {
        option_codes::CLIENT_ID => Dhcp6Option::ClientId(data.to_vec()),
        option_codes::SERVER_ID => Dhcp6Option::ServerId(data.to_vec()),
        option_codes::VENDOR_CLASS => Dhcp6Option::VendorClass(data.to_vec()),
        option_codes::BOOTFILE_URL => Dhcp6Option::BootfileUrl(data.to_vec()),
        option_codes::IA_NA => {
            if data.len() < 12 {
                return Err(ParseError::InvalidOption {
                    offset,
                    message: "IA_NA shorter than 12 bytes".to_string(),
                });
            }
            let mut iaid = [0u8; 4];
            iaid.copy_from_slice(&data[..4]);
            let t1 = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let t2 = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            let addresses = parse_ia_addresses(&data[12..], offset)?;
            Dhcp6Option::IaNa(IaNa {
                iaid,
                t1,
                t2,
                addresses,
            })
        }
        other => Dhcp6Option::Unknown(other, data.to_vec()),
    };
    Ok(opt)
}

fn parse_ia_addresses(data: &[u8], outer: usize) -> Result<Vec<IaAddress>, ParseError> {
    let mut addresses = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if offset + 4 > data.len() {
            return Err(ParseError::InvalidOption {
                offset: outer,
                message: "IA_NA sub-option header truncated".to_string(),
            });
        }
        let code = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if offset + 4 + len > data.len() {
            return Err(ParseError::InvalidOption {
                offset: outer,
                message: "IA_NA sub-option truncated".to_string(),
            });
        }
        if code == option_codes::IA_ADDRESS && len >= 24 {
            let payload = &data[offset + 4..offset + 4 + len];
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&payload[..16]);
            addresses.push(IaAddress {
                address: Ipv6Addr::from(octets),
                preferred_lifetime: u32::from_be_bytes([
                    payload[16],
                    payload[17],
                    payload[18],
                    payload[19],
                ]),
                valid_lifetime: u32::from_be_bytes([
                    payload[20],
                    payload[21],
                    payload[22],
                    payload[23],
                ]),
            });
        }
        offset += 4 + len;
    }

    Ok(addresses)
}
