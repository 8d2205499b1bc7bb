//! TFTP packet parsing and encoding.

use crate::error::TftpError;

/// TFTP opcodes
pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;
pub const OPCODE_OACK: u16 = 6;

/// TFTP error codes
pub const ERROR_NOT_DEFINED: u16 = 0;
pub const ERROR_FILE_NOT_FOUND: u16 = 1;
pub const ERROR_ACCESS_VIOLATION: u16 = 2;
pub const ERROR_ILLEGAL_OPERATION: u16 = 4;

/// A parsed read request.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: String,
    /// RFC 2347 options in request order, names lowercased.
    pub options: Vec<(String, String)>,
}

/// Parse the body of an RRQ packet (everything after the opcode).
pub fn parse_read_request(body: &[u8]) -> Result<ReadRequest, TftpError> {
    let mut fields = body.split(|&b| b == 0);

    let filename = fields
        .next()
        .filter(|f| !f.is_empty())
        .and_then(|f| std::str::from_utf8(f).ok())
        .ok_or_else(|| TftpError::BadRequest("missing filename".to_string()))?
        .to_string();

    let mode = fields
        .next()
        .and_then(|f| std::str::from_utf8(f).ok())
        .unwrap_or("octet")
        .to_lowercase();

    let mut options = Vec::new();
    loop {
        let name = match fields.next() {
            Some(n) if !n.is_empty() => n,
            _ => break,
        };
        let value = match fields.next() {
            Some(v) if !v.is_empty() => v,
            _ => break,
        };
        if let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) {
            options.push((name.to_lowercase(), value.to_string()));
        }
    }

    Ok(ReadRequest {
        filename,
        mode,
        options,
    })
}

/// What the client sent back during a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    Ack(u16),
    Error(String),
}

/// Parse an in-transfer packet from the client.
pub fn parse_client_reply(data: &[u8]) -> Option<ClientReply> {
    if data.len() < 4 {
        return None;
    }
    let opcode = u16::from_be_bytes([data[0], data[1]]);
    match opcode {
        OPCODE_ACK => Some(ClientReply::Ack(u16::from_be_bytes([data[2], data[3]]))),
        OPCODE_ERROR => {
            let message = data[4..]
                .split(|&b| b == 0)
                .next()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .unwrap_or_default();
            Some(ClientReply::Error(message))
        }
        _ => None,
    }
}

/// Build a DATA packet.
pub fn data_packet(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&OPCODE_DATA.to_be_bytes());
    out.extend_from_slice(&block.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build an OACK packet from negotiated options.
pub fn oack_packet(options: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    out.extend_from_slice(&OPCODE_OACK.to_be_bytes());
    for (name, value) in options {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

/// Build an ERROR packet.
pub fn error_packet(code: u16, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + message.len());
    out.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(message.as_bytes());
    out.push(0);
    out
}
