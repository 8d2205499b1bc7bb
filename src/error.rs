//! Error types for the boot server.
//!
//! Using thiserror for ergonomic error definitions. Errors come in three
//! altitudes: wire-level parse failures (drop the packet), per-exchange boot
//! failures (reply with a protocol error where one exists, otherwise drop and
//! let the client retry), and fatal server conditions that end `serve()`.

use thiserror::Error;

/// Errors that can occur while parsing DHCP packets.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("invalid DHCP magic cookie")]
    InvalidMagicCookie,

    #[error("invalid option at offset {offset}: {message}")]
    InvalidOption { offset: usize, message: String },

    #[error("not a DHCP message")]
    NotDhcp,
}

/// Errors that can occur during a TFTP exchange.
#[derive(Error, Debug)]
pub enum TftpError {
    #[error("unknown path {0:?}")]
    UnknownPath(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("transfer timed out waiting for ACK of block {block}")]
    Timeout { block: u16 },

    #[error("peer aborted transfer: {0}")]
    PeerError(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors fatal to a single client boot exchange.
#[derive(Error, Debug)]
pub enum BootError {
    /// Parse or validation failed; the exchange is abandoned.
    #[error("bad packet: {0}")]
    BadPacket(String),

    /// The classifier rejected the client.
    #[error("unsupported client: {0}")]
    UnsupportedClient(String),

    /// The Booter declined to boot this machine.
    #[error("booter declined to boot this machine")]
    BooterRefused,

    /// A signed URL failed verification.
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("not found: {0}")]
    NotFound(String),

    /// The Booter does not implement the requested operation.
    #[error("operation not supported by this booter")]
    Unsupported,

    #[error("fetching {url}: {message}")]
    Upstream { url: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors fatal to the whole server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("binding {what} on port {port}: {source}")]
    Bind {
        what: &'static str,
        port: u16,
        source: std::io::Error,
    },

    #[error("no usable network interface: {0}")]
    Interface(String),

    #[error("{what} listener failed: {source}")]
    Listener {
        what: &'static str,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
