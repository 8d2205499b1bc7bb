//! DHCPv4 wire codec and transports.
//!
//! `packet` is the pure codec (RFC 2131 + the RFC 2132 options PXE cares
//! about); `conn` provides the two ways of getting DHCP traffic off the
//! wire: a bound broadcast socket, or a packet-capture snooper that
//! coexists with an authoritative DHCP server.

pub mod conn;
pub mod packet;

pub use conn::DhcpConn;
pub use packet::{pxe_vendor_options, DhcpMessageType, DhcpOption, Packet};
