//! TFTP server for the first boot stage.
//!
//! Implements RFC 1350 read requests with RFC 2347/2348/2349 option
//! negotiation. Transfers are lockstep: DATA(n) is never sent before ACK(n-1)
//! has been observed. What gets served is decided by an injected [`Handler`].

pub mod packet;
pub mod server;

pub use server::{Handler, TftpServer};
