//! Tinderbox - network boot server.
//!
//! Boots bare-metal machines over the network by steering their firmware
//! through a multi-stage chainload: ProxyDHCP offers name a TFTP path, TFTP
//! serves a firmware-appropriate iPXE binary, and iPXE fetches a dynamically
//! assembled boot script over HTTP whose file references are signed,
//! tamper-evident URLs. Runs next to an existing DHCP server (snooper mode)
//! or as a self-contained lab appliance.
//!
//! # Architecture
//!
//! - `domain`: machines, firmware families, boot progress events
//! - `dhcp4` / `dhcp6` / `tftp::packet`: wire codecs, no I/O
//! - `tftp`: lockstep TFTP server with option negotiation
//! - `booter`: the injected capability deciding what machines boot
//! - `urlsign` / `cmdline`: signed file URLs and command line templates
//! - `server`: the orchestrator tying the four protocol tasks together
//!
//! What to boot is injected as a [`Booter`]; the bundled [`StaticBooter`]
//! serves one fixed [`BootSpec`] to every machine.

pub mod booter;
pub mod cmdline;
pub mod dhcp4;
pub mod dhcp6;
pub mod domain;
pub mod error;
pub mod server;
pub mod tftp;
pub mod urlsign;
pub mod utils;

pub use booter::{BootFile, BootSpec, Booter, FileId, StaticBooter};
pub use domain::{Firmware, Machine};
pub use error::{BootError, ParseError, ServerError, TftpError};
pub use server::{BootConfiguration, Server, ServerV6, StaticBootUrl};
