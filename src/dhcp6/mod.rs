//! DHCPv6 wire codec and collaborator traits.
//!
//! Only the message types and options needed for network boot (RFC 3315
//! Solicit/Advertise/Request/Renew/Reply plus the boot file URL option) are
//! modeled. Address management itself is delegated to an injected
//! [`AddressPool`].

pub mod duid;
pub mod packet;
pub mod pool;

pub use duid::duid_llt;
pub use packet::{Dhcp6Option, IaAddress, IaNa, MessageType, Packet};
pub use pool::{AddressPool, IdentityAssociation, PoolError};
