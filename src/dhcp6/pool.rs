//! Address pool collaborator for the DHCPv6 responder.
//!
//! This server does not manage IPv6 address space itself; the operator
//! injects an [`AddressPool`]. There is deliberately no default
//! implementation: enabling DHCPv6 without a pool is a configuration error.

use std::net::Ipv6Addr;
use std::time::SystemTime;

use thiserror::Error;

/// An address reservation for one network interface of a client.
#[derive(Debug, Clone)]
pub struct IdentityAssociation {
    pub address: Ipv6Addr,
    pub client_id: Vec<u8>,
    pub interface_id: Vec<u8>,
    pub created_at: SystemTime,
}

/// Error returned by an [`AddressPool`]. Treated as transient: the client
/// gets no reply and will resend.
#[derive(Error, Debug)]
#[error("address pool: {0}")]
pub struct PoolError(pub String);

/// Tracks assigned and available addresses in an IPv6 pool.
pub trait AddressPool: Send + Sync {
    /// Reserve one address per interface id for the given client.
    fn reserve_addresses(
        &self,
        client_id: &[u8],
        interface_ids: &[Vec<u8>],
    ) -> Result<Vec<IdentityAssociation>, PoolError>;

    /// Release any reservations held for the given client.
    fn release_addresses(&self, client_id: &[u8], interface_ids: &[Vec<u8>]);
}
