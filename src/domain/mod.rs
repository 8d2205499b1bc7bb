//! Core domain types shared by the protocol servers.

pub mod events;
pub mod machine;

pub use events::{EventLog, MachineEvent, Phase};
pub use machine::{format_mac, Firmware, Machine};
