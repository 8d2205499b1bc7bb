//! Per-machine boot progress events.
//!
//! Every protocol server appends to a shared in-memory log keyed by client
//! MAC, so an operator can see how far a machine got through the boot chain.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

/// Events kept per machine before the oldest are dropped.
const MAX_EVENTS_PER_MACHINE: usize = 64;

/// Machines tracked before the least recently active one is evicted.
const MAX_MACHINES: usize = 10_000;

/// The boot phase an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    DhcpOffered,
    PxeResponded,
    TftpSent,
    HttpScript,
    HttpFile,
    ClientReport,
    Error,
}

/// One entry in a machine's boot log.
#[derive(Debug, Clone, Serialize)]
pub struct MachineEvent {
    /// Milliseconds since the server started.
    pub millis: u64,
    pub phase: Phase,
    pub message: String,
}

struct MachineLog {
    events: VecDeque<MachineEvent>,
    // Monotonic counter used for least-recently-active eviction.
    touched: u64,
}

/// Append-only boot progress log, shared between all protocol servers.
///
/// Timestamps are monotonic. Per machine, at most one event is recorded per
/// (phase, millisecond); duplicate appends within the same millisecond are
/// dropped.
pub struct EventLog {
    started: Instant,
    inner: Mutex<Inner>,
}

struct Inner {
    machines: HashMap<String, MachineLog>,
    clock: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(Inner {
                machines: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Append an event to the log for `mac` (lowercase colon form).
    pub fn record(&self, mac: &str, phase: Phase, message: impl Into<String>) {
        let millis = self.started.elapsed().as_millis() as u64;
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let clock = inner.clock;

        if !inner.machines.contains_key(mac) && inner.machines.len() >= MAX_MACHINES {
            if let Some(stale) = inner
                .machines
                .iter()
                .min_by_key(|(_, log)| log.touched)
                .map(|(mac, _)| mac.clone())
            {
                inner.machines.remove(&stale);
            }
        }

        let log = inner.machines.entry(mac.to_string()).or_insert(MachineLog {
            events: VecDeque::new(),
            touched: 0,
        });
        log.touched = clock;

        // Same-millisecond entries sit at the tail; one per phase is enough.
        let duplicate = log
            .events
            .iter()
            .rev()
            .take_while(|e| e.millis == millis)
            .any(|e| e.phase == phase);
        if duplicate {
            return;
        }

        if log.events.len() >= MAX_EVENTS_PER_MACHINE {
            log.events.pop_front();
        }
        log.events.push_back(MachineEvent {
            millis,
            phase,
            message: message.into(),
        });
    }

    /// Copy of the event list for `mac`, oldest first.
    pub fn snapshot(&self, mac: &str) -> Vec<MachineEvent> {
        let inner = self.inner.lock().unwrap();
        inner
            .machines
            .get(mac)
            .map(|log| log.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of machines currently tracked.
    pub fn machine_count(&self) -> usize {
        self.inner.lock().unwrap().machines.len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
