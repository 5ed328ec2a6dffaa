//! Slots, the slot pool, and local occupancy probing.
//!
//! A slot is a network port that at most one worker may occupy. The pool is
//! the fixed set of slots the controller is allowed to launch onto; its size
//! is the maximum number of concurrently running workers.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from slot and pool construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot port must be non-zero")]
    ZeroPort,

    #[error("invalid slot '{0}': expected a port number")]
    Parse(String),

    #[error("slot pool cannot be empty")]
    EmptyPool,
}

/// A single slot, identified by its port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Slot(u16);

impl Slot {
    /// Create a slot for the given port.
    pub fn new(port: u16) -> Result<Self, SlotError> {
        if port == 0 {
            return Err(SlotError::ZeroPort);
        }
        Ok(Self(port))
    }

    /// The port number.
    pub const fn port(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Slot {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let port = s
            .trim()
            .parse::<u16>()
            .map_err(|_| SlotError::Parse(s.to_string()))?;
        Self::new(port)
    }
}

impl TryFrom<u16> for Slot {
    type Error = SlotError;

    fn try_from(port: u16) -> Result<Self, Self::Error> {
        Self::new(port)
    }
}

impl From<Slot> for u16 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

/// The fixed, non-empty set of slots available for launching workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPool {
    slots: BTreeSet<Slot>,
}

impl SlotPool {
    /// Build a pool from a set of slots. Duplicates collapse.
    pub fn new(slots: impl IntoIterator<Item = Slot>) -> Result<Self, SlotError> {
        let slots: BTreeSet<Slot> = slots.into_iter().collect();
        if slots.is_empty() {
            return Err(SlotError::EmptyPool);
        }
        Ok(Self { slots })
    }

    /// Parse a comma-separated list of ports, e.g. `9995,9996`.
    pub fn parse(list: &str) -> Result<Self, SlotError> {
        let slots = list
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Slot>, _>>()?;
        Self::new(slots)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.contains(&slot)
    }

    /// Number of slots, i.e. the maximum number of concurrent workers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a pool is never empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots in ascending port order.
    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        self.slots.iter().copied()
    }
}

/// Local check of whether a slot is free.
pub trait SlotProbe: Send + Sync {
    /// Returns true only if nothing currently occupies the slot.
    ///
    /// Probe failures of any kind must be reported as "not free".
    fn is_free(&self, slot: Slot) -> bool;
}

/// Probe that tries to bind the slot's port for both TCP and UDP.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortProbe;

impl PortProbe {
    pub fn new() -> Self {
        Self
    }
}

impl SlotProbe for PortProbe {
    fn is_free(&self, slot: Slot) -> bool {
        let addr = SocketAddr::from(([0, 0, 0, 0], slot.port()));

        let tcp = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(e) => {
                debug!(slot = %slot, error = %e, "TCP bind failed, slot busy");
                return false;
            }
        };

        let udp = match UdpSocket::bind(addr) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(slot = %slot, error = %e, "UDP bind failed, slot busy");
                return false;
            }
        };

        drop(udp);
        drop(tcp);
        true
    }
}

/// In-memory probe for testing and development.
///
/// Every slot is free until marked occupied.
#[derive(Debug, Default)]
pub struct MockProbe {
    occupied: Mutex<HashSet<Slot>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a process now holds the slot.
    pub fn occupy(&self, slot: Slot) {
        self.lock().insert(slot);
    }

    /// Pretend the process holding the slot exited.
    pub fn release(&self, slot: Slot) {
        self.lock().remove(&slot);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Slot>> {
        // A poisoned set is still a valid set of ports.
        self.occupied.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SlotProbe for MockProbe {
    fn is_free(&self, slot: Slot) -> bool {
        !self.lock().contains(&slot)
    }
}
