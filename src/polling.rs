//! Polling list and registration bookkeeping.

use std::collections::HashSet;

use crate::erd::Erd;
use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Added,
    AlreadyPresent,
}

/// Ordered, duplicate-free, bounded list of ERDs read in steady state.
#[derive(Debug, Clone)]
pub struct PollingList {
    erds: Vec<Erd>,
    capacity: usize,
}

impl PollingList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            erds: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, erd: Erd) -> Result<Push, BridgeError> {
        if self.erds.contains(&erd) {
            return Ok(Push::AlreadyPresent);
        }
        if self.erds.len() >= self.capacity {
            return Err(BridgeError::PollingListFull {
                erd,
                capacity: self.capacity,
            });
        }
        self.erds.push(erd);
        Ok(Push::Added)
    }

    /// Replace the contents wholesale, dropping duplicates and anything past capacity.
    pub fn replace(&mut self, erds: &[Erd]) {
        self.erds.clear();
        for erd in erds {
            if self.push(*erd).is_err() {
                tracing::warn!("Polling list truncated at {} entries", self.capacity);
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.erds.clear();
    }

    pub fn get(&self, index: usize) -> Option<Erd> {
        self.erds.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.erds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.erds.is_empty()
    }

    pub fn as_slice(&self) -> &[Erd] {
        &self.erds
    }

    pub fn iter(&self) -> impl Iterator<Item = Erd> + '_ {
        self.erds.iter().copied()
    }
}

/// ERDs already registered with the MQTT side since the last disconnect.
#[derive(Debug, Clone, Default)]
pub struct DedupSet {
    registered: HashSet<Erd>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `erd` was not registered yet.
    pub fn insert(&mut self, erd: Erd) -> bool {
        self.registered.insert(erd)
    }

    pub fn clear(&mut self) {
        self.registered.clear();
    }
}
