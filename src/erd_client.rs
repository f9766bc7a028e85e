//! ERD client: asynchronous reads and writes on the appliance bus.
//!
//! Requests are fire-and-forget; results come back later as
//! [`ErdClientActivity`] values delivered to the run loop. The byte-level
//! bus framing lives behind this trait.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;

use crate::erd::{Erd, RequestId, APPLIANCE_TYPE_ERD, BROADCAST_ADDRESS};

/// Result of a bus request, reported by the ERD client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErdClientActivity {
    ReadCompleted {
        request_id: RequestId,
        address: u8,
        erd: Erd,
        data: Vec<u8>,
    },
    ReadFailed {
        request_id: RequestId,
        erd: Erd,
        reason: u8,
    },
    WriteCompleted {
        request_id: RequestId,
        erd: Erd,
    },
    WriteFailed {
        request_id: RequestId,
        erd: Erd,
        reason: u8,
    },
}

pub trait ErdClient {
    /// Queue a read. Returns false if the request could not be queued.
    fn read(&mut self, request_id: RequestId, address: u8, erd: Erd) -> bool;

    /// Queue a write. Returns false if the request could not be queued.
    fn write(&mut self, request_id: RequestId, address: u8, erd: Erd, value: &[u8]) -> bool;
}

/// Write failure reason: the appliance does not publish this ERD.
pub const REASON_UNSUPPORTED_ERD: u8 = 1;

/// Configuration of the in-process simulated appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedApplianceConfig {
    /// Bus address the appliance answers from
    #[serde(default = "default_appliance_address")]
    pub address: u8,
    /// Value reported for ERD 0x0008
    #[serde(default)]
    pub appliance_type: u8,
    /// Response latency in milliseconds
    #[serde(default = "default_latency")]
    pub latency_ms: u64,
    /// ERD values as hex strings, keyed by ERD
    #[serde(default)]
    pub erds: HashMap<Erd, String>,
    /// Answer reads of unknown ERDs with a failure instead of silence
    #[serde(default)]
    pub reject_unknown_reads: bool,
}

fn default_appliance_address() -> u8 {
    0xC0
}

fn default_latency() -> u64 {
    20
}

impl Default for SimulatedApplianceConfig {
    fn default() -> Self {
        Self {
            address: default_appliance_address(),
            appliance_type: 0,
            latency_ms: default_latency(),
            erds: HashMap::new(),
            reject_unknown_reads: false,
        }
    }
}

/// An appliance model living in the bridge process.
///
/// Reads of ERDs the appliance does not have go unanswered, so they time out
/// the way an unsupported ERD does on a real bus, unless
/// `reject_unknown_reads` is set. Responses are delivered on the activity
/// channel after `latency_ms`. Requests carry `client_address` as their source;
/// the appliance only answers requests addressed to it from another node.
pub struct SimulatedAppliance {
    address: u8,
    client_address: u8,
    reject_unknown_reads: bool,
    latency: Duration,
    values: HashMap<Erd, Vec<u8>>,
    activity_tx: mpsc::UnboundedSender<ErdClientActivity>,
}

impl SimulatedAppliance {
    pub fn new(
        config: &SimulatedApplianceConfig,
        client_address: u8,
        activity_tx: mpsc::UnboundedSender<ErdClientActivity>,
    ) -> Self {
        let mut values = HashMap::new();
        values.insert(APPLIANCE_TYPE_ERD, vec![config.appliance_type]);
        for (erd, value) in &config.erds {
            match hex::decode(value.trim_start_matches("0x")) {
                Ok(bytes) => {
                    values.insert(*erd, bytes);
                }
                Err(e) => {
                    tracing::warn!("Simulated appliance: ignoring ERD {} value {:?}: {}", erd, value, e);
                }
            }
        }

        Self {
            address: config.address,
            client_address,
            reject_unknown_reads: config.reject_unknown_reads,
            latency: Duration::from_millis(config.latency_ms),
            values,
            activity_tx,
        }
    }

    fn addressed_to_me(&self, address: u8) -> bool {
        self.client_address != self.address
            && (address == self.address || address == BROADCAST_ADDRESS)
    }

    fn deliver(&self, activity: ErdClientActivity) {
        let tx = self.activity_tx.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            // Receiver gone means the bridge is shutting down
            let _ = tx.send(activity);
        });
    }
}

impl ErdClient for SimulatedAppliance {
    fn read(&mut self, request_id: RequestId, address: u8, erd: Erd) -> bool {
        tracing::trace!("0x{:02X} -> 0x{:02X}: read {}", self.client_address, address, erd);
        if !self.addressed_to_me(address) {
            return true;
        }
        if let Some(data) = self.values.get(&erd) {
            self.deliver(ErdClientActivity::ReadCompleted {
                request_id,
                address: self.address,
                erd,
                data: data.clone(),
            });
        } else if self.reject_unknown_reads {
            self.deliver(ErdClientActivity::ReadFailed {
                request_id,
                erd,
                reason: REASON_UNSUPPORTED_ERD,
            });
        } else {
            tracing::trace!("Simulated appliance: no ERD {}", erd);
        }
        true
    }

    fn write(&mut self, request_id: RequestId, address: u8, erd: Erd, value: &[u8]) -> bool {
        tracing::trace!("0x{:02X} -> 0x{:02X}: write {}", self.client_address, address, erd);
        if !self.addressed_to_me(address) {
            return true;
        }
        let activity = match self.values.get_mut(&erd) {
            Some(slot) => {
                *slot = value.to_vec();
                ErdClientActivity::WriteCompleted { request_id, erd }
            }
            None => ErdClientActivity::WriteFailed {
                request_id,
                erd,
                reason: REASON_UNSUPPORTED_ERD,
            },
        };
        self.deliver(activity);
        true
    }
}
