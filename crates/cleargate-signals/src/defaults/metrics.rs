//! Counting observability provider.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::traits::{DeliveryFault, FaultSite, ObservabilityProvider};
use crate::types::{DefinitionId, SignalMessage};

/// Point-in-time copy of [`MetricsObserver`] counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub signals_fired: u64,
    pub subscriber_faults: u64,
    pub target_faults: u64,
    pub door_evaluations: u64,
    pub door_activations: u64,
    pub trigger_fires: u64,
    pub target_invocations: u64,
    pub capacity_exceeded: u64,
    pub conflicts_recovered: u64,
    pub conflicts_failed: u64,
    pub activation_errors: u64,
}

/// Observability provider that counts events and keeps recent faults.
///
/// Lock-free counters; the fault log holds at most `fault_capacity` entries,
/// dropping the oldest.
pub struct MetricsObserver {
    signals_fired: AtomicU64,
    subscriber_faults: AtomicU64,
    target_faults: AtomicU64,
    door_evaluations: AtomicU64,
    door_activations: AtomicU64,
    trigger_fires: AtomicU64,
    target_invocations: AtomicU64,
    capacity_exceeded: AtomicU64,
    conflicts_recovered: AtomicU64,
    conflicts_failed: AtomicU64,
    activation_errors: AtomicU64,
    faults: Mutex<Vec<DeliveryFault>>,
    fault_capacity: usize,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::with_fault_capacity(256)
    }

    pub fn with_fault_capacity(fault_capacity: usize) -> Self {
        Self {
            signals_fired: AtomicU64::new(0),
            subscriber_faults: AtomicU64::new(0),
            target_faults: AtomicU64::new(0),
            door_evaluations: AtomicU64::new(0),
            door_activations: AtomicU64::new(0),
            trigger_fires: AtomicU64::new(0),
            target_invocations: AtomicU64::new(0),
            capacity_exceeded: AtomicU64::new(0),
            conflicts_recovered: AtomicU64::new(0),
            conflicts_failed: AtomicU64::new(0),
            activation_errors: AtomicU64::new(0),
            faults: Mutex::new(Vec::new()),
            fault_capacity,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            signals_fired: get(&self.signals_fired),
            subscriber_faults: get(&self.subscriber_faults),
            target_faults: get(&self.target_faults),
            door_evaluations: get(&self.door_evaluations),
            door_activations: get(&self.door_activations),
            trigger_fires: get(&self.trigger_fires),
            target_invocations: get(&self.target_invocations),
            capacity_exceeded: get(&self.capacity_exceeded),
            conflicts_recovered: get(&self.conflicts_recovered),
            conflicts_failed: get(&self.conflicts_failed),
            activation_errors: get(&self.activation_errors),
        }
    }

    /// Most recent faults, oldest first.
    pub fn faults(&self) -> Vec<DeliveryFault> {
        self.faults.lock().clone()
    }
}

impl Default for MetricsObserver {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ObservabilityProvider for MetricsObserver {
    fn record_signal_fired(&self, _message: &SignalMessage, _subscribers: usize) {
        bump(&self.signals_fired, 1);
    }

    fn record_delivery_fault(&self, fault: &DeliveryFault) {
        match fault.site {
            FaultSite::Subscriber { .. } => bump(&self.subscriber_faults, 1),
            FaultSite::Target { .. } => bump(&self.target_faults, 1),
        }
        if self.fault_capacity == 0 {
            return;
        }
        let mut faults = self.faults.lock();
        if faults.len() == self.fault_capacity {
            faults.remove(0);
        }
        faults.push(fault.clone());
    }

    fn record_door_evaluated(&self, _door_id: DefinitionId, _result: bool, activated: bool) {
        bump(&self.door_evaluations, 1);
        if activated {
            bump(&self.door_activations, 1);
        }
    }

    fn record_trigger_fired(&self, _trigger_id: DefinitionId, _values: usize, invocations: usize) {
        bump(&self.trigger_fires, 1);
        bump(&self.target_invocations, invocations as u64);
    }

    fn record_capacity_exceeded(&self, _trigger_id: DefinitionId, _requested: usize) {
        bump(&self.capacity_exceeded, 1);
    }

    fn record_conflict(&self, _scope: &str, _key: &str, recovered: bool) {
        if recovered {
            bump(&self.conflicts_recovered, 1);
        } else {
            bump(&self.conflicts_failed, 1);
        }
    }

    fn record_activation_error(&self, _scope: &str, _id: DefinitionId, _error: &str) {
        bump(&self.activation_errors, 1);
    }
}
