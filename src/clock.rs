//! Vector clocks for causal ordering of vault mutations.
//!
//! Every device (and the server itself) owns one slot in the clock.
//! The server merges each inbound clock and bumps its own slot on each
//! mutation it accepts; clients bump their own slot on each outbound
//! mutation. Comparison yields the usual component-wise partial order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// `a` is causally before `b`.
    Before,
    /// `a` is causally after `b`.
    After,
    /// Neither dominates: concurrent mutations.
    Concurrent,
    /// Identical clocks.
    Equal,
}

/// Map of device id → monotonic counter. Serialized as a bare mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: HashMap<String, u64>,
}

impl VectorClock {
    /// Empty clock (all components read 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the slot for the given device.
    pub fn bump(&mut self, device_id: &str) {
        *self.clocks.entry(device_id.to_string()).or_insert(0) += 1;
    }

    /// Counter for a device. Missing components read 0.
    pub fn get(&self, device_id: &str) -> u64 {
        self.clocks.get(device_id).copied().unwrap_or(0)
    }

    /// Merge another clock into self (component-wise max).
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.clocks {
            let slot = self.clocks.entry(device.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
    }

    /// True when every component of `other` is ≤ the matching component
    /// of self. Equal clocks dominate each other.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .clocks
            .iter()
            .all(|(device, &counter)| self.get(device) >= counter)
    }

    /// Component-wise partial-order comparison of `a` against `b`.
    pub fn compare(a: &VectorClock, b: &VectorClock) -> ClockOrdering {
        let mut a_greater = false;
        let mut b_greater = false;

        for device in a.clocks.keys().chain(b.clocks.keys()) {
            let av = a.get(device);
            let bv = b.get(device);
            if av > bv {
                a_greater = true;
            }
            if bv > av {
                b_greater = true;
            }
        }

        match (a_greater, b_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when no device has ever been recorded.
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}
