//! Delta engine: converts cumulative traffic counters into safe increments
//!
//! Relay nodes report cumulative byte counters that reset whenever the
//! reporting process restarts. This module keeps the last observed value per
//! subscriber (the baseline) and turns each observation window into a
//! verified, non-negative increment map ready for the ledger.
//!
//! Baselines advance only after the corresponding increment has been durably
//! applied (`commit`). Advancing them earlier would lose the delta for good
//! if the ledger write fails.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One traffic observation reported by a relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedEvent {
    /// Subscriber id; events without one carry only service-level traffic.
    pub client: Option<String>,
    /// Service tag of the reporting listener (e.g. "1.2.3.4-https").
    pub service: Option<String>,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Last observed cumulative counter values for one subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cumulative {
    pub input: u128,
    pub output: u128,
    pub total: u128,
}

impl Cumulative {
    pub fn new(input: u128, output: u128) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// Byte increment attributable to one observation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Increment {
    pub input_bytes: u128,
    pub output_bytes: u128,
    pub total_bytes: u128,
}

impl Increment {
    pub fn add(&mut self, other: Increment) {
        self.input_bytes += other.input_bytes;
        self.output_bytes += other.output_bytes;
        self.total_bytes += other.total_bytes;
    }
}

/// Increments for one ledger transaction plus the baselines to advance once
/// the transaction commits.
#[derive(Debug, Clone, Default)]
pub struct PendingBatch {
    pub increments: BTreeMap<String, Increment>,
    baselines: HashMap<String, Cumulative>,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }
}

/// Aggregate node-level delta with the baseline to advance on commit.
#[derive(Debug, Clone, Copy)]
pub struct ServerDelta {
    pub delta: u128,
    baseline_after: u128,
}

/// Per-process tracker of cumulative counter baselines.
///
/// Single-writer: one instance per process, owned by the gateway behind a
/// mutex. Baselines are never shared across processes.
pub struct DeltaEngine {
    user_baselines: HashMap<String, Cumulative>,
    server_baseline: u128,
    batch_size: usize,
    server_reset_ceiling: u128,
}

impl DeltaEngine {
    pub fn new(batch_size: usize, server_reset_ceiling: u128) -> Self {
        Self {
            user_baselines: HashMap::new(),
            server_baseline: 0,
            batch_size: batch_size.max(1),
            server_reset_ceiling,
        }
    }

    /// Compute per-subscriber increments for one observation window.
    ///
    /// Events without a subscriber id are skipped. Multiple events for the
    /// same subscriber are summed. A counter decrease means the upstream
    /// reporter restarted: the baseline rebases to the current value and the
    /// whole current value counts as the increment, never a negative one.
    ///
    /// The result is chunked so no single batch exceeds the configured batch
    /// size; each chunk maps to one ledger transaction.
    pub fn compute_user_deltas(&self, events: &[ObservedEvent]) -> Vec<PendingBatch> {
        let mut working: HashMap<String, Cumulative> = HashMap::new();
        let mut increments: BTreeMap<String, Increment> = BTreeMap::new();

        for event in events {
            let user_id = match &event.client {
                Some(id) if !id.is_empty() => id,
                _ => continue,
            };

            let current = Cumulative::new(event.input_bytes as u128, event.output_bytes as u128);
            let previous = working
                .get(user_id)
                .or_else(|| self.user_baselines.get(user_id))
                .copied()
                .unwrap_or_default();

            let delta = Self::delta_between(previous, current);
            working.insert(user_id.clone(), current);

            if delta.total_bytes == 0 {
                continue;
            }
            increments.entry(user_id.clone()).or_default().add(delta);
        }

        self.chunk(increments, working)
    }

    /// Compute the node-level aggregate delta for one observation window.
    ///
    /// The aggregate baseline rebases to zero once it crosses the configured
    /// ceiling; that only trims the in-memory tracking value, never ledger
    /// state.
    pub fn compute_server_delta(&self, events: &[ObservedEvent]) -> ServerDelta {
        let aggregate: u128 = events
            .iter()
            .map(|e| e.input_bytes as u128 + e.output_bytes as u128)
            .sum();

        let delta = if aggregate < self.server_baseline {
            // Upstream counters restarted.
            aggregate
        } else {
            aggregate - self.server_baseline
        };

        let baseline_after = if aggregate > self.server_reset_ceiling {
            0
        } else {
            aggregate
        };

        ServerDelta {
            delta,
            baseline_after,
        }
    }

    /// Advance subscriber baselines after the batch was durably applied.
    pub fn commit(&mut self, batch: &PendingBatch) {
        for (user_id, cumulative) in &batch.baselines {
            self.user_baselines.insert(user_id.clone(), *cumulative);
        }
    }

    /// Advance the aggregate server baseline after the delta was recorded.
    pub fn commit_server(&mut self, delta: &ServerDelta) {
        self.server_baseline = delta.baseline_after;
    }

    pub fn baseline(&self, user_id: &str) -> Option<Cumulative> {
        self.user_baselines.get(user_id).copied()
    }

    fn delta_between(previous: Cumulative, current: Cumulative) -> Increment {
        let reset = current.total < previous.total
            || current.input < previous.input
            || current.output < previous.output;

        if reset {
            Increment {
                input_bytes: current.input,
                output_bytes: current.output,
                total_bytes: current.total,
            }
        } else {
            Increment {
                input_bytes: current.input - previous.input,
                output_bytes: current.output - previous.output,
                total_bytes: current.total - previous.total,
            }
        }
    }

    fn chunk(
        &self,
        increments: BTreeMap<String, Increment>,
        mut working: HashMap<String, Cumulative>,
    ) -> Vec<PendingBatch> {
        let mut batches = Vec::new();
        let mut batch = PendingBatch::default();

        for (user_id, increment) in increments {
            let baseline = working
                .remove(&user_id)
                .expect("working baseline exists for every increment key");
            batch.increments.insert(user_id.clone(), increment);
            batch.baselines.insert(user_id, baseline);

            if batch.increments.len() >= self.batch_size {
                batches.push(std::mem::take(&mut batch));
            }
        }

        if !batch.is_empty() {
            batches.push(batch);
        }
        batches
    }
}
