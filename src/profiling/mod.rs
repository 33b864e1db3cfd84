//! Profiling support
//!
//! - [`timer`]: the backend timer interface and a CPU implementation
//! - [`ExecutionProfile`]: per-sequence timings collected by one `execute`

pub mod timer;

pub use timer::{CpuTimer, ScopedTimer, Timer};

use serde::{Deserialize, Serialize};

/// Timing of one compiled sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceProfile {
    /// Position of the sequence in its compiled subgraph
    pub sequence: usize,
    pub backend: String,
    pub operation_count: usize,
    pub elapsed_us: u64,
}

/// Timings gathered during the most recent profiled `execute`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub sequences: Vec<SequenceProfile>,
}

impl ExecutionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entry: SequenceProfile) {
        self.sequences.push(entry);
    }

    pub fn total_us(&self) -> u64 {
        self.sequences.iter().map(|s| s.elapsed_us).sum()
    }

    /// Sum of sequence time per backend id, sorted by id
    pub fn per_backend_us(&self) -> Vec<(String, u64)> {
        let mut totals: std::collections::BTreeMap<&str, u64> = Default::default();
        for entry in &self.sequences {
            *totals.entry(entry.backend.as_str()).or_default() += entry.elapsed_us;
        }
        totals
            .into_iter()
            .map(|(backend, us)| (backend.to_string(), us))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}
