//! One compiled subgraph: its sequences, their dependency levels and the
//! tensors bound to the graph's inputs and outputs.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backend::BackendTensor;
use crate::config::ExecutionMode;
use crate::error::{ForgeError, ForgeResult};
use crate::exec::function::{Function, FunctionSequence};
use crate::exec::io::IoDescription;
use crate::ir::{OperandId, OperandInfo};
use crate::profiling::{ExecutionProfile, SequenceProfile, Timer};

/// A generated sequence plus what it touches
pub struct CompiledSequence {
    pub backend: String,
    pub operation_count: usize,
    pub functions: FunctionSequence,
    /// Root buffers read
    pub reads: BTreeSet<OperandId>,
    /// Root buffers written
    pub writes: BTreeSet<OperandId>,
    pub timer: Box<dyn Timer>,
}

impl std::fmt::Debug for CompiledSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSequence")
            .field("backend", &self.backend)
            .field("operation_count", &self.operation_count)
            .field("functions", &self.functions)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// A graph input or output and the tensor holding it
#[derive(Debug, Clone)]
pub struct IoTensor {
    pub operand: OperandId,
    pub info: OperandInfo,
    pub tensor: Arc<BackendTensor>,
}

struct SequenceSlot {
    backend: String,
    operation_count: usize,
    functions: Mutex<FunctionSequence>,
    timer: Mutex<Box<dyn Timer>>,
}

/// Group sequences into levels: a sequence lands one level after the last
/// earlier sequence it conflicts with (read-after-write, write-after-write
/// or write-after-read). Sequences within a level touch disjoint buffers.
pub fn dependency_levels(sets: &[(BTreeSet<OperandId>, BTreeSet<OperandId>)]) -> Vec<Vec<usize>> {
    let mut level_of = vec![0usize; sets.len()];
    for i in 0..sets.len() {
        let (reads, writes) = &sets[i];
        let mut level = 0;
        for j in 0..i {
            let (earlier_reads, earlier_writes) = &sets[j];
            let conflict = !reads.is_disjoint(earlier_writes)
                || !writes.is_disjoint(earlier_writes)
                || !writes.is_disjoint(earlier_reads);
            if conflict {
                level = level.max(level_of[j] + 1);
            }
        }
        level_of[i] = level;
    }
    let depth = level_of.iter().max().map_or(0, |m| m + 1);
    let mut levels = vec![Vec::new(); depth];
    for (i, &level) in level_of.iter().enumerate() {
        levels[level].push(i);
    }
    levels
}

/// Executable form of one subgraph
pub struct CompiledSubgraph {
    sequences: Vec<SequenceSlot>,
    levels: Vec<Vec<usize>>,
    inputs: Vec<IoTensor>,
    outputs: Vec<IoTensor>,
    mode: ExecutionMode,
    pool: Option<rayon::ThreadPool>,
    profile: bool,
    last_profile: Mutex<ExecutionProfile>,
    run_lock: Mutex<()>,
}

impl CompiledSubgraph {
    pub fn new(
        sequences: Vec<CompiledSequence>,
        inputs: Vec<IoTensor>,
        outputs: Vec<IoTensor>,
        mode: ExecutionMode,
        threads: Option<usize>,
        profile: bool,
    ) -> ForgeResult<Self> {
        let sets: Vec<_> = sequences
            .iter()
            .map(|s| (s.reads.clone(), s.writes.clone()))
            .collect();
        let levels = dependency_levels(&sets);
        let pool = match mode {
            ExecutionMode::Parallel => {
                let mut builder = rayon::ThreadPoolBuilder::new();
                if let Some(n) = threads {
                    builder = builder.num_threads(n);
                }
                Some(builder.build().map_err(|e| {
                    ForgeError::InvalidConfiguration(format!("cannot build worker pool: {}", e))
                })?)
            }
            ExecutionMode::Linear => None,
        };

        let mut slots = Vec::with_capacity(sequences.len());
        for mut sequence in sequences {
            sequence.functions.prepare()?;
            slots.push(SequenceSlot {
                backend: sequence.backend,
                operation_count: sequence.operation_count,
                functions: Mutex::new(sequence.functions),
                timer: Mutex::new(sequence.timer),
            });
        }
        debug!(
            sequences = slots.len(),
            levels = levels.len(),
            mode = ?mode,
            "compiled subgraph ready"
        );
        Ok(Self {
            sequences: slots,
            levels,
            inputs,
            outputs,
            mode,
            pool,
            profile,
            last_profile: Mutex::new(ExecutionProfile::new()),
            run_lock: Mutex::new(()),
        })
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn input_info(&self, index: usize) -> ForgeResult<&OperandInfo> {
        self.inputs
            .get(index)
            .map(|io| &io.info)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no input {}", index)))
    }

    pub fn output_info(&self, index: usize) -> ForgeResult<&OperandInfo> {
        self.outputs
            .get(index)
            .map(|io| &io.info)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no output {}", index)))
    }

    pub(crate) fn input_tensor(&self, index: usize) -> ForgeResult<&Arc<BackendTensor>> {
        self.inputs
            .get(index)
            .map(|io| &io.tensor)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no input {}", index)))
    }

    pub(crate) fn output_tensor(&self, index: usize) -> ForgeResult<&Arc<BackendTensor>> {
        self.outputs
            .get(index)
            .map(|io| &io.tensor)
            .ok_or_else(|| ForgeError::InvalidIo(format!("no output {}", index)))
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    /// Sequence indices per dependency level
    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    /// Unit names of sequence `index`
    pub fn describe_sequence(&self, index: usize) -> ForgeResult<Vec<String>> {
        let slot = self
            .sequences
            .get(index)
            .ok_or_else(|| crate::invariant!("no sequence {}", index))?;
        Ok(slot.functions.lock()?.describe())
    }

    /// Timings of the last profiled run
    pub fn last_profile(&self) -> ForgeResult<ExecutionProfile> {
        Ok(self.last_profile.lock()?.clone())
    }

    /// Copy inputs in, run every sequence, copy outputs out.
    pub fn execute(&self, io: &mut IoDescription<'_>) -> ForgeResult<()> {
        let _running = self.run_lock.lock()?;
        if io.inputs.len() != self.inputs.len() || io.outputs.len() != self.outputs.len() {
            return Err(ForgeError::InvalidIo(format!(
                "expected {} inputs and {} outputs, got {} and {}",
                self.inputs.len(),
                self.outputs.len(),
                io.inputs.len(),
                io.outputs.len()
            )));
        }

        for (index, dims) in &io.input_shapes {
            let tensor = self.input_tensor(*index)?;
            if !tensor.is_dynamic() {
                if &tensor.logical_dims()? != dims {
                    return Err(ForgeError::InvalidIo(format!(
                        "input {} has a static shape {:?}, got {:?}",
                        index,
                        tensor.logical_dims()?,
                        dims
                    )));
                }
                continue;
            }
            tensor.resize(dims)?;
        }
        for (index, buffer) in io.inputs.iter().enumerate() {
            self.write_input(index, buffer)?;
        }

        self.run_sequences()?;

        for (index, buffer) in io.outputs.iter_mut().enumerate() {
            self.read_output(index, buffer)?;
        }
        Ok(())
    }

    pub(crate) fn write_input(&self, index: usize, buffer: &[u8]) -> ForgeResult<()> {
        let tensor = self.input_tensor(index)?;
        let expected = tensor.byte_size()?;
        if buffer.len() != expected {
            return Err(ForgeError::IoSizeMismatch {
                direction: "input",
                index,
                expected,
                actual: buffer.len(),
            });
        }
        tensor.write_logical_bytes(buffer)
    }

    pub(crate) fn read_output(&self, index: usize, buffer: &mut [u8]) -> ForgeResult<()> {
        let tensor = self.output_tensor(index)?;
        let bytes = tensor.read_logical_bytes()?;
        copy_output(index, &bytes, buffer, tensor.is_dynamic())
    }

    /// Run with inputs given as (logical dims, bytes) and return every
    /// output the same way. Used when models feed each other.
    pub(crate) fn execute_staged(
        &self,
        inputs: &[(Vec<usize>, &[u8])],
    ) -> ForgeResult<Vec<(Vec<usize>, Vec<u8>)>> {
        let _running = self.run_lock.lock()?;
        if inputs.len() != self.inputs.len() {
            return Err(ForgeError::InvalidIo(format!(
                "expected {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }
        for (index, (dims, bytes)) in inputs.iter().enumerate() {
            let tensor = self.input_tensor(index)?;
            if tensor.is_dynamic() {
                tensor.resize(dims)?;
            }
            self.write_input(index, bytes)?;
        }
        self.run_sequences()?;
        self.outputs
            .iter()
            .map(|io| Ok((io.tensor.logical_dims()?, io.tensor.read_logical_bytes()?)))
            .collect()
    }

    /// Run all sequences without touching I/O
    pub(crate) fn run_sequences(&self) -> ForgeResult<()> {
        let entries = match (&self.mode, &self.pool) {
            (ExecutionMode::Parallel, Some(pool)) => {
                let mut entries = Vec::new();
                for level in &self.levels {
                    let timed: Vec<Option<SequenceProfile>> = pool.install(|| {
                        level
                            .par_iter()
                            .map(|&i| self.run_one(i))
                            .collect::<ForgeResult<_>>()
                    })?;
                    entries.extend(timed.into_iter().flatten());
                }
                entries
            }
            _ => {
                let mut entries = Vec::new();
                for i in 0..self.sequences.len() {
                    entries.extend(self.run_one(i)?);
                }
                entries
            }
        };

        if self.profile {
            let mut profile = ExecutionProfile::new();
            for entry in entries {
                profile.record(entry);
            }
            info!(
                total_us = profile.total_us(),
                sequences = profile.sequences.len(),
                "execute profiled"
            );
            *self.last_profile.lock()? = profile;
        }
        Ok(())
    }

    fn run_one(&self, index: usize) -> ForgeResult<Option<SequenceProfile>> {
        let slot = self
            .sequences
            .get(index)
            .ok_or_else(|| crate::invariant!("no sequence {}", index))?;
        let mut functions = slot.functions.lock()?;
        if !self.profile {
            return functions.run().map(|_| None);
        }
        let mut timer = slot.timer.lock()?;
        timer.handle_begin();
        let result = functions.run();
        timer.handle_end();
        result?;
        let elapsed_us = match timer.elapsed_us() {
            Some(us) => us,
            None => {
                warn!(sequence = index, "timer reported no elapsed time");
                0
            }
        };
        Ok(Some(SequenceProfile {
            sequence: index,
            backend: slot.backend.clone(),
            operation_count: slot.operation_count,
            elapsed_us,
        }))
    }
}

impl std::fmt::Debug for CompiledSubgraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSubgraph")
            .field("sequences", &self.sequences.len())
            .field("levels", &self.levels)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Copy one produced output into the caller's buffer. A static output
/// needs an exact fit; a dynamic one only needs room.
pub(crate) fn copy_output(
    index: usize,
    bytes: &[u8],
    buffer: &mut [u8],
    dynamic: bool,
) -> ForgeResult<()> {
    let fits = if dynamic {
        buffer.len() >= bytes.len()
    } else {
        buffer.len() == bytes.len()
    };
    if !fits {
        return Err(ForgeError::IoSizeMismatch {
            direction: "output",
            index,
            expected: bytes.len(),
            actual: buffer.len(),
        });
    }
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[usize]) -> BTreeSet<OperandId> {
        ids.iter().map(|&i| OperandId(i)).collect()
    }

    #[test]
    fn test_independent_sequences_share_a_level() {
        let levels = dependency_levels(&[
            (set(&[0]), set(&[1])),
            (set(&[2]), set(&[3])),
            (set(&[1, 3]), set(&[4])),
        ]);
        assert_eq!(levels, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_write_after_read_orders_sequences() {
        // sequence 1 overwrites what sequence 0 still reads
        let levels = dependency_levels(&[(set(&[0]), set(&[1])), (set(&[5]), set(&[0]))]);
        assert_eq!(levels, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_empty() {
        assert!(dependency_levels(&[]).is_empty());
    }
}
