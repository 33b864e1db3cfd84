//! Compiler and executor options
//!
//! Options come from three places, later ones winning:
//! defaults, a JSON document ([`CompilerOptions::from_json_str`]) and
//! `GRAPHFORGE_*` environment variables ([`CompilerOptions::overlay_env`]).

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backend::builtin::BUILTIN_BACKEND_ID;
use crate::error::{ForgeError, ForgeResult};
use crate::ir::{OpCode, OperationId};

/// How a compiled subgraph runs its sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One sequence after another, in compile order
    #[default]
    Linear,
    /// Sequences grouped into dependency levels, each level on the rayon pool
    Parallel,
}

impl ExecutionMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Some(ExecutionMode::Linear),
            "parallel" | "dataflow" => Some(ExecutionMode::Parallel),
            _ => None,
        }
    }
}

/// Manual backend assignment
///
/// Lookup precedence is operation index, then opcode, then `backend_for_all`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualSchedulerOptions {
    pub backend_for_all: Option<String>,
    /// Opcode name (as printed by `OpCode`) to backend id
    pub opcode_to_backend: BTreeMap<String, String>,
    /// Operation index to backend id
    pub index_to_backend: BTreeMap<usize, String>,
}

impl ManualSchedulerOptions {
    /// Resolve the backend for one operation, if any rule names it.
    pub fn backend_for(&self, index: OperationId, code: OpCode) -> Option<&str> {
        if let Some(id) = self.index_to_backend.get(&index.0) {
            return Some(id);
        }
        if let Some(id) = self.opcode_to_backend.get(code.name()) {
            return Some(id);
        }
        self.backend_for_all.as_deref()
    }
}

/// Options consumed by [`crate::compiler::Compiler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Backends available to the scheduler, in preference order
    pub backend_list: Vec<String>,
    pub manual_scheduler: ManualSchedulerOptions,
    pub executor: ExecutionMode,
    /// Let the tensor planner alias Concat inputs into the output buffer
    pub enable_sub_tensors: bool,
    /// Time every sequence with its backend's timer
    pub profile: bool,
    /// Worker count for [`ExecutionMode::Parallel`]; rayon's default when unset
    pub parallel_threads: Option<usize>,
    /// Compute backends that accept Float16 operands and the fp16
    /// conversion operations
    pub fp16_backends: Vec<String>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            backend_list: vec!["gpu_cl".to_string()],
            manual_scheduler: ManualSchedulerOptions::default(),
            executor: ExecutionMode::Linear,
            enable_sub_tensors: true,
            profile: false,
            parallel_threads: None,
            fp16_backends: Vec::new(),
        }
    }
}

const EXECUTOR_ENV: &str = "GRAPHFORGE_EXECUTOR";
const BACKENDS_ENV: &str = "GRAPHFORGE_BACKENDS";
const PROFILE_ENV: &str = "GRAPHFORGE_PROFILE";
const SUBTENSOR_ENV: &str = "GRAPHFORGE_SUBTENSOR";
const FP16_ENV: &str = "GRAPHFORGE_FP16";

impl CompilerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the environment.
    ///
    /// - `GRAPHFORGE_EXECUTOR`: "linear" or "parallel"
    /// - `GRAPHFORGE_BACKENDS`: semicolon-separated backend ids
    /// - `GRAPHFORGE_PROFILE`: 0/1
    /// - `GRAPHFORGE_SUBTENSOR`: 0/1
    /// - `GRAPHFORGE_FP16`: semicolon-separated backend ids with Float16 on
    pub fn from_env() -> Self {
        Self::default().overlay_env()
    }

    /// Apply any `GRAPHFORGE_*` variables on top of `self`. Unparsable
    /// values are ignored.
    pub fn overlay_env(mut self) -> Self {
        if let Some(mode) = env::var(EXECUTOR_ENV)
            .ok()
            .and_then(|s| ExecutionMode::from_str(&s))
        {
            self.executor = mode;
        }

        if let Ok(list) = env::var(BACKENDS_ENV) {
            let backends = parse_list(&list);
            if !backends.is_empty() {
                self.backend_list = backends;
            }
        }

        if let Ok(list) = env::var(FP16_ENV) {
            self.fp16_backends = parse_list(&list);
        }

        if let Ok(profile) = env::var(PROFILE_ENV) {
            self.profile = parse_flag(&profile);
        }

        if let Ok(subtensor) = env::var(SUBTENSOR_ENV) {
            self.enable_sub_tensors = parse_flag(&subtensor);
        }

        self
    }

    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        let options: CompilerOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ForgeResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_backends<I, S>(mut self, backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend_list = backends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_backend_for_all(mut self, backend: impl Into<String>) -> Self {
        self.manual_scheduler.backend_for_all = Some(backend.into());
        self
    }

    pub fn with_opcode_backend(mut self, code: OpCode, backend: impl Into<String>) -> Self {
        self.manual_scheduler
            .opcode_to_backend
            .insert(code.name().to_string(), backend.into());
        self
    }

    pub fn with_index_backend(mut self, index: OperationId, backend: impl Into<String>) -> Self {
        self.manual_scheduler
            .index_to_backend
            .insert(index.0, backend.into());
        self
    }

    pub fn with_executor(mut self, mode: ExecutionMode) -> Self {
        self.executor = mode;
        self
    }

    pub fn with_sub_tensors(mut self, enabled: bool) -> Self {
        self.enable_sub_tensors = enabled;
        self
    }

    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }

    pub fn with_parallel_threads(mut self, threads: usize) -> Self {
        self.parallel_threads = Some(threads);
        self
    }

    pub fn with_fp16_backend(mut self, backend: impl Into<String>) -> Self {
        let backend = backend.into();
        if !self.fp16_backends.contains(&backend) {
            self.fp16_backends.push(backend);
        }
        self
    }

    pub fn fp16_enabled(&self, backend: &str) -> bool {
        self.fp16_backends.iter().any(|id| id == backend)
    }

    /// Backend that operations default to when no manual rule applies.
    pub fn default_backend(&self) -> &str {
        self.manual_scheduler
            .backend_for_all
            .as_deref()
            .or_else(|| self.backend_list.first().map(String::as_str))
            .unwrap_or(BUILTIN_BACKEND_ID)
    }

    /// Check internal consistency of the options
    pub fn validate(&self) -> ForgeResult<()> {
        if self.backend_list.is_empty() {
            return Err(ForgeError::InvalidConfiguration(
                "backend_list cannot be empty".to_string(),
            ));
        }
        if self.parallel_threads == Some(0) {
            return Err(ForgeError::InvalidConfiguration(
                "parallel_threads cannot be zero".to_string(),
            ));
        }
        if let Some(id) = self
            .fp16_backends
            .iter()
            .find(|id| !self.backend_list.contains(id))
        {
            return Err(ForgeError::InvalidConfiguration(format!(
                "fp16 enabled for {}, which is not in backend_list",
                id
            )));
        }
        for name in self.manual_scheduler.opcode_to_backend.keys() {
            if OpCode::from_name(name).is_none() {
                return Err(ForgeError::InvalidConfiguration(format!(
                    "unknown opcode in opcode_to_backend: {}",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v != "0" && v != "false" && v != "off" && !v.is_empty()
}
