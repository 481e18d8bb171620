//! Pipeline and executor configuration.
//!
//! A pipeline can be described in TOML:
//!
//! ```toml
//! [executor]
//! thread_name_prefix = "stage"
//!
//! [[kernel]]
//! id = 0
//! name = "source"
//! inrate = 0
//! outrate = 4
//!
//! [[kernel]]
//! id = 1
//! name = "sink"
//! inrate = 4
//! outrate = 0
//!
//! [[edge]]
//! source = 0
//! dest = 1
//! depth = 16
//! width = 8
//! cross_thread = true
//!
//! [[segment]]
//! kernels = [0]
//!
//! [[segment]]
//! kernels = [1]
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RingPipeError};
use crate::graph::{EdgeDescriptor, KernelDescriptor, PipelineGraph, SegmentDescriptor};
use crate::types::KernelId;

/// Kernel entry of a pipeline document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Dense kernel id.
    pub id: KernelId,
    /// Name used to pick the kernel's logic.
    #[serde(default)]
    pub name: Option<String>,
    /// Elements consumed per firing on every input port.
    #[serde(default)]
    pub inrate: usize,
    /// Elements produced per firing on every output port.
    #[serde(default)]
    pub outrate: usize,
    /// Bytes of private state.
    #[serde(default)]
    pub state_bytes: usize,
    /// Estimated cost of one firing.
    #[serde(default)]
    pub cost: u64,
}

impl KernelConfig {
    /// Convert to a graph descriptor.
    pub fn descriptor(&self) -> KernelDescriptor {
        KernelDescriptor {
            id: self.id,
            inrate: self.inrate,
            outrate: self.outrate,
            state_bytes: self.state_bytes,
            cost: self.cost,
        }
    }
}

/// A whole pipeline document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Kernels, any order.
    #[serde(default, rename = "kernel")]
    pub kernels: Vec<KernelConfig>,

    /// Edges; order defines port order.
    #[serde(default, rename = "edge")]
    pub edges: Vec<EdgeDescriptor>,

    /// Segments in pipeline order.
    #[serde(default, rename = "segment")]
    pub segments: Vec<SegmentDescriptor>,
}

impl PipelineConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.executor.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Name of a kernel, if the document gave one.
    pub fn kernel_name(&self, id: KernelId) -> Option<&str> {
        self.kernels
            .iter()
            .find(|k| k.id == id)
            .and_then(|k| k.name.as_deref())
    }

    /// Build and validate the pipeline graph.
    pub fn to_graph(&self) -> Result<PipelineGraph> {
        let mut kernels: Vec<KernelDescriptor> =
            self.kernels.iter().map(KernelConfig::descriptor).collect();
        kernels.sort_by_key(|k| k.id);

        PipelineGraph::from_parts(kernels, self.edges.clone(), self.segments.clone())
    }
}

/// Thread-per-segment executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Segment threads are named `{prefix}-{segment}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Stack size of segment threads; platform default when unset.
    #[serde(default)]
    pub stack_size: Option<usize>,

    /// Idle polls that spin or yield before a segment thread starts sleeping.
    #[serde(default = "default_idle_spins")]
    pub idle_spins: u32,

    /// Sleep between idle polls once the spin budget is spent, in microseconds.
    /// 0 keeps yielding instead.
    #[serde(default = "default_idle_sleep_us")]
    pub idle_sleep_us: u64,
}

fn default_thread_name_prefix() -> String {
    "ringpipe-seg".to_string()
}

fn default_idle_spins() -> u32 {
    1024
}

fn default_idle_sleep_us() -> u64 {
    50
}

const MIN_STACK_SIZE: usize = 16 * 1024;

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: default_thread_name_prefix(),
            stack_size: None,
            idle_spins: default_idle_spins(),
            idle_sleep_us: default_idle_sleep_us(),
        }
    }
}

impl ExecutorConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the segment thread stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Set the idle spin budget.
    pub fn with_idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    /// Set the idle sleep.
    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep_us = sleep.as_micros().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Get the idle sleep.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }

    /// Check the values.
    pub fn validate(&self) -> Result<()> {
        if self.thread_name_prefix.is_empty() {
            return Err(RingPipeError::InvalidConfig(
                "thread_name_prefix must not be empty".to_string(),
            ));
        }
        if let Some(size) = self.stack_size {
            if size < MIN_STACK_SIZE {
                return Err(RingPipeError::InvalidConfig(format!(
                    "stack_size {size} is below the minimum of {MIN_STACK_SIZE} bytes"
                )));
            }
        }
        Ok(())
    }
}
