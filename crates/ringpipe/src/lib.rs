//! # RingPipe
//!
//! Streaming dataflow execution core for Rust.
//!
//! A pipeline is a chain of kernels with fixed per-firing input and output
//! rates. Kernels are connected by fixed-capacity ring-buffer edges that hand
//! out contiguous reservations, and grouped into segments that a scheduler
//! fires on one thread. Adjacent segments only exchange two backpressure
//! flags, so memory stays bounded without locks.
//!
//! ## Features
//!
//! - **Contiguous reservations**: a kernel always sees its whole input and
//!   output window as plain slices
//! - **Lock-free boundaries**: single-producer single-consumer atomic queues
//!   between segments
//! - **Arena layout**: a segment's kernel state and internal edges share one
//!   cache-aligned allocation
//! - **Hysteresis backpressure**: segments toggle their neighbours only every
//!   half buffer, not on every element
//!
//! ## Quick Start
//!
//! ```
//! use ringpipe::prelude::*;
//!
//! // [source] => [sink]
//! let mut graph = PipelineGraph::new();
//! let source = graph.add_kernel(KernelDescriptor::new(0, 2));
//! let sink = graph.add_kernel(KernelDescriptor::new(2, 0));
//! graph.add_edge(EdgeDescriptor::new(source, sink, 16, 8).cross_thread(true));
//! graph.add_segment([source]);
//! graph.add_segment([sink]);
//!
//! let pipeline = Pipeline::build(&graph, |desc| -> Box<dyn KernelLogic> {
//!     if desc.id == source {
//!         let mut next = 0u64;
//!         Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
//!             for slot in firing.outputs.get(0).unwrap().chunks_exact_mut(8) {
//!                 next += 1;
//!                 slot.copy_from_slice(&next.to_le_bytes());
//!             }
//!             if next >= 64 { Flow::Finish } else { Flow::Continue }
//!         }))
//!     } else {
//!         Box::new(Idle)
//!     }
//! })?;
//!
//! let report = CpuExecutor::default().run(pipeline)?;
//! assert!(report.all_finished());
//! # Ok::<(), RingPipeError>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//!   segment 0 (thread)              segment 1 (thread)
//!  ┌──────────────────────┐        ┌──────────────────────┐
//!  │ [k0] -> [k1] -> [k2] │ =====> │ [k3] -> [k4]         │
//!  │   arena: state+edges │  SPSC  │   arena: state+edges │
//!  └──────────────────────┘        └──────────────────────┘
//!              ^    upstream_writable / downstream_readable    ^
//!              └──────────────── BoundaryLink ─────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use ringpipe_core::*;

// Re-export the executor
pub use ringpipe_cpu::{CpuExecutor, ExecutorMetrics, RunReport, SegmentReport};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use ringpipe_core::prelude::*;
    pub use ringpipe_cpu::{CpuExecutor, ExecutorMetrics, RunReport, SegmentReport};
}

/// Build a pipeline from a TOML document and run it to completion.
///
/// The factory is called with each kernel's descriptor and the `name` the
/// document gave it.
pub fn run_config<F>(
    config: &ringpipe_core::config::PipelineConfig,
    mut factory: F,
) -> Result<RunReport>
where
    F: FnMut(&ringpipe_core::graph::KernelDescriptor, Option<&str>) -> Box<dyn KernelLogic>,
{
    let pipeline = Pipeline::from_config(config, |desc| {
        factory(desc, config.kernel_name(desc.id))
    })?;
    CpuExecutor::new(config.executor.clone()).run(pipeline)
}
