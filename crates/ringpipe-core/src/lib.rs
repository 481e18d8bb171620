//! # RingPipe Core
//!
//! Queues, kernels and segments for a streaming dataflow pipeline.
//!
//! Kernels with fixed input and output rates are connected by fixed-capacity
//! ring-buffer edges and grouped into segments, ordered chains that a
//! scheduler fires on one thread. Adjacent segments exchange backpressure
//! through a pair of shared flags, so memory stays bounded and no stage
//! ever blocks on a lock.
//!
//! ## Core Abstractions
//!
//! - [`RingQueue`] / [`AtomicRingQueue`] - contiguous-reservation ring buffers
//! - [`Edge`] - one queue between two kernels
//! - [`Kernel`] - rate-driven computational node with a [`KernelLogic`]
//! - [`Segment`] - chain of kernels sharing one arena, with the firing loop
//! - [`PipelineGraph`] / [`Pipeline`] - description and runtime form
//!
//! ## Example
//!
//! ```
//! use ringpipe_core::prelude::*;
//!
//! let mut queue = RingQueue::new(8, 4).unwrap();
//! let buf = queue.start_write(2).unwrap();
//! buf.copy_from_slice(&[1, 0, 0, 0, 2, 0, 0, 0]);
//! queue.finish_write(2);
//!
//! assert_eq!(queue.used(), 2);
//! assert_eq!(queue.start_read().len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod atomic;
pub mod config;
pub mod edge;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod ring;
pub mod segment;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::atomic::{AtomicRingQueue, RingConsumer, RingProducer};
    pub use crate::config::{ExecutorConfig, KernelConfig, PipelineConfig};
    pub use crate::edge::{Edge, EdgeQueue};
    pub use crate::error::{Result, RingPipeError};
    pub use crate::graph::{
        EdgeDescriptor, EdgePlacement, KernelDescriptor, PipelineGraph, SegmentDescriptor,
    };
    pub use crate::kernel::{
        ChainLinks, Firing, Flow, FnLogic, Idle, Inlet, Inputs, Kernel, KernelLogic, KernelSpec,
        Outlet, Outputs,
    };
    pub use crate::memory::{ArenaLayout, ArenaRegion};
    pub use crate::pipeline::Pipeline;
    pub use crate::queue::{QueueReader, QueueState, QueueWriter, ReadView};
    pub use crate::ring::RingQueue;
    pub use crate::segment::{BoundaryLink, ChainEdge, Segment, SegmentBuilder};
    pub use crate::types::{EdgeId, KernelId, SegmentId};
}

// Re-exports for convenience
pub use atomic::{AtomicRingQueue, RingConsumer, RingProducer};
pub use edge::Edge;
pub use error::{Result, RingPipeError};
pub use graph::PipelineGraph;
pub use kernel::{Flow, Kernel, KernelLogic, KernelSpec};
pub use pipeline::Pipeline;
pub use queue::{QueueReader, QueueState, QueueWriter};
pub use ring::RingQueue;
pub use segment::Segment;
