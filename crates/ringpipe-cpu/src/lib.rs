//! # RingPipe CPU
//!
//! Native-thread executor for ringpipe pipelines.
//!
//! Every segment gets its own named thread that polls the segment's
//! backpressure flags and fires it whenever it is fireable. Segments only
//! talk through their boundary queues and link flags, so no thread ever
//! holds a lock while a kernel runs.
//!
//! ## Example
//!
//! ```
//! use ringpipe_core::prelude::*;
//! use ringpipe_cpu::CpuExecutor;
//!
//! let mut graph = PipelineGraph::new();
//! let source = graph.add_kernel(KernelDescriptor::new(0, 1));
//! let sink = graph.add_kernel(KernelDescriptor::new(1, 0));
//! graph.add_edge(EdgeDescriptor::new(source, sink, 8, 4).cross_thread(true));
//! graph.add_segment([source]);
//! graph.add_segment([sink]);
//!
//! let pipeline = Pipeline::build(&graph, |desc| -> Box<dyn KernelLogic> {
//!     if desc.id == source {
//!         let mut left = 100;
//!         Box::new(FnLogic::new(move |_: &mut Firing<'_>| {
//!             left -= 1;
//!             if left == 0 { Flow::Finish } else { Flow::Continue }
//!         }))
//!     } else {
//!         Box::new(Idle)
//!     }
//! })?;
//!
//! let report = CpuExecutor::default().run(pipeline)?;
//! assert_eq!(report.kernel_firings(), 200);
//! # Ok::<(), RingPipeError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod executor;

pub use executor::{CpuExecutor, ExecutorMetrics, RunReport, SegmentReport};
