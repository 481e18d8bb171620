//! Segments: kernel chains fired on one thread.
//!
//! A segment owns its kernels and the internal edges between them, both
//! backed by one aligned arena laid out in chain order. Adjacent segments
//! share a [`BoundaryLink`] holding the flags of the backpressure protocol:
//!
//! - after kernel 0 fires, `read_count` grows; at `ceil(T/2)` the segment
//!   clears its own readable flag and makes the previous segment writable;
//! - after the last kernel fires, `write_count` grows; at `ceil(T/2)` the
//!   segment clears its own writable flag and makes the next segment readable;
//! - each counter wraps to 0 once it reaches its threshold.
//!
//! The flags are the only state one segment touches in another.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::edge::Edge;
use crate::error::{Result, RingPipeError};
use crate::kernel::{ChainLinks, Flow, Kernel, KernelSpec, Inlet, Outlet};
use crate::memory::ArenaLayout;
use crate::queue::QueueState;
use crate::types::{EdgeId, KernelId, SegmentId};

/// Backpressure flags shared by two adjacent segments.
///
/// Every access is `SeqCst`: each side clears its own flag before setting
/// the other's, and a total order over the four stores guarantees that at
/// least one side is always enabled.
#[derive(Debug)]
pub struct BoundaryLink {
    upstream_writable: AtomicBool,
    downstream_readable: AtomicBool,
    upstream_done: AtomicBool,
    downstream_done: AtomicBool,
}

impl Default for BoundaryLink {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryLink {
    /// Upstream may write, downstream waits for data.
    pub fn new() -> Self {
        Self {
            upstream_writable: AtomicBool::new(true),
            downstream_readable: AtomicBool::new(false),
            upstream_done: AtomicBool::new(false),
            downstream_done: AtomicBool::new(false),
        }
    }

    /// Previous segment's `write_buf_fireable`.
    pub fn upstream_writable(&self) -> bool {
        self.upstream_writable.load(Ordering::SeqCst)
    }

    /// Next segment's `read_buf_fireable`.
    pub fn downstream_readable(&self) -> bool {
        self.downstream_readable.load(Ordering::SeqCst)
    }

    /// Set the previous segment's writable flag.
    pub fn set_upstream_writable(&self, value: bool) {
        self.upstream_writable.store(value, Ordering::SeqCst);
    }

    /// Set the next segment's readable flag.
    pub fn set_downstream_readable(&self, value: bool) {
        self.downstream_readable.store(value, Ordering::SeqCst);
    }

    /// Check if the previous segment has finished.
    pub fn is_upstream_done(&self) -> bool {
        self.upstream_done.load(Ordering::SeqCst)
    }

    /// Check if the next segment has finished.
    pub fn is_downstream_done(&self) -> bool {
        self.downstream_done.load(Ordering::SeqCst)
    }

    fn mark_upstream_done(&self) {
        self.upstream_done.store(true, Ordering::SeqCst);
    }

    fn mark_downstream_done(&self) {
        self.downstream_done.store(true, Ordering::SeqCst);
    }
}

/// Internal edge between two consecutive kernels of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEdge {
    /// Edge id.
    pub id: EdgeId,
    /// Capacity in elements.
    pub depth: usize,
    /// Bytes per element.
    pub width: usize,
    /// Use an atomic queue even though both ends share a thread.
    pub cross_thread: bool,
}

impl ChainEdge {
    /// Create a same-thread internal edge.
    pub fn new(id: EdgeId, depth: usize, width: usize) -> Self {
        Self {
            id,
            depth,
            width,
            cross_thread: false,
        }
    }
}

/// Builder for a [`Segment`].
pub struct SegmentBuilder {
    id: SegmentId,
    kernels: Vec<KernelSpec>,
    edges: Vec<ChainEdge>,
    prev: Option<Arc<BoundaryLink>>,
    next: Option<Arc<BoundaryLink>>,
}

impl SegmentBuilder {
    /// Create an empty builder.
    pub fn new(id: SegmentId) -> Self {
        Self {
            id,
            kernels: Vec::new(),
            edges: Vec::new(),
            prev: None,
            next: None,
        }
    }

    /// Append a kernel to the chain.
    pub fn kernel(mut self, spec: KernelSpec) -> Self {
        self.kernels.push(spec);
        self
    }

    /// Append the internal edge from the last kernel to the next one.
    pub fn edge(mut self, edge: ChainEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Link to the previous segment.
    pub fn prev(mut self, link: Arc<BoundaryLink>) -> Self {
        self.prev = Some(link);
        self
    }

    /// Link to the next segment.
    pub fn next(mut self, link: Arc<BoundaryLink>) -> Self {
        self.next = Some(link);
        self
    }

    fn check_chain(&self) -> Result<()> {
        let n = self.kernels.len();
        if n == 0 {
            return Err(RingPipeError::InvalidTopology(format!(
                "segment {} has no kernels",
                self.id
            )));
        }
        if self.edges.len() != n - 1 {
            return Err(RingPipeError::InvalidTopology(format!(
                "segment {} has {} kernels but {} internal edges",
                self.id,
                n,
                self.edges.len()
            )));
        }

        for (pos, spec) in self.kernels.iter().enumerate() {
            let chained_in = spec.inlets().iter().any(|i| matches!(i, Inlet::Chained));
            let chained_out = spec.outlets().iter().any(|o| matches!(o, Outlet::Chained));
            if chained_in != (pos > 0) || chained_out != (pos + 1 < n) {
                return Err(RingPipeError::InvalidTopology(format!(
                    "kernel {} at position {pos} of segment {} has mismatched chained ports",
                    spec.id(),
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Lay out the arena, build kernels and edges, and compute thresholds.
    pub fn build(self) -> Result<Segment> {
        self.check_chain()?;

        let mut layout = ArenaLayout::new();
        for (pos, spec) in self.kernels.iter().enumerate() {
            layout.push(spec.state_bytes())?;
            if let Some(edge) = self.edges.get(pos) {
                let bytes = edge.depth.checked_mul(edge.width).ok_or_else(|| {
                    RingPipeError::InvalidConfig(format!("edge {} size overflows", edge.id))
                })?;
                layout.push(bytes)?;
            }
        }
        let arena_bytes = layout.total_size();
        let mut regions = layout.allocate()?.into_iter();
        let mut next_region = || {
            regions
                .next()
                .ok_or_else(|| RingPipeError::InvalidConfig("arena layout mismatch".to_string()))
        };

        let ids: Vec<KernelId> = self.kernels.iter().map(KernelSpec::id).collect();
        let mut kernels = Vec::with_capacity(self.kernels.len());
        let mut edges = Vec::with_capacity(self.edges.len());
        for (pos, spec) in self.kernels.into_iter().enumerate() {
            kernels.push(spec.into_kernel(next_region()?)?);
            if let Some(chain) = self.edges.get(pos) {
                edges.push(Edge::with_region(
                    chain.id,
                    ids[pos],
                    ids[pos + 1],
                    chain.depth,
                    chain.width,
                    chain.cross_thread,
                    next_region()?,
                )?);
            }
        }

        let segment = Segment::assemble(self.id, kernels, edges, self.prev, self.next);
        if cfg!(debug_assertions) {
            segment.check()?;
        }
        debug!(
            segment = %segment.id,
            kernels = segment.kernels.len(),
            arena_bytes,
            input_rate = segment.input_rate,
            output_rate = segment.output_rate,
            read_threshold = segment.read_count_threshold,
            write_threshold = segment.write_count_threshold,
            max_fires = segment.max_fires,
            "segment built"
        );
        Ok(segment)
    }
}

fn links_at(edges: &mut [Edge], position: usize) -> ChainLinks<'_> {
    let (before, after) = edges.split_at_mut(position);
    ChainLinks::new(before.last_mut(), after.first_mut())
}

/// An ordered chain of kernels fired on one thread.
#[derive(Debug)]
pub struct Segment {
    id: SegmentId,
    kernels: Vec<Kernel>,
    /// `edges[j]` connects `kernels[j]` to `kernels[j + 1]`.
    edges: Vec<Edge>,
    prev: Option<Arc<BoundaryLink>>,
    next: Option<Arc<BoundaryLink>>,

    input_rate: usize,
    output_rate: f64,
    in_buf_size: usize,
    out_buf_size: usize,
    max_fires: usize,

    read_count: usize,
    read_count_threshold: usize,
    write_count: usize,
    write_count_threshold: usize,

    fire_counts: Vec<u64>,
    firings: u64,
    initialized: bool,
    finished: bool,
}

impl Segment {
    fn assemble(
        id: SegmentId,
        kernels: Vec<Kernel>,
        edges: Vec<Edge>,
        prev: Option<Arc<BoundaryLink>>,
        next: Option<Arc<BoundaryLink>>,
    ) -> Self {
        let none = ChainLinks::none();
        let (input_rate, in_buf_size, output_rate, out_buf_size, last_outrate) = {
            let first = &kernels[0];
            let last = &kernels[kernels.len() - 1];

            let input_rate = if first.num_inputs() > 0 {
                first.inrate()
            } else {
                0
            };
            let produced: f64 = kernels.iter().map(|k| k.outrate() as f64).product();
            let consumed: f64 = kernels[1..].iter().map(|k| k.inrate() as f64).product();
            let last_outrate = if last.num_outputs() > 0 {
                last.outrate()
            } else {
                0
            };

            (
                input_rate,
                first.input_depth(0, &none),
                produced / consumed,
                last.output_depth(0, &none),
                last_outrate,
            )
        };

        let read_count_threshold = if input_rate > 0 && in_buf_size > 0 {
            (in_buf_size / input_rate).max(1)
        } else {
            0
        };
        let write_count_threshold = if last_outrate > 0 && out_buf_size > 0 {
            (out_buf_size / last_outrate).max(1)
        } else {
            0
        };

        let reads = (read_count_threshold > 0).then(|| in_buf_size / input_rate);
        let writes = (out_buf_size > 0 && output_rate > 0.0)
            .then(|| (out_buf_size as f64 / output_rate) as usize);
        let max_fires = match (reads, writes) {
            (Some(r), Some(w)) => r.min(w),
            (Some(r), None) => r,
            (None, Some(w)) => w,
            (None, None) => 0,
        };

        let fire_counts = vec![0; kernels.len()];
        Self {
            id,
            kernels,
            edges,
            prev,
            next,
            input_rate,
            output_rate,
            in_buf_size,
            out_buf_size,
            max_fires,
            read_count: 0,
            read_count_threshold,
            write_count: 0,
            write_count_threshold,
            fire_counts,
            firings: 0,
            initialized: false,
            finished: false,
        }
    }

    /// Get the segment id.
    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Get number of kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Check if the segment has no kernels. Never true for a built segment.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Get the kernels in chain order.
    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    /// Get the internal edges in chain order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Get the link to the previous segment.
    pub fn prev_link(&self) -> Option<&Arc<BoundaryLink>> {
        self.prev.as_ref()
    }

    /// Get the link to the next segment.
    pub fn next_link(&self) -> Option<&Arc<BoundaryLink>> {
        self.next.as_ref()
    }

    /// Elements consumed by kernel 0 per firing; 0 without an input.
    pub fn input_rate(&self) -> usize {
        self.input_rate
    }

    /// Elements produced on the output per firing of kernel 0.
    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    /// Depth of kernel 0's first input queue.
    pub fn in_buf_size(&self) -> usize {
        self.in_buf_size
    }

    /// Depth of the last kernel's first output queue.
    pub fn out_buf_size(&self) -> usize {
        self.out_buf_size
    }

    /// Firings one full boundary buffer allows.
    pub fn max_fires(&self) -> usize {
        self.max_fires
    }

    /// Get the input-side counter.
    pub fn read_count(&self) -> usize {
        self.read_count
    }

    /// Get the input-side threshold; 0 without an input.
    pub fn read_count_threshold(&self) -> usize {
        self.read_count_threshold
    }

    /// Get the output-side counter.
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    /// Get the output-side threshold; 0 without an output.
    pub fn write_count_threshold(&self) -> usize {
        self.write_count_threshold
    }

    /// Total estimated cost of firing every kernel once.
    pub fn runtime(&self) -> u64 {
        self.kernels.iter().map(Kernel::cost).sum()
    }

    /// Total kernel state in bytes.
    pub fn state(&self) -> usize {
        self.kernels.iter().map(Kernel::state_bytes).sum()
    }

    /// Kernel firings, indexed by chain position.
    pub fn fire_counts(&self) -> &[u64] {
        &self.fire_counts
    }

    /// Firings of one kernel.
    pub fn fire_count(&self, kernel: KernelId) -> Option<u64> {
        self.kernels
            .iter()
            .position(|k| k.id() == kernel)
            .map(|pos| self.fire_counts[pos])
    }

    /// Number of `fire` calls that fired at least one kernel.
    pub fn firings(&self) -> u64 {
        self.firings
    }

    /// Check if every kernel has finished.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Readable flag; true without a previous segment or once it is done.
    pub fn read_buf_fireable(&self) -> bool {
        self.prev
            .as_ref()
            .map_or(true, |l| l.downstream_readable() || l.is_upstream_done())
    }

    /// Writable flag; true without a next segment or once it is done.
    pub fn write_buf_fireable(&self) -> bool {
        self.next
            .as_ref()
            .map_or(true, |l| l.upstream_writable() || l.is_downstream_done())
    }

    /// Check if the scheduler should call [`fire`](Self::fire).
    ///
    /// Head segments follow their writable flag, tail segments their
    /// readable flag, middle segments both, isolated segments neither.
    pub fn is_fireable(&self) -> bool {
        !self.finished && self.read_buf_fireable() && self.write_buf_fireable()
    }

    /// Firings the boundary queues currently allow, `None` when unconstrained.
    pub fn fire_iterations(&mut self) -> Option<usize> {
        let last = self.kernels.len() - 1;
        let reads = (self.input_rate > 0).then(|| {
            let links = links_at(&mut self.edges, 0);
            self.kernels[0].get_available(0, &links) / self.input_rate
        });
        let outrate = self.kernels[last].outrate();
        let writes = (self.write_count_threshold > 0).then(|| {
            let links = links_at(&mut self.edges, last);
            self.kernels[last].get_free(0, &links) / outrate
        });

        match (reads, writes) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    /// Check the cookie and buffer size of every internal edge.
    pub fn check(&self) -> Result<()> {
        match self.edges.iter().find(|e| !e.is_valid()) {
            Some(edge) => {
                error!(segment = %self.id, edge = %edge.id(), "internal queue failed its check");
                Err(RingPipeError::InvalidQueue(edge.id()))
            }
            None => Ok(()),
        }
    }

    /// Run every kernel's init hook. Called once before the first firing.
    pub fn init(&mut self) {
        if !self.initialized {
            self.initialized = true;
            self.kernels.iter_mut().for_each(Kernel::init);
        }
    }

    /// Check if the kernel at `position` could fire now.
    pub fn kernel_fireable(&mut self, position: usize) -> bool {
        let links = links_at(&mut self.edges, position);
        self.kernels[position].fireable(&links)
    }

    fn run_kernel(&mut self, position: usize) -> Result<()> {
        let mut links = links_at(&mut self.edges, position);
        let kernel = &mut self.kernels[position];
        match kernel.run(&mut links) {
            Ok(flow) => {
                self.fire_counts[position] += 1;
                if flow == Flow::Finish {
                    kernel.finish(&mut links);
                }
                Ok(())
            }
            Err(err) => {
                error!(
                    segment = %self.id,
                    kernel = %kernel.id(),
                    error = %err,
                    "kernel firing failed"
                );
                Err(err)
            }
        }
    }

    /// Count a firing of kernel 0 and notify the previous segment.
    pub fn update_prev_seg(&mut self) {
        let threshold = self.read_count_threshold;
        if threshold == 0 {
            return;
        }

        self.read_count += 1;
        if self.read_count == threshold.div_ceil(2) || threshold == 1 {
            if let Some(link) = &self.prev {
                link.set_downstream_readable(false);
                link.set_upstream_writable(true);
            }
        }
        if self.read_count >= threshold {
            self.read_count = 0;
        }
    }

    /// Count a firing of the last kernel and notify the next segment.
    pub fn update_next_seg(&mut self) {
        let threshold = self.write_count_threshold;
        if threshold == 0 {
            return;
        }

        self.write_count += 1;
        if self.write_count == threshold.div_ceil(2) || threshold == 1 {
            if let Some(link) = &self.next {
                link.set_upstream_writable(false);
                link.set_downstream_readable(true);
            }
        }
        if self.write_count >= threshold {
            self.write_count = 0;
        }
    }

    /// Kernel 0 did not fire: wake the previous segment if it is input starved.
    fn wake_prev(&mut self) {
        let links = links_at(&mut self.edges, 0);
        let first = &self.kernels[0];
        if first.is_finished() || first.inputs_ready(&links) {
            return;
        }
        if let Some(link) = &self.prev {
            trace!(segment = %self.id, "input starved, waking previous segment");
            link.set_upstream_writable(true);
        }
    }

    /// Nothing fired: wake the next segment if the last kernel is output blocked.
    fn wake_next(&mut self) {
        let last = self.kernels.len() - 1;
        let links = links_at(&mut self.edges, last);
        let tail = &self.kernels[last];
        if tail.is_finished() || tail.outputs_ready(&links) {
            return;
        }
        if let Some(link) = &self.next {
            trace!(segment = %self.id, "output blocked, waking next segment");
            link.set_downstream_readable(true);
        }
    }

    /// Fire the chain once, returning the number of kernel firings.
    ///
    /// Kernel 0 fires at most once. The walk then moves forward from
    /// kernel 1 while kernels can fire, re-firing the last kernel in place,
    /// and steps back one kernel whenever the current one cannot fire. It
    /// ends when kernel 1 cannot fire.
    ///
    /// A stalled pass hands the turn to whichever neighbour can unblock it:
    /// the previous segment when kernel 0 lacks input, the next segment when
    /// the last kernel lacks output space. Both may be woken at once.
    pub fn fire(&mut self) -> Result<usize> {
        if self.finished {
            return Ok(0);
        }
        self.init();

        let n = self.kernels.len();
        let mut fired = 0;

        if self.kernel_fireable(0) {
            self.run_kernel(0)?;
            fired += 1;
            self.update_prev_seg();
            if n == 1 {
                self.update_next_seg();
            }
        } else {
            self.wake_prev();
        }

        if n > 1 {
            let mut idx = 1;
            loop {
                if self.kernel_fireable(idx) {
                    self.run_kernel(idx)?;
                    fired += 1;
                    if idx == n - 1 {
                        self.update_next_seg();
                    } else {
                        idx += 1;
                    }
                } else if idx == 1 {
                    break;
                } else {
                    idx -= 1;
                }
            }
        }

        if fired > 0 {
            self.firings += 1;
        } else {
            self.wake_next();
        }
        self.refresh_finished();
        Ok(fired)
    }

    fn refresh_finished(&mut self) {
        for position in 0..self.kernels.len() {
            let mut links = links_at(&mut self.edges, position);
            self.kernels[position].check_finished(&mut links);
        }

        if self.kernels.iter().all(Kernel::is_finished) {
            self.finished = true;
            // Release both neighbours so they can drain and stop.
            if let Some(link) = &self.prev {
                link.mark_downstream_done();
            }
            if let Some(link) = &self.next {
                link.mark_upstream_done();
            }
            debug!(segment = %self.id, firings = self.firings, "segment finished");
        }
    }

    /// Finish every kernel now, closing all of their queues.
    pub fn shutdown(&mut self) {
        for position in 0..self.kernels.len() {
            let mut links = links_at(&mut self.edges, position);
            self.kernels[position].finish(&mut links);
        }
        self.refresh_finished();
    }
}
