//! Pipeline graph: kernel, edge and segment descriptors addressed by dense ids.
//!
//! The graph is pure description. [`Pipeline::build`](crate::pipeline::Pipeline::build)
//! turns a validated graph into runtime segments.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RingPipeError};
use crate::types::{EdgeId, KernelId, SegmentId};

/// Static description of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    /// Dense kernel id.
    #[serde(default)]
    pub id: KernelId,
    /// Elements consumed per firing on every input port.
    pub inrate: usize,
    /// Elements produced per firing on every output port.
    pub outrate: usize,
    /// Bytes of private state.
    #[serde(default)]
    pub state_bytes: usize,
    /// Estimated cost of one firing, in arbitrary units.
    #[serde(default)]
    pub cost: u64,
}

impl KernelDescriptor {
    /// Create a descriptor; the id is assigned when added to a graph.
    pub fn new(inrate: usize, outrate: usize) -> Self {
        Self {
            id: KernelId::default(),
            inrate,
            outrate,
            state_bytes: 0,
            cost: 0,
        }
    }

    /// Set state size in bytes.
    pub fn with_state_bytes(mut self, state_bytes: usize) -> Self {
        self.state_bytes = state_bytes;
        self
    }

    /// Set firing cost.
    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// Static description of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Producing kernel.
    pub source: KernelId,
    /// Consuming kernel.
    pub dest: KernelId,
    /// Capacity in elements.
    pub depth: usize,
    /// Bytes per element.
    pub width: usize,
    /// Producer and consumer may run on different threads.
    #[serde(default)]
    pub cross_thread: bool,
}

impl EdgeDescriptor {
    /// Create a same-thread edge descriptor.
    pub fn new(source: KernelId, dest: KernelId, depth: usize, width: usize) -> Self {
        Self {
            source,
            dest,
            depth,
            width,
            cross_thread: false,
        }
    }

    /// Mark the edge as crossing threads.
    pub fn cross_thread(mut self, cross_thread: bool) -> Self {
        self.cross_thread = cross_thread;
        self
    }
}

/// Ordered chain of kernels run on one thread.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Kernels in chain order.
    pub kernels: Vec<KernelId>,
}

/// Where an edge sits relative to segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePlacement {
    /// Between consecutive kernels of one segment.
    Internal {
        /// Owning segment.
        segment: SegmentId,
        /// Chain position of the source kernel.
        position: usize,
    },
    /// From the last kernel of `upstream` to the first kernel of the next segment.
    Boundary {
        /// Segment holding the source kernel.
        upstream: SegmentId,
    },
}

/// Kernels, edges and segments of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineGraph {
    kernels: Vec<KernelDescriptor>,
    edges: Vec<EdgeDescriptor>,
    segments: Vec<SegmentDescriptor>,
}

impl PipelineGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a graph from descriptor tables, then validate it.
    pub fn from_parts(
        kernels: Vec<KernelDescriptor>,
        edges: Vec<EdgeDescriptor>,
        segments: Vec<SegmentDescriptor>,
    ) -> Result<Self> {
        let graph = Self {
            kernels,
            edges,
            segments,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Add a kernel, assigning the next dense id.
    pub fn add_kernel(&mut self, mut desc: KernelDescriptor) -> KernelId {
        let id = KernelId::from(self.kernels.len());
        desc.id = id;
        self.kernels.push(desc);
        id
    }

    /// Add an edge, assigning the next dense id.
    pub fn add_edge(&mut self, desc: EdgeDescriptor) -> EdgeId {
        let id = EdgeId::from(self.edges.len());
        self.edges.push(desc);
        id
    }

    /// Add a segment, assigning the next dense id.
    pub fn add_segment(&mut self, kernels: impl IntoIterator<Item = KernelId>) -> SegmentId {
        let id = SegmentId::from(self.segments.len());
        self.segments.push(SegmentDescriptor {
            kernels: kernels.into_iter().collect(),
        });
        id
    }

    /// Get all kernels.
    pub fn kernels(&self) -> &[KernelDescriptor] {
        &self.kernels
    }

    /// Get all edges.
    pub fn edges(&self) -> &[EdgeDescriptor] {
        &self.edges
    }

    /// Get all segments.
    pub fn segments(&self) -> &[SegmentDescriptor] {
        &self.segments
    }

    /// Get a kernel descriptor.
    pub fn kernel(&self, id: KernelId) -> Option<&KernelDescriptor> {
        self.kernels.get(id.index())
    }

    /// Get an edge descriptor.
    pub fn edge(&self, id: EdgeId) -> Option<&EdgeDescriptor> {
        self.edges.get(id.index())
    }

    /// Get a segment descriptor.
    pub fn segment(&self, id: SegmentId) -> Option<&SegmentDescriptor> {
        self.segments.get(id.index())
    }

    /// Input edges of a kernel, in port order.
    pub fn inputs_of(&self, kernel: KernelId) -> impl Iterator<Item = (EdgeId, &EdgeDescriptor)> {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.dest == kernel)
            .map(|(i, e)| (EdgeId::from(i), e))
    }

    /// Output edges of a kernel, in port order.
    pub fn outputs_of(&self, kernel: KernelId) -> impl Iterator<Item = (EdgeId, &EdgeDescriptor)> {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.source == kernel)
            .map(|(i, e)| (EdgeId::from(i), e))
    }

    /// Find the segment and chain position of a kernel.
    pub fn locate(&self, kernel: KernelId) -> Option<(SegmentId, usize)> {
        self.segments.iter().enumerate().find_map(|(s, seg)| {
            seg.kernels
                .iter()
                .position(|&k| k == kernel)
                .map(|pos| (SegmentId::from(s), pos))
        })
    }

    /// Classify an edge as internal or boundary.
    pub fn placement(&self, edge: EdgeId) -> Result<EdgePlacement> {
        let desc = self
            .edge(edge)
            .ok_or_else(|| RingPipeError::InvalidTopology(format!("unknown edge {edge}")))?;
        let (src_seg, src_pos) = self
            .locate(desc.source)
            .ok_or(RingPipeError::UnknownKernel(desc.source))?;
        let (dst_seg, dst_pos) = self
            .locate(desc.dest)
            .ok_or(RingPipeError::UnknownKernel(desc.dest))?;

        if src_seg == dst_seg {
            if dst_pos != src_pos + 1 {
                return Err(RingPipeError::InvalidTopology(format!(
                    "edge {edge} connects non-consecutive kernels {} and {} of segment {src_seg}",
                    desc.source, desc.dest
                )));
            }
            return Ok(EdgePlacement::Internal {
                segment: src_seg,
                position: src_pos,
            });
        }

        let src_last = self.segments[src_seg.index()].kernels.len() - 1;
        if dst_seg.index() != src_seg.index() + 1 || src_pos != src_last || dst_pos != 0 {
            return Err(RingPipeError::InvalidTopology(format!(
                "edge {edge} must run from the last kernel of a segment to the first kernel of the next ({} in {src_seg} -> {} in {dst_seg})",
                desc.source, desc.dest
            )));
        }
        Ok(EdgePlacement::Boundary { upstream: src_seg })
    }

    /// Check ids, segmentation, edge shapes and rates.
    pub fn validate(&self) -> Result<()> {
        for (i, k) in self.kernels.iter().enumerate() {
            if k.id.index() != i {
                return Err(RingPipeError::InvalidTopology(format!(
                    "kernel ids must be dense: slot {i} holds {}",
                    k.id
                )));
            }
        }

        let mut owner = vec![None; self.kernels.len()];
        for (s, seg) in self.segments.iter().enumerate() {
            let sid = SegmentId::from(s);
            if seg.kernels.is_empty() {
                return Err(RingPipeError::InvalidTopology(format!("segment {sid} is empty")));
            }
            for &k in &seg.kernels {
                let slot = owner
                    .get_mut(k.index())
                    .ok_or(RingPipeError::UnknownKernel(k))?;
                if let Some(other) = slot.replace(sid) {
                    return Err(RingPipeError::InvalidTopology(format!(
                        "kernel {k} is in segments {other} and {sid}"
                    )));
                }
            }
        }
        if let Some(k) = owner.iter().position(Option::is_none) {
            return Err(RingPipeError::InvalidTopology(format!(
                "kernel {} is not assigned to a segment",
                KernelId::from(k)
            )));
        }

        let mut chained = vec![0usize; self.kernels.len()];
        for (i, e) in self.edges.iter().enumerate() {
            let id = EdgeId::from(i);
            for k in [e.source, e.dest] {
                if self.kernel(k).is_none() {
                    return Err(RingPipeError::UnknownKernel(k));
                }
            }
            if e.depth < 2 {
                return Err(RingPipeError::InvalidConfig(format!(
                    "edge {id} depth must be at least 2, got {}",
                    e.depth
                )));
            }
            if e.width == 0 {
                return Err(RingPipeError::InvalidConfig(format!(
                    "edge {id} element width must be non-zero"
                )));
            }
            if e.depth.checked_mul(e.width).is_none() {
                return Err(RingPipeError::InvalidConfig(format!(
                    "edge {id} of {} x {} bytes overflows",
                    e.depth, e.width
                )));
            }

            if let EdgePlacement::Internal { .. } = self.placement(id)? {
                chained[e.source.index()] += 1;
                if chained[e.source.index()] > 1 {
                    return Err(RingPipeError::InvalidTopology(format!(
                        "more than one internal edge from {}",
                        e.source
                    )));
                }
            }

            self.check_rate(id, e, e.source, self.kernels[e.source.index()].outrate, "outrate")?;
            self.check_rate(id, e, e.dest, self.kernels[e.dest.index()].inrate, "inrate")?;
        }

        for seg in &self.segments {
            for &k in &seg.kernels[..seg.kernels.len() - 1] {
                if chained[k.index()] == 0 {
                    return Err(RingPipeError::InvalidTopology(format!(
                        "kernel {k} has no internal edge to its successor"
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_rate(
        &self,
        id: EdgeId,
        edge: &EdgeDescriptor,
        kernel: KernelId,
        rate: usize,
        what: &str,
    ) -> Result<()> {
        if rate == 0 || rate > edge.depth - 1 {
            return Err(RingPipeError::InvalidConfig(format!(
                "kernel {kernel} {what} {rate} does not fit edge {id} of depth {}",
                edge.depth
            )));
        }
        if rate > edge.depth / 2 {
            warn!(
                %kernel,
                edge = %id,
                rate,
                depth = edge.depth,
                "{what} exceeds half the edge depth, firings will serialize"
            );
        }
        Ok(())
    }
}
