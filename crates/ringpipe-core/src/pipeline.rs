//! Turning a [`PipelineGraph`] into runtime segments.

use std::sync::Arc;

use tracing::info;

use crate::config::PipelineConfig;
use crate::edge::Edge;
use crate::error::{Result, RingPipeError};
use crate::graph::{EdgePlacement, KernelDescriptor, PipelineGraph};
use crate::kernel::{Inlet, KernelLogic, KernelSpec, Outlet};
use crate::segment::{BoundaryLink, ChainEdge, Segment, SegmentBuilder};
use crate::types::{EdgeId, SegmentId};

/// Runtime form of a pipeline: built segments plus the links between them.
#[derive(Debug)]
pub struct Pipeline {
    segments: Vec<Segment>,
    links: Vec<Option<Arc<BoundaryLink>>>,
}

impl Pipeline {
    /// Validate `graph` and build every segment.
    ///
    /// `factory` supplies the logic of each kernel. Internal edges are carved
    /// out of their segment's arena; boundary edges get an atomic queue whose
    /// endpoints go to the two kernels.
    pub fn build<F>(graph: &PipelineGraph, mut factory: F) -> Result<Self>
    where
        F: FnMut(&KernelDescriptor) -> Box<dyn KernelLogic>,
    {
        graph.validate()?;

        let mut specs: Vec<Option<KernelSpec>> = graph
            .kernels()
            .iter()
            .map(|desc| Some(KernelSpec::from_descriptor(desc).with_boxed_logic(factory(desc))))
            .collect();

        let mut chains: Vec<Vec<Option<ChainEdge>>> = graph
            .segments()
            .iter()
            .map(|s| vec![None; s.kernels.len() - 1])
            .collect();
        let mut links: Vec<Option<Arc<BoundaryLink>>> =
            vec![None; graph.segments().len().saturating_sub(1)];

        for (i, desc) in graph.edges().iter().enumerate() {
            let id = EdgeId::from(i);
            match graph.placement(id)? {
                EdgePlacement::Internal { segment, position } => {
                    chains[segment.index()][position] = Some(ChainEdge {
                        id,
                        depth: desc.depth,
                        width: desc.width,
                        cross_thread: desc.cross_thread,
                    });
                    spec_mut(&mut specs, desc.source.index())?.push_output(Outlet::Chained);
                    spec_mut(&mut specs, desc.dest.index())?.push_input(Inlet::Chained);
                }
                EdgePlacement::Boundary { upstream } => {
                    let (producer, consumer) = Edge::boundary(
                        id,
                        desc.source,
                        desc.dest,
                        desc.depth,
                        desc.width,
                        desc.cross_thread,
                    )?
                    .split()?;
                    let link = &mut links[upstream.index()];
                    if link.is_none() {
                        *link = Some(Arc::new(BoundaryLink::new()));
                    }
                    spec_mut(&mut specs, desc.source.index())?
                        .push_output(Outlet::Boundary(producer));
                    spec_mut(&mut specs, desc.dest.index())?.push_input(Inlet::Boundary(consumer));
                }
            }
        }

        let mut segments = Vec::with_capacity(graph.segments().len());
        for (s, seg) in graph.segments().iter().enumerate() {
            let mut builder = SegmentBuilder::new(SegmentId::from(s));
            for (pos, &k) in seg.kernels.iter().enumerate() {
                let spec = specs
                    .get_mut(k.index())
                    .and_then(Option::take)
                    .ok_or(RingPipeError::UnknownKernel(k))?;
                builder = builder.kernel(spec);
                if let Some(chain) = chains[s].get(pos).copied().flatten() {
                    builder = builder.edge(chain);
                }
            }
            if let Some(Some(link)) = s.checked_sub(1).and_then(|p| links.get(p)) {
                builder = builder.prev(Arc::clone(link));
            }
            if let Some(Some(link)) = links.get(s) {
                builder = builder.next(Arc::clone(link));
            }
            segments.push(builder.build()?);
        }

        info!(
            segments = segments.len(),
            kernels = graph.kernels().len(),
            edges = graph.edges().len(),
            "pipeline built"
        );
        Ok(Self { segments, links })
    }

    /// Build from a configuration document.
    pub fn from_config<F>(config: &PipelineConfig, factory: F) -> Result<Self>
    where
        F: FnMut(&KernelDescriptor) -> Box<dyn KernelLogic>,
    {
        Self::build(&config.to_graph()?, factory)
    }

    /// Get number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if the pipeline has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Get the segments in order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Get the segments mutably.
    pub fn segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    /// Get a segment by id.
    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.index())
    }

    /// Take the segments, e.g. to move them onto their own threads.
    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Link between segment `i` and `i + 1`, if they share a boundary edge.
    pub fn link(&self, upstream: SegmentId) -> Option<&Arc<BoundaryLink>> {
        self.links.get(upstream.index()).and_then(Option::as_ref)
    }

    /// Check if every segment has finished.
    pub fn is_finished(&self) -> bool {
        self.segments.iter().all(Segment::is_finished)
    }

    /// Check the internal queues of every segment.
    pub fn check(&self) -> Result<()> {
        self.segments.iter().try_for_each(Segment::check)
    }

    /// Fire every fireable segment once, returning the kernel firings.
    pub fn fire_round(&mut self) -> Result<usize> {
        let mut fired = 0;
        for segment in &mut self.segments {
            if segment.is_fireable() {
                fired += segment.fire()?;
            }
        }
        Ok(fired)
    }

    /// Finish every segment now.
    pub fn shutdown(&mut self) {
        self.segments.iter_mut().for_each(Segment::shutdown);
    }
}

fn spec_mut(specs: &mut [Option<KernelSpec>], index: usize) -> Result<&mut KernelSpec> {
    specs
        .get_mut(index)
        .and_then(Option::as_mut)
        .ok_or_else(|| RingPipeError::UnknownKernel(index.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeDescriptor;
    use crate::kernel::{Firing, FnLogic, Flow, Idle};
    use crate::types::KernelId;
    use std::sync::mpsc;

    /// `[source] => [double -> sink]`
    fn graph() -> PipelineGraph {
        let mut g = PipelineGraph::new();
        let source = g.add_kernel(KernelDescriptor::new(0, 2));
        let double = g.add_kernel(KernelDescriptor::new(1, 1).with_cost(2));
        let sink = g.add_kernel(KernelDescriptor::new(1, 0).with_state_bytes(8));
        g.add_edge(EdgeDescriptor::new(source, double, 8, 4).cross_thread(true));
        g.add_edge(EdgeDescriptor::new(double, sink, 4, 4));
        g.add_segment([source]);
        g.add_segment([double, sink]);
        g
    }

    fn value(firing: &Firing<'_>) -> u32 {
        let input = firing.inputs.get(0).unwrap();
        u32::from_le_bytes(input.get(0).unwrap().try_into().unwrap())
    }

    #[test]
    fn test_build_and_drain() {
        let (tx, rx) = mpsc::channel();
        let mut pipeline = Pipeline::build(&graph(), |desc| -> Box<dyn KernelLogic> {
            match desc.id.index() {
                0 => {
                    let mut next = 0u32;
                    Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                        let out = firing.outputs.get(0).unwrap();
                        for chunk in out.chunks_exact_mut(4) {
                            next += 1;
                            chunk.copy_from_slice(&next.to_le_bytes());
                        }
                        if next >= 10 {
                            Flow::Finish
                        } else {
                            Flow::Continue
                        }
                    }))
                }
                1 => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
                    let doubled = value(firing) * 2;
                    firing.outputs.get(0).unwrap().copy_from_slice(&doubled.to_le_bytes());
                    Flow::Continue
                })),
                _ => {
                    let tx = tx.clone();
                    Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                        tx.send(value(firing)).unwrap();
                        Flow::Continue
                    }))
                }
            }
        })
        .unwrap();
        drop(tx);

        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.link(SegmentId::new(0)).is_some());
        assert!(pipeline.segments()[0].edges().is_empty());
        assert_eq!(pipeline.segments()[1].edges().len(), 1);
        assert_eq!(pipeline.segments()[1].runtime(), 2);
        assert_eq!(pipeline.segments()[1].state(), 8);

        let mut rounds = 0;
        while !pipeline.is_finished() {
            pipeline.fire_round().unwrap();
            rounds += 1;
            assert!(rounds < 1000, "pipeline did not drain");
        }

        let seen: Vec<u32> = rx.try_iter().collect();
        assert_eq!(seen, (1..=10).map(|v| v * 2).collect::<Vec<_>>());
        assert_eq!(
            pipeline.segments()[1].fire_count(KernelId::new(2)),
            Some(10)
        );
    }

    #[test]
    fn test_rejects_invalid_graph() {
        let mut g = graph();
        g.add_kernel(KernelDescriptor::new(1, 1));
        let err = Pipeline::build(&g, |_| Box::new(Idle)).unwrap_err();
        assert!(err.is_topology_error());
    }

    #[test]
    fn test_shutdown_finishes_all() {
        let mut pipeline = Pipeline::build(&graph(), |_| Box::new(Idle)).unwrap();
        assert!(!pipeline.is_finished());
        pipeline.shutdown();
        assert!(pipeline.is_finished());
        assert_eq!(pipeline.fire_round().unwrap(), 0);
    }

    fn word(bytes: &[u8]) -> u32 {
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn test_middle_segment_drains() {
        // [source(0, 3)] => [repeat(1, 2) -> pack(4, 1)] => [sink(1, 0)]
        let mut g = PipelineGraph::new();
        let source = g.add_kernel(KernelDescriptor::new(0, 3));
        let repeat = g.add_kernel(KernelDescriptor::new(1, 2));
        let pack = g.add_kernel(KernelDescriptor::new(4, 1));
        let sink = g.add_kernel(KernelDescriptor::new(1, 0));
        g.add_edge(EdgeDescriptor::new(source, repeat, 8, 4).cross_thread(true));
        g.add_edge(EdgeDescriptor::new(repeat, pack, 8, 4));
        g.add_edge(EdgeDescriptor::new(pack, sink, 4, 4).cross_thread(true));
        g.add_segment([source]);
        g.add_segment([repeat, pack]);
        g.add_segment([sink]);

        let (tx, rx) = mpsc::channel();
        let mut pipeline = Pipeline::build(&g, |desc| -> Box<dyn KernelLogic> {
            match desc.id.index() {
                0 => {
                    let mut next = 0u32;
                    Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                        for chunk in firing.outputs.get(0).unwrap().chunks_exact_mut(4) {
                            next += 1;
                            chunk.copy_from_slice(&next.to_le_bytes());
                        }
                        if next >= 300 {
                            Flow::Finish
                        } else {
                            Flow::Continue
                        }
                    }))
                }
                1 => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
                    let v = value(firing).to_le_bytes();
                    for chunk in firing.outputs.get(0).unwrap().chunks_exact_mut(4) {
                        chunk.copy_from_slice(&v);
                    }
                    Flow::Continue
                })),
                2 => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
                    let sum: u32 = firing.inputs.get(0).unwrap().iter().map(word).sum();
                    firing.outputs.get(0).unwrap().copy_from_slice(&sum.to_le_bytes());
                    Flow::Continue
                })),
                _ => {
                    let tx = tx.clone();
                    Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                        tx.send(value(firing)).unwrap();
                        Flow::Continue
                    }))
                }
            }
        })
        .unwrap();
        drop(tx);
        assert!(pipeline.check().is_ok());

        let mut rounds = 0;
        while !pipeline.is_finished() {
            pipeline.fire_round().unwrap();
            rounds += 1;
            assert!(rounds < 10_000, "pipeline did not drain");
        }

        let seen: Vec<u32> = rx.try_iter().collect();
        assert_eq!(seen, (1..=150).map(|k| 8 * k - 2).collect::<Vec<_>>());
        assert_eq!(pipeline.segments()[0].fire_counts(), &[100]);
        assert_eq!(pipeline.segments()[1].fire_counts(), &[300, 150]);
        assert_eq!(pipeline.segments()[2].fire_counts(), &[150]);
        assert!(pipeline.link(SegmentId::new(1)).unwrap().is_upstream_done());
        assert!(pipeline.check().is_ok());
    }
}
