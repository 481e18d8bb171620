//! Kernels and the firing contract.
//!
//! A kernel fires by consuming exactly `inrate` elements on every input port
//! and producing exactly `outrate` on every output port. All reservations
//! are taken before the logic runs and committed after it returns, so a
//! firing is atomic from the pipeline's point of view.
//!
//! Ports come in two flavours. A chained port is the internal edge to the
//! neighbouring kernel of the same segment; the segment owns that edge and
//! lends it to the kernel through [`ChainLinks`] for the duration of a call.
//! A boundary port owns one endpoint of a cross-thread queue.

use tracing::debug;

use crate::atomic::{RingConsumer, RingProducer};
use crate::edge::Edge;
use crate::error::{Result, RingPipeError};
use crate::graph::KernelDescriptor;
use crate::memory::ArenaRegion;
use crate::queue::{QueueReader, QueueState, QueueWriter, ReadView};
use crate::types::KernelId;

/// What a kernel wants after a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    /// Keep firing.
    #[default]
    Continue,
    /// Commit this firing, then close every port.
    Finish,
}

/// Input port of a kernel.
#[derive(Debug)]
pub enum Inlet {
    /// Internal edge from the previous kernel in the segment.
    Chained,
    /// Consumer end of a boundary edge.
    Boundary(RingConsumer),
}

/// Output port of a kernel.
#[derive(Debug)]
pub enum Outlet {
    /// Internal edge to the next kernel in the segment.
    Chained,
    /// Producer end of a boundary edge.
    Boundary(RingProducer),
}

/// Internal edges lent to a kernel by its segment.
#[derive(Debug, Default)]
pub struct ChainLinks<'a> {
    /// Edge from the previous kernel.
    pub upstream: Option<&'a mut Edge>,
    /// Edge to the next kernel.
    pub downstream: Option<&'a mut Edge>,
}

impl<'a> ChainLinks<'a> {
    /// No internal edges.
    pub fn none() -> Self {
        Self::default()
    }

    /// Lend both internal edges.
    pub fn new(upstream: Option<&'a mut Edge>, downstream: Option<&'a mut Edge>) -> Self {
        Self {
            upstream,
            downstream,
        }
    }
}

/// Reserved input windows of a firing.
pub struct Inputs<'a> {
    chained: Option<&'a Edge>,
    inlets: &'a [Inlet],
    rate: usize,
}

impl<'a> Inputs<'a> {
    /// Get number of input ports.
    pub fn len(&self) -> usize {
        self.inlets.len()
    }

    /// Check if the kernel has no input port.
    pub fn is_empty(&self) -> bool {
        self.inlets.is_empty()
    }

    /// Elements reserved on each port.
    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Get the `inrate` elements reserved on `port`.
    pub fn get(&self, port: usize) -> Option<ReadView<'a>> {
        match self.inlets.get(port)? {
            Inlet::Chained => self.chained.map(|edge| edge.reserved()),
            Inlet::Boundary(consumer) => Some(consumer.reserved()),
        }
    }
}

/// Reserved output regions of a firing.
pub struct Outputs<'a> {
    chained: Option<&'a mut Edge>,
    outlets: &'a mut [Outlet],
    rate: usize,
}

impl Outputs<'_> {
    /// Get number of output ports.
    pub fn len(&self) -> usize {
        self.outlets.len()
    }

    /// Check if the kernel has no output port.
    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }

    /// Elements reserved on each port.
    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Get the `outrate * width` bytes reserved on `port`.
    pub fn get(&mut self, port: usize) -> Option<&mut [u8]> {
        match self.outlets.get_mut(port)? {
            Outlet::Chained => self.chained.as_deref_mut().map(|edge| edge.reserved_mut()),
            Outlet::Boundary(producer) => Some(producer.reserved_mut()),
        }
    }
}

/// Everything the logic sees during one firing.
pub struct Firing<'a> {
    /// Input windows, `inrate` elements each.
    pub inputs: Inputs<'a>,
    /// Output regions, `outrate` elements each.
    pub outputs: Outputs<'a>,
    /// Private kernel state.
    pub state: &'a mut [u8],
}

/// Kernel business logic.
pub trait KernelLogic: Send {
    /// Prepare the state region. Runs once, on the segment's thread.
    fn init(&mut self, _state: &mut [u8]) {}

    /// Perform one firing.
    fn run(&mut self, firing: &mut Firing<'_>) -> Flow;
}

/// Closure-backed logic, see [`KernelSpec::with_fn`].
pub struct FnLogic<F>(F);

impl<F> FnLogic<F>
where
    F: FnMut(&mut Firing<'_>) -> Flow + Send,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> KernelLogic for FnLogic<F>
where
    F: FnMut(&mut Firing<'_>) -> Flow + Send,
{
    fn run(&mut self, firing: &mut Firing<'_>) -> Flow {
        (self.0)(firing)
    }
}

/// Logic that leaves its outputs untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

impl KernelLogic for Idle {
    fn run(&mut self, _firing: &mut Firing<'_>) -> Flow {
        Flow::Continue
    }
}

fn input_state<'q>(inlet: &'q Inlet, upstream: Option<&'q Edge>) -> Option<&'q dyn QueueState> {
    match inlet {
        Inlet::Chained => upstream.map(|e| e as &dyn QueueState),
        Inlet::Boundary(c) => Some(c as &dyn QueueState),
    }
}

fn output_state<'q>(
    outlet: &'q Outlet,
    downstream: Option<&'q Edge>,
) -> Option<&'q dyn QueueState> {
    match outlet {
        Outlet::Chained => downstream.map(|e| e as &dyn QueueState),
        Outlet::Boundary(p) => Some(p as &dyn QueueState),
    }
}

fn reader<'q>(
    inlet: &'q mut Inlet,
    upstream: Option<&'q mut Edge>,
) -> Option<&'q mut dyn QueueReader> {
    match inlet {
        Inlet::Chained => upstream.map(|e| e as &mut dyn QueueReader),
        Inlet::Boundary(c) => Some(c as &mut dyn QueueReader),
    }
}

fn writer<'q>(
    outlet: &'q mut Outlet,
    downstream: Option<&'q mut Edge>,
) -> Option<&'q mut dyn QueueWriter> {
    match outlet {
        Outlet::Chained => downstream.map(|e| e as &mut dyn QueueWriter),
        Outlet::Boundary(p) => Some(p as &mut dyn QueueWriter),
    }
}

fn missing_link(kernel: KernelId, direction: &str, port: usize) -> RingPipeError {
    RingPipeError::InvalidTopology(format!(
        "kernel {kernel} {direction} port {port} is chained but no edge was lent"
    ))
}

/// Builder for a [`Kernel`].
pub struct KernelSpec {
    id: KernelId,
    inrate: usize,
    outrate: usize,
    state_bytes: usize,
    cost: u64,
    inputs: Vec<Inlet>,
    outputs: Vec<Outlet>,
    logic: Box<dyn KernelLogic>,
}

impl KernelSpec {
    /// Create a kernel with no ports, no state and [`Idle`] logic.
    pub fn new(id: KernelId, inrate: usize, outrate: usize) -> Self {
        Self {
            id,
            inrate,
            outrate,
            state_bytes: 0,
            cost: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
            logic: Box::new(Idle),
        }
    }

    /// Start from a graph descriptor.
    pub fn from_descriptor(desc: &KernelDescriptor) -> Self {
        Self::new(desc.id, desc.inrate, desc.outrate)
            .with_state_bytes(desc.state_bytes)
            .with_cost(desc.cost)
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

    /// Set the logic.
    pub fn with_logic(mut self, logic: impl KernelLogic + 'static) -> Self {
        self.logic = Box::new(logic);
        self
    }

    /// Set already boxed logic.
    pub fn with_boxed_logic(mut self, logic: Box<dyn KernelLogic>) -> Self {
        self.logic = logic;
        self
    }

    /// Set the logic from a closure.
    pub fn with_fn<F>(self, f: F) -> Self
    where
        F: FnMut(&mut Firing<'_>) -> Flow + Send + 'static,
    {
        self.with_logic(FnLogic::new(f))
    }

    /// Add an input port fed by the previous kernel of the segment.
    pub fn chained_input(mut self) -> Self {
        self.inputs.push(Inlet::Chained);
        self
    }

    /// Add an input port fed by a boundary edge.
    pub fn boundary_input(mut self, consumer: RingConsumer) -> Self {
        self.inputs.push(Inlet::Boundary(consumer));
        self
    }

    /// Add an output port feeding the next kernel of the segment.
    pub fn chained_output(mut self) -> Self {
        self.outputs.push(Outlet::Chained);
        self
    }

    /// Add an output port feeding a boundary edge.
    pub fn boundary_output(mut self, producer: RingProducer) -> Self {
        self.outputs.push(Outlet::Boundary(producer));
        self
    }

    /// Get the kernel id.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Get the state size in bytes.
    pub fn state_bytes(&self) -> usize {
        self.state_bytes
    }

    pub(crate) fn push_input(&mut self, inlet: Inlet) {
        self.inputs.push(inlet);
    }

    pub(crate) fn push_output(&mut self, outlet: Outlet) {
        self.outputs.push(outlet);
    }

    pub(crate) fn inlets(&self) -> &[Inlet] {
        &self.inputs
    }

    pub(crate) fn outlets(&self) -> &[Outlet] {
        &self.outputs
    }

    /// Build a kernel with a state region of its own.
    pub fn build(self) -> Result<Kernel> {
        let state = ArenaRegion::standalone(self.state_bytes)?;
        self.into_kernel(state)
    }

    /// Build a kernel over a state region supplied by its segment.
    pub fn into_kernel(self, state: ArenaRegion) -> Result<Kernel> {
        if state.len() < self.state_bytes {
            return Err(RingPipeError::InvalidConfig(format!(
                "kernel {} needs {} state bytes, region has {}",
                self.id,
                self.state_bytes,
                state.len()
            )));
        }
        let chained_in = self.inputs.iter().filter(|i| matches!(i, Inlet::Chained)).count();
        let chained_out = self.outputs.iter().filter(|o| matches!(o, Outlet::Chained)).count();
        if chained_in > 1 || chained_out > 1 {
            return Err(RingPipeError::InvalidTopology(format!(
                "kernel {} has more than one chained port per direction",
                self.id
            )));
        }

        Ok(Kernel {
            id: self.id,
            inrate: self.inrate,
            outrate: self.outrate,
            state_bytes: self.state_bytes,
            cost: self.cost,
            state,
            inputs: self.inputs,
            outputs: self.outputs,
            logic: self.logic,
            initialized: false,
            finished: false,
            fires: 0,
        })
    }
}

/// A computational node with fixed rates.
pub struct Kernel {
    id: KernelId,
    inrate: usize,
    outrate: usize,
    state_bytes: usize,
    cost: u64,
    state: ArenaRegion,
    inputs: Vec<Inlet>,
    outputs: Vec<Outlet>,
    logic: Box<dyn KernelLogic>,
    initialized: bool,
    finished: bool,
    fires: u64,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("inrate", &self.inrate)
            .field("outrate", &self.outrate)
            .field("state_bytes", &self.state_bytes)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("finished", &self.finished)
            .field("fires", &self.fires)
            .finish()
    }
}

impl Kernel {
    /// Get the kernel id.
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Elements consumed per port per firing.
    pub fn inrate(&self) -> usize {
        self.inrate
    }

    /// Elements produced per port per firing.
    pub fn outrate(&self) -> usize {
        self.outrate
    }

    /// State size in bytes.
    pub fn state_bytes(&self) -> usize {
        self.state_bytes
    }

    /// Estimated cost of one firing.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Get the state bytes.
    pub fn state(&self) -> &[u8] {
        &self.state.as_slice()[..self.state_bytes]
    }

    /// Get the state region supplied by the segment.
    pub fn state_region(&self) -> &ArenaRegion {
        &self.state
    }

    /// Get number of input ports.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Get number of output ports.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Get number of completed firings.
    pub fn fires(&self) -> u64 {
        self.fires
    }

    /// Check if the kernel has stopped for good.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Depth of an input queue; 0 for an unknown port.
    pub fn input_depth(&self, port: usize, links: &ChainLinks<'_>) -> usize {
        self.inputs
            .get(port)
            .and_then(|i| input_state(i, links.upstream.as_deref()))
            .map_or(0, |q| q.depth())
    }

    /// Depth of an output queue; 0 for an unknown port.
    pub fn output_depth(&self, port: usize, links: &ChainLinks<'_>) -> usize {
        self.outputs
            .get(port)
            .and_then(|o| output_state(o, links.downstream.as_deref()))
            .map_or(0, |q| q.depth())
    }

    /// Largest contiguous writable region of an output, 0 for an unknown port.
    pub fn get_free(&self, port: usize, links: &ChainLinks<'_>) -> usize {
        self.outputs
            .get(port)
            .and_then(|o| output_state(o, links.downstream.as_deref()))
            .map_or(0, |q| q.free())
    }

    /// Readable elements on an input, 0 for an unknown port.
    pub fn get_available(&self, port: usize, links: &ChainLinks<'_>) -> usize {
        self.inputs
            .get(port)
            .and_then(|i| input_state(i, links.upstream.as_deref()))
            .map_or(0, |q| q.used())
    }

    /// Check if every input has `inrate` elements.
    pub fn inputs_ready(&self, links: &ChainLinks<'_>) -> bool {
        let upstream = links.upstream.as_deref();
        self.inputs.iter().all(|i| {
            input_state(i, upstream).is_some_and(|q| q.ready(self.inrate, false))
        })
    }

    /// Check if every output has room for `outrate` elements.
    pub fn outputs_ready(&self, links: &ChainLinks<'_>) -> bool {
        let downstream = links.downstream.as_deref();
        self.outputs.iter().all(|o| {
            output_state(o, downstream).is_some_and(|q| q.ready(self.outrate, true))
        })
    }

    /// Check if a firing would succeed.
    pub fn fireable(&self, links: &ChainLinks<'_>) -> bool {
        !self.finished && self.outputs_ready(links) && self.inputs_ready(links)
    }

    /// Run [`KernelLogic::init`] if it has not run yet.
    pub fn init(&mut self) {
        if !self.initialized {
            self.initialized = true;
            self.logic.init(self.state.as_mut_slice());
        }
    }

    /// Fire once.
    ///
    /// Callers must check [`fireable`](Self::fireable) first; a firing
    /// without data or room is a [`RingPipeError::CapacityViolation`].
    pub fn run(&mut self, links: &mut ChainLinks<'_>) -> Result<Flow> {
        let id = self.id;
        let (inrate, outrate) = (self.inrate, self.outrate);

        for (port, inlet) in self.inputs.iter_mut().enumerate() {
            let queue = reader(inlet, links.upstream.as_deref_mut())
                .ok_or_else(|| missing_link(id, "input", port))?;
            if !queue.start_read_exact(inrate) {
                return Err(RingPipeError::CapacityViolation {
                    kernel: id,
                    direction: "input",
                    port,
                    requested: inrate,
                    available: queue.used(),
                });
            }
        }

        for (port, outlet) in self.outputs.iter_mut().enumerate() {
            let queue = writer(outlet, links.downstream.as_deref_mut())
                .ok_or_else(|| missing_link(id, "output", port))?;
            if queue.start_write_offset(outrate).is_none() {
                return Err(RingPipeError::CapacityViolation {
                    kernel: id,
                    direction: "output",
                    port,
                    requested: outrate,
                    available: queue.free(),
                });
            }
        }

        self.init();

        let mut firing = Firing {
            inputs: Inputs {
                chained: links.upstream.as_deref(),
                inlets: &self.inputs,
                rate: inrate,
            },
            outputs: Outputs {
                chained: links.downstream.as_deref_mut(),
                outlets: &mut self.outputs,
                rate: outrate,
            },
            state: &mut self.state.as_mut_slice()[..self.state_bytes],
        };
        let flow = self.logic.run(&mut firing);

        for inlet in self.inputs.iter_mut() {
            if let Some(queue) = reader(inlet, links.upstream.as_deref_mut()) {
                queue.finish_read(inrate);
            }
        }
        for outlet in self.outputs.iter_mut() {
            if let Some(queue) = writer(outlet, links.downstream.as_deref_mut()) {
                queue.finish_write(outrate);
            }
        }

        self.fires += 1;
        Ok(flow)
    }

    /// Finish the kernel if it can never fire again.
    ///
    /// That is the case once a reader closed one of its outputs, or once an
    /// input is closed with fewer than `inrate` elements left.
    pub fn check_finished(&mut self, links: &mut ChainLinks<'_>) -> bool {
        if self.finished {
            return true;
        }

        let upstream = links.upstream.as_deref();
        let downstream = links.downstream.as_deref();
        let output_gone = self
            .outputs
            .iter()
            .filter_map(|o| output_state(o, downstream))
            .any(|q| q.is_closed());
        let input_dry = self
            .inputs
            .iter()
            .filter_map(|i| input_state(i, upstream))
            .any(|q| q.is_closed() && q.used() < self.inrate);

        if output_gone || input_dry {
            self.finish(links);
        }
        self.finished
    }

    /// Close every port and stop firing.
    pub fn finish(&mut self, links: &mut ChainLinks<'_>) {
        for inlet in self.inputs.iter_mut() {
            if let Some(queue) = reader(inlet, links.upstream.as_deref_mut()) {
                queue.close();
            }
        }
        for outlet in self.outputs.iter_mut() {
            if let Some(queue) = writer(outlet, links.downstream.as_deref_mut()) {
                queue.close();
            }
        }

        if !self.finished {
            debug!(kernel = %self.id, fires = self.fires, "kernel finished");
        }
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicRingQueue;
    use crate::types::EdgeId;

    fn edge(depth: usize, width: usize) -> Edge {
        Edge::new(EdgeId::new(0), KernelId::new(0), KernelId::new(1), depth, width, false).unwrap()
    }

    fn fill(e: &mut Edge, values: &[u8]) {
        let buf = e.start_write(values.len()).unwrap();
        buf.copy_from_slice(values);
        e.finish_write(values.len());
    }

    #[test]
    fn test_admission_per_port() {
        let mut kernel = KernelSpec::new(KernelId::new(1), 2, 3)
            .chained_input()
            .chained_output()
            .build()
            .unwrap();
        let mut up = edge(8, 1);
        let mut down = edge(4, 1);

        fill(&mut up, &[1]);
        assert!(!kernel.fireable(&ChainLinks::new(Some(&mut up), Some(&mut down))));

        fill(&mut up, &[2]);
        let mut links = ChainLinks::new(Some(&mut up), Some(&mut down));
        assert!(kernel.fireable(&links));
        assert_eq!(kernel.run(&mut links).unwrap(), Flow::Continue);

        // Output now holds depth - 1 elements.
        assert!(!kernel.fireable(&links));
        assert_eq!(kernel.get_available(0, &links), 0);
        assert_eq!(kernel.get_free(0, &links), 0);
        assert_eq!(kernel.get_free(5, &links), 0);
        assert_eq!(kernel.get_available(5, &links), 0);
        assert_eq!(kernel.input_depth(0, &links), 8);
        assert_eq!(kernel.output_depth(0, &links), 4);
        drop(links);

        assert_eq!(up.used(), 0);
        assert_eq!(down.used(), 3);
        assert_eq!(kernel.fires(), 1);
    }

    #[test]
    fn test_run_without_room_is_violation() {
        let mut kernel = KernelSpec::new(KernelId::new(4), 1, 1)
            .chained_input()
            .build()
            .unwrap();
        let mut up = edge(4, 1);
        let err = kernel
            .run(&mut ChainLinks::new(Some(&mut up), None))
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_missing_link_is_not_fireable() {
        let kernel = KernelSpec::new(KernelId::new(0), 1, 1)
            .chained_output()
            .build()
            .unwrap();
        assert!(!kernel.fireable(&ChainLinks::none()));
    }

    #[test]
    fn test_logic_sees_exact_windows() {
        let mut kernel = KernelSpec::new(KernelId::new(1), 2, 2)
            .with_state_bytes(8)
            .chained_input()
            .chained_output()
            .with_fn(|firing| {
                let input = firing.inputs.get(0).unwrap();
                assert_eq!(input.len(), 2);
                let doubled: Vec<u8> = input.iter().map(|v| v[0] * 2).collect();

                let out = firing.outputs.get(0).unwrap();
                assert_eq!(out.len(), 2);
                out.copy_from_slice(&doubled);

                let mut count = u64::from_le_bytes(firing.state[..8].try_into().unwrap());
                count += 1;
                firing.state[..8].copy_from_slice(&count.to_le_bytes());
                Flow::Continue
            })
            .build()
            .unwrap();

        let mut up = edge(8, 1);
        let mut down = edge(8, 1);
        fill(&mut up, &[1, 2, 3, 4]);

        let mut links = ChainLinks::new(Some(&mut up), Some(&mut down));
        while kernel.fireable(&links) {
            kernel.run(&mut links).unwrap();
        }
        drop(links);

        assert_eq!(down.start_read().to_vec(), vec![2, 4, 6, 8]);
        assert_eq!(u64::from_le_bytes(kernel.state().try_into().unwrap()), 2);
    }

    #[test]
    fn test_boundary_ports() {
        let (mut tx_in, rx_in) = AtomicRingQueue::new(4, 1).unwrap().split();
        let (tx_out, mut rx_out) = AtomicRingQueue::new(4, 1).unwrap().split();

        let mut kernel = KernelSpec::new(KernelId::new(2), 1, 1)
            .boundary_input(rx_in)
            .boundary_output(tx_out)
            .with_fn(|firing| {
                let value = firing.inputs.get(0).unwrap().get(0).unwrap()[0];
                firing.outputs.get(0).unwrap()[0] = value + 1;
                Flow::Continue
            })
            .build()
            .unwrap();

        tx_in.start_write(1).unwrap()[0] = 41;
        tx_in.finish_write(1);

        let mut links = ChainLinks::none();
        assert!(kernel.fireable(&links));
        kernel.run(&mut links).unwrap();
        assert_eq!(rx_out.start_read().to_vec(), vec![42]);
    }

    #[test]
    fn test_closed_input_finishes_kernel() {
        let mut kernel = KernelSpec::new(KernelId::new(1), 2, 1)
            .chained_input()
            .chained_output()
            .build()
            .unwrap();
        let mut up = edge(8, 1);
        let mut down = edge(8, 1);
        fill(&mut up, &[1]);
        up.close();

        let mut links = ChainLinks::new(Some(&mut up), Some(&mut down));
        assert!(!kernel.fireable(&links));
        assert!(kernel.check_finished(&mut links));
        assert!(kernel.is_finished());
        drop(links);

        assert!(down.is_closed());
    }

    #[test]
    fn test_closed_input_with_enough_data_keeps_running() {
        let mut kernel = KernelSpec::new(KernelId::new(1), 1, 1)
            .chained_input()
            .chained_output()
            .build()
            .unwrap();
        let mut up = edge(8, 1);
        let mut down = edge(8, 1);
        fill(&mut up, &[1]);
        up.close();

        let mut links = ChainLinks::new(Some(&mut up), Some(&mut down));
        assert!(!kernel.check_finished(&mut links));
        kernel.run(&mut links).unwrap();
        assert!(kernel.check_finished(&mut links));
    }

    #[test]
    fn test_source_finishes_itself() {
        struct Countdown(u8);
        impl KernelLogic for Countdown {
            fn init(&mut self, state: &mut [u8]) {
                state[0] = 0xAB;
            }

            fn run(&mut self, firing: &mut Firing<'_>) -> Flow {
                firing.outputs.get(0).unwrap()[0] = self.0;
                self.0 -= 1;
                if self.0 == 0 {
                    Flow::Finish
                } else {
                    Flow::Continue
                }
            }
        }

        let mut kernel = KernelSpec::new(KernelId::new(0), 0, 1)
            .with_state_bytes(1)
            .chained_output()
            .with_logic(Countdown(2))
            .build()
            .unwrap();
        let mut down = edge(8, 1);

        let mut links = ChainLinks::new(None, Some(&mut down));
        assert_eq!(kernel.run(&mut links).unwrap(), Flow::Continue);
        assert_eq!(kernel.state(), &[0xAB]);
        assert_eq!(kernel.run(&mut links).unwrap(), Flow::Finish);
        kernel.finish(&mut links);
        assert!(!kernel.fireable(&links));
        drop(links);

        assert!(down.is_closed());
        assert_eq!(down.start_read().to_vec(), vec![2, 1]);
    }

    #[test]
    fn test_rejects_two_chained_inputs() {
        let spec = KernelSpec::new(KernelId::new(0), 1, 1)
            .chained_input()
            .chained_input();
        assert!(spec.build().is_err());
    }
}
