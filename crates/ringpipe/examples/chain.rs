//! Chain Example
//!
//! Builds a three-segment pipeline by hand and runs it on the CPU executor:
//!
//! ```text
//! [ramp] => [smooth -> decimate] => [print]
//! ```
//!
//! Run with `RUST_LOG=ringpipe_core=debug` to see the segment layout.

use ringpipe::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLES: u32 = 4096;
const WINDOW: usize = 4;

fn sample(bytes: &[u8]) -> f32 {
    f32::from_le_bytes(bytes.try_into().unwrap_or_default())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut graph = PipelineGraph::new();
    let ramp = graph.add_kernel(KernelDescriptor::new(0, 8));
    let smooth = graph.add_kernel(
        KernelDescriptor::new(1, 1)
            .with_state_bytes(WINDOW * 4)
            .with_cost(4),
    );
    let decimate = graph.add_kernel(KernelDescriptor::new(4, 1));
    let print = graph.add_kernel(KernelDescriptor::new(1, 0));

    graph.add_edge(EdgeDescriptor::new(ramp, smooth, 32, 4).cross_thread(true));
    graph.add_edge(EdgeDescriptor::new(smooth, decimate, 16, 4));
    graph.add_edge(EdgeDescriptor::new(decimate, print, 16, 4).cross_thread(true));

    graph.add_segment([ramp]);
    graph.add_segment([smooth, decimate]);
    graph.add_segment([print]);

    let pipeline = Pipeline::build(&graph, |desc| -> Box<dyn KernelLogic> {
        match desc.id.index() {
            0 => {
                let mut t = 0u32;
                Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                    let Some(out) = firing.outputs.get(0) else {
                        return Flow::Finish;
                    };
                    for slot in out.chunks_exact_mut(4) {
                        let value = (t as f32 * 0.01).sin();
                        slot.copy_from_slice(&value.to_le_bytes());
                        t += 1;
                    }
                    if t >= SAMPLES {
                        Flow::Finish
                    } else {
                        Flow::Continue
                    }
                }))
            }
            // Moving average over the last WINDOW samples, kept in kernel state.
            1 => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
                let value = firing
                    .inputs
                    .get(0)
                    .and_then(|v| v.get(0).map(sample))
                    .unwrap_or_default();
                firing.state.copy_within(4.., 0);
                firing.state[(WINDOW - 1) * 4..].copy_from_slice(&value.to_le_bytes());
                let mean =
                    firing.state.chunks_exact(4).map(sample).sum::<f32>() / WINDOW as f32;
                if let Some(out) = firing.outputs.get(0) {
                    out.copy_from_slice(&mean.to_le_bytes());
                }
                Flow::Continue
            })),
            2 => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
                let first = firing
                    .inputs
                    .get(0)
                    .and_then(|v| v.get(0).map(sample))
                    .unwrap_or_default();
                if let Some(out) = firing.outputs.get(0) {
                    out.copy_from_slice(&first.to_le_bytes());
                }
                Flow::Continue
            })),
            _ => {
                let mut seen = 0u32;
                Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                    if let Some(value) = firing.inputs.get(0).and_then(|v| v.get(0).map(sample)) {
                        if seen % 128 == 0 {
                            info!(index = seen, value, "sample");
                        }
                        seen += 1;
                    }
                    Flow::Continue
                }))
            }
        }
    })?;

    let executor = CpuExecutor::new(ExecutorConfig::new().with_thread_name_prefix("chain"));
    let report = executor.run(pipeline)?;

    for segment in &report.segments {
        info!(
            segment = %segment.segment,
            firings = segment.firings,
            fire_counts = ?segment.fire_counts,
            idle_polls = segment.idle_polls,
            "segment done"
        );
    }
    info!(
        kernel_firings = report.kernel_firings(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "pipeline done"
    );
    Ok(())
}
