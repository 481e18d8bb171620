//! Config Example
//!
//! Loads a pipeline description from TOML and picks each kernel's logic by
//! the `name` the document gives it.
//!
//! ```text
//! cargo run --example from_config -- [pipeline.toml]
//! ```
//!
//! Without an argument the built-in document below is used.

use ringpipe::config::PipelineConfig;
use ringpipe::graph::KernelDescriptor;
use ringpipe::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PIPELINE: &str = r#"
[executor]
thread_name_prefix = "cfg"
idle_spins = 256

[[kernel]]
id = 0
name = "counter"
outrate = 2

[[kernel]]
id = 1
name = "square"
inrate = 1
outrate = 1
cost = 2

[[kernel]]
id = 2
name = "sum"
inrate = 1
state_bytes = 8

[[edge]]
source = 0
dest = 1
depth = 16
width = 8
cross_thread = true

[[edge]]
source = 1
dest = 2
depth = 8
width = 8

[[segment]]
kernels = [0]

[[segment]]
kernels = [1, 2]
"#;

const LIMIT: u64 = 1000;

fn word(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().unwrap_or_default())
}

fn logic(desc: &KernelDescriptor, name: Option<&str>) -> Box<dyn KernelLogic> {
    match name {
        Some("counter") => {
            let mut next = 0u64;
            Box::new(FnLogic::new(move |firing: &mut Firing<'_>| {
                if let Some(out) = firing.outputs.get(0) {
                    for slot in out.chunks_exact_mut(8) {
                        next += 1;
                        slot.copy_from_slice(&next.to_le_bytes());
                    }
                }
                if next >= LIMIT {
                    Flow::Finish
                } else {
                    Flow::Continue
                }
            }))
        }
        Some("square") => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
            let value = firing
                .inputs
                .get(0)
                .and_then(|v| v.get(0).map(word))
                .unwrap_or_default();
            if let Some(out) = firing.outputs.get(0) {
                out.copy_from_slice(&(value * value).to_le_bytes());
            }
            Flow::Continue
        })),
        Some("sum") => Box::new(FnLogic::new(|firing: &mut Firing<'_>| {
            let value = firing
                .inputs
                .get(0)
                .and_then(|v| v.get(0).map(word))
                .unwrap_or_default();
            let total = word(firing.state) + value;
            firing.state.copy_from_slice(&total.to_le_bytes());
            Flow::Continue
        })),
        other => {
            warn!(kernel = %desc.id, name = ?other, "no logic registered, kernel stays idle");
            Box::new(Idle)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_toml_str(PIPELINE)?,
    };

    // One thread per segment.
    let report = ringpipe::run_config(&config, logic)?;
    info!(
        kernel_firings = report.kernel_firings(),
        elapsed_us = report.elapsed.as_micros() as u64,
        "threaded run complete"
    );

    // Same document, fired round by round on this thread so the result can be read back.
    let mut pipeline =
        Pipeline::from_config(&config, |desc| logic(desc, config.kernel_name(desc.id)))?;
    while !pipeline.is_finished() {
        pipeline.fire_round()?;
    }

    if let Some(sum) = pipeline
        .segments()
        .last()
        .and_then(|segment| segment.kernels().last())
    {
        let expected: u64 = (1..=LIMIT).map(|v| v * v).sum();
        info!(total = word(sum.state()), expected, "sum of squares");
    }
    Ok(())
}
