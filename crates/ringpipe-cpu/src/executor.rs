//! Thread-per-segment executor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use ringpipe_core::config::ExecutorConfig;
use ringpipe_core::error::{Result, RingPipeError};
use ringpipe_core::pipeline::Pipeline;
use ringpipe_core::segment::Segment;
use ringpipe_core::types::SegmentId;

/// Outcome of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    /// Segment id.
    pub segment: SegmentId,
    /// `fire` calls that fired at least one kernel.
    pub firings: u64,
    /// Kernel firings across the chain.
    pub kernel_firings: u64,
    /// Kernel firings by chain position.
    pub fire_counts: Vec<u64>,
    /// Polls that found nothing to do.
    pub idle_polls: u64,
    /// Whether the segment finished on its own rather than being stopped.
    pub finished: bool,
}

impl SegmentReport {
    fn new(segment: &Segment, idle_polls: u64, finished: bool) -> Self {
        Self {
            segment: segment.id(),
            firings: segment.firings(),
            kernel_firings: segment.fire_counts().iter().sum(),
            fire_counts: segment.fire_counts().to_vec(),
            idle_polls,
            finished,
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Per-segment results, in pipeline order.
    pub segments: Vec<SegmentReport>,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl RunReport {
    /// Kernel firings across all segments.
    pub fn kernel_firings(&self) -> u64 {
        self.segments.iter().map(|s| s.kernel_firings).sum()
    }

    /// Check if every segment finished on its own.
    pub fn all_finished(&self) -> bool {
        self.segments.iter().all(|s| s.finished)
    }
}

/// Executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorMetrics {
    /// Completed runs.
    pub runs: u64,
    /// Segments driven to completion.
    pub segments_finished: u64,
    /// Kernel firings across all runs.
    pub kernel_firings: u64,
}

/// Drives a [`Pipeline`], one native thread per segment.
///
/// Each thread polls its segment: fire while it is fireable, stop once it is
/// finished, and back off in between.
pub struct CpuExecutor {
    config: ExecutorConfig,
    /// Set by [`shutdown`](Self::shutdown).
    shutdown: AtomicBool,
    runs: AtomicU64,
    segments_finished: AtomicU64,
    kernel_firings: AtomicU64,
}

/// Stops sibling segments if a segment thread unwinds.
struct AbortOnPanic<'a>(&'a AtomicBool);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

impl Default for CpuExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl CpuExecutor {
    /// Create an executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            shutdown: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            segments_finished: AtomicU64::new(0),
            kernel_firings: AtomicU64::new(0),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Ask running segments to stop. Pending queues are closed.
    pub fn shutdown(&self) {
        info!("executor shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Get the counters.
    pub fn metrics(&self) -> ExecutorMetrics {
        ExecutorMetrics {
            runs: self.runs.load(Ordering::Relaxed),
            segments_finished: self.segments_finished.load(Ordering::Relaxed),
            kernel_firings: self.kernel_firings.load(Ordering::Relaxed),
        }
    }

    fn check_ready(&self) -> Result<()> {
        self.config.validate()?;
        if self.is_shutdown() {
            return Err(RingPipeError::InvalidConfig(
                "executor is shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&self, report: &RunReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.kernel_firings
            .fetch_add(report.kernel_firings(), Ordering::Relaxed);
        let finished = report.segments.iter().filter(|s| s.finished).count();
        self.segments_finished
            .fetch_add(finished as u64, Ordering::Relaxed);
        info!(
            segments = report.segments.len(),
            kernel_firings = report.kernel_firings(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline run complete"
        );
    }

    /// Run the pipeline to completion, one thread per segment.
    ///
    /// A single-segment pipeline runs on the caller's thread. Returns the
    /// first error any segment hit; the other segments are stopped.
    pub fn run(&self, pipeline: Pipeline) -> Result<RunReport> {
        self.check_ready()?;
        if pipeline.len() <= 1 {
            return self.run_inline(pipeline);
        }

        let segments = pipeline.into_segments();
        info!(segments = segments.len(), "starting segment threads");

        let started = Instant::now();
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<RingPipeError>> = Mutex::new(None);
        let fail = |err: RingPipeError| {
            abort.store(true, Ordering::Release);
            let mut slot = failure.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        };

        let reports = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(segments.len());
            for segment in segments {
                let id = segment.id();
                let name = format!("{}-{}", self.config.thread_name_prefix, id);
                let mut builder = thread::Builder::new().name(name);
                if let Some(size) = self.config.stack_size {
                    builder = builder.stack_size(size);
                }

                let abort = &abort;
                let fail = &fail;
                match builder.spawn_scoped(scope, move || {
                    let _guard = AbortOnPanic(abort);
                    self.drive(segment, abort, fail)
                }) {
                    Ok(handle) => handles.push((id, handle)),
                    Err(source) => {
                        error!(segment = %id, error = %source, "failed to spawn segment thread");
                        fail(RingPipeError::ThreadSpawn {
                            segment: id,
                            source,
                        });
                        break;
                    }
                }
            }

            let mut reports = Vec::with_capacity(handles.len());
            for (id, handle) in handles {
                match handle.join() {
                    Ok(report) => reports.push(report),
                    Err(payload) => {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(segment = %id, %message, "segment thread panicked");
                        fail(RingPipeError::SegmentPanicked {
                            segment: id,
                            message,
                        });
                    }
                }
            }
            reports
        });

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }

        let report = RunReport {
            segments: reports,
            elapsed: started.elapsed(),
        };
        self.record(&report);
        Ok(report)
    }

    /// Run every segment round-robin on the caller's thread.
    pub fn run_inline(&self, pipeline: Pipeline) -> Result<RunReport> {
        self.check_ready()?;

        let started = Instant::now();
        let mut segments = pipeline.into_segments();
        segments.iter_mut().for_each(Segment::init);
        debug!(segments = segments.len(), "running inline");

        let backoff = Backoff::new();
        let mut idle = 0u32;
        let mut idle_polls = vec![0u64; segments.len()];
        let mut stopped = false;

        loop {
            if self.is_shutdown() {
                segments.iter_mut().for_each(Segment::shutdown);
                stopped = true;
                break;
            }

            let mut fired = 0;
            let mut failure = None;
            for (segment, polls) in segments.iter_mut().zip(idle_polls.iter_mut()) {
                let n = if segment.is_fireable() {
                    match segment.fire() {
                        Ok(n) => n,
                        Err(err) => {
                            error!(segment = %segment.id(), error = %err, "segment failed");
                            failure = Some(err);
                            break;
                        }
                    }
                } else {
                    0
                };
                if n == 0 && !segment.is_finished() {
                    *polls += 1;
                }
                fired += n;
            }
            if let Some(err) = failure {
                segments.iter_mut().for_each(Segment::shutdown);
                return Err(err);
            }

            if segments.iter().all(Segment::is_finished) {
                break;
            }
            if fired > 0 {
                idle = 0;
                backoff.reset();
            } else {
                self.idle_wait(&backoff, &mut idle);
            }
        }

        let report = RunReport {
            segments: segments
                .iter()
                .zip(idle_polls)
                .map(|(s, polls)| SegmentReport::new(s, polls, !stopped))
                .collect(),
            elapsed: started.elapsed(),
        };
        self.record(&report);
        Ok(report)
    }

    fn drive(
        &self,
        mut segment: Segment,
        abort: &AtomicBool,
        fail: &(dyn Fn(RingPipeError) + Sync),
    ) -> SegmentReport {
        let id = segment.id();
        debug!(segment = %id, kernels = segment.len(), "segment thread started");
        segment.init();

        let backoff = Backoff::new();
        let mut idle = 0u32;
        let mut idle_polls = 0u64;

        loop {
            if self.is_shutdown() || abort.load(Ordering::Acquire) {
                segment.shutdown();
                debug!(segment = %id, "segment stopped");
                return SegmentReport::new(&segment, idle_polls, false);
            }

            let fired = if segment.is_fireable() {
                match segment.fire() {
                    Ok(n) => n,
                    Err(err) => {
                        error!(segment = %id, error = %err, "segment failed");
                        segment.shutdown();
                        fail(err);
                        return SegmentReport::new(&segment, idle_polls, false);
                    }
                }
            } else {
                0
            };

            if fired > 0 {
                idle = 0;
                backoff.reset();
                continue;
            }
            if segment.is_finished() {
                debug!(segment = %id, firings = segment.firings(), "segment thread finished");
                return SegmentReport::new(&segment, idle_polls, true);
            }

            idle_polls += 1;
            self.idle_wait(&backoff, &mut idle);
        }
    }

    fn idle_wait(&self, backoff: &Backoff, idle: &mut u32) {
        if *idle < self.config.idle_spins {
            *idle += 1;
            backoff.snooze();
        } else if self.config.idle_sleep_us > 0 {
            thread::sleep(self.config.idle_sleep());
        } else {
            thread::yield_now();
        }
    }
}
