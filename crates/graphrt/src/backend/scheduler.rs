//! Kernel scheduling seam and the timing interceptor that wraps it.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::{BackendError, BackendResult};

/// Row-parallel compute kernel producing `rows * row_len` `f32` values.
pub trait Kernel: Sync {
    fn name(&self) -> &str;

    fn rows(&self) -> usize;

    fn row_len(&self) -> usize;

    /// Computes `rows` into `dst`, which holds exactly those rows.
    fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHints {
    /// Whether rows may be split across workers.
    pub split_rows: bool,
    /// Lower bound on rows handed to one worker.
    pub min_rows_per_task: usize,
}

impl Default for ScheduleHints {
    fn default() -> Self {
        Self {
            split_rows: true,
            min_rows_per_task: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: usize,
    pub num_threads: usize,
}

pub type WorkloadFn<'a> = Box<dyn FnMut(&ThreadInfo) -> BackendResult<()> + Send + 'a>;

/// Dispatches kernels and batches of closures, possibly across worker threads.
pub trait KernelScheduler: Send + Sync {
    fn set_thread_count(&self, threads: usize);

    fn thread_count(&self) -> usize;

    fn schedule(&self, kernel: &dyn Kernel, hints: &ScheduleHints, dst: &mut [f32])
        -> BackendResult<()>;

    fn run_workloads(&self, workloads: &mut [WorkloadFn<'_>]) -> BackendResult<()>;
}

/// Fails unless `dst` holds exactly the rows `kernel` produces.
pub fn check_destination(kernel: &dyn Kernel, dst: &[f32]) -> BackendResult<()> {
    let expected = kernel.rows() * kernel.row_len();
    if dst.len() != expected {
        return Err(BackendError::execution(format!(
            "kernel {} writes {expected} values into a buffer of {}",
            kernel.name(),
            dst.len()
        )));
    }
    Ok(())
}

/// Runs everything on the calling thread.
#[derive(Debug)]
pub struct SerialScheduler {
    threads: AtomicUsize,
}

impl SerialScheduler {
    pub fn new() -> Self {
        Self {
            threads: AtomicUsize::new(1),
        }
    }
}

impl Default for SerialScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelScheduler for SerialScheduler {
    /// Recorded for reporting only.
    fn set_thread_count(&self, threads: usize) {
        self.threads.store(threads.max(1), Ordering::Relaxed);
    }

    fn thread_count(&self) -> usize {
        self.threads.load(Ordering::Relaxed)
    }

    fn schedule(
        &self,
        kernel: &dyn Kernel,
        _hints: &ScheduleHints,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        check_destination(kernel, dst)?;
        kernel.run(0..kernel.rows(), dst)
    }

    fn run_workloads(&self, workloads: &mut [WorkloadFn<'_>]) -> BackendResult<()> {
        let info = ThreadInfo {
            thread_id: 0,
            num_threads: 1,
        };
        for workload in workloads.iter_mut() {
            workload(&info)?;
        }
        Ok(())
    }
}

/// Timing of one intercepted dispatch, relative to the session origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMeasurement {
    pub start_offset: Duration,
    pub duration: Duration,
}

#[derive(Debug)]
struct MeasurementLog {
    origin: Instant,
    entries: Vec<(String, KernelMeasurement)>,
}

/// Shared, append-only record of intercepted dispatches.
#[derive(Debug)]
pub struct KernelMeasurements {
    log: Mutex<MeasurementLog>,
}

impl KernelMeasurements {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(MeasurementLog {
                origin: Instant::now(),
                entries: Vec::new(),
            }),
        }
    }

    pub fn origin(&self) -> Instant {
        self.log.lock().expect("kernel measurements poisoned").origin
    }

    pub fn record(&self, name: &str, start: Instant, duration: Duration) {
        let mut log = self.log.lock().expect("kernel measurements poisoned");
        let start_offset = start.saturating_duration_since(log.origin);
        log.entries.push((
            name.to_string(),
            KernelMeasurement {
                start_offset,
                duration,
            },
        ));
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("kernel measurements poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatches in the order they were recorded.
    pub fn snapshot(&self) -> Vec<(String, KernelMeasurement)> {
        self.log
            .lock()
            .expect("kernel measurements poisoned")
            .entries
            .clone()
    }

    /// Measurements grouped by kernel name, each group in dispatch order.
    pub fn by_kernel(&self) -> BTreeMap<String, Vec<KernelMeasurement>> {
        let mut grouped: BTreeMap<String, Vec<KernelMeasurement>> = BTreeMap::new();
        for (name, measurement) in self.snapshot() {
            grouped.entry(name).or_default().push(measurement);
        }
        grouped
    }

    /// Drops all entries and restarts the clock.
    pub fn reset(&self) {
        let mut log = self.log.lock().expect("kernel measurements poisoned");
        log.origin = Instant::now();
        log.entries.clear();
    }

    pub fn take(&self) -> Vec<(String, KernelMeasurement)> {
        let mut log = self.log.lock().expect("kernel measurements poisoned");
        std::mem::take(&mut log.entries)
    }
}

impl Default for KernelMeasurements {
    fn default() -> Self {
        Self::new()
    }
}

/// Label under which batched closure dispatches are recorded.
pub const WORKLOAD_LABEL: &str = "Workload";

/// Forwards every call to the wrapped scheduler and times each dispatch.
pub struct InterceptorScheduler<S: KernelScheduler + ?Sized = dyn KernelScheduler> {
    inner: Arc<S>,
    kernels: Arc<KernelMeasurements>,
}

impl<S: KernelScheduler + ?Sized> InterceptorScheduler<S> {
    pub fn new(inner: Arc<S>, kernels: Arc<KernelMeasurements>) -> Self {
        Self { inner, kernels }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }
}

impl<S: KernelScheduler + ?Sized> KernelScheduler for InterceptorScheduler<S> {
    fn set_thread_count(&self, threads: usize) {
        self.inner.set_thread_count(threads);
    }

    fn thread_count(&self) -> usize {
        self.inner.thread_count()
    }

    fn schedule(
        &self,
        kernel: &dyn Kernel,
        hints: &ScheduleHints,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        let start = Instant::now();
        let result = self.inner.schedule(kernel, hints, dst);
        let elapsed = start.elapsed();
        self.kernels.record(kernel.name(), start, elapsed);
        result
    }

    fn run_workloads(&self, workloads: &mut [WorkloadFn<'_>]) -> BackendResult<()> {
        let start = Instant::now();
        let result = self.inner.run_workloads(workloads);
        let elapsed = start.elapsed();
        self.kernels.record(WORKLOAD_LABEL, start, elapsed);
        result
    }
}

/// Active scheduler of one backend. Workloads resolve it on every dispatch, so swapping
/// takes effect for already-built workloads.
///
/// Interceptions stack: each active [`InterceptGuard`] adds one measurement sink, and
/// guards may drop in any order. Kernels carry no engine identity, so two engines
/// profiling on the same backend at the same time each record the other's dispatches.
pub struct SchedulerCell {
    state: RwLock<CellState>,
}

struct CellState {
    base: Arc<dyn KernelScheduler>,
    sinks: Vec<(u64, Arc<KernelMeasurements>)>,
    next_token: u64,
    active: Arc<dyn KernelScheduler>,
}

impl CellState {
    fn rebuild(&mut self) {
        self.active = self
            .sinks
            .iter()
            .fold(Arc::clone(&self.base), |inner, (_, kernels)| {
                Arc::new(InterceptorScheduler::new(inner, Arc::clone(kernels)))
                    as Arc<dyn KernelScheduler>
            });
    }
}

impl SchedulerCell {
    pub fn new(scheduler: Arc<dyn KernelScheduler>) -> Self {
        Self {
            state: RwLock::new(CellState {
                base: Arc::clone(&scheduler),
                sinks: Vec::new(),
                next_token: 0,
                active: scheduler,
            }),
        }
    }

    pub fn current(&self) -> Arc<dyn KernelScheduler> {
        Arc::clone(&self.state.read().expect("scheduler cell poisoned").active)
    }

    /// Installs `scheduler` beneath any active interceptions, returning the previous one.
    pub fn replace(&self, scheduler: Arc<dyn KernelScheduler>) -> Arc<dyn KernelScheduler> {
        let mut state = self.state.write().expect("scheduler cell poisoned");
        let previous = std::mem::replace(&mut state.base, scheduler);
        state.rebuild();
        previous
    }

    /// Times every dispatch into `kernels` until the guard drops.
    pub fn intercept(self: &Arc<Self>, kernels: Arc<KernelMeasurements>) -> InterceptGuard {
        let mut state = self.state.write().expect("scheduler cell poisoned");
        let token = state.next_token;
        state.next_token += 1;
        state.sinks.push((token, kernels));
        state.rebuild();
        InterceptGuard {
            cell: Arc::clone(self),
            token,
        }
    }

    fn release(&self, token: u64) {
        let mut state = self.state.write().expect("scheduler cell poisoned");
        state.sinks.retain(|(id, _)| *id != token);
        state.rebuild();
    }
}

impl std::fmt::Debug for SchedulerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("scheduler cell poisoned");
        f.debug_struct("SchedulerCell")
            .field("threads", &state.active.thread_count())
            .field("interceptions", &state.sinks.len())
            .finish()
    }
}

/// Removes its interception on drop.
pub struct InterceptGuard {
    cell: Arc<SchedulerCell>,
    token: u64,
}

impl Drop for InterceptGuard {
    fn drop(&mut self) {
        self.cell.release(self.token);
    }
}
