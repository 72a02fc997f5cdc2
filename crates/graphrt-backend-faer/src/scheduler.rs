//! Rayon-backed kernel scheduler.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use graphrt::backend::{
    check_destination, BackendError, BackendResult, Kernel, KernelScheduler, ScheduleHints,
    ThreadInfo, WorkloadFn,
};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Splits kernel rows into contiguous chunks and runs them on a private rayon pool.
///
/// The pool is rebuilt whenever the thread count changes. When a pool cannot be built the
/// scheduler keeps working on the calling thread.
pub struct RayonScheduler {
    state: RwLock<PoolState>,
}

struct PoolState {
    threads: usize,
    pool: Option<Arc<ThreadPool>>,
}

impl PoolState {
    fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            threads,
            pool: build_pool(threads),
        }
    }
}

fn build_pool(threads: usize) -> Option<Arc<ThreadPool>> {
    if threads == 1 {
        return None;
    }
    match ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|index| format!("graphrt-faer-{index}"))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(err) => {
            tracing::warn!(threads, error = %err, "failed to build rayon pool, running serially");
            None
        }
    }
}

/// Threads used when nothing else is configured.
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl RayonScheduler {
    pub fn new(threads: usize) -> Self {
        Self {
            state: RwLock::new(PoolState::new(threads)),
        }
    }

    fn snapshot(&self) -> (usize, Option<Arc<ThreadPool>>) {
        let state = self.state.read().expect("scheduler lock poisoned");
        (state.threads, state.pool.clone())
    }
}

impl Default for RayonScheduler {
    fn default() -> Self {
        Self::new(default_thread_count())
    }
}

impl std::fmt::Debug for RayonScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayonScheduler")
            .field("threads", &self.thread_count())
            .finish()
    }
}

/// Rows per chunk so that `threads` workers each get at most one chunk.
fn chunk_rows(rows: usize, threads: usize, hints: &ScheduleHints) -> usize {
    rows.div_ceil(threads.max(1)).max(hints.min_rows_per_task).max(1)
}

impl KernelScheduler for RayonScheduler {
    fn set_thread_count(&self, threads: usize) {
        let threads = threads.max(1);
        let mut state = self.state.write().expect("scheduler lock poisoned");
        if state.threads == threads {
            return;
        }
        tracing::debug!(from = state.threads, to = threads, "resizing rayon pool");
        *state = PoolState::new(threads);
    }

    fn thread_count(&self) -> usize {
        self.state.read().expect("scheduler lock poisoned").threads
    }

    fn schedule(
        &self,
        kernel: &dyn Kernel,
        hints: &ScheduleHints,
        dst: &mut [f32],
    ) -> BackendResult<()> {
        check_destination(kernel, dst)?;
        let rows = kernel.rows();
        let row_len = kernel.row_len();
        if rows == 0 || row_len == 0 {
            return Ok(());
        }

        let (threads, pool) = self.snapshot();
        let chunk = chunk_rows(rows, threads, hints);
        let pool = match pool {
            Some(pool) if hints.split_rows && chunk < rows => pool,
            _ => return kernel.run(0..rows, dst),
        };

        pool.install(|| {
            dst.par_chunks_mut(chunk * row_len)
                .enumerate()
                .try_for_each(|(index, block)| {
                    let start = index * chunk;
                    kernel.run(start..start + block.len() / row_len, block)
                })
        })
    }

    fn run_workloads(&self, workloads: &mut [WorkloadFn<'_>]) -> BackendResult<()> {
        let (threads, pool) = self.snapshot();
        let Some(pool) = pool else {
            let info = ThreadInfo {
                thread_id: 0,
                num_threads: 1,
            };
            return workloads.iter_mut().try_for_each(|workload| workload(&info));
        };

        pool.install(|| {
            workloads.par_iter_mut().try_for_each(|workload| {
                let thread_id = rayon::current_thread_index().ok_or_else(|| {
                    BackendError::execution("workload ran outside the scheduler pool")
                })?;
                workload(&ThreadInfo {
                    thread_id,
                    num_threads: threads,
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Range;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Writes `row * 10 + column` and remembers every row range it was handed.
    struct IndexKernel {
        rows: usize,
        row_len: usize,
        ranges: Mutex<Vec<Range<usize>>>,
    }

    impl IndexKernel {
        fn new(rows: usize, row_len: usize) -> Self {
            Self {
                rows,
                row_len,
                ranges: Mutex::new(Vec::new()),
            }
        }

        fn expected(&self) -> Vec<f32> {
            (0..self.rows)
                .flat_map(|row| (0..self.row_len).map(move |col| (row * 10 + col) as f32))
                .collect()
        }

        fn sorted_ranges(&self) -> Vec<Range<usize>> {
            let mut ranges = self.ranges.lock().unwrap().clone();
            ranges.sort_by_key(|range| range.start);
            ranges
        }
    }

    impl Kernel for IndexKernel {
        fn name(&self) -> &str {
            "Index"
        }

        fn rows(&self) -> usize {
            self.rows
        }

        fn row_len(&self) -> usize {
            self.row_len
        }

        fn run(&self, rows: Range<usize>, dst: &mut [f32]) -> BackendResult<()> {
            assert_eq!(dst.len(), rows.len() * self.row_len);
            for (row, values) in rows.clone().zip(dst.chunks_exact_mut(self.row_len)) {
                for (col, value) in values.iter_mut().enumerate() {
                    *value = (row * 10 + col) as f32;
                }
            }
            self.ranges.lock().unwrap().push(rows);
            Ok(())
        }
    }

    #[test]
    fn split_rows_cover_the_output_once() {
        let scheduler = RayonScheduler::new(4);
        let kernel = IndexKernel::new(10, 3);
        let mut dst = vec![0.0; 30];
        scheduler
            .schedule(&kernel, &ScheduleHints::default(), &mut dst)
            .unwrap();
        assert_eq!(dst, kernel.expected());
        assert_eq!(kernel.sorted_ranges(), vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn hints_bound_the_split() {
        let scheduler = RayonScheduler::new(4);

        let kernel = IndexKernel::new(10, 2);
        let mut dst = vec![0.0; 20];
        let hints = ScheduleHints {
            split_rows: true,
            min_rows_per_task: 6,
        };
        scheduler.schedule(&kernel, &hints, &mut dst).unwrap();
        assert_eq!(dst, kernel.expected());
        assert_eq!(kernel.sorted_ranges(), vec![0..6, 6..10]);

        let kernel = IndexKernel::new(10, 2);
        let hints = ScheduleHints {
            split_rows: false,
            min_rows_per_task: 1,
        };
        scheduler.schedule(&kernel, &hints, &mut dst).unwrap();
        assert_eq!(kernel.sorted_ranges(), vec![0..10]);
    }

    #[test]
    fn wrong_destination_is_rejected() {
        let scheduler = RayonScheduler::new(2);
        let kernel = IndexKernel::new(4, 4);
        let mut dst = vec![0.0; 15];
        let err = scheduler
            .schedule(&kernel, &ScheduleHints::default(), &mut dst)
            .unwrap_err();
        assert!(matches!(err, BackendError::Execution { .. }));
    }

    #[test]
    fn thread_count_resizes_pool() {
        let scheduler = RayonScheduler::new(2);
        assert_eq!(scheduler.thread_count(), 2);
        scheduler.set_thread_count(3);
        assert_eq!(scheduler.thread_count(), 3);
        scheduler.set_thread_count(0);
        assert_eq!(scheduler.thread_count(), 1);

        let kernel = IndexKernel::new(5, 1);
        let mut dst = vec![0.0; 5];
        scheduler
            .schedule(&kernel, &ScheduleHints::default(), &mut dst)
            .unwrap();
        assert_eq!(kernel.sorted_ranges(), vec![0..5]);
    }

    #[test]
    fn run_workloads_runs_every_closure() {
        let scheduler = RayonScheduler::new(3);
        let calls = AtomicUsize::new(0);
        let mut workloads: Vec<WorkloadFn<'_>> = (0..8)
            .map(|_| {
                Box::new(|info: &ThreadInfo| {
                    assert!(info.thread_id < info.num_threads);
                    assert_eq!(info.num_threads, 3);
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as WorkloadFn<'_>
            })
            .collect();
        scheduler.run_workloads(&mut workloads).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn run_workloads_surfaces_failures() {
        let scheduler = RayonScheduler::new(2);
        let mut workloads: Vec<WorkloadFn<'_>> = vec![
            Box::new(|_: &ThreadInfo| Ok(())) as WorkloadFn<'_>,
            Box::new(|_: &ThreadInfo| Err(BackendError::execution("boom"))) as WorkloadFn<'_>,
        ];
        assert!(scheduler.run_workloads(&mut workloads).is_err());
    }
}
