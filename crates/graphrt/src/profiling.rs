//! Workload and kernel timing collected during profiled runs.
//!
//! A [`Profiler`] owns the shared [`KernelMeasurements`] that interceptor schedulers
//! append to, plus one [`WorkloadRecord`] per executed workload. The process-wide
//! instance from [`Profiler::global`] is used unless an engine is given its own.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, KernelMeasurement, KernelMeasurements};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRecord {
    pub label: String,
    pub backend: String,
    pub start_offset: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilingReport {
    pub workloads: Vec<WorkloadRecord>,
    /// Measurements per kernel name, each list in dispatch order.
    pub kernels: BTreeMap<String, Vec<KernelMeasurement>>,
    /// Every intercepted dispatch in the order it happened.
    pub dispatch: Vec<(String, KernelMeasurement)>,
}

impl ProfilingReport {
    pub fn is_empty(&self) -> bool {
        self.workloads.is_empty() && self.dispatch.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Markdown tables aggregating workloads by label and kernels by name.
    pub fn format_table(&self) -> String {
        let mut workload_rows: BTreeMap<(String, String), (u64, Duration)> = BTreeMap::new();
        for record in &self.workloads {
            let entry = workload_rows
                .entry((record.label.clone(), record.backend.clone()))
                .or_default();
            entry.0 += 1;
            entry.1 += record.duration;
        }
        let workload_rows: Vec<TableRow> = workload_rows
            .into_iter()
            .map(|((label, backend), (calls, total))| TableRow {
                name: format!("{label} [{backend}]"),
                calls,
                total,
            })
            .collect();

        let kernel_rows: Vec<TableRow> = self
            .kernels
            .iter()
            .map(|(name, measurements)| TableRow {
                name: name.clone(),
                calls: measurements.len() as u64,
                total: measurements.iter().map(|m| m.duration).sum(),
            })
            .collect();

        let mut output = String::new();
        output.push_str(&format_rows("Workloads", "workload", workload_rows));
        output.push('\n');
        output.push_str(&format_rows("Kernels", "kernel", kernel_rows));
        output
    }
}

struct TableRow {
    name: String,
    calls: u64,
    total: Duration,
}

fn format_rows(label: &str, column: &str, mut rows: Vec<TableRow>) -> String {
    rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    let grand_total: f64 = rows.iter().map(|row| row.total.as_secs_f64()).sum();

    let name_width = rows
        .iter()
        .map(|row| row.name.len())
        .max()
        .unwrap_or(column.len())
        .max(column.len());
    let mut calls_width = "#".len();
    let mut total_width = "total_ms".len();
    let mut per_width = "ms/call".len();
    let percent_width = "%all".len().max(6);
    for row in &rows {
        let total_ms = row.total.as_secs_f64() * 1e3;
        calls_width = calls_width.max(format!("{}", row.calls).len());
        total_width = total_width.max(format!("{total_ms:.3}").len());
        per_width = per_width.max(format!("{:.3}", total_ms / row.calls.max(1) as f64).len());
    }

    let mut output = String::new();
    output.push_str(label);
    output.push('\n');
    output.push_str(&format!(
        "| {:<name_width$} | {:^calls_width$} | {:^total_width$} | {:^per_width$} | {:^percent_width$} |\n",
        column, "#", "total_ms", "ms/call", "%all"
    ));
    output.push_str(&format!(
        "|-{}-|-{}-|-{}-|-{}-|-{}-|\n",
        "-".repeat(name_width),
        "-".repeat(calls_width),
        "-".repeat(total_width),
        "-".repeat(per_width),
        "-".repeat(percent_width),
    ));
    for row in &rows {
        let total_ms = row.total.as_secs_f64() * 1e3;
        let percent = if grand_total > 0.0 {
            row.total.as_secs_f64() / grand_total * 100.0
        } else {
            0.0
        };
        output.push_str(&format!(
            "| {:<name_width$} | {:>calls_width$} | {:>total_width$.3} | {:>per_width$.3} | {:>percent_width$.2} |\n",
            row.name,
            row.calls,
            total_ms,
            total_ms / row.calls.max(1) as f64,
            percent,
        ));
    }
    output
}

#[derive(Debug, Default)]
pub struct Profiler {
    kernels: Arc<KernelMeasurements>,
    workloads: Mutex<Vec<WorkloadRecord>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<Profiler> {
        static INSTANCE: OnceLock<Arc<Profiler>> = OnceLock::new();
        Arc::clone(INSTANCE.get_or_init(|| Arc::new(Profiler::new())))
    }

    /// Clears previous records and restarts the session clock.
    pub fn begin_session(&self) {
        self.kernels.reset();
        self.workloads
            .lock()
            .expect("profiler mutex poisoned")
            .clear();
    }

    /// Sink shared with interceptor schedulers.
    pub fn kernel_measurements(&self) -> Arc<KernelMeasurements> {
        Arc::clone(&self.kernels)
    }

    pub fn record_workload(&self, label: &str, backend: BackendId, start: Instant, duration: Duration) {
        let start_offset = start.saturating_duration_since(self.kernels.origin());
        self.workloads
            .lock()
            .expect("profiler mutex poisoned")
            .push(WorkloadRecord {
                label: label.to_string(),
                backend: backend.to_string(),
                start_offset,
                duration,
            });
    }

    /// Times a workload execution until the returned guard drops.
    pub fn workload_scope<'a>(&'a self, label: &'a str, backend: BackendId) -> WorkloadScope<'a> {
        WorkloadScope {
            profiler: self,
            label,
            backend,
            start: Instant::now(),
        }
    }

    /// Flushes everything recorded since the last session start.
    pub fn take_report(&self) -> ProfilingReport {
        let dispatch = self.kernels.take();
        let mut kernels: BTreeMap<String, Vec<KernelMeasurement>> = BTreeMap::new();
        for (name, measurement) in &dispatch {
            kernels.entry(name.clone()).or_default().push(*measurement);
        }
        let workloads = std::mem::take(&mut *self.workloads.lock().expect("profiler mutex poisoned"));
        ProfilingReport {
            workloads,
            kernels,
            dispatch,
        }
    }
}

pub struct WorkloadScope<'a> {
    profiler: &'a Profiler,
    label: &'a str,
    backend: BackendId,
    start: Instant,
}

impl Drop for WorkloadScope<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.profiler
            .record_workload(self.label, self.backend, self.start, elapsed);
    }
}
