//! Timing metrics and performance instrumentation.
//!
//! This module provides utilities for tracking timing metrics across the daemon.
//! All metrics are exposed through tracing spans and can be aggregated by log analysis tools.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global metrics collector.
pub static METRICS: Metrics = Metrics::new();

/// Timing histogram bucket for latency tracking.
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Histogram {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record a duration.
    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);

        // Update min (using compare-and-swap loop)
        let mut current_min = self.min_us.load(Ordering::Relaxed);
        while us < current_min {
            match self.min_us.compare_exchange_weak(
                current_min,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_min) => current_min = new_min,
            }
        }

        // Update max
        let mut current_max = self.max_us.load(Ordering::Relaxed);
        while us > current_max {
            match self.max_us.compare_exchange_weak(
                current_max,
                us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_max) => current_max = new_max,
            }
        }
    }

    /// Get histogram statistics.
    pub fn stats(&self) -> HistogramStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        let min_us = self.min_us.load(Ordering::Relaxed);
        let max_us = self.max_us.load(Ordering::Relaxed);

        HistogramStats {
            count,
            sum_us,
            min_us: if min_us == u64::MAX { 0 } else { min_us },
            max_us,
            avg_us: if count > 0 { sum_us / count } else { 0 },
        }
    }

    /// Reset the histogram.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
        self.min_us.store(u64::MAX, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
    }
}

/// Histogram statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct HistogramStats {
    pub count: u64,
    pub sum_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

/// Global metrics storage.
pub struct Metrics {
    /// tmux command execution times
    pub tmux_cmd: Histogram,
    /// ssh command execution times (remote scanner/terminal)
    pub ssh_cmd: Histogram,
    /// rg (ripgrep) invocation times for log matching
    pub rg_cmd: Histogram,
    /// Full scanner tick durations
    pub scanner_tick: Histogram,
    /// Event processing latency
    pub event_processing: Histogram,
    /// DB write latency
    pub db_write: Histogram,
    /// RPC request handling time
    pub rpc_request: Histogram,
    /// WebSocket outbound message dispatch latency
    pub ws_dispatch: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tmux_cmd: Histogram::new(),
            ssh_cmd: Histogram::new(),
            rg_cmd: Histogram::new(),
            scanner_tick: Histogram::new(),
            event_processing: Histogram::new(),
            db_write: Histogram::new(),
            rpc_request: Histogram::new(),
            ws_dispatch: Histogram::new(),
        }
    }

    /// Get all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            tmux_cmd: self.tmux_cmd.stats(),
            ssh_cmd: self.ssh_cmd.stats(),
            rg_cmd: self.rg_cmd.stats(),
            scanner_tick: self.scanner_tick.stats(),
            event_processing: self.event_processing.stats(),
            db_write: self.db_write.stats(),
            rpc_request: self.rpc_request.stats(),
            ws_dispatch: self.ws_dispatch.stats(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.tmux_cmd.reset();
        self.ssh_cmd.reset();
        self.rg_cmd.reset();
        self.scanner_tick.reset();
        self.event_processing.reset();
        self.db_write.reset();
        self.rpc_request.reset();
        self.ws_dispatch.reset();
    }
}

/// Summary of all metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub tmux_cmd: HistogramStats,
    pub ssh_cmd: HistogramStats,
    pub rg_cmd: HistogramStats,
    pub scanner_tick: HistogramStats,
    pub event_processing: HistogramStats,
    pub db_write: HistogramStats,
    pub rpc_request: HistogramStats,
    pub ws_dispatch: HistogramStats,
}

/// RAII timer that records duration on drop.
pub struct Timer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for Timer<'a> {
    fn drop(&mut self) {
        self.histogram.record(self.start.elapsed());
    }
}

/// Convenience macro for timing a block.
#[macro_export]
macro_rules! time_it {
    ($histogram:expr, $block:expr) => {{
        let _timer = $crate::metrics::Timer::new($histogram);
        $block
    }};
}
