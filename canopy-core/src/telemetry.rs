use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Completions kept for the moving rate.
const RATE_WINDOW: usize = 50;

/// Process-lifetime counters. Shared by every worker; increments are atomic
/// and the rate window sits behind a short-lived lock.
#[derive(Debug)]
pub struct Telemetry {
    ok: AtomicU64,
    error: AtomicU64,
    skipped: AtomicU64,
    not_found: AtomicU64,
    resumed: AtomicU64,
    planned: AtomicU64,
    started: Instant,
    window: Mutex<VecDeque<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub ok: u64,
    pub error: u64,
    pub skipped: u64,
    /// Subset of `error` whose terminal outcome was a 404.
    pub not_found: u64,
    /// Entities already satisfied by the checkpoint when the run started.
    pub resumed: u64,
    /// Work items scheduled on the pool.
    pub planned: u64,
    pub elapsed: Duration,
    /// Items per second over the recent window.
    pub rate: f64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            ok: AtomicU64::new(0),
            error: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            resumed: AtomicU64::new(0),
            planned: AtomicU64::new(0),
            started: Instant::now(),
            window: Mutex::new(VecDeque::with_capacity(RATE_WINDOW)),
        }
    }

    fn tick(&self) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == RATE_WINDOW {
            window.pop_front();
        }
        window.push_back(Instant::now());
    }

    /// Returns the number of fetched items (ok + error) so far.
    pub fn record_ok(&self) -> u64 {
        self.ok.fetch_add(1, Ordering::Relaxed);
        self.tick();
        self.fetched()
    }

    pub fn record_error(&self, not_found: bool) -> u64 {
        self.error.fetch_add(1, Ordering::Relaxed);
        if not_found {
            self.not_found.fetch_add(1, Ordering::Relaxed);
        }
        self.tick();
        self.fetched()
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Entities filtered out by the checkpoint before dispatch. They count as
    /// skipped as well.
    pub fn record_resumed(&self, count: u64) {
        self.resumed.fetch_add(count, Ordering::Relaxed);
        self.skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_planned(&self, count: u64) {
        self.planned.store(count, Ordering::Relaxed);
    }

    pub fn fetched(&self) -> u64 {
        self.ok.load(Ordering::Relaxed) + self.error.load(Ordering::Relaxed)
    }

    /// Moving rate over the last completions, falling back to the whole-run
    /// average while the window is too small.
    pub fn rate(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() >= 2
            && let (Some(first), Some(last)) = (window.front(), window.back())
        {
            let span = last.duration_since(*first).as_secs_f64();
            if span > 0.0 {
                return (window.len() - 1) as f64 / span;
            }
        }
        drop(window);

        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.fetched() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            ok: self.ok.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            resumed: self.resumed.load(Ordering::Relaxed),
            planned: self.planned.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
            rate: self.rate(),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySnapshot {
    pub fn fetched(&self) -> u64 {
        self.ok + self.error
    }

    /// Items still waiting for a terminal outcome in this run. Items skipped
    /// by the in-loop checkpoint recheck count as handled.
    pub fn remaining(&self) -> u64 {
        let handled = self.fetched() + (self.skipped - self.resumed);
        self.planned.saturating_sub(handled)
    }

    pub fn error_rate(&self) -> f64 {
        if self.fetched() == 0 {
            0.0
        } else {
            self.error as f64 / self.fetched() as f64
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        if self.rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.remaining() as f64 / self.rate))
    }
}

/// `1h02m`, `3m07s`, `12s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m", h, m)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
