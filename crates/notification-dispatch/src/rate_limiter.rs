//! Sliding-window admission per subject.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Trailing window length.
    pub window: Duration,
    /// Admissions allowed per subject within the window.
    pub max_per_window: usize,
    /// Interval of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_per_window: 5,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Per-subject sliding-window rate limiter.
///
/// Each subject keeps the timestamps of its admissions inside the trailing
/// window, oldest first. Stale timestamps are pruned on every check; a
/// denied request is not recorded.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn admit(&self, subject: &str) -> bool {
        self.admit_at(subject, Instant::now())
    }

    /// Admit and record one request at `now` if the subject is below the limit.
    pub fn admit_at(&self, subject: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(subject.to_string()).or_default();
        prune(window, now, self.config.window);

        if window.len() >= self.config.max_per_window {
            debug!(subject, in_window = window.len(), "Rate limit reached");
            return false;
        }

        window.push_back(now);
        true
    }

    /// Admissions left for the subject in the current window.
    pub fn remaining(&self, subject: &str) -> usize {
        self.remaining_at(subject, Instant::now())
    }

    pub fn remaining_at(&self, subject: &str, now: Instant) -> usize {
        let windows = self.windows.lock();
        let used = windows.get(subject).map_or(0, |window| {
            window
                .iter()
                .filter(|&&at| now.duration_since(at) < self.config.window)
                .count()
        });
        self.config.max_per_window.saturating_sub(used)
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Forget subjects with no admissions in the trailing window.
    ///
    /// Returns how many subjects were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| {
            prune(window, now, self.config.window);
            !window.is_empty()
        });
        before - windows.len()
    }

    /// Number of subjects currently tracked.
    pub fn tracked_subjects(&self) -> usize {
        self.windows.lock().len()
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Rate limiter sweeper received shutdown signal");
                        break;
                    }
                    _ = sleep(interval) => {
                        let removed = self.sweep();
                        if removed > 0 {
                            debug!(removed, tracked = self.tracked_subjects(), "Swept idle rate windows");
                        }
                    }
                }
            }

            debug!("Rate limiter sweeper stopped");
        })
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(&oldest) = window.front() {
        if now.duration_since(oldest) < length {
            break;
        }
        window.pop_front();
    }
}
