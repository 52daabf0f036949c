//! Admission limiter: multi-window sliding rate limiting.
//!
//! Each window keeps the instants of admitted calls in a `VecDeque`. A check
//! purges expired instants from every window, denies if any window is at its
//! quota, and otherwise records the call in all of them. The check and the
//! record happen under one lock so concurrent callers can never overshoot.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::LimiterConfig;
use crate::error::ConfigError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Time until the binding window frees a slot. Zero when allowed.
    pub wait: Duration,
}

impl Admission {
    fn allow() -> Self {
        Self { allowed: true, wait: Duration::ZERO }
    }

    fn deny(wait: Duration) -> Self {
        Self { allowed: false, wait }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Burst,
    Minute,
    Hour,
    Day,
}

/// Usage of one window at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub window: WindowKind,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    /// Milliseconds until the oldest recorded call leaves the window.
    pub resets_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub windows: Vec<WindowStatus>,
    pub admitted: u64,
    pub denied: u64,
}

impl LimiterStatus {
    pub fn window(&self, kind: WindowKind) -> Option<&WindowStatus> {
        self.windows.iter().find(|w| w.window == kind)
    }
}

struct SlidingWindow {
    kind: WindowKind,
    span: Duration,
    quota: u32,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(kind: WindowKind, span: Duration, quota: u32) -> Self {
        Self {
            kind,
            span,
            quota,
            stamps: VecDeque::new(),
        }
    }

    /// Drop instants that have aged out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.stamps.front() {
            if now.saturating_duration_since(front) >= self.span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_full(&self) -> bool {
        self.stamps.len() >= self.quota as usize
    }

    /// Time until the oldest instant expires.
    fn wait(&self, now: Instant) -> Duration {
        self.stamps
            .front()
            .map(|&oldest| self.span.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or_default()
    }

    fn status(&self, now: Instant) -> WindowStatus {
        let used = self.stamps.len() as u32;
        WindowStatus {
            window: self.kind,
            used,
            limit: self.quota,
            remaining: self.quota.saturating_sub(used),
            resets_in_ms: self.wait(now).as_millis() as u64,
        }
    }
}

struct Windows {
    all: [SlidingWindow; 4],
    admitted: u64,
    denied: u64,
}

pub struct AdmissionLimiter {
    windows: Mutex<Windows>,
}

impl AdmissionLimiter {
    pub fn new(config: LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            windows: Mutex::new(Windows {
                all: [
                    SlidingWindow::new(WindowKind::Burst, config.burst_window, config.burst_limit),
                    SlidingWindow::new(WindowKind::Minute, MINUTE, config.requests_per_minute),
                    SlidingWindow::new(WindowKind::Hour, HOUR, config.requests_per_hour),
                    SlidingWindow::new(WindowKind::Day, DAY, config.requests_per_day),
                ],
                admitted: 0,
                denied: 0,
            }),
        })
    }

    /// Check admission now, recording the call if allowed.
    pub fn can_proceed(&self) -> Admission {
        self.check_at(Instant::now())
    }

    /// `true` if the call was admitted (and recorded).
    pub fn acquire(&self) -> bool {
        self.can_proceed().allowed
    }

    /// Check admission at an explicit instant. Instants passed across calls
    /// must be non-decreasing.
    pub fn check_at(&self, now: Instant) -> Admission {
        let mut guard = self.lock();

        for window in guard.all.iter_mut() {
            window.prune(now);
        }

        // Longest wait among saturated windows wins
        let binding = guard
            .all
            .iter()
            .filter(|w| w.is_full())
            .map(|w| (w.kind, w.wait(now)))
            .max_by_key(|(_, wait)| *wait);

        if let Some((kind, wait)) = binding {
            guard.denied += 1;
            debug!(window = ?kind, wait_ms = wait.as_millis() as u64, "Admission denied");
            return Admission::deny(wait);
        }

        for window in guard.all.iter_mut() {
            window.stamps.push_back(now);
        }
        guard.admitted += 1;
        Admission::allow()
    }

    pub fn get_status(&self) -> LimiterStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> LimiterStatus {
        let mut guard = self.lock();
        for window in guard.all.iter_mut() {
            window.prune(now);
        }
        LimiterStatus {
            windows: guard.all.iter().map(|w| w.status(now)).collect(),
            admitted: guard.admitted,
            denied: guard.denied,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
