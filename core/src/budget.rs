//! Global retry budget
//!
//! Caps how many retries (not first attempts) the whole process may spend
//! per minute and per hour. The budget is the single point of
//! synchronization shared by every target.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// How consumption windows are measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Rolling 60s / 3600s windows over a timestamp log
    #[default]
    Sliding,
    /// Counters that reset when the window boundary is crossed
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub mode: WindowMode,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 60,
            max_per_hour: 1000,
            mode: WindowMode::Sliding,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_per_hour < self.max_per_minute {
            problems.push(format!(
                "budget max_per_hour ({}) is below max_per_minute ({})",
                self.max_per_hour, self.max_per_minute
            ));
        }
        problems
    }
}

/// Snapshot of budget consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetStatus {
    pub consumed_minute: u32,
    pub consumed_hour: u32,
    pub remaining_minute: u32,
    pub remaining_hour: u32,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
}

#[derive(Debug)]
enum BudgetWindow {
    Sliding {
        minute: VecDeque<Instant>,
        hour: VecDeque<Instant>,
    },
    Fixed {
        minute_start: Instant,
        hour_start: Instant,
        consumed_minute: u32,
        consumed_hour: u32,
    },
}

impl BudgetWindow {
    fn new(mode: WindowMode) -> Self {
        match mode {
            WindowMode::Sliding => BudgetWindow::Sliding {
                minute: VecDeque::new(),
                hour: VecDeque::new(),
            },
            WindowMode::Fixed => {
                let now = Instant::now();
                BudgetWindow::Fixed {
                    minute_start: now,
                    hour_start: now,
                    consumed_minute: 0,
                    consumed_hour: 0,
                }
            }
        }
    }

    /// Drop expired entries or roll fixed windows forward
    fn refresh(&mut self, now: Instant) {
        match self {
            BudgetWindow::Sliding { minute, hour } => {
                evict(minute, now, MINUTE);
                evict(hour, now, HOUR);
            }
            BudgetWindow::Fixed {
                minute_start,
                hour_start,
                consumed_minute,
                consumed_hour,
            } => {
                if now.duration_since(*minute_start) >= MINUTE {
                    *minute_start = now;
                    *consumed_minute = 0;
                }
                if now.duration_since(*hour_start) >= HOUR {
                    *hour_start = now;
                    *consumed_hour = 0;
                }
            }
        }
    }

    fn consumed(&self) -> (u32, u32) {
        match self {
            BudgetWindow::Sliding { minute, hour } => (minute.len() as u32, hour.len() as u32),
            BudgetWindow::Fixed {
                consumed_minute,
                consumed_hour,
                ..
            } => (*consumed_minute, *consumed_hour),
        }
    }

    fn take(&mut self, now: Instant) {
        match self {
            BudgetWindow::Sliding { minute, hour } => {
                minute.push_back(now);
                hour.push_back(now);
            }
            BudgetWindow::Fixed {
                consumed_minute,
                consumed_hour,
                ..
            } => {
                *consumed_minute += 1;
                *consumed_hour += 1;
            }
        }
    }
}

fn evict(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while log
        .front()
        .is_some_and(|at| now.duration_since(*at) >= window)
    {
        log.pop_front();
    }
}

/// Process-wide retry allowance
#[derive(Debug)]
pub struct RetryBudget {
    config: BudgetConfig,
    window: Mutex<BudgetWindow>,
}

impl RetryBudget {
    pub fn new(config: BudgetConfig) -> Self {
        let window = Mutex::new(BudgetWindow::new(config.mode));
        Self { config, window }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn has_room(&self, window: &BudgetWindow) -> bool {
        let (minute, hour) = window.consumed();
        minute < self.config.max_per_minute && hour < self.config.max_per_hour
    }

    /// Whether one more retry fits in both windows
    pub fn can_consume(&self) -> bool {
        let mut window = self.window.lock();
        window.refresh(Instant::now());
        self.has_room(&window)
    }

    /// Atomically check and take one retry
    ///
    /// Returns `false` without changing anything when either window is full.
    pub fn consume(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.refresh(now);
        if !self.has_room(&window) {
            tracing::debug!(
                max_per_minute = self.config.max_per_minute,
                max_per_hour = self.config.max_per_hour,
                "retry budget exhausted"
            );
            return false;
        }
        window.take(now);
        true
    }

    pub fn status(&self) -> BudgetStatus {
        let mut window = self.window.lock();
        window.refresh(Instant::now());
        let (consumed_minute, consumed_hour) = window.consumed();

        BudgetStatus {
            consumed_minute,
            consumed_hour,
            remaining_minute: self.config.max_per_minute.saturating_sub(consumed_minute),
            remaining_hour: self.config.max_per_hour.saturating_sub(consumed_hour),
            max_per_minute: self.config.max_per_minute,
            max_per_hour: self.config.max_per_hour,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
