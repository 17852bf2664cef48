//! Operator alerts raised by the health monitor and the guard

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub target: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(severity: Severity, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            target: target.into(),
            message: message.into(),
            raised_at: Utc::now(),
            acknowledged: false,
        }
    }
}

/// Bounded in-memory alert history
#[derive(Debug)]
pub struct AlertLog {
    entries: Mutex<VecDeque<Alert>>,
    retained: usize,
}

impl AlertLog {
    pub fn new(retained: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retained: retained.max(1),
        }
    }

    pub fn push(&self, alert: Alert) {
        let mut entries = self.entries.lock();
        if entries.len() == self.retained {
            entries.pop_front();
        }
        entries.push_back(alert);
    }

    /// Oldest first
    pub fn list(&self) -> Vec<Alert> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn unacknowledged(&self) -> Vec<Alert> {
        self.entries
            .lock()
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    /// Returns false when no retained alert has this id
    pub fn acknowledge(&self, id: Uuid) -> bool {
        match self.entries.lock().iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(500)
    }
}
