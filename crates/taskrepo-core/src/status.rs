//! Status and priority enums for task records.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow status of a task record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Not started yet.
    #[default]
    Pending,
    /// Someone is working on it.
    #[serde(alias = "in_progress")]
    InProgress,
    /// Finished.
    #[serde(alias = "completed")]
    Done,
    /// Dropped.
    Cancelled,
}

impl Status {
    /// Position in the default listing order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::InProgress => 1,
            Self::Done => 2,
            Self::Cancelled => 3,
        }
    }

    /// Canonical spelling used in task files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a status, accepting the legacy spellings.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(Self::Pending),
            "in-progress" | "in_progress" => Some(Self::InProgress),
            "done" | "completed" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of a task record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    #[serde(rename = "H", alias = "high")]
    High,
    #[default]
    #[serde(rename = "M", alias = "medium")]
    Medium,
    #[serde(rename = "L", alias = "low")]
    Low,
}

impl Priority {
    /// Position in the default listing order (high first).
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    /// Canonical spelling used in task files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "H",
            Self::Medium => "M",
            Self::Low => "L",
        }
    }

    /// Parse a priority from its short or long spelling.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "H" | "h" | "high" => Some(Self::High),
            "M" | "m" | "medium" => Some(Self::Medium),
            "L" | "l" | "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
