//! Execution status shared by stages and tasks.

use serde::{Deserialize, Serialize};

/// Status of a stage or task in the execution pipeline.
///
/// Transitions are monotonic: `NoAttempt -> InProgress -> {Successful,
/// Failed}`. A stage never regresses out of `Successful`; a task only
/// leaves a terminal state by being deleted (reload).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// No job attempt has been made yet.
    #[default]
    NoAttempt,
    /// At least one child has started.
    InProgress,
    /// Terminal: completed successfully.
    Successful,
    /// Terminal: completed unsuccessfully.
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAttempt => "no_attempt",
            Self::InProgress => "in_progress",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "no_attempt" => Some(Self::NoAttempt),
            "in_progress" => Some(Self::InProgress),
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
