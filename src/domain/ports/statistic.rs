//! Aggregate statistics supported by stage-level reporting queries.

use crate::domain::errors::{DomainError, DomainResult};

/// The aggregation functions stage statistics may request. Anything
/// else is a caller error, not a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    Avg,
    Sum,
    Max,
    Min,
    Count,
}

impl Statistic {
    /// SQL aggregate function name.
    pub fn sql_fn(&self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Sum => "SUM",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Count => "COUNT",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "Avg" => Ok(Self::Avg),
            "Sum" => Ok(Self::Sum),
            "Max" => Ok(Self::Max),
            "Min" => Ok(Self::Min),
            "Count" => Ok(Self::Count),
            other => Err(DomainError::UnknownStatistic(other.to_string())),
        }
    }
}
