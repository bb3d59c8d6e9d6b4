use super::{Result, ShuttleError, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RunNumber = u32;

/// Data-taking window of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Builds a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<()> {
        if self.end <= self.start {
            return Err(ShuttleError::Config(format!(
                "malformed run window: end {} is not after start {}",
                self.end, self.start
            )));
        }
        Ok(())
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// One timestamped archive reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsSample {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

/// Ordered samples of a single signal over the queried window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsValueSet {
    pub signal: String,
    pub samples: Vec<ConditionsSample>,
}

impl ConditionsValueSet {
    pub fn new(signal: impl Into<String>, mut samples: Vec<ConditionsSample>) -> Self {
        samples.sort_by_key(|sample| sample.timestamp);
        Self {
            signal: signal.into(),
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn numeric_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().filter_map(|sample| sample.value.as_f64())
    }
}

/// Upper end of a validity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunBound {
    Finite(RunNumber),
    /// Valid until superseded.
    Infinite,
}

impl RunBound {
    pub fn covers(&self, run: RunNumber) -> bool {
        match self {
            Self::Finite(last) => run <= *last,
            Self::Infinite => true,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

impl fmt::Display for RunBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(run) => write!(f, "{}", run),
            Self::Infinite => write!(f, "inf"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityRange {
    pub first: RunNumber,
    pub last: RunBound,
}

impl ValidityRange {
    pub fn new(first: RunNumber, last: RunBound) -> Result<Self> {
        if let RunBound::Finite(last) = last {
            if last < first {
                return Err(ShuttleError::Store(format!(
                    "invalid validity range [{}, {}]",
                    first, last
                )));
            }
        }
        Ok(Self { first, last })
    }

    pub fn single(run: RunNumber) -> Self {
        Self {
            first: run,
            last: RunBound::Finite(run),
        }
    }

    pub fn open_ended(first: RunNumber) -> Self {
        Self {
            first,
            last: RunBound::Infinite,
        }
    }

    pub fn contains(&self, run: RunNumber) -> bool {
        run >= self.first && self.last.covers(run)
    }

    pub fn overlaps(&self, other: &ValidityRange) -> bool {
        let self_reaches = other.last.covers(self.first);
        let other_reaches = self.last.covers(other.first);
        self_reaches && other_reaches
    }

    pub fn is_infinite(&self) -> bool {
        self.last.is_infinite()
    }
}

impl fmt::Display for ValidityRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}
