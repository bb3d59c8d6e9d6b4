pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, ShuttleError};
pub use types::{
    ConditionsSample, ConditionsValueSet, RunBound, RunNumber, TimeWindow, ValidityRange,
};
pub use value::Value;
