//! # Core Error Types
//!
//! Errors raised by data set and parameter store operations.

use thiserror::Error;

use crate::attribute::ValueType;

/// Errors that can occur while managing particle data sets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataSetError {
    /// Mapping a data set would overflow the register table.
    #[error("register table overflow: {kind} registers need {required}, max is {max}")]
    RegisterOverflow {
        /// Which side of the table overflowed ("input" or "output").
        kind: &'static str,
        /// Registers needed after appending the data set.
        required: usize,
        /// Registers the table can hold.
        max: usize,
    },
}

/// Result type for data set operations.
pub type DataSetResult<T> = Result<T, DataSetError>;

/// Errors that can occur while reading or writing parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    /// Parameter not declared in the store layout.
    #[error("parameter not found: {0}")]
    UnknownParameter(String),

    /// Parameter exists with a different type.
    #[error("parameter {name} is {found:?}, accessed as {expected:?}")]
    TypeMismatch {
        /// Parameter name.
        name: String,
        /// Type requested by the caller.
        expected: ValueType,
        /// Type declared in the layout.
        found: ValueType,
    },

    /// Data interface slot not declared in the store.
    #[error("data interface not found: {0}")]
    UnknownInterface(String),
}

/// Result type for parameter operations.
pub type ParameterResult<T> = Result<T, ParameterError>;
