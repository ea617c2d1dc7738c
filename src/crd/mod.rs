//! Custom Resource Definitions for the consistency operator

pub mod types;
mod work_set;

#[cfg(test)]
mod tests;

pub use types::*;
pub use work_set::{SpecValidationError, WorkSet, WorkSetSpec, WorkSetStatus};
