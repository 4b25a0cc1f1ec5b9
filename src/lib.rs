//! labsim: simulates hands-on lab exercises against a live lab host.
//!
//! Exercise instructions are extracted from course markup into a step tree,
//! then replayed over SSH through the exercise lifecycle (start, grade,
//! steps, grade, finish). Failures are classified into prioritized bugs.

pub mod config;
pub mod error;
pub mod extractor;
pub mod lifecycle;
pub mod remote;
pub mod simulator;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, LabError, Result};
