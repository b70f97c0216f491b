//! Test support for the grader crate.
//!
//! Provides a scriptable [`MockRuntimeFactory`]/[`MockBackend`] pair that
//! records every lifecycle call, a [`MockImageBuilder`], and fixture
//! helpers for fake submissions and result artifacts.

pub mod fixtures;
pub mod mock;

pub use fixtures::{passing_results, submission_fixtures};
pub use mock::{MockBackend, MockImageBuilder, MockRuntimeFactory, MockScript, UnitRecord};
