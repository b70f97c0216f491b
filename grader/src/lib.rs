//! grader - Parallel notebook autograding across interchangeable runtimes.
//!
//! Grades student submissions by executing each one inside an isolated,
//! ephemeral compute unit. Substrates are interchangeable behind one
//! contract: a local Docker daemon, Kubernetes batch jobs, or OpenShift
//! batch jobs.
//!
//! # Core Concepts
//!
//! - **RuntimeBackend**: The [`RuntimeBackend`] trait drives one compute
//!   unit's lifecycle (`start`, `wait`, `kill`, `logs`, `finalize`);
//!   [`RuntimeFactory`] allocates units for a substrate picked by
//!   [`RuntimeKind`].
//!
//! - **Orchestrator**: [`Orchestrator`] fans one unit out per submission
//!   under a bounded worker pool, with per-unit timeout watchdogs,
//!   guaranteed staging cleanup, and a report that tolerates partial
//!   failure.
//!
//! - **Builder**: The [`ImageBuilder`] trait turns an autograder archive
//!   plus config overrides into a reusable grading image.
//!
//! - **ScoreRecord**: Each unit's result artifact is flattened into a
//!   [`ScoreRecord`]; the run returns one [`UnitReport`] row per
//!   submission with an explicit status.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use grader::*;
//!
//! let kind = RuntimeKind::from_env()?;
//! let factory = runtime_factory(kind, ClusterJobConfig::default())?;
//! let options = LaunchOptions::new(4)
//!     .with_timeout(std::time::Duration::from_secs(600));
//! let orchestrator = Orchestrator::new(factory, options);
//! let reports = orchestrator.launch("grading:hw01", submissions).await;
//! ```

/// Grading image construction.
///
/// The `builder` module defines the [`ImageBuilder`] trait, the
/// [`BuildRequest`] inputs, the config-overrides merge, and the local
/// Docker implementation.
pub mod builder;

/// Configuration structures and substrate selection.
///
/// The `config` module defines [`LaunchOptions`], [`ClusterJobConfig`],
/// and the [`RuntimeKind`]/[`BuilderKind`] selection enums with their
/// environment helpers.
pub mod config;

/// Failure taxonomy.
///
/// The `error` module defines [`GradeError`] plus the backend-local
/// [`RuntimeError`] and builder-local [`BuildError`] enums.
pub mod error;

/// Parallel grading engine.
///
/// The `orchestrator` module provides [`Orchestrator`], the bounded
/// worker pool that drives one compute unit per submission.
pub mod orchestrator;

/// Runtime backends.
///
/// The `runtime` module defines the [`RuntimeBackend`]/[`RuntimeFactory`]
/// contract, the unit state machine, the fixed in-unit filesystem
/// layout, and the Docker/Kubernetes/OpenShift implementations.
pub mod runtime;

/// Result artifacts and report rows.
///
/// The `score` module defines [`GradingResults`], [`ScoreRecord`], and
/// the per-submission [`UnitReport`].
pub mod score;

/// Per-unit staging with scoped cleanup.
///
/// The `staging` module provides [`StagedUnit`], which owns a unit's
/// temporary input/result/PDF files and removes them exactly once.
pub mod staging;

/// Tracing spans and metric recorders for the grading lifecycle.
pub mod telemetry;

#[cfg(feature = "metrics")]
/// Prometheus metrics, compiled behind the `metrics` feature.
pub mod metrics;

pub use builder::{image_builder, BuildRequest, DockerImageBuilder, ImageBuilder};
pub use config::{
    BuilderKind, ClusterJobConfig, LaunchOptions, NetworkPolicy, ReadinessGate, RetryConfig,
    RuntimeKind,
};
pub use error::{BuildError, GradeError, RuntimeError};
pub use orchestrator::Orchestrator;
pub use runtime::{
    runtime_factory, RuntimeBackend, RuntimeFactory, RuntimeSpec, UnitExit, UnitState,
    VolumeBinding,
};
pub use score::{GradingResults, ScoreRecord, TestResult, UnitReport, UnitStatus};
pub use staging::StagedUnit;
