//! # Focusloop Core Library
//!
//! Core logic for the focusloop focus timer: a plan of tasks is worked
//! through in study/break cycles, each study countdown is sized from past
//! performance, and optional screen sampling records what was on screen.
//! The CLI is a thin layer over this crate.
//!
//! ## Architecture
//!
//! - **Session**: a tick-driven state machine ([`Scheduler`]) plus an async
//!   driver ([`SessionRunner`]) that feeds it one tick per second
//! - **Estimator**: history-backed duration recommendations with a
//!   periodically refined per-category prior
//! - **Sampler**: background screen capture, OCR and comprehensibility filtering
//! - **Storage**: SQLite analytics store and TOML configuration
//!
//! ## Key Components
//!
//! - [`Scheduler`]: study/break state machine
//! - [`DurationEstimator`]: duration recommendation and refinement
//! - [`ActivitySampler`]: per-phase screen sampling
//! - [`AnalyticsStore`]: session records and task histories
//! - [`Config`]: application configuration management

pub mod classifier;
pub mod error;
pub mod estimator;
pub mod events;
pub mod sampler;
pub mod session;
pub mod storage;

pub use classifier::{Category, Classifier, ClassifierScheme};
pub use error::{CaptureError, ConfigError, CoreError, PersistenceError, StateError, ValidationError};
pub use estimator::{DurationEstimator, EstimatorConfig, Recommendation, RecommendationBasis};
pub use events::Event;
pub use sampler::{ActivityMonitor, ActivitySampler, NullMonitor, SamplerConfig};
pub use session::{
    Outcome, Phase, Plan, PlanSettings, Scheduler, SchedulerSnapshot, SessionHandle,
    SessionRunner, SessionState, TaskSpec,
};
pub use storage::{AnalyticsStore, Config, Report, SessionRecord, SessionStore};
