use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::estimator::RecommendationBasis;
use crate::session::{HaltReason, Phase};
use crate::storage::Report;

/// Every state change in the scheduler produces an Event.
/// The presentation layer renders them; nothing in the core depends on them
/// being delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    PlanStarted {
        plan_id: String,
        task_count: usize,
        at: DateTime<Utc>,
    },
    DurationRecommended {
        task_id: String,
        seconds: u64,
        basis: RecommendationBasis,
        at: DateTime<Utc>,
    },
    PhaseStarted {
        phase: Phase,
        task_id: String,
        duration_secs: u64,
        cycle: u32,
        at: DateTime<Utc>,
    },
    Tick {
        remaining_secs: u64,
        phase: Phase,
    },
    PhaseEnded {
        phase: Phase,
        task_id: String,
        at: DateTime<Utc>,
    },
    /// Study countdown hit zero; the caller must answer with an outcome.
    OutcomeRequested {
        task_id: String,
        at: DateTime<Utc>,
    },
    TimeExtended {
        task_id: String,
        added_secs: u64,
        remaining_secs: u64,
        at: DateTime<Utc>,
    },
    /// The countdown of `from_task` was dropped without a record.
    TaskSwitched {
        from_task: String,
        to_task: String,
        discarded_secs: u64,
        at: DateTime<Utc>,
    },
    TaskEnded {
        task_id: String,
        completed: bool,
        at: DateTime<Utc>,
    },
    PlanHalted {
        plan_id: String,
        reason: HaltReason,
        at: DateTime<Utc>,
    },
    PlanCompleted {
        report: Report,
        at: DateTime<Utc>,
    },
    SamplerWarning {
        reason: String,
        at: DateTime<Utc>,
    },
    /// An analytics write failed; the timer keeps running.
    PersistenceFailed {
        message: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Short machine name, handy for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PlanStarted { .. } => "plan_started",
            Event::DurationRecommended { .. } => "duration_recommended",
            Event::PhaseStarted { .. } => "phase_started",
            Event::Tick { .. } => "tick",
            Event::PhaseEnded { .. } => "phase_ended",
            Event::OutcomeRequested { .. } => "outcome_requested",
            Event::TimeExtended { .. } => "time_extended",
            Event::TaskSwitched { .. } => "task_switched",
            Event::TaskEnded { .. } => "task_ended",
            Event::PlanHalted { .. } => "plan_halted",
            Event::PlanCompleted { .. } => "plan_completed",
            Event::SamplerWarning { .. } => "sampler_warning",
            Event::PersistenceFailed { .. } => "persistence_failed",
        }
    }
}
