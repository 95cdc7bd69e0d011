//! Plan and task model plus the session state machine.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Studying -> AwaitingOutcome -> (ShortBreak | LongBreak) -> Studying -> ... -> PlanComplete
//!                          |  ^
//!                          |  +-- ExtendTime
//!                          +----> Halted (NotCompleted under halt_plan, or cancel)
//! ```

mod runner;
mod scheduler;

pub use runner::{Command, SessionHandle, SessionRunner};
pub use scheduler::{PlanRun, Scheduler, SchedulerSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classifier::Category;
use crate::error::{StateError, ValidationError};

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Studying,
    /// Countdown reached zero; waiting for the caller's [`Outcome`].
    AwaitingOutcome,
    ShortBreak,
    LongBreak,
    PlanComplete,
    /// Plan stopped early (abandoned task or cancellation).
    Halted,
}

impl SessionState {
    /// Whether a countdown is running in this state.
    pub fn is_counting(&self) -> bool {
        matches!(
            self,
            SessionState::Studying | SessionState::ShortBreak | SessionState::LongBreak
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::PlanComplete | SessionState::Halted)
    }
}

/// A single countdown interval kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Study,
    ShortBreak,
    LongBreak,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Study => "study",
            Phase::ShortBreak => "short_break",
            Phase::LongBreak => "long_break",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "study" => Some(Phase::Study),
            "short_break" => Some(Phase::ShortBreak),
            "long_break" => Some(Phase::LongBreak),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller's answer when a study countdown reaches zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    NotCompleted,
    ExtendTime,
}

/// What happens to the rest of the plan after a `NotCompleted` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Stop the whole plan.
    #[default]
    HaltPlan,
    /// Drop the task and continue with the break branch.
    SkipToNext,
}

/// Why a plan ended in [`SessionState::Halted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    TaskAbandoned,
    Cancelled,
}

/// Task status.
///
/// Valid transitions:
/// - pending → active (task becomes current)
/// - active → pending (switched away)
/// - active → completed | abandoned (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Abandoned,
}

impl TaskStatus {
    pub fn can_transition_to(&self, to: &TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(to, TaskStatus::Active),
            TaskStatus::Active => matches!(
                to,
                TaskStatus::Pending | TaskStatus::Completed | TaskStatus::Abandoned
            ),
            TaskStatus::Completed | TaskStatus::Abandoned => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Abandoned)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Caller-side description of a task to add to a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    /// Overrides the classifier when set.
    #[serde(default)]
    pub category: Option<Category>,
    /// Overrides both the estimator and the fixed study duration when set.
    #[serde(default)]
    pub planned_duration_seconds: Option<u64>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_duration(mut self, seconds: u64) -> Self {
        self.planned_duration_seconds = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Never rewritten after creation.
    pub description: String,
    pub category: Category,
    pub planned_duration_seconds: u64,
    pub status: TaskStatus,
    /// Caller pinned the duration; the estimator is not consulted.
    #[serde(default)]
    pub duration_pinned: bool,
}

impl Task {
    pub(crate) fn new(description: String, category: Category, planned: u64, pinned: bool) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            description,
            category,
            planned_duration_seconds: planned,
            status: TaskStatus::Pending,
            duration_pinned: pinned,
        }
    }

    pub(crate) fn transition(&mut self, to: TaskStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(&to) {
            return Err(StateError::InvalidTaskTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Timing settings shared by every task in a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSettings {
    /// Fixed study length when adaptive timing is off.
    pub study_seconds: u64,
    pub short_break_seconds: u64,
    pub long_break_seconds: u64,
    pub cycles_before_long_break: u32,
    #[serde(default)]
    pub adaptive_timing: bool,
    #[serde(default = "default_extend_increment")]
    pub extend_increment_seconds: u64,
    #[serde(default)]
    pub abandon_policy: AbandonPolicy,
    /// Also append a record for each finished break.
    #[serde(default)]
    pub log_breaks: bool,
}

fn default_extend_increment() -> u64 {
    600
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            study_seconds: 25 * 60,
            short_break_seconds: 5 * 60,
            long_break_seconds: 15 * 60,
            cycles_before_long_break: 4,
            adaptive_timing: false,
            extend_increment_seconds: default_extend_increment(),
            abandon_policy: AbandonPolicy::HaltPlan,
            log_breaks: false,
        }
    }
}

impl PlanSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("study_seconds", self.study_seconds),
            ("short_break_seconds", self.short_break_seconds),
            ("long_break_seconds", self.long_break_seconds),
            ("extend_increment_seconds", self.extend_increment_seconds),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::invalid(field, "must be greater than zero"));
            }
        }
        if self.cycles_before_long_break < 1 {
            return Err(ValidationError::invalid(
                "cycles_before_long_break",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Ordered task queue plus settings, as handed to [`Scheduler::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<TaskSpec>,
    pub settings: PlanSettings,
}

impl Plan {
    pub fn new(tasks: Vec<TaskSpec>, settings: PlanSettings) -> Self {
        Self { tasks, settings }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tasks.is_empty() {
            return Err(ValidationError::EmptyCollection("plan has no tasks".into()));
        }
        self.settings.validate()?;
        for (i, spec) in self.tasks.iter().enumerate() {
            if spec.description.trim().is_empty() {
                return Err(ValidationError::invalid(
                    &format!("tasks[{i}].description"),
                    "must not be blank",
                ));
            }
            if spec.planned_duration_seconds == Some(0) {
                return Err(ValidationError::invalid(
                    &format!("tasks[{i}].planned_duration_seconds"),
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Active));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Completed));
        assert!(TaskStatus::Active.can_transition_to(&TaskStatus::Pending));
        assert!(TaskStatus::Active.can_transition_to(&TaskStatus::Abandoned));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Active));
        assert!(!TaskStatus::Abandoned.can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn terminal_task_rejects_transition() {
        let mut task = Task::new("x".into(), Category::Doing, 60, false);
        task.transition(TaskStatus::Active).unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let err = task.transition(TaskStatus::Active).unwrap_err();
        assert!(matches!(err, StateError::InvalidTaskTransition { .. }));
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn plan_validation() {
        let ok = Plan::new(vec![TaskSpec::new("Write report")], PlanSettings::default());
        assert!(ok.validate().is_ok());

        let empty = Plan::new(vec![], PlanSettings::default());
        assert!(matches!(empty.validate(), Err(ValidationError::EmptyCollection(_))));

        let blank = Plan::new(vec![TaskSpec::new("  ")], PlanSettings::default());
        assert!(blank.validate().is_err());

        let zero_cycles = Plan::new(
            vec![TaskSpec::new("a")],
            PlanSettings {
                cycles_before_long_break: 0,
                ..PlanSettings::default()
            },
        );
        assert!(zero_cycles.validate().is_err());

        let zero_break = Plan::new(
            vec![TaskSpec::new("a")],
            PlanSettings {
                short_break_seconds: 0,
                ..PlanSettings::default()
            },
        );
        assert!(zero_break.validate().is_err());

        let zero_task = Plan::new(vec![TaskSpec::new("a").with_duration(0)], PlanSettings::default());
        assert!(zero_task.validate().is_err());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let json = r#"{"study_seconds":60,"short_break_seconds":5,"long_break_seconds":15,"cycles_before_long_break":2}"#;
        let s: PlanSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.extend_increment_seconds, 600);
        assert_eq!(s.abandon_policy, AbandonPolicy::HaltPlan);
        assert!(!s.adaptive_timing);
    }
}
