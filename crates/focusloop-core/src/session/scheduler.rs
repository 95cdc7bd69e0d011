//! Tick-driven session state machine.
//!
//! The scheduler never reads the clock to advance: the caller invokes
//! [`Scheduler::tick`] once per second while a countdown is running. Every
//! operation returns the events it produced. Operations either apply fully
//! or return an error without touching state; only analytics writes may
//! fail after the fact, and those surface as [`Event::PersistenceFailed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{
    AbandonPolicy, HaltReason, Outcome, Phase, Plan, PlanSettings, SessionState, Task, TaskStatus,
};
use crate::classifier::{Category, Classifier};
use crate::error::{CoreError, PersistenceError, StateError, ValidationError};
use crate::estimator::{DurationEstimator, Recommendation, RecommendationBasis};
use crate::events::Event;
use crate::sampler::{ActivityBuffer, ActivityMonitor, ActivitySummary, NullMonitor};
use crate::storage::{Report, SessionRecord, SessionStore};

/// State of one plan from `start` until it completes or halts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRun {
    plan_id: String,
    settings: PlanSettings,
    tasks: Vec<Task>,
    /// Unfinished task ids, plan order.
    queue: Vec<String>,
    current: Option<String>,
    /// Task the running break follows.
    last_task: Option<String>,
    phase: Option<Phase>,
    remaining_secs: u64,
    /// Seconds ticked in the current interval, extensions included.
    elapsed_secs: u64,
    cycle: u32,
    phase_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    activity: ActivityBuffer,
    /// Records appended for this plan, in order.
    #[serde(default)]
    records: Vec<SessionRecord>,
}

impl PlanRun {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn settings(&self) -> &PlanSettings {
        &self.settings
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

/// Serializable scheduler state for resuming an interrupted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub state: SessionState,
    pub run: Option<PlanRun>,
}

impl SchedulerSnapshot {
    pub fn plan_id(&self) -> Option<&str> {
        self.run.as_ref().map(PlanRun::plan_id)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: &str| ValidationError::invalid("snapshot", msg);
        let needs_run = self.state.is_counting() || self.state == SessionState::AwaitingOutcome;
        let Some(run) = &self.run else {
            return if needs_run {
                Err(invalid("active state without a plan"))
            } else {
                Ok(())
            };
        };
        if needs_run && run.phase.is_none() {
            return Err(invalid("active state without a phase"));
        }
        if matches!(self.state, SessionState::Studying | SessionState::AwaitingOutcome) {
            let current = run.current.as_deref().ok_or_else(|| invalid("no current task"))?;
            if run.task(current).is_none() {
                return Err(ValidationError::UnknownTask(current.to_string()));
            }
        }
        if run.queue.iter().any(|id| run.task(id).is_none()) {
            return Err(invalid("queue references an unknown task"));
        }
        run.settings.validate()
    }
}

/// Session scheduler.
///
/// Owns the plan and its tasks, consults the classifier and the estimator,
/// starts the activity monitor for study phases only, and appends
/// analytics records on terminal task outcomes.
pub struct Scheduler {
    store: Arc<dyn SessionStore>,
    estimator: Arc<DurationEstimator>,
    classifier: Classifier,
    monitor: Box<dyn ActivityMonitor>,
    state: SessionState,
    run: Option<PlanRun>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        estimator: Arc<DurationEstimator>,
        classifier: Classifier,
        monitor: Box<dyn ActivityMonitor>,
    ) -> Self {
        Self {
            store,
            estimator,
            classifier,
            monitor,
            state: SessionState::Idle,
            run: None,
        }
    }

    /// Scheduler with screen sampling disabled.
    pub fn without_sampling(
        store: Arc<dyn SessionStore>,
        estimator: Arc<DurationEstimator>,
        classifier: Classifier,
    ) -> Self {
        Self::new(store, estimator, classifier, Box::new(NullMonitor::default()))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> Option<Phase> {
        self.run.as_ref().and_then(|r| r.phase)
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.run.as_ref().map_or(0, |r| r.remaining_secs)
    }

    pub fn cycle(&self) -> u32 {
        self.run.as_ref().map_or(0, |r| r.cycle)
    }

    pub fn tasks(&self) -> &[Task] {
        self.run.as_ref().map_or(&[][..], |r| r.tasks.as_slice())
    }

    pub fn current_task(&self) -> Option<&Task> {
        let run = self.run.as_ref()?;
        run.task(run.current.as_deref()?)
    }

    pub fn plan_id(&self) -> Option<&str> {
        self.run.as_ref().map(PlanRun::plan_id)
    }

    pub fn settings(&self) -> Option<&PlanSettings> {
        self.run.as_ref().map(PlanRun::settings)
    }

    pub fn sampler_running(&self) -> bool {
        self.monitor.is_running()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Validate `plan` and enter `Studying` on its first task.
    ///
    /// # Errors
    /// `StateError` while a plan is in progress, `ValidationError` for a bad
    /// plan. Neither creates any state.
    pub fn start(&mut self, plan: Plan) -> Result<Vec<Event>, CoreError> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::PlanComplete | SessionState::Halted
        ) {
            return Err(self.reject("start"));
        }
        plan.validate()?;

        let mut events = Vec::new();
        let settings = plan.settings;
        let mut tasks = Vec::with_capacity(plan.tasks.len());
        for spec in plan.tasks {
            let category = spec
                .category
                .unwrap_or_else(|| self.classifier.classify(&spec.description));
            let (planned, pinned) = match spec.planned_duration_seconds {
                Some(secs) => (secs, true),
                None if settings.adaptive_timing => {
                    (self.recommend(&spec.description, category, &mut events).seconds, false)
                }
                None => (settings.study_seconds, false),
            };
            tasks.push(Task::new(spec.description, category, planned, pinned));
        }

        let plan_id = format!("plan-{}", uuid::Uuid::new_v4());
        let first = tasks[0].id.clone();
        events.push(Event::PlanStarted {
            plan_id: plan_id.clone(),
            task_count: tasks.len(),
            at: Utc::now(),
        });
        tracing::info!(plan_id = %plan_id, tasks = tasks.len(), "plan started");

        self.run = Some(PlanRun {
            plan_id,
            queue: tasks.iter().map(|t| t.id.clone()).collect(),
            tasks,
            settings,
            current: None,
            last_task: None,
            phase: None,
            remaining_secs: 0,
            elapsed_secs: 0,
            cycle: 1,
            phase_started_at: None,
            activity: ActivityBuffer::default(),
            records: Vec::new(),
        });
        self.begin_study(&first, &mut events);
        Ok(events)
    }

    /// Advance the running countdown by one second.
    ///
    /// Emits `Tick(remaining)` before decrementing. Ignored outside a
    /// countdown phase.
    pub fn tick(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        if !self.state.is_counting() {
            return events;
        }
        self.drain_warnings(&mut events);

        let Some(run) = self.run.as_mut() else {
            return events;
        };
        let Some(phase) = run.phase else {
            return events;
        };
        events.push(Event::Tick {
            remaining_secs: run.remaining_secs,
            phase,
        });
        run.remaining_secs = run.remaining_secs.saturating_sub(1);
        run.elapsed_secs += 1;
        if run.remaining_secs > 0 {
            return events;
        }

        match phase {
            Phase::Study => self.end_study(&mut events),
            Phase::ShortBreak | Phase::LongBreak => self.end_break(phase, &mut events),
        }
        events
    }

    /// Answer the outcome prompt raised when a study countdown hit zero.
    pub fn supply_outcome(&mut self, outcome: Outcome) -> Result<Vec<Event>, CoreError> {
        if self.state != SessionState::AwaitingOutcome {
            return Err(self.reject("supply_outcome"));
        }
        let mut events = Vec::new();
        match outcome {
            Outcome::ExtendTime => {
                let run = self.run_mut("supply_outcome")?;
                let added = run.settings.extend_increment_seconds;
                run.remaining_secs += added;
                // the extension continues the same interval, so a degraded sampler stays off
                let resume_sampling = !run.activity.degraded;
                let event = Event::TimeExtended {
                    task_id: run.current.clone().unwrap_or_default(),
                    added_secs: added,
                    remaining_secs: run.remaining_secs,
                    at: Utc::now(),
                };
                self.state = SessionState::Studying;
                if resume_sampling {
                    self.monitor.start();
                }
                events.push(event);
            }
            Outcome::Completed => {
                self.finish_task(true, &mut events)?;
                self.advance(&mut events);
            }
            Outcome::NotCompleted => {
                self.finish_task(false, &mut events)?;
                let policy = self.run_mut("supply_outcome")?.settings.abandon_policy;
                match policy {
                    AbandonPolicy::HaltPlan => self.halt(HaltReason::TaskAbandoned, &mut events),
                    AbandonPolicy::SkipToNext => self.advance(&mut events),
                }
            }
        }
        Ok(events)
    }

    /// Restart the study countdown on another unfinished task.
    ///
    /// Seconds already counted for the task being left are dropped (no
    /// record) and reported as `discarded_secs`; that task goes back to
    /// pending. The cycle counter is unchanged.
    pub fn switch_task(&mut self, task_id: &str) -> Result<Vec<Event>, CoreError> {
        if self.state != SessionState::Studying {
            return Err(self.reject("switch_task"));
        }
        let run = self.run_mut("switch_task")?;
        let target = run
            .task(task_id)
            .ok_or_else(|| ValidationError::UnknownTask(task_id.to_string()))?;
        if target.status.is_terminal() || !run.queue.iter().any(|id| id == task_id) {
            return Err(StateError::TaskNotSwitchable(task_id.to_string()).into());
        }
        let from = run.current.clone().unwrap_or_default();
        let discarded = run.elapsed_secs;

        let dropped = self.monitor.stop();
        tracing::debug!(kept = dropped.entries.len(), "discarding activity for switched task");

        let run = self.run_mut("switch_task")?;
        run.activity = ActivityBuffer::default();
        if from != task_id {
            if let Some(left) = run.task_mut(&from) {
                left.transition(TaskStatus::Pending)?;
            }
        }

        let mut events = vec![Event::TaskSwitched {
            from_task: from,
            to_task: task_id.to_string(),
            discarded_secs: discarded,
            at: Utc::now(),
        }];
        self.begin_study(task_id, &mut events);
        Ok(events)
    }

    /// Stop the plan now.
    ///
    /// During study (or while awaiting an outcome) the current task is
    /// recorded as not completed with the seconds counted so far.
    pub fn cancel(&mut self) -> Result<Vec<Event>, CoreError> {
        let mut events = Vec::new();
        match self.state {
            SessionState::Studying | SessionState::AwaitingOutcome => {
                self.finish_task(false, &mut events)?;
            }
            SessionState::ShortBreak | SessionState::LongBreak => {
                self.monitor.stop();
            }
            _ => return Err(self.reject("cancel")),
        }
        self.halt(HaltReason::Cancelled, &mut events);
        Ok(events)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            state: self.state,
            run: self.run.clone(),
        }
    }

    /// Resume from a snapshot. Sampling restarts if it was mid-study.
    pub fn restore(&mut self, snapshot: SchedulerSnapshot) -> Result<Vec<Event>, CoreError> {
        if !matches!(
            self.state,
            SessionState::Idle | SessionState::PlanComplete | SessionState::Halted
        ) {
            return Err(self.reject("restore"));
        }
        snapshot.validate()?;

        self.state = snapshot.state;
        self.run = snapshot.run;
        let mut events = Vec::new();
        let Some(run) = self.run.as_ref() else {
            return Ok(events);
        };
        let task_id = match self.state {
            SessionState::ShortBreak | SessionState::LongBreak => run.last_task.clone(),
            _ => run.current.clone(),
        }
        .unwrap_or_default();
        tracing::info!(plan_id = %run.plan_id, state = ?self.state, "session restored");

        if let (true, Some(phase)) = (self.state.is_counting(), run.phase) {
            events.push(Event::PhaseStarted {
                phase,
                task_id,
                duration_secs: run.remaining_secs,
                cycle: run.cycle,
                at: Utc::now(),
            });
            if phase == Phase::Study {
                self.monitor.start();
            }
        } else if self.state == SessionState::AwaitingOutcome {
            events.push(Event::OutcomeRequested {
                task_id,
                at: Utc::now(),
            });
        }
        Ok(events)
    }

    /// Stop sampling without changing state, before the process exits.
    pub fn suspend(&mut self) {
        if self.monitor.is_running() {
            self.monitor.stop();
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    fn reject(&self, operation: &'static str) -> CoreError {
        StateError::InvalidOperation {
            operation,
            state: self.state,
        }
        .into()
    }

    fn run_mut(&mut self, operation: &'static str) -> Result<&mut PlanRun, CoreError> {
        let state = self.state;
        self.run
            .as_mut()
            .ok_or(StateError::InvalidOperation { operation, state }.into())
    }

    fn recommend(
        &self,
        description: &str,
        category: Category,
        events: &mut Vec<Event>,
    ) -> Recommendation {
        match self
            .estimator
            .recommend_from_store(self.store.as_ref(), description, category)
        {
            Ok(r) => r,
            Err(e) => {
                events.push(persistence_failed(&e));
                Recommendation {
                    seconds: self.estimator.prior(category),
                    basis: RecommendationBasis::NoData,
                    samples: 0,
                }
            }
        }
    }

    fn begin_study(&mut self, task_id: &str, events: &mut Vec<Event>) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        let Some(task) = run.task(task_id) else {
            tracing::error!(task_id, "study requested for unknown task");
            return;
        };
        let recommendation = (run.settings.adaptive_timing && !task.duration_pinned)
            .then(|| (task.description.clone(), task.category));
        let recommendation =
            recommendation.map(|(desc, category)| self.recommend(&desc, category, events));

        let Some(run) = self.run.as_mut() else {
            return;
        };
        let now = Utc::now();
        let Some(task) = run.task_mut(task_id) else {
            return;
        };
        if task.status == TaskStatus::Pending {
            if let Err(e) = task.transition(TaskStatus::Active) {
                tracing::warn!(error = %e, "task activation rejected");
            }
        }
        if let Some(r) = recommendation {
            task.planned_duration_seconds = r.seconds;
            events.push(Event::DurationRecommended {
                task_id: task_id.to_string(),
                seconds: r.seconds,
                basis: r.basis,
                at: now,
            });
        }
        let duration = task.planned_duration_seconds;

        run.current = Some(task_id.to_string());
        run.phase = Some(Phase::Study);
        run.remaining_secs = duration;
        run.elapsed_secs = 0;
        run.phase_started_at = Some(now);
        run.activity = ActivityBuffer::default();
        let cycle = run.cycle;

        self.state = SessionState::Studying;
        self.monitor.start();
        events.push(Event::PhaseStarted {
            phase: Phase::Study,
            task_id: task_id.to_string(),
            duration_secs: duration,
            cycle,
            at: now,
        });
    }

    fn end_study(&mut self, events: &mut Vec<Event>) {
        let buffer = self.monitor.stop();
        self.drain_warnings(events);
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.activity.merge(buffer);
        let task_id = run.current.clone().unwrap_or_default();
        let now = Utc::now();
        self.state = SessionState::AwaitingOutcome;
        events.push(Event::PhaseEnded {
            phase: Phase::Study,
            task_id: task_id.clone(),
            at: now,
        });
        events.push(Event::OutcomeRequested { task_id, at: now });
    }

    fn end_break(&mut self, phase: Phase, events: &mut Vec<Event>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let now = Utc::now();
        let last = run.last_task.clone().unwrap_or_default();
        events.push(Event::PhaseEnded {
            phase,
            task_id: last.clone(),
            at: now,
        });

        if run.settings.log_breaks {
            if let Some(task) = run.task(&last) {
                let record = SessionRecord {
                    plan_id: run.plan_id.clone(),
                    task_id: task.id.clone(),
                    task_description: task.description.clone(),
                    category: task.category,
                    phase,
                    started_at: run.phase_started_at.unwrap_or(now),
                    ended_at: now,
                    elapsed_secs: run.elapsed_secs,
                    completed: true,
                    activity_summary: None,
                };
                self.append(record, events);
            }
        }

        let next = self.run.as_ref().and_then(|r| r.queue.first().cloned());
        match next {
            Some(id) => self.begin_study(&id, events),
            None => self.complete_plan(events),
        }
    }

    /// Mark the current task terminal and append its study record.
    fn finish_task(&mut self, completed: bool, events: &mut Vec<Event>) -> Result<(), CoreError> {
        let target = if completed {
            TaskStatus::Completed
        } else {
            TaskStatus::Abandoned
        };
        {
            let run = self.run_mut("finish_task")?;
            let id = run.current.clone().ok_or(StateError::InvalidOperation {
                operation: "finish_task",
                state: SessionState::Idle,
            })?;
            let task = run
                .task(&id)
                .ok_or_else(|| ValidationError::UnknownTask(id.clone()))?;
            if !task.status.can_transition_to(&target) {
                return Err(StateError::InvalidTaskTransition {
                    task_id: id,
                    from: task.status.to_string(),
                    to: target.to_string(),
                }
                .into());
            }
        }

        let late = self.monitor.stop();
        let run = self.run_mut("finish_task")?;
        run.activity.merge(late);
        let buffer = std::mem::take(&mut run.activity);
        let Some(task_id) = run.current.take() else {
            return Ok(());
        };
        let now = Utc::now();
        let (description, category) = match run.task_mut(&task_id) {
            Some(task) => {
                task.transition(target)?;
                (task.description.clone(), task.category)
            }
            None => return Ok(()),
        };
        let record = SessionRecord {
            plan_id: run.plan_id.clone(),
            task_id: task_id.clone(),
            task_description: description,
            category,
            phase: Phase::Study,
            started_at: run.phase_started_at.unwrap_or(now),
            ended_at: now,
            elapsed_secs: run.elapsed_secs,
            completed,
            activity_summary: (!buffer.is_empty()).then(|| ActivitySummary::summarize(&buffer)),
        };
        run.queue.retain(|id| *id != task_id);
        run.last_task = Some(task_id.clone());
        run.phase = None;
        run.remaining_secs = 0;

        tracing::info!(task_id = %task_id, completed, elapsed = record.elapsed_secs, "task ended");
        self.append(record, events);
        events.push(Event::TaskEnded {
            task_id,
            completed,
            at: now,
        });
        Ok(())
    }

    /// Break branch, or plan completion when nothing is left.
    fn advance(&mut self, events: &mut Vec<Event>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.queue.is_empty() {
            self.complete_plan(events);
            return;
        }

        let (phase, duration, state) = if run.cycle >= run.settings.cycles_before_long_break {
            run.cycle = 1;
            (Phase::LongBreak, run.settings.long_break_seconds, SessionState::LongBreak)
        } else {
            run.cycle += 1;
            (Phase::ShortBreak, run.settings.short_break_seconds, SessionState::ShortBreak)
        };
        let now = Utc::now();
        run.phase = Some(phase);
        run.remaining_secs = duration;
        run.elapsed_secs = 0;
        run.phase_started_at = Some(now);
        events.push(Event::PhaseStarted {
            phase,
            task_id: run.last_task.clone().unwrap_or_default(),
            duration_secs: duration,
            cycle: run.cycle,
            at: now,
        });
        self.state = state;
    }

    fn complete_plan(&mut self, events: &mut Vec<Event>) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.phase = None;
        run.remaining_secs = 0;
        run.current = None;
        let plan_id = run.plan_id.clone();
        self.state = SessionState::PlanComplete;

        let report = match self.store.summarize(&plan_id) {
            Ok(report) => report,
            Err(e) => {
                events.push(persistence_failed(&e));
                let records = self.run.as_ref().map_or(&[][..], |r| r.records.as_slice());
                Report::from_records(&plan_id, records)
            }
        };
        tracing::info!(
            plan_id = %plan_id,
            completed = report.completed_count,
            abandoned = report.abandoned_count,
            "plan complete"
        );
        events.push(Event::PlanCompleted {
            report,
            at: Utc::now(),
        });
    }

    fn halt(&mut self, reason: HaltReason, events: &mut Vec<Event>) {
        self.monitor.stop();
        let plan_id = match self.run.as_mut() {
            Some(run) => {
                run.phase = None;
                run.remaining_secs = 0;
                run.current = None;
                run.plan_id.clone()
            }
            None => String::new(),
        };
        self.state = SessionState::Halted;
        tracing::info!(plan_id = %plan_id, ?reason, "plan halted");
        events.push(Event::PlanHalted {
            plan_id,
            reason,
            at: Utc::now(),
        });
    }

    fn append(&mut self, record: SessionRecord, events: &mut Vec<Event>) {
        if let Err(e) = self.store.record(&record) {
            tracing::error!(error = %e, task_id = %record.task_id, "failed to append session record");
            events.push(persistence_failed(&e));
        }
        if let Some(run) = self.run.as_mut() {
            run.records.push(record);
        }
    }

    fn drain_warnings(&mut self, events: &mut Vec<Event>) {
        for reason in self.monitor.take_warnings() {
            tracing::warn!(%reason, "sampler warning");
            events.push(Event::SamplerWarning {
                reason,
                at: Utc::now(),
            });
        }
    }
}

fn persistence_failed(e: &PersistenceError) -> Event {
    Event::PersistenceFailed {
        message: e.to_string(),
        at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ActivityEntry;
    use crate::session::TaskSpec;
    use crate::storage::{AnalyticsStore, HistoryKey, TaskHistory};
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn settings(study: u64, short: u64, long: u64, cycles: u32) -> PlanSettings {
        PlanSettings {
            study_seconds: study,
            short_break_seconds: short,
            long_break_seconds: long,
            cycles_before_long_break: cycles,
            ..PlanSettings::default()
        }
    }

    fn scheduler() -> (Scheduler, Arc<AnalyticsStore>) {
        let store = Arc::new(AnalyticsStore::open_memory().unwrap());
        let s = Scheduler::without_sampling(
            store.clone(),
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
        );
        (s, store)
    }

    fn plan(descriptions: &[&str], settings: PlanSettings) -> Plan {
        Plan::new(descriptions.iter().map(|d| TaskSpec::new(*d)).collect(), settings)
    }

    /// Tick until the current countdown ends, collecting every event.
    /// Stops at the phase boundary even when the next phase counts too.
    fn run_phase(s: &mut Scheduler) -> Vec<Event> {
        let mut events = Vec::new();
        let phase = s.phase();
        for _ in 0..10_000 {
            if !s.state().is_counting() || s.phase() != phase {
                break;
            }
            events.extend(s.tick());
        }
        events
    }

    fn ticks(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Tick { remaining_secs, .. } => Some(*remaining_secs),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_task_runs_to_plan_complete() {
        let (mut s, store) = scheduler();
        s.start(plan(&["Write report"], settings(2, 5, 15, 1))).unwrap();
        assert_eq!(s.state(), SessionState::Studying);
        assert_eq!(s.current_task().unwrap().category, Category::Doing);

        let events = run_phase(&mut s);
        assert_eq!(ticks(&events), vec![2, 1]);
        assert_eq!(s.state(), SessionState::AwaitingOutcome);
        assert!(events.iter().any(|e| matches!(e, Event::OutcomeRequested { .. })));

        let events = s.supply_outcome(Outcome::Completed).unwrap();
        assert_eq!(s.state(), SessionState::PlanComplete);
        let completions: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::PlanCompleted { .. }))
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(store.record_count().unwrap(), 1);

        let Event::PlanCompleted { report, .. } = completions[0] else {
            unreachable!()
        };
        assert_eq!(report.completed_count, 1);
        assert_eq!(report.total_study_secs, 2);
    }

    #[test]
    fn four_cycles_give_three_short_breaks_then_long() {
        let (mut s, _store) = scheduler();
        s.start(plan(&["a", "b", "c", "d", "e"], settings(1, 1, 1, 4))).unwrap();

        let mut breaks = Vec::new();
        while !s.state().is_terminal() {
            for e in run_phase(&mut s) {
                if let Event::PhaseStarted { phase, .. } = e {
                    if phase != Phase::Study {
                        breaks.push(phase);
                    }
                }
            }
            if s.state() == SessionState::AwaitingOutcome {
                for e in s.supply_outcome(Outcome::Completed).unwrap() {
                    if let Event::PhaseStarted { phase, .. } = e {
                        breaks.push(phase);
                    }
                }
            }
        }
        assert_eq!(
            breaks,
            vec![Phase::ShortBreak, Phase::ShortBreak, Phase::ShortBreak, Phase::LongBreak]
        );
        assert_eq!(s.state(), SessionState::PlanComplete);
    }

    #[test]
    fn extend_time_adds_increment_without_record() {
        let (mut s, store) = scheduler();
        let cfg = PlanSettings {
            extend_increment_seconds: 3,
            ..settings(2, 1, 1, 1)
        };
        s.start(plan(&["Read chapter"], cfg)).unwrap();
        run_phase(&mut s);
        let cycle = s.cycle();
        let task = s.current_task().unwrap().id.clone();

        let events = s.supply_outcome(Outcome::ExtendTime).unwrap();
        assert!(matches!(events[0], Event::TimeExtended { added_secs: 3, remaining_secs: 3, .. }));
        assert_eq!(s.state(), SessionState::Studying);
        assert_eq!(s.remaining_seconds(), 3);
        assert_eq!(s.cycle(), cycle);
        assert_eq!(s.current_task().unwrap().id, task);
        assert_eq!(store.record_count().unwrap(), 0);

        assert_eq!(ticks(&run_phase(&mut s)), vec![3, 2, 1]);
        s.supply_outcome(Outcome::Completed).unwrap();
        let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].elapsed_secs, 5);
    }

    #[test]
    fn not_completed_halts_plan_by_default() {
        let (mut s, store) = scheduler();
        s.start(plan(&["first", "second"], settings(1, 1, 1, 2))).unwrap();
        run_phase(&mut s);
        let events = s.supply_outcome(Outcome::NotCompleted).unwrap();

        assert_eq!(s.state(), SessionState::Halted);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PlanHalted { reason: HaltReason::TaskAbandoned, .. }
        )));
        assert_eq!(s.tasks()[0].status, TaskStatus::Abandoned);
        assert_eq!(s.tasks()[1].status, TaskStatus::Pending);
        assert_eq!(store.record_count().unwrap(), 1);
        assert!(s.tick().is_empty());
        assert!(s.supply_outcome(Outcome::Completed).is_err());
    }

    #[test]
    fn skip_policy_moves_on_to_next_task() {
        let (mut s, store) = scheduler();
        let cfg = PlanSettings {
            abandon_policy: AbandonPolicy::SkipToNext,
            ..settings(1, 1, 1, 2)
        };
        s.start(plan(&["first", "second"], cfg)).unwrap();
        run_phase(&mut s);
        s.supply_outcome(Outcome::NotCompleted).unwrap();
        assert_eq!(s.state(), SessionState::ShortBreak);

        run_phase(&mut s);
        assert_eq!(s.state(), SessionState::Studying);
        assert_eq!(s.current_task().unwrap().description, "second");
        run_phase(&mut s);
        s.supply_outcome(Outcome::Completed).unwrap();
        assert_eq!(s.state(), SessionState::PlanComplete);
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn switch_task_discards_elapsed_and_keeps_cycle() {
        let (mut s, store) = scheduler();
        s.start(plan(&["first", "second"], settings(10, 1, 1, 4))).unwrap();
        s.tick();
        s.tick();
        let second = s.tasks()[1].id.clone();

        let events = s.switch_task(&second).unwrap();
        assert!(matches!(
            &events[0],
            Event::TaskSwitched { discarded_secs: 2, to_task, .. } if *to_task == second
        ));
        assert_eq!(s.remaining_seconds(), 10);
        assert_eq!(s.cycle(), 1);
        assert_eq!(s.tasks()[0].status, TaskStatus::Pending);
        assert_eq!(s.tasks()[1].status, TaskStatus::Active);
        assert_eq!(store.record_count().unwrap(), 0);

        let err = s.switch_task("task-missing").unwrap_err();
        assert!(matches!(err, CoreError::Validation(ValidationError::UnknownTask(_))));
    }

    #[test]
    fn switch_is_rejected_outside_study() {
        let (mut s, _store) = scheduler();
        s.start(plan(&["first", "second"], settings(1, 5, 5, 4))).unwrap();
        let first = s.tasks()[0].id.clone();
        run_phase(&mut s);
        let before = s.snapshot();
        let err = s.switch_task(&first).unwrap_err();
        assert!(matches!(err, CoreError::State(StateError::InvalidOperation { .. })));
        assert_eq!(s.state(), before.state);

        s.supply_outcome(Outcome::Completed).unwrap();
        assert_eq!(s.state(), SessionState::ShortBreak);
        assert!(s.switch_task(&first).is_err());
    }

    #[test]
    fn cancel_records_partial_study_and_halts() {
        let (mut s, store) = scheduler();
        s.start(plan(&["Study graphs"], settings(60, 5, 5, 4))).unwrap();
        for _ in 0..7 {
            s.tick();
        }
        let events = s.cancel().unwrap();
        assert_eq!(s.state(), SessionState::Halted);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PlanHalted { reason: HaltReason::Cancelled, .. }
        )));
        let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].completed);
        assert_eq!(records[0].elapsed_secs, 7);
        assert!(s.cancel().is_err());
    }

    #[test]
    fn invalid_plan_creates_no_state() {
        let (mut s, _store) = scheduler();
        let err = s.start(plan(&[], settings(1, 1, 1, 1))).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(s.start(plan(&["a"], settings(1, 1, 1, 0))).is_err());
        assert!(s.start(plan(&["a"], settings(0, 1, 1, 1))).is_err());
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.plan_id().is_none());
    }

    #[test]
    fn operations_rejected_in_wrong_state() {
        let (mut s, _store) = scheduler();
        assert!(matches!(
            s.supply_outcome(Outcome::Completed),
            Err(CoreError::State(_))
        ));
        assert!(s.cancel().is_err());
        s.start(plan(&["a"], settings(5, 1, 1, 1))).unwrap();
        assert!(s.start(plan(&["b"], settings(5, 1, 1, 1))).is_err());
        assert_eq!(s.tasks()[0].description, "a");
    }

    #[test]
    fn new_plan_accepted_after_completion() {
        let (mut s, _store) = scheduler();
        s.start(plan(&["a"], settings(1, 1, 1, 1))).unwrap();
        run_phase(&mut s);
        s.supply_outcome(Outcome::Completed).unwrap();
        let first_plan = s.plan_id().unwrap().to_string();
        s.start(plan(&["b"], settings(1, 1, 1, 1))).unwrap();
        assert_ne!(s.plan_id().unwrap(), first_plan);
        assert_eq!(s.state(), SessionState::Studying);
    }

    struct FailingStore;

    impl SessionStore for FailingStore {
        fn record(&self, _: &SessionRecord) -> Result<i64, PersistenceError> {
            Err(PersistenceError::Locked)
        }
        fn history_for(&self, _: &HistoryKey) -> Result<TaskHistory, PersistenceError> {
            Err(PersistenceError::Locked)
        }
        fn all_histories(&self) -> Result<Vec<(HistoryKey, TaskHistory)>, PersistenceError> {
            Err(PersistenceError::Locked)
        }
        fn records_for_plan(&self, _: &str) -> Result<Vec<SessionRecord>, PersistenceError> {
            Err(PersistenceError::Locked)
        }
        fn kv_get(&self, _: &str) -> Result<Option<String>, PersistenceError> {
            Err(PersistenceError::Locked)
        }
        fn kv_set(&self, _: &str, _: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::Locked)
        }
    }

    #[test]
    fn persistence_failure_is_reported_and_timer_continues() {
        let mut s = Scheduler::without_sampling(
            Arc::new(FailingStore),
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
        );
        let cfg = PlanSettings {
            adaptive_timing: true,
            ..settings(1, 1, 1, 1)
        };
        let events = s.start(plan(&["Read notes"], cfg)).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::PersistenceFailed { .. })));
        // prior for Learning
        assert_eq!(s.remaining_seconds(), 1800);

        for _ in 0..1800 {
            s.tick();
        }
        let events = s.supply_outcome(Outcome::Completed).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::PersistenceFailed { .. })));
        let report = events.iter().find_map(|e| match e {
            Event::PlanCompleted { report, .. } => Some(report),
            _ => None,
        });
        assert_eq!(report.unwrap().completed_count, 1);
        assert_eq!(s.state(), SessionState::PlanComplete);
    }

    #[test]
    fn adaptive_timing_uses_history() {
        let store = Arc::new(AnalyticsStore::open_memory().unwrap());
        for secs in [2400, 2400] {
            store
                .record(&SessionRecord {
                    plan_id: "old".into(),
                    task_id: "t".into(),
                    task_description: "write docs".into(),
                    category: Category::Doing,
                    phase: Phase::Study,
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    elapsed_secs: secs,
                    completed: true,
                    activity_summary: None,
                })
                .unwrap();
        }
        let mut s = Scheduler::without_sampling(
            store,
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
        );
        let cfg = PlanSettings {
            adaptive_timing: true,
            ..settings(60, 1, 1, 1)
        };
        let events = s
            .start(Plan::new(
                vec![TaskSpec::new("Write docs"), TaskSpec::new("write tests").with_duration(42)],
                cfg,
            ))
            .unwrap();

        let recommended = events.iter().find_map(|e| match e {
            Event::DurationRecommended { seconds, basis, .. } => Some((*seconds, *basis)),
            _ => None,
        });
        assert_eq!(recommended, Some((1800, RecommendationBasis::History)));
        assert_eq!(s.remaining_seconds(), 1800);
        assert_eq!(s.tasks()[1].planned_duration_seconds, 42);
        assert!(s.tasks()[1].duration_pinned);
    }

    #[derive(Clone, Default)]
    struct CallLog {
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    struct RecordingMonitor {
        calls: CallLog,
        running: bool,
    }

    impl ActivityMonitor for RecordingMonitor {
        fn start(&mut self) {
            self.calls.log.lock().unwrap().push("start");
            self.running = true;
        }

        fn stop(&mut self) -> ActivityBuffer {
            if !self.running {
                return ActivityBuffer::default();
            }
            self.running = false;
            self.calls.log.lock().unwrap().push("stop");
            ActivityBuffer {
                entries: vec![ActivityEntry {
                    timestamp: Utc::now(),
                    source_label: "Editor".into(),
                    extracted_text: "the report is done".into(),
                    is_comprehensible: true,
                    score: 1.0,
                }],
                interval_secs: 30,
                ..ActivityBuffer::default()
            }
        }

        fn take_warnings(&mut self) -> Vec<String> {
            Vec::new()
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    #[test]
    fn sampler_runs_only_during_study() {
        let store = Arc::new(AnalyticsStore::open_memory().unwrap());
        let calls = CallLog::default();
        let mut s = Scheduler::new(
            store.clone(),
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
            Box::new(RecordingMonitor {
                calls: calls.clone(),
                running: false,
            }),
        );
        s.start(plan(&["a", "b"], settings(1, 1, 1, 4))).unwrap();
        assert!(s.sampler_running());
        run_phase(&mut s);
        assert!(!s.sampler_running());
        s.supply_outcome(Outcome::ExtendTime).unwrap();
        assert!(s.sampler_running());
        run_phase(&mut s);
        s.supply_outcome(Outcome::Completed).unwrap();
        assert_eq!(s.state(), SessionState::ShortBreak);
        assert!(!s.sampler_running());
        run_phase(&mut s);
        assert!(s.sampler_running());

        assert_eq!(
            *calls.log.lock().unwrap(),
            vec!["start", "stop", "start", "stop", "start"]
        );
        // both runs of the extended interval land on one record
        let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
        let summary = records[0].activity_summary.as_ref().unwrap();
        assert_eq!(summary.samples_kept, 2);
        assert_eq!(summary.sources[0].approx_secs, 60);
    }

    struct DeadDisplay {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl crate::sampler::ScreenSource for DeadDisplay {
        fn capture(&self) -> Result<crate::sampler::Snapshot, crate::error::CaptureError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(crate::error::CaptureError::CaptureFailed("no display".into()))
        }

        fn extract_text(
            &self,
            _snapshot: &crate::sampler::Snapshot,
        ) -> Result<String, crate::error::CaptureError> {
            unreachable!("capture never succeeds")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn extension_keeps_degraded_sampler_off() {
        use crate::sampler::{ActivitySampler, Lexicon, SamplerSettings};
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let store = Arc::new(AnalyticsStore::open_memory().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let sampler = ActivitySampler::new(
            tokio::runtime::Handle::current(),
            Arc::new(DeadDisplay { calls: calls.clone() }),
            Lexicon::builtin(),
            SamplerSettings {
                interval: Duration::from_millis(5),
                threshold: 0.5,
                failure_limit: 3,
                capture_timeout: Duration::from_secs(1),
            },
        );
        let mut s = Scheduler::new(
            store.clone(),
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
            Box::new(sampler),
        );
        s.start(plan(&["a"], settings(1, 1, 1, 4))).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut events = run_phase(&mut s);
        assert_eq!(s.state(), SessionState::AwaitingOutcome);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        events.extend(s.supply_outcome(Outcome::ExtendTime).unwrap());
        assert_eq!(s.state(), SessionState::Studying);
        assert!(!s.sampler_running());
        tokio::time::sleep(Duration::from_millis(200)).await;
        events.extend(run_phase(&mut s));
        events.extend(s.supply_outcome(Outcome::Completed).unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let warnings = events
            .iter()
            .filter(|e| matches!(e, Event::SamplerWarning { .. }))
            .count();
        assert_eq!(warnings, 1);
        let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
        let summary = records[0].activity_summary.as_ref().unwrap();
        assert!(summary.degraded);
        assert_eq!(summary.failures, 3);
    }

    #[test]
    fn snapshot_restores_mid_study() {
        let (mut s, store) = scheduler();
        s.start(plan(&["a", "b"], settings(5, 1, 1, 4))).unwrap();
        s.tick();
        s.tick();
        let json = serde_json::to_string(&s.snapshot()).unwrap();

        let mut resumed = Scheduler::without_sampling(
            store.clone(),
            Arc::new(DurationEstimator::default()),
            Classifier::default(),
        );
        let snapshot: SchedulerSnapshot = serde_json::from_str(&json).unwrap();
        let events = resumed.restore(snapshot).unwrap();
        assert!(matches!(events[0], Event::PhaseStarted { duration_secs: 3, .. }));
        assert_eq!(resumed.state(), SessionState::Studying);
        assert_eq!(resumed.plan_id(), s.plan_id());
        assert_eq!(ticks(&run_phase(&mut resumed)), vec![3, 2, 1]);
        resumed.supply_outcome(Outcome::Completed).unwrap();
        let records = store.records_for_plan(resumed.plan_id().unwrap()).unwrap();
        assert_eq!(records[0].elapsed_secs, 5);
    }

    #[test]
    fn restore_rejects_inconsistent_snapshot() {
        let (mut s, _store) = scheduler();
        let bad = SchedulerSnapshot {
            state: SessionState::Studying,
            run: None,
        };
        assert!(matches!(s.restore(bad), Err(CoreError::Validation(_))));
        assert_eq!(s.state(), SessionState::Idle);
    }

    #[test]
    fn break_records_only_when_enabled() {
        let (mut s, store) = scheduler();
        let cfg = PlanSettings {
            log_breaks: true,
            ..settings(1, 2, 2, 4)
        };
        s.start(plan(&["a", "b"], cfg)).unwrap();
        run_phase(&mut s);
        s.supply_outcome(Outcome::Completed).unwrap();
        run_phase(&mut s);
        let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].phase, Phase::ShortBreak);
        assert_eq!(records[1].elapsed_secs, 2);
        // breaks never feed history
        let history = store.history_for(&HistoryKey::task("a")).unwrap();
        assert_eq!(history.attempts(), 1);
    }

    fn outcome_strategy() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            Just(Outcome::Completed),
            Just(Outcome::NotCompleted),
            Just(Outcome::ExtendTime),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn records_match_terminal_tasks(
            task_count in 1usize..5,
            outcomes in prop::collection::vec(outcome_strategy(), 0..16),
            skip in any::<bool>(),
        ) {
            let (mut s, store) = scheduler();
            let names: Vec<String> = (0..task_count).map(|i| format!("task {i}")).collect();
            let cfg = PlanSettings {
                extend_increment_seconds: 1,
                abandon_policy: if skip { AbandonPolicy::SkipToNext } else { AbandonPolicy::HaltPlan },
                ..settings(1, 1, 1, 2)
            };
            s.start(Plan::new(names.iter().map(TaskSpec::new).collect(), cfg)).unwrap();

            let mut next = outcomes.into_iter();
            while !s.state().is_terminal() {
                run_phase(&mut s);
                if s.state() == SessionState::AwaitingOutcome {
                    let outcome = next.next().unwrap_or(Outcome::Completed);
                    s.supply_outcome(outcome).unwrap();
                }
            }

            let terminal = s.tasks().iter().filter(|t| t.status.is_terminal()).count();
            let records = store.records_for_plan(s.plan_id().unwrap()).unwrap();
            prop_assert_eq!(records.len(), terminal);
            let mut ids: Vec<_> = records.iter().map(|r| r.task_id.clone()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), records.len());

            for (_, history) in store.all_histories().unwrap() {
                prop_assert!(history.completions() <= history.attempts());
                prop_assert_eq!(history.duration_samples().len() as u64, history.completions());
            }
        }
    }
}
