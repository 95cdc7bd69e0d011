//! End-of-plan aggregate view over a plan's session records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::analytics::SessionRecord;
use crate::classifier::Category;
use crate::sampler::ActivitySummary;
use crate::session::Phase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub description: String,
    pub category: Category,
    pub time_spent_secs: u64,
    pub completed: bool,
    #[serde(default)]
    pub activity: Option<ActivitySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub plan_id: String,
    pub tasks: Vec<TaskReport>,
    pub completed_count: usize,
    pub abandoned_count: usize,
    pub total_study_secs: u64,
    pub by_category: BTreeMap<Category, u64>,
}

impl Report {
    /// Fold a plan's records (in append order) into a report.
    /// Break records are skipped.
    pub fn from_records(plan_id: &str, records: &[SessionRecord]) -> Self {
        let mut tasks: Vec<TaskReport> = Vec::new();
        for record in records.iter().filter(|r| r.phase == Phase::Study) {
            match tasks.iter_mut().find(|t| t.task_id == record.task_id) {
                Some(existing) => {
                    existing.time_spent_secs += record.elapsed_secs;
                    existing.completed |= record.completed;
                    if record.activity_summary.is_some() {
                        existing.activity = record.activity_summary.clone();
                    }
                }
                None => tasks.push(TaskReport {
                    task_id: record.task_id.clone(),
                    description: record.task_description.clone(),
                    category: record.category,
                    time_spent_secs: record.elapsed_secs,
                    completed: record.completed,
                    activity: record.activity_summary.clone(),
                }),
            }
        }

        let mut by_category = BTreeMap::new();
        for t in &tasks {
            *by_category.entry(t.category).or_insert(0) += t.time_spent_secs;
        }
        let completed_count = tasks.iter().filter(|t| t.completed).count();

        Self {
            plan_id: plan_id.to_string(),
            completed_count,
            abandoned_count: tasks.len() - completed_count,
            total_study_secs: tasks.iter().map(|t| t.time_spent_secs).sum(),
            tasks,
            by_category,
        }
    }

    /// Plain-text summary for the end-of-plan screen.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.abandoned_count == 0 && !self.tasks.is_empty() {
            let _ = writeln!(out, "Congratulations, every task is done!");
        } else {
            let _ = writeln!(
                out,
                "Plan finished: {} of {} tasks completed.",
                self.completed_count,
                self.tasks.len()
            );
        }

        let _ = writeln!(out, "\nTask Time Breakdown:");
        for t in &self.tasks {
            let _ = writeln!(
                out,
                " - {} ({}): {} [{}]",
                t.description,
                t.category,
                display_time(t.time_spent_secs),
                if t.completed { "completed" } else { "not completed" }
            );
        }

        let _ = writeln!(out, "\nCategory Totals:");
        for (category, secs) in &self.by_category {
            let _ = writeln!(out, " - {category}: {}", display_time(*secs));
        }
        let _ = writeln!(out, "\nTotal study time: {}", display_time(self.total_study_secs));

        let with_activity: Vec<&TaskReport> =
            self.tasks.iter().filter(|t| t.activity.is_some()).collect();
        if !with_activity.is_empty() {
            let _ = writeln!(out, "\nScreen Activity Highlights:");
            for t in &with_activity {
                let Some(activity) = &t.activity else { continue };
                for h in &activity.highlights {
                    let _ = writeln!(
                        out,
                        "At {} on '{}' ({}):\n {}",
                        h.at.format("%H:%M:%S"),
                        h.source_label,
                        t.description,
                        h.excerpt
                    );
                }
            }

            let _ = writeln!(out, "\nPage/Application Focus Summary:");
            let mut per_source: BTreeMap<&str, u64> = BTreeMap::new();
            for t in &with_activity {
                let Some(activity) = &t.activity else { continue };
                for s in &activity.sources {
                    *per_source.entry(s.label.as_str()).or_insert(0) += s.approx_secs;
                }
            }
            for (label, secs) in per_source {
                let _ = writeln!(out, " - {label}: Focused for {}", display_time(secs));
            }
        }
        out
    }
}

/// `MM:SS`, minutes unbounded.
pub fn display_time(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
