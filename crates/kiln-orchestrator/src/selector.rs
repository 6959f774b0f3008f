//! Model selection over a dispatch report.
//!
//! Candidates are the completed runs a report points at: runs trained in this
//! dispatch and completed runs reused by a skip. Selection is pure; it never
//! calls the run store.

use crate::report::DispatchReport;
use chrono::{DateTime, Utc};
use kiln_store::{RunId, RunRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Default tolerance under which two metric values count as equal.
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// Whether a lower or a higher metric value is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" | "minimize" => Ok(Self::Minimize),
            "max" | "maximize" => Ok(Self::Maximize),
            other => Err(format!("unknown direction '{other}' (expected min or max)")),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Minimize => "min",
            Self::Maximize => "max",
        })
    }
}

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub model_id: String,
    pub run_id: RunId,
    pub metric_value: f64,
    pub started_at: DateTime<Utc>,
}

/// The winning run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedModel {
    pub metric: String,
    pub direction: Direction,
    pub best: LeaderboardEntry,
    /// Number of candidates that carried the metric.
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "selection", rename_all = "snake_case")]
pub enum Selection {
    Selected(SelectedModel),
    /// No completed run in the report carries the metric.
    NoCandidate,
}

impl Selection {
    pub fn selected(&self) -> Option<&SelectedModel> {
        match self {
            Self::Selected(model) => Some(model),
            Self::NoCandidate => None,
        }
    }
}

/// Ranks completed runs by one metric.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    metric: String,
    direction: Direction,
    epsilon: f64,
}

impl ModelSelector {
    pub fn new(metric: impl Into<String>, direction: Direction) -> Self {
        Self { metric: metric.into(), direction, epsilon: DEFAULT_EPSILON }
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon.abs();
        self
    }

    /// Rank `records`, best first. Records without a finite value for the
    /// metric are left out; duplicates (by run id) count once.
    pub fn rank<'a>(&self, records: impl IntoIterator<Item = &'a RunRecord>) -> Vec<LeaderboardEntry> {
        let mut seen = HashSet::new();
        let mut entries: Vec<LeaderboardEntry> = records
            .into_iter()
            .filter(|r| seen.insert(r.run_id.clone()))
            .filter_map(|r| {
                let value = r.metric(&self.metric).filter(|v| v.is_finite())?;
                Some(LeaderboardEntry {
                    model_id: r.model_id.clone(),
                    run_id: r.run_id.clone(),
                    metric_value: value,
                    started_at: r.started_at,
                })
            })
            .collect();
        entries.sort_by(|a, b| self.compare(a, b));
        entries
    }

    /// Leaderboard for every completed run referenced by `report`.
    pub fn leaderboard(&self, report: &DispatchReport) -> Vec<LeaderboardEntry> {
        self.rank(report.entries.iter().filter_map(|e| e.outcome.completed_record()))
    }

    pub fn select_best(&self, report: &DispatchReport) -> Selection {
        self.select_from(report.entries.iter().filter_map(|e| e.outcome.completed_record()))
    }

    /// Same as [`Self::select_best`] over arbitrary records (e.g. a store listing).
    pub fn select_from<'a>(&self, records: impl IntoIterator<Item = &'a RunRecord>) -> Selection {
        let ranked = self.rank(records);
        let candidates = ranked.len();
        match ranked.into_iter().next() {
            Some(best) => Selection::Selected(SelectedModel {
                metric: self.metric.clone(),
                direction: self.direction,
                best,
                candidates,
            }),
            None => Selection::NoCandidate,
        }
    }

    /// Better entries sort first. Values within epsilon tie; ties go to the
    /// earlier run, then the smaller run id.
    fn compare(&self, a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
        let diff = a.metric_value - b.metric_value;
        let by_value = if diff.abs() <= self.epsilon {
            Ordering::Equal
        } else {
            match self.direction {
                Direction::Minimize => a.metric_value.total_cmp(&b.metric_value),
                Direction::Maximize => b.metric_value.total_cmp(&a.metric_value),
            }
        };
        by_value.then_with(|| a.started_at.cmp(&b.started_at)).then_with(|| a.run_id.cmp(&b.run_id))
    }
}

/// Pick the best completed run in `report` for `metric`.
pub fn select_best(report: &DispatchReport, metric: &str, direction: Direction) -> Selection {
    ModelSelector::new(metric, direction).select_best(report)
}
