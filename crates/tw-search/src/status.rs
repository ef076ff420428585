//! Run tracking for sequential searches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tw_types::{Candidate, Direction, FitRecord};

/// Unique search run identifier.
pub type SearchId = Uuid;

/// Lifecycle state of a search run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Cumulative best after one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationBest {
    pub iteration: usize,
    pub config: String,
    pub candidate: Candidate,
    /// Mean of the target metric for `candidate`.
    pub mean: f64,
    /// Whether this iteration improved on the previous best.
    pub improved: bool,
}

/// Aggregate status of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub id: SearchId,
    pub metric: String,
    pub direction: Direction,
    pub state: SearchState,
    pub iterations_completed: usize,
    pub fits_completed: usize,
    pub fits_failed: usize,
    pub best: Option<IterationBest>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SearchStatus {
    pub fn new(metric: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            metric: metric.into(),
            direction,
            state: SearchState::Pending,
            iterations_completed: 0,
            fits_completed: 0,
            fits_failed: 0,
            best: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = SearchState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = SearchState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = SearchState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn record_fits(&mut self, records: &[FitRecord]) {
        let succeeded = records.iter().filter(|r| r.succeeded()).count();
        self.fits_completed += succeeded;
        self.fits_failed += records.len() - succeeded;
    }

    /// Replace the best if `candidate` strictly improves on it. Returns
    /// whether it did.
    pub fn update_best(&mut self, candidate: &IterationBest) -> bool {
        let improves = match &self.best {
            None => true,
            Some(current) => self.direction.improves(candidate.mean, current.mean),
        };
        if improves {
            self.best = Some(candidate.clone());
        }
        improves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn best(iteration: usize, mean: f64) -> IterationBest {
        IterationBest {
            iteration,
            config: format!("Iter{iteration}"),
            candidate: Candidate::default().with_model("k", iteration as i64),
            mean,
            improved: true,
        }
    }

    #[test]
    fn lifecycle() {
        let mut status = SearchStatus::new("rmse", Direction::Minimize);
        assert_eq!(status.state, SearchState::Pending);
        status.mark_running();
        assert!(status.started_at.is_some());
        status.mark_failed("surrogate failed".into());
        assert_eq!(status.state, SearchState::Failed);
        assert_eq!(status.error.as_deref(), Some("surrogate failed"));
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn update_best_respects_direction() {
        let mut status = SearchStatus::new("rmse", Direction::Minimize);
        assert!(status.update_best(&best(0, 2.0)));
        assert!(!status.update_best(&best(1, 3.0)));
        assert!(!status.update_best(&best(2, 2.0)));
        assert!(status.update_best(&best(3, 1.0)));
        assert_eq!(status.best.as_ref().map(|b| b.iteration), Some(3));
    }
}
