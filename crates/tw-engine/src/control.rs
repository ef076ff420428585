//! Run options for grid evaluation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which units of work are dispatched to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelOver {
    /// Everything runs on the calling thread.
    Sequential,
    /// One task per resample; groups inside a resample run in order.
    Resamples,
    /// One task per (resample, preprocessing group).
    ResamplesAndGroups,
}

impl Default for ParallelOver {
    fn default() -> Self {
        Self::Resamples
    }
}

/// Options controlling a grid run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlGrid {
    /// Attach validation-set predictions to every record.
    pub save_pred: bool,
    pub parallel_over: ParallelOver,
    /// Log every fit at `info` instead of `debug`.
    pub verbose: bool,
    /// Per-stage wall-clock limit. A stage running longer is recorded as a
    /// failed fit; it is not interrupted.
    pub fit_timeout_ms: Option<u64>,
}

impl Default for ControlGrid {
    fn default() -> Self {
        Self {
            save_pred: false,
            parallel_over: ParallelOver::default(),
            verbose: false,
            fit_timeout_ms: None,
        }
    }
}

impl ControlGrid {
    pub fn with_save_pred(mut self, save_pred: bool) -> Self {
        self.save_pred = save_pred;
        self
    }

    pub fn with_parallel_over(mut self, parallel_over: ParallelOver) -> Self {
        self.parallel_over = parallel_over;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_fit_timeout(mut self, timeout: Duration) -> Self {
        self.fit_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn fit_timeout(&self) -> Option<Duration> {
        self.fit_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let control = ControlGrid::default();
        assert!(!control.save_pred);
        assert_eq!(control.parallel_over, ParallelOver::Resamples);
        assert!(control.fit_timeout().is_none());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let control: ControlGrid =
            serde_json::from_str(r#"{"save_pred": true, "parallel_over": "resamples_and_groups"}"#)
                .unwrap();
        assert!(control.save_pred);
        assert_eq!(control.parallel_over, ParallelOver::ResamplesAndGroups);
        assert!(!control.verbose);
    }

    #[test]
    fn timeout_builder() {
        let control = ControlGrid::default().with_fit_timeout(Duration::from_secs(2));
        assert_eq!(control.fit_timeout_ms, Some(2000));
        assert_eq!(control.fit_timeout(), Some(Duration::from_secs(2)));

        let huge = ControlGrid::default().with_fit_timeout(Duration::MAX);
        assert_eq!(huge.fit_timeout_ms, Some(u64::MAX));
    }
}
