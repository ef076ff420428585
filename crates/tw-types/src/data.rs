//! Base dataset and read-only row views over it.

use serde::{Deserialize, Serialize};

use crate::errors::TuneResult;
use crate::validation_error;

/// Numeric base dataset: a row-major feature matrix plus one outcome column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub outcome: Vec<f64>,
}

impl Dataset {
    pub fn new(columns: Vec<String>, features: Vec<Vec<f64>>, outcome: Vec<f64>) -> TuneResult<Self> {
        if features.len() != outcome.len() {
            return Err(validation_error!(
                "feature rows ({}) and outcome length ({}) differ",
                features.len(),
                outcome.len()
            ));
        }
        if let Some((i, row)) = features
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(validation_error!(
                "row {} has {} values, expected {}",
                i,
                row.len(),
                columns.len()
            ));
        }
        Ok(Self {
            columns,
            features,
            outcome,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.outcome.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Borrow a subset of rows. Indices must be in range (checked by the
    /// execution loop before any fit starts).
    pub fn view<'a>(&'a self, rows: &'a [usize]) -> DataView<'a> {
        DataView { data: self, rows }
    }
}

/// Read-only view of selected dataset rows.
#[derive(Debug, Clone, Copy)]
pub struct DataView<'a> {
    data: &'a Dataset,
    rows: &'a [usize],
}

impl<'a> DataView<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &'a [String] {
        &self.data.columns
    }

    /// Dataset row indices covered by the view.
    pub fn rows(&self) -> &'a [usize] {
        self.rows
    }

    pub fn features(&self, i: usize) -> &'a [f64] {
        &self.data.features[self.rows[i]]
    }

    pub fn outcome(&self, i: usize) -> f64 {
        self.data.outcome[self.rows[i]]
    }

    pub fn outcomes(&self) -> Vec<f64> {
        self.rows.iter().map(|&r| self.data.outcome[r]).collect()
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|&r| self.data.features[r][index])
            .collect()
    }
}

/// Output of a fitted preprocessor applied to a view: owned, model-ready data.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    pub columns: Vec<String>,
    pub features: Vec<Vec<f64>>,
    pub outcome: Vec<f64>,
    /// Dataset row index of each processed row.
    pub rows: Vec<usize>,
}

impl Processed {
    /// Copy a view through unchanged.
    pub fn from_view(view: &DataView<'_>) -> Self {
        Self {
            columns: view.columns().to_vec(),
            features: (0..view.len()).map(|i| view.features(i).to_vec()).collect(),
            outcome: view.outcomes(),
            rows: view.rows().to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.outcome.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Dataset {
        Dataset::new(
            vec!["x".into(), "z".into()],
            vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]],
            vec![0.5, 1.5, 2.5],
        )
        .unwrap()
    }

    #[test]
    fn rejects_ragged_rows() {
        let result = Dataset::new(vec!["x".into()], vec![vec![1.0, 2.0]], vec![1.0]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let result = Dataset::new(vec!["x".into()], vec![vec![1.0]], vec![1.0, 2.0]);
        assert!(result.is_err());
    }

    #[test]
    fn view_selects_rows() {
        let data = tiny();
        let rows = [2, 0];
        let view = data.view(&rows);
        assert_eq!(view.len(), 2);
        assert_eq!(view.features(0), &[3.0, 30.0]);
        assert_eq!(view.outcomes(), vec![2.5, 0.5]);
        assert_eq!(view.column(1), vec![30.0, 10.0]);
    }

    #[test]
    fn processed_copies_view() {
        let data = tiny();
        let rows = [1];
        let processed = Processed::from_view(&data.view(&rows));
        assert_eq!(processed.rows, vec![1]);
        assert_eq!(processed.features, vec![vec![2.0, 20.0]]);
        assert_eq!(processed.outcome, vec![1.5]);
    }
}
