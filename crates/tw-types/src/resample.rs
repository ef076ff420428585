//! Train/validation splits and the resample source interface.

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::TuneResult;
use crate::validation_error;

/// One train/validation split over the base dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resample {
    pub id: String,
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

impl Resample {
    pub fn new(id: impl Into<String>, train: Vec<usize>, validation: Vec<usize>) -> Self {
        Self {
            id: id.into(),
            train,
            validation,
        }
    }

    /// Check that every index addresses a row of a dataset with `n_rows` rows.
    pub fn validate(&self, n_rows: usize) -> TuneResult<()> {
        if self.train.is_empty() || self.validation.is_empty() {
            return Err(validation_error!(
                "resample {} has an empty train or validation set",
                self.id
            ));
        }
        if let Some(bad) = self
            .train
            .iter()
            .chain(self.validation.iter())
            .find(|&&i| i >= n_rows)
        {
            return Err(validation_error!(
                "resample {} references row {} but the dataset has {} rows",
                self.id,
                bad,
                n_rows
            ));
        }
        Ok(())
    }
}

/// Producer of resamples. Identifiers must be stable: they are copied
/// verbatim into every output row.
pub trait ResampleSource {
    fn generate(&self, n_rows: usize, rng: &mut dyn RngCore) -> TuneResult<Vec<Resample>>;
}

/// V-fold cross-validation, optionally repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFold {
    pub folds: usize,
    pub repeats: usize,
}

impl VFold {
    pub fn new(folds: usize) -> Self {
        Self { folds, repeats: 1 }
    }

    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }
}

impl Default for VFold {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ResampleSource for VFold {
    fn generate(&self, n_rows: usize, rng: &mut dyn RngCore) -> TuneResult<Vec<Resample>> {
        if self.folds < 2 {
            return Err(validation_error!("v-fold needs at least 2 folds, got {}", self.folds));
        }
        if self.folds > n_rows {
            return Err(validation_error!(
                "cannot make {} folds from {} rows",
                self.folds,
                n_rows
            ));
        }
        if self.repeats == 0 {
            return Err(validation_error!("repeats must be at least 1"));
        }

        let fold_width = self.folds.to_string().len();
        let repeat_width = self.repeats.to_string().len();
        let mut resamples = Vec::with_capacity(self.folds * self.repeats);

        for repeat in 0..self.repeats {
            let mut order: Vec<usize> = (0..n_rows).collect();
            order.shuffle(rng);

            for fold in 0..self.folds {
                let mut validation: Vec<usize> = order
                    .iter()
                    .enumerate()
                    .filter(|(pos, _)| pos % self.folds == fold)
                    .map(|(_, &row)| row)
                    .collect();
                validation.sort_unstable();
                let mut train: Vec<usize> = order
                    .iter()
                    .enumerate()
                    .filter(|(pos, _)| pos % self.folds != fold)
                    .map(|(_, &row)| row)
                    .collect();
                train.sort_unstable();

                let fold_id = format!("Fold{:0w$}", fold + 1, w = fold_width);
                let id = if self.repeats > 1 {
                    format!("Repeat{:0w$}_{fold_id}", repeat + 1, w = repeat_width)
                } else {
                    fold_id
                };
                resamples.push(Resample::new(id, train, validation));
            }
        }

        Ok(resamples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn folds_partition_rows() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let resamples = VFold::new(4).generate(22, &mut rng).unwrap();
        assert_eq!(resamples.len(), 4);

        let mut seen: Vec<usize> = resamples
            .iter()
            .flat_map(|r| r.validation.iter().copied())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..22).collect::<Vec<_>>());

        for r in &resamples {
            assert_eq!(r.train.len() + r.validation.len(), 22);
            assert!(r.validate(22).is_ok());
        }
    }

    #[test]
    fn ids_are_padded() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let resamples = VFold::new(10).with_repeats(2).generate(40, &mut rng).unwrap();
        assert_eq!(resamples.len(), 20);
        assert_eq!(resamples[0].id, "Repeat1_Fold01");
        assert_eq!(resamples[19].id, "Repeat2_Fold10");
    }

    #[test]
    fn same_seed_same_splits() {
        let a = VFold::new(3)
            .generate(12, &mut ChaCha8Rng::seed_from_u64(42))
            .unwrap();
        let b = VFold::new(3)
            .generate(12, &mut ChaCha8Rng::seed_from_u64(42))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn too_many_folds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(VFold::new(5).generate(3, &mut rng).is_err());
    }

    #[test]
    fn validate_catches_out_of_range() {
        let r = Resample::new("Fold1", vec![0, 1], vec![5]);
        assert!(r.validate(3).is_err());
    }
}
