//! Candidates and ordered, deduplicated candidate sets.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::params::{format_params, ParamMap, ParameterValue};

/// One concrete assignment of values to all tunable parameters.
///
/// Parameters are split into the preprocessing subset (consumed by the
/// preprocessor) and the model subset (consumed by the model backend).
/// Two candidates are the same candidate when both maps are value-equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub preprocessing: ParamMap,
    pub model: ParamMap,
}

impl Candidate {
    pub fn new(preprocessing: ParamMap, model: ParamMap) -> Self {
        Self {
            preprocessing,
            model,
        }
    }

    pub fn with_preprocessing(
        mut self,
        name: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        self.preprocessing.insert(name.into(), value.into());
        self
    }

    pub fn with_model(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.model.insert(name.into(), value.into());
        self
    }

    /// All parameter values in one map.
    pub fn values(&self) -> ParamMap {
        let mut all = self.preprocessing.clone();
        all.extend(self.model.iter().map(|(k, v)| (k.clone(), v.clone())));
        all
    }

    /// Look up a parameter in either subset.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.preprocessing.get(name).or_else(|| self.model.get(name))
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_params(&self.values()))
    }
}

/// A candidate together with its bookkeeping inside a [`CandidateSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub candidate: Candidate,
    /// Stable configuration label used in every output row.
    pub config: String,
    /// Search iteration that created the candidate (0 for grids).
    pub iteration: usize,
}

/// Candidates sharing one preprocessing configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessingGroup {
    pub preprocessing: ParamMap,
    /// Positions in the owning [`CandidateSet`], in set order.
    pub members: Vec<usize>,
}

/// Ordered, deduplicated collection of candidates.
///
/// Insertion order is creation order and is never changed, so indices into
/// the set are stable for the lifetime of a tuning run.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    entries: Vec<CandidateEntry>,
    index: HashMap<Candidate, usize>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a static grid. Duplicates are dropped and members are labelled
    /// `Preprocessor{i}_Model{j}` after their preprocessing group.
    pub fn from_grid(candidates: impl IntoIterator<Item = Candidate>) -> Self {
        let mut unique: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<Candidate> = HashSet::new();
        for candidate in candidates {
            if seen.insert(candidate.clone()) {
                unique.push(candidate);
            }
        }

        let groups = group_by_preprocessing(|p| unique.get(p), 0..unique.len());
        let group_width = digits(groups.len());
        let model_width = digits(groups.iter().map(|g| g.members.len()).max().unwrap_or(1));

        let mut labels = vec![String::new(); unique.len()];
        for (i, group) in groups.iter().enumerate() {
            for (j, &member) in group.members.iter().enumerate() {
                labels[member] = format!(
                    "Preprocessor{:0gw$}_Model{:0mw$}",
                    i + 1,
                    j + 1,
                    gw = group_width,
                    mw = model_width
                );
            }
        }

        let mut set = Self::new();
        for (candidate, config) in unique.into_iter().zip(labels) {
            set.push(candidate, config, 0);
        }
        set
    }

    /// Append a candidate unless a value-equal one is already present.
    /// Returns the new position, or `None` for a duplicate.
    pub fn push(
        &mut self,
        candidate: Candidate,
        config: impl Into<String>,
        iteration: usize,
    ) -> Option<usize> {
        if self.index.contains_key(&candidate) {
            return None;
        }
        let position = self.entries.len();
        self.index.insert(candidate.clone(), position);
        self.entries.push(CandidateEntry {
            candidate,
            config: config.into(),
            iteration,
        });
        Some(position)
    }

    /// Append the candidates proposed by one search iteration, labelled
    /// `Iter{n}` (or `Iter{n}_{k}` when several are proposed at once).
    /// Returns the positions of the candidates actually added.
    pub fn push_iteration(&mut self, iteration: usize, candidates: Vec<Candidate>) -> Vec<usize> {
        let fresh: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| !self.contains(c))
            .collect();
        let many = fresh.len() > 1;
        let mut added = Vec::with_capacity(fresh.len());
        for (k, candidate) in fresh.into_iter().enumerate() {
            let config = if many {
                format!("Iter{}_{}", iteration, k + 1)
            } else {
                format!("Iter{iteration}")
            };
            if let Some(position) = self.push(candidate, config, iteration) {
                added.push(position);
            }
        }
        added
    }

    pub fn contains(&self, candidate: &Candidate) -> bool {
        self.index.contains_key(candidate)
    }

    pub fn position(&self, candidate: &Candidate) -> Option<usize> {
        self.index.get(candidate).copied()
    }

    pub fn get(&self, position: usize) -> Option<&CandidateEntry> {
        self.entries.get(position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.entries.iter()
    }

    /// Group the given positions by preprocessing values, groups ordered by
    /// first appearance.
    pub fn preprocessing_groups(
        &self,
        positions: impl IntoIterator<Item = usize>,
    ) -> Vec<PreprocessingGroup> {
        group_by_preprocessing(|p| self.entries.get(p).map(|e| &e.candidate), positions)
    }
}

fn group_by_preprocessing<'a>(
    candidate_at: impl Fn(usize) -> Option<&'a Candidate>,
    positions: impl IntoIterator<Item = usize>,
) -> Vec<PreprocessingGroup> {
    let mut groups: Vec<PreprocessingGroup> = Vec::new();
    let mut lookup: HashMap<&'a ParamMap, usize> = HashMap::new();

    for position in positions {
        let Some(candidate) = candidate_at(position) else {
            continue;
        };
        match lookup.get(&candidate.preprocessing) {
            Some(&g) => groups[g].members.push(position),
            None => {
                lookup.insert(&candidate.preprocessing, groups.len());
                groups.push(PreprocessingGroup {
                    preprocessing: candidate.preprocessing.clone(),
                    members: vec![position],
                });
            }
        }
    }

    groups
}

fn digits(n: usize) -> usize {
    n.max(1).to_string().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(threshold: f64, penalty: f64) -> Candidate {
        Candidate::default()
            .with_preprocessing("threshold", threshold)
            .with_model("penalty", penalty)
    }

    #[test]
    fn grid_drops_duplicates_and_keeps_order() {
        let set = CandidateSet::from_grid(vec![
            candidate(0.1, 1.0),
            candidate(0.2, 1.0),
            candidate(0.1, 1.0),
            candidate(0.1, 2.0),
        ]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.get(0).unwrap().candidate, candidate(0.1, 1.0));
        assert_eq!(set.get(2).unwrap().candidate, candidate(0.1, 2.0));
    }

    #[test]
    fn grid_labels_follow_preprocessing_groups() {
        let set = CandidateSet::from_grid(vec![
            candidate(0.1, 1.0),
            candidate(0.2, 1.0),
            candidate(0.1, 2.0),
        ]);
        let labels: Vec<&str> = set.iter().map(|e| e.config.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "Preprocessor1_Model1",
                "Preprocessor2_Model1",
                "Preprocessor1_Model2"
            ]
        );
    }

    #[test]
    fn labels_are_zero_padded() {
        let grid: Vec<Candidate> = (0..12).map(|i| candidate(0.5, i as f64)).collect();
        let set = CandidateSet::from_grid(grid);
        assert_eq!(set.get(0).unwrap().config, "Preprocessor1_Model01");
        assert_eq!(set.get(11).unwrap().config, "Preprocessor1_Model12");
    }

    #[test]
    fn separately_built_candidates_are_equal() {
        let mut set = CandidateSet::new();
        assert!(set.push(candidate(0.3, 4.0), "a", 0).is_some());
        assert!(set.push(candidate(0.3, 4.0), "b", 1).is_none());
        assert_eq!(set.position(&candidate(0.3, 4.0)), Some(0));
    }

    #[test]
    fn iteration_labels() {
        let mut set = CandidateSet::from_grid(vec![candidate(0.1, 1.0)]);
        let added = set.push_iteration(1, vec![candidate(0.2, 1.0)]);
        assert_eq!(added, vec![1]);
        assert_eq!(set.get(1).unwrap().config, "Iter1");
        assert_eq!(set.get(1).unwrap().iteration, 1);

        let added = set.push_iteration(2, vec![candidate(0.1, 1.0), candidate(0.3, 1.0), candidate(0.4, 1.0)]);
        assert_eq!(added, vec![2, 3]);
        assert_eq!(set.get(2).unwrap().config, "Iter2_1");
        assert_eq!(set.get(3).unwrap().config, "Iter2_2");
    }

    #[test]
    fn groups_in_first_appearance_order() {
        let set = CandidateSet::from_grid(vec![
            candidate(0.2, 1.0),
            candidate(0.1, 1.0),
            candidate(0.2, 2.0),
        ]);
        let groups = set.preprocessing_groups(0..set.len());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![0, 2]);
        assert_eq!(groups[1].members, vec![1]);
    }
}
