//! Search space definitions, random sampling and unit-cube encoding.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use tw_types::{validation_error, Candidate, ParameterValue, TuneResult};

/// Which half of a candidate a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Preprocessing,
    Model,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<ParameterValue> },
}

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub role: Role,
    pub kind: ParameterKind,
}

impl ParameterDef {
    fn sample(&self, rng: &mut dyn RngCore) -> ParameterValue {
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => values[rng.gen_range(0..values.len())].clone(),
        }
    }

    /// Position of `value` on [0, 1], or `None` when it is not a value of this
    /// dimension.
    fn encode(&self, value: &ParameterValue) -> Option<f64> {
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                value.as_f64().map(|v| to_normalized(v, *low, *high))
            }
            ParameterKind::IntRange { low, high } => value
                .as_f64()
                .map(|v| to_normalized(v, *low as f64, *high as f64)),
            ParameterKind::LogUniform { low, high } => value
                .as_f64()
                .filter(|v| *v > 0.0)
                .map(|v| to_normalized(v.ln(), low.ln(), high.ln())),
            ParameterKind::Choice { values } => {
                let index = values.iter().position(|v| v == value)?;
                Some(to_normalized(index as f64, 0.0, (values.len() - 1) as f64))
            }
        }
    }

    fn decode(&self, u: f64) -> ParameterValue {
        let u = u.clamp(0.0, 1.0);
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(from_normalized(u, *low, *high))
            }
            ParameterKind::IntRange { low, high } => {
                let v = from_normalized(u, *low as f64, *high as f64).round() as i64;
                ParameterValue::Int(v.clamp(*low, *high))
            }
            ParameterKind::LogUniform { low, high } => {
                let v = from_normalized(u, low.ln(), high.ln()).exp();
                ParameterValue::Float(v.clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let index = (u * (values.len() - 1) as f64).round() as usize;
                values[index.min(values.len() - 1)].clone()
            }
        }
    }

    /// `levels` evenly spaced values (every value for integers and choices
    /// when there are no more than `levels` of them).
    fn levels(&self, levels: usize) -> Vec<ParameterValue> {
        let steps = levels.max(2);
        let spaced = |low: f64, high: f64| -> Vec<f64> {
            (0..steps)
                .map(|i| low + i as f64 / (steps - 1) as f64 * (high - low))
                .collect()
        };
        match &self.kind {
            ParameterKind::FloatRange { low, high } => {
                spaced(*low, *high).into_iter().map(ParameterValue::Float).collect()
            }
            ParameterKind::IntRange { low, high } => {
                let mut values: Vec<i64> = spaced(*low as f64, *high as f64)
                    .into_iter()
                    .map(|v| v.round() as i64)
                    .collect();
                values.dedup();
                values.into_iter().map(ParameterValue::Int).collect()
            }
            ParameterKind::LogUniform { low, high } => spaced(low.ln(), high.ln())
                .into_iter()
                .map(|v| ParameterValue::Float(v.exp()))
                .collect(),
            ParameterKind::Choice { values } => values.clone(),
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: impl Into<String>, role: Role, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            role,
            kind,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Role::Model, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add(name, Role::Model, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.add(name, Role::Model, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<ParameterValue>) -> Self {
        self.add(name, Role::Model, ParameterKind::Choice { values })
    }

    /// Add a preprocessing parameter.
    pub fn add_preprocessing(self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.add(name, Role::Preprocessing, kind)
    }

    pub fn dims(&self) -> usize {
        self.parameters.len()
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.parameters.is_empty() {
            return Err(validation_error!("search space has no parameters"));
        }
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(validation_error!("parameter '{}' is defined twice", param.name));
            }
            let ok = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    low.is_finite() && high.is_finite() && low <= high
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    *low > 0.0 && high.is_finite() && low <= high
                }
                ParameterKind::Choice { values } => !values.is_empty(),
            };
            if !ok {
                return Err(validation_error!(
                    "invalid range for parameter '{}': {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    /// Draw one candidate. Fails when the space does not validate.
    pub fn sample(&self, rng: &mut dyn RngCore) -> TuneResult<Candidate> {
        self.validate()?;
        Ok(self.draw(rng))
    }

    /// Draw up to `n` distinct candidates. Small discrete spaces may yield
    /// fewer.
    pub fn sample_unique(&self, n: usize, rng: &mut dyn RngCore) -> TuneResult<Vec<Candidate>> {
        self.validate()?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(n);
        let mut attempts = 0;
        while out.len() < n && attempts < n.saturating_mul(100) {
            attempts += 1;
            let candidate = self.draw(rng);
            if seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        }
        Ok(out)
    }

    fn draw(&self, rng: &mut dyn RngCore) -> Candidate {
        self.assemble(self.parameters.iter().map(|p| p.sample(rng)))
    }

    /// Regular grid with `levels` values per continuous dimension.
    pub fn regular_grid(&self, levels: usize) -> Vec<Candidate> {
        let mut result: Vec<Vec<ParameterValue>> = vec![Vec::new()];
        for param in &self.parameters {
            let axis = param.levels(levels);
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in &axis {
                    let mut combo = existing.clone();
                    combo.push(value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result.into_iter().map(|values| self.assemble(values)).collect()
    }

    /// Map a candidate onto the unit cube, one coordinate per parameter.
    /// `None` when the candidate lacks a parameter or holds a value outside
    /// the space.
    pub fn encode(&self, candidate: &Candidate) -> Option<Vec<f64>> {
        self.parameters
            .iter()
            .map(|param| {
                let value = match param.role {
                    Role::Preprocessing => candidate.preprocessing.get(&param.name),
                    Role::Model => candidate.model.get(&param.name),
                }?;
                param.encode(value)
            })
            .collect()
    }

    /// Inverse of [`encode`](Self::encode): integers are rounded and
    /// categorical coordinates snap to the nearest choice.
    pub fn decode(&self, point: &[f64]) -> Candidate {
        self.assemble(
            self.parameters
                .iter()
                .zip(point)
                .map(|(param, &u)| param.decode(u)),
        )
    }

    fn assemble(&self, values: impl IntoIterator<Item = ParameterValue>) -> Candidate {
        let mut candidate = Candidate::default();
        for (param, value) in self.parameters.iter().zip(values) {
            match param.role {
                Role::Preprocessing => candidate.preprocessing.insert(param.name.clone(), value),
                Role::Model => candidate.model.insert(param.name.clone(), value),
            };
        }
        candidate
    }
}

/// Convert a value to [0, 1] using bounds.
fn to_normalized(value: f64, lo: f64, hi: f64) -> f64 {
    if (hi - lo).abs() < 1e-15 {
        0.5
    } else {
        (value - lo) / (hi - lo)
    }
}

fn from_normalized(value: f64, lo: f64, hi: f64) -> f64 {
    lo + value * (hi - lo)
}
