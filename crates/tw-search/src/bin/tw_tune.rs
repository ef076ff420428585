//! Demo search: tunes a one-feature ridge regression on synthetic data.
//!
//! `TUNEWISE_CONFIG` may point at a JSON file with `ControlSearch` options;
//! `RUST_LOG` controls log output.

use anyhow::Context;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tw_engine::{Diagnostics, MetricSet, ModelBackend, Preprocessor, Rmse, Rsq, Workflow};
use tw_search::{tune_bayes, ControlSearch, ParameterKind, SearchError, SearchSpace};
use tw_types::{
    DataView, Dataset, FitError, ParamMap, Processed, ResampleSource, VFold,
};

/// Caps the feature at `cap`.
struct Clip;

impl Preprocessor for Clip {
    type Fitted = f64;

    fn fit(&self, _train: &DataView<'_>, params: &ParamMap, _d: &mut Diagnostics) -> Result<f64, FitError> {
        params
            .get("cap")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| FitError::preprocessing("cap must be a number"))
    }

    fn bake(&self, cap: &f64, data: &DataView<'_>, _d: &mut Diagnostics) -> Result<Processed, FitError> {
        let mut processed = Processed::from_view(data);
        for row in &mut processed.features {
            row[0] = row[0].min(*cap);
        }
        Ok(processed)
    }
}

/// `y = a + b x` with an L2 penalty on `b`.
struct Ridge;

impl ModelBackend for Ridge {
    type Fitted = (f64, f64);

    fn fit(
        &self,
        train: &Processed,
        params: &ParamMap,
        diagnostics: &mut Diagnostics,
    ) -> Result<(f64, f64), FitError> {
        let penalty = params
            .get("penalty")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| FitError::model_fit("penalty must be a number"))?;
        let n = train.len() as f64;
        let mean_x = train.features.iter().map(|r| r[0]).sum::<f64>() / n;
        let mean_y = train.outcome.iter().sum::<f64>() / n;
        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (row, y) in train.features.iter().zip(&train.outcome) {
            sxy += (row[0] - mean_x) * (y - mean_y);
            sxx += (row[0] - mean_x).powi(2);
        }
        if sxx == 0.0 {
            diagnostics.warn("feature is constant after preprocessing");
        }
        let slope = sxy / (sxx + penalty);
        Ok((mean_y - slope * mean_x, slope))
    }

    fn predict(
        &self,
        (intercept, slope): &(f64, f64),
        data: &Processed,
        _diagnostics: &mut Diagnostics,
    ) -> Result<Vec<f64>, FitError> {
        Ok(data.features.iter().map(|r| intercept + slope * r[0]).collect())
    }
}

fn load_control() -> anyhow::Result<ControlSearch> {
    match std::env::var("TUNEWISE_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading search config from {path}"))?;
            Ok(ControlSearch::from_json_str(&json)?)
        }
        Err(_) => Ok(ControlSearch::default().with_iter(15).with_no_improve(8)),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let control = load_control()?;
    let mut rng = ChaCha8Rng::seed_from_u64(control.seed);

    let n = 200;
    let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..12.0)).collect();
    let outcome: Vec<f64> = xs
        .iter()
        .map(|x| 1.5 + 3.0 * x.min(8.0) + rng.gen_range(-1.0..1.0))
        .collect();
    let data = Dataset::new(vec!["x".into()], xs.into_iter().map(|x| vec![x]).collect(), outcome)?;
    let resamples = VFold::new(5).generate(data.n_rows(), &mut rng)?;

    let workflow = Workflow::new(Clip, Ridge, MetricSet::new().with(Rmse).with(Rsq));
    let space = SearchSpace::new()
        .add_preprocessing("cap", ParameterKind::FloatRange { low: 2.0, high: 12.0 })
        .add_log_uniform("penalty", 1e-3, 1e3);

    info!(rows = data.n_rows(), resamples = resamples.len(), "starting demo search");
    let results = match tune_bayes(&data, &resamples, &workflow, space, control) {
        Ok(results) => results,
        Err(SearchError::Surrogate { source, history, .. }) => {
            info!(iterations = history.iterations(), "returning partial history");
            return Err(source.into());
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        iterations = results.iterations(),
        stop_reason = ?results.stop_reason,
        "search finished"
    );
    let best = results.results.show_best(&results.target.name, 5)?;
    println!("{}", serde_json::to_string_pretty(&best)?);
    Ok(())
}
