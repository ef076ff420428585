//! Result aggregation: per-fit metric rows to per-candidate summaries.

use std::collections::HashMap;

use tw_types::{AggregatedMetric, Candidate, FitRecord};

type Key = (Candidate, String, String);

struct Accumulator {
    candidate: Candidate,
    config: String,
    iteration: usize,
    metric: String,
    estimator: String,
    values: Vec<f64>,
}

/// Summarize metric rows by (candidate values, metric, estimator).
///
/// Only finite estimates contribute to `mean`, `std_err` and `n`; a
/// combination that was observed but never produced a finite value keeps its
/// row with `mean = None`. Rows are ordered by candidate first appearance,
/// then by metric first appearance.
pub fn aggregate(records: &[FitRecord]) -> Vec<AggregatedMetric> {
    let mut candidate_rank: HashMap<&Candidate, usize> = HashMap::new();
    let mut metric_rank: HashMap<(&str, &str), usize> = HashMap::new();
    let mut index: HashMap<Key, usize> = HashMap::new();
    let mut groups: Vec<Accumulator> = Vec::new();

    for record in records {
        let next = candidate_rank.len();
        candidate_rank.entry(&record.candidate).or_insert(next);

        for row in &record.metrics {
            let next = metric_rank.len();
            metric_rank
                .entry((row.metric.as_str(), row.estimator.as_str()))
                .or_insert(next);

            let key = (
                record.candidate.clone(),
                row.metric.clone(),
                row.estimator.clone(),
            );
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push(Accumulator {
                    candidate: record.candidate.clone(),
                    config: record.config.clone(),
                    iteration: record.iteration,
                    metric: row.metric.clone(),
                    estimator: row.estimator.clone(),
                    values: Vec::new(),
                });
                groups.len() - 1
            });
            if row.estimate.is_finite() {
                groups[slot].values.push(row.estimate);
            }
        }
    }

    let mut summaries: Vec<(usize, usize, AggregatedMetric)> = groups
        .into_iter()
        .map(|acc| {
            let c = candidate_rank.get(&acc.candidate).copied().unwrap_or(usize::MAX);
            let m = metric_rank
                .get(&(acc.metric.as_str(), acc.estimator.as_str()))
                .copied()
                .unwrap_or(usize::MAX);
            let (mean, std_err) = mean_and_std_err(&acc.values);
            let summary = AggregatedMetric {
                candidate: acc.candidate,
                config: acc.config,
                iteration: acc.iteration,
                metric: acc.metric,
                estimator: acc.estimator,
                mean,
                std_err,
                n: acc.values.len(),
            };
            (c, m, summary)
        })
        .collect();
    summaries.sort_by_key(|(c, m, _)| (*c, *m));
    summaries.into_iter().map(|(_, _, s)| s).collect()
}

/// Re-aggregate summaries by the same key.
///
/// Keys that appear once are returned untouched, so regrouping the output of
/// [`aggregate`] is the identity. Duplicate keys are pooled through their
/// sufficient statistics (count, sum, sum of squares).
pub fn regroup(summaries: &[AggregatedMetric]) -> Vec<AggregatedMetric> {
    let mut index: HashMap<Key, usize> = HashMap::new();
    let mut pooled: Vec<Vec<&AggregatedMetric>> = Vec::new();

    for summary in summaries {
        let key = (
            summary.candidate.clone(),
            summary.metric.clone(),
            summary.estimator.clone(),
        );
        let slot = *index.entry(key).or_insert_with(|| {
            pooled.push(Vec::new());
            pooled.len() - 1
        });
        pooled[slot].push(summary);
    }

    pooled
        .into_iter()
        .filter_map(|parts| match parts.as_slice() {
            [] => None,
            [single] => Some((*single).clone()),
            [first, ..] => Some(pool(first, &parts)),
        })
        .collect()
}

fn pool(first: &AggregatedMetric, parts: &[&AggregatedMetric]) -> AggregatedMetric {
    let (mut n, mut sum, mut sum_sq) = (0usize, 0.0f64, 0.0f64);
    for part in parts {
        let Some(mean) = part.mean else { continue };
        if part.n == 0 {
            continue;
        }
        let k = part.n as f64;
        let sd = part.std_err.map(|se| se * k.sqrt()).unwrap_or(0.0);
        n += part.n;
        sum += mean * k;
        sum_sq += sd * sd * (k - 1.0) + k * mean * mean;
    }

    let (mean, std_err) = if n == 0 {
        (None, None)
    } else {
        let k = n as f64;
        let mean = sum / k;
        let std_err = (n > 1).then(|| {
            let var = ((sum_sq - k * mean * mean) / (k - 1.0)).max(0.0);
            (var / k).sqrt()
        });
        (Some(mean), std_err)
    };

    AggregatedMetric {
        candidate: first.candidate.clone(),
        config: first.config.clone(),
        iteration: first.iteration,
        metric: first.metric.clone(),
        estimator: first.estimator.clone(),
        mean,
        std_err,
        n,
    }
}

/// Mean and standard error (`sd / sqrt(n)`, sample sd) of `values`.
pub fn mean_and_std_err(values: &[f64]) -> (Option<f64>, Option<f64>) {
    let n = values.len();
    if n == 0 {
        return (None, None);
    }
    let k = n as f64;
    let mean = values.iter().sum::<f64>() / k;
    if n < 2 {
        return (Some(mean), None);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (k - 1.0);
    (Some(mean), Some((var / k).sqrt()))
}
