//! Summaries and convergence diagnostics for traces of shape `[chains, samples, nodes]`.

use std::fmt;

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;

/// Posterior summary of one traced node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub q2_5: f64,
    pub q50: f64,
    pub q97_5: f64,
    pub rhat: f64,
}

/// Gelman-Rubin potential scale reduction of every node.
///
/// NaN for nodes that are constant within every chain, and for fewer than two chains or samples.
pub fn rhat(samples: ArrayView3<f64>) -> Array1<f64> {
    let (n_chains, n_samples, n_nodes) = samples.dim();
    if n_chains < 2 || n_samples < 2 {
        return Array1::from_elem(n_nodes, f64::NAN);
    }
    let n = n_samples as f64;

    // chains x nodes
    let mean = samples.mean_axis(Axis(1)).unwrap_or_else(|| Array2::zeros((n_chains, n_nodes)));
    let sm2 = samples.var_axis(Axis(1), 1.0);

    let global = mean.sum_axis(Axis(0)) / n_chains as f64;
    let between = (mean - global.insert_axis(Axis(0))).pow2().sum_axis(Axis(0)) * n
        / (n_chains as f64 - 1.0);
    let within = sm2.sum_axis(Axis(0)) / n_chains as f64;
    let var = within.clone() * ((n - 1.0) / n) + between * (1.0 / n);
    (var / within).sqrt()
}

/// Largest finite R-hat, if any.
pub fn max_rhat(samples: ArrayView3<f64>) -> Option<f64> {
    let finite: Array1<f64> = rhat(samples).into_iter().filter(|r| r.is_finite()).collect();
    finite.max_skipnan().is_finite().then(|| *finite.max_skipnan())
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let idx = q * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;
    sorted[lo] * (1.0 - frac) + sorted[hi.min(sorted.len() - 1)] * frac
}

/// Pools all chains and summarises every node; `names` labels the last axis.
pub fn summarize(samples: ArrayView3<f64>, names: &[String]) -> Vec<NodeSummary> {
    let rhats = rhat(samples);
    names
        .iter()
        .enumerate()
        .take(samples.dim().2)
        .map(|(j, name)| {
            let mut pooled: Vec<f64> = samples.index_axis(Axis(2), j).iter().copied().collect();
            pooled.sort_unstable_by(f64::total_cmp);
            let n = pooled.len() as f64;
            let mean = pooled.iter().sum::<f64>() / n;
            let std = (pooled.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
            NodeSummary {
                name: name.clone(),
                mean,
                std,
                q2_5: quantile_sorted(&pooled, 0.025),
                q50: quantile_sorted(&pooled, 0.5),
                q97_5: quantile_sorted(&pooled, 0.975),
                rhat: rhats[j],
            }
        })
        .collect()
}

/// Renders summaries as a fixed-width table.
pub struct SummaryTable<'a>(pub &'a [NodeSummary]);

impl fmt::Display for SummaryTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .0
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(4)
            .max(4);
        writeln!(
            f,
            "{:<width$} {:>9} {:>9} {:>9} {:>9} {:>9} {:>7}",
            "node", "mean", "std", "2.5%", "50%", "97.5%", "r_hat"
        )?;
        for s in self.0 {
            writeln!(
                f,
                "{:<width$} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>7.3}",
                s.name, s.mean, s.std, s.q2_5, s.q50, s.q97_5, s.rhat
            )?;
        }
        Ok(())
    }
}
