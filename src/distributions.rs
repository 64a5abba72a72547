/*!
Distribution kinds understood by the reference [`Graph`](crate::graph::Graph) runtime.

A kind only names a family and the parents it expects; the parent *values* are resolved by the
runtime at evaluation time. Log-densities are delegated to [`statrs`], initial values are drawn
with [`rand_distr`]. Parent values outside a family's valid range give a log-density of
negative infinity instead of an error, so samplers simply treat them as zero probability.

# Examples

```rust
use mini_hbm::distributions::DistKind;

let lp = DistKind::Normal.ln_pdf(&[0.0, 1.0], 0.0);
assert!((lp + 0.9189385332046727).abs() < 1e-12);

// sigma <= 0 is not an error, just impossible
assert_eq!(DistKind::Normal.ln_pdf(&[0.0, -1.0], 0.0), f64::NEG_INFINITY);
```
*/

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand_distr::{Distribution, Exp, Gamma, Normal, Uniform};
use serde::{Deserialize, Serialize};
use statrs::distribution::Continuous;

/// A univariate distribution family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistKind {
    /// Parents: `mu`, `sigma`.
    Normal,
    /// Parents: `sigma`.
    HalfNormal,
    /// Parents: `lower`, `upper`.
    Uniform,
    /// Parents: `shape`, `rate`.
    Gamma,
    /// Parents: `rate`.
    Exponential,
}

impl DistKind {
    /// Names of the parents this family needs, in the order [`ln_pdf`](Self::ln_pdf) expects
    /// their values.
    pub fn parent_names(&self) -> &'static [&'static str] {
        match self {
            DistKind::Normal => &["mu", "sigma"],
            DistKind::HalfNormal => &["sigma"],
            DistKind::Uniform => &["lower", "upper"],
            DistKind::Gamma => &["shape", "rate"],
            DistKind::Exponential => &["rate"],
        }
    }

    /// Log-density of `x` given the parent values `p` (ordered as in
    /// [`parent_names`](Self::parent_names)).
    pub fn ln_pdf(&self, p: &[f64], x: f64) -> f64 {
        let lp = match self {
            DistKind::Normal => statrs::distribution::Normal::new(p[0], p[1])
                .map(|d| d.ln_pdf(x))
                .ok(),
            DistKind::HalfNormal if x < 0.0 => None,
            DistKind::HalfNormal => statrs::distribution::Normal::new(0.0, p[0])
                .map(|d| d.ln_pdf(x) + std::f64::consts::LN_2)
                .ok(),
            DistKind::Uniform => statrs::distribution::Uniform::new(p[0], p[1])
                .map(|d| d.ln_pdf(x))
                .ok(),
            DistKind::Gamma if x <= 0.0 => None,
            DistKind::Gamma => statrs::distribution::Gamma::new(p[0], p[1])
                .map(|d| d.ln_pdf(x))
                .ok(),
            DistKind::Exponential if x < 0.0 => None,
            DistKind::Exponential => statrs::distribution::Exp::new(p[0])
                .map(|d| d.ln_pdf(x))
                .ok(),
        };
        match lp {
            Some(v) if !v.is_nan() => v,
            _ => f64::NEG_INFINITY,
        }
    }

    /// Draws an initial value from the family. Returns `None` if the parent values are invalid.
    pub fn sample<R: Rng + ?Sized>(&self, p: &[f64], rng: &mut R) -> Option<f64> {
        match self {
            DistKind::Normal => Normal::new(p[0], p[1]).ok().map(|d| d.sample(rng)),
            DistKind::HalfNormal => Normal::new(0.0, p[0]).ok().map(|d| d.sample(rng).abs()),
            DistKind::Uniform if p[0] < p[1] && (p[1] - p[0]).is_finite() => {
                Some(Uniform::new(p[0], p[1]).sample(rng))
            }
            DistKind::Uniform => None,
            // rand_distr parameterises Gamma by scale.
            DistKind::Gamma => Gamma::new(p[0], 1.0 / p[1]).ok().map(|d| d.sample(rng)),
            DistKind::Exponential => Exp::new(p[0]).ok().map(|d| d.sample(rng)),
        }
    }
}

impl fmt::Display for DistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistKind::Normal => "normal",
            DistKind::HalfNormal => "half_normal",
            DistKind::Uniform => "uniform",
            DistKind::Gamma => "gamma",
            DistKind::Exponential => "exponential",
        };
        write!(f, "{name}")
    }
}

impl FromStr for DistKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(DistKind::Normal),
            "half_normal" => Ok(DistKind::HalfNormal),
            "uniform" => Ok(DistKind::Uniform),
            "gamma" => Ok(DistKind::Gamma),
            "exponential" => Ok(DistKind::Exponential),
            other => Err(format!("unknown distribution kind `{other}`")),
        }
    }
}
