/*!
# Slice Sampler

Univariate slice sampling with stepping-out and shrinkage, usable as the update rule of a single
node. One [`SliceSampler::step`]:

1. draws a threshold `z = L(x0) - Exp(1)`, defining the slice `{x : L(x) >= z}`;
2. places an interval of width `w` at a uniform offset around `x0`;
3. steps each end outwards by `w` while it is still inside the slice;
4. draws uniformly from the interval, shrinking it towards `x0` after every rejected draw.

Exhausting `max_iter` in steps 3 or 4 is a [`SliceError`]; the target is restored to `x0` before
the error is returned. Optional hard bounds clamp both ends of the interval.

# Examples

```rust
use mini_hbm::slice::{LogDensity, SliceSampler};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut target = LogDensity::new(0.0_f64, |x: f64| -0.5 * x * x);
let mut sampler = SliceSampler::new(1.0);
let mut rng = SmallRng::seed_from_u64(42);

let mut sum = 0.0;
for _ in 0..2000 {
    sum += sampler.step(&mut target, &mut rng).unwrap().value;
}
assert!((sum / 2000.0).abs() < 0.2);
```
*/

use num_traits::Float;
use rand::Rng;
use rand_distr::{Distribution, Exp1, Standard};

use crate::errors::{Side, SliceError};

/// A scalar whose value can be moved and whose log-density can be read at the current value.
pub trait SliceTarget<T> {
    fn value(&self) -> T;

    fn set_value(&mut self, x: T);

    /// Log-density of the current value, including everything that depends on it.
    fn logp_plus_loglike(&self) -> T;
}

/// A free-standing scalar with a log-density function.
#[derive(Debug, Clone)]
pub struct LogDensity<T, F> {
    pub x: T,
    pub f: F,
}

impl<T, F> LogDensity<T, F> {
    pub fn new(x: T, f: F) -> Self {
        Self { x, f }
    }
}

impl<T: Copy, F: Fn(T) -> T> SliceTarget<T> for LogDensity<T, F> {
    fn value(&self) -> T {
        self.x
    }

    fn set_value(&mut self, x: T) {
        self.x = x;
    }

    fn logp_plus_loglike(&self) -> T {
        (self.f)(self.x)
    }
}

/// Result of one accepted update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceStep<T> {
    pub value: T,
    /// The auxiliary threshold `z`.
    pub threshold: T,
    /// The interval the value was drawn from last.
    pub interval: (T, T),
}

/// Per-node slice sampling state.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSampler<T> {
    /// Width of the initial interval and of every stepping-out move.
    pub width: T,
    pub max_iter: usize,
    /// Value reassignments performed so far.
    pub n_eval: usize,
    pub lower: Option<T>,
    pub upper: Option<T>,
}

impl<T> SliceSampler<T>
where
    T: Float,
    Standard: Distribution<T>,
    Exp1: Distribution<T>,
{
    pub fn new(width: T) -> Self {
        Self {
            width,
            max_iter: 200,
            n_eval: 0,
            lower: None,
            upper: None,
        }
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn bounds(mut self, lower: Option<T>, upper: Option<T>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    fn clamp(&self, x: T) -> T {
        let x = self.lower.map_or(x, |lo| x.max(lo));
        self.upper.map_or(x, |hi| x.min(hi))
    }

    fn at_bound(&self, x: T, side: Side) -> bool {
        match side {
            Side::Left => self.lower.is_some_and(|lo| x <= lo),
            Side::Right => self.upper.is_some_and(|hi| x >= hi),
        }
    }

    /**
    Performs one update of `target`.

    On success the target holds the accepted value. On failure it holds the value it had before
    the call.
    */
    pub fn step<S, R>(&mut self, target: &mut S, rng: &mut R) -> Result<SliceStep<T>, SliceError>
    where
        S: SliceTarget<T> + ?Sized,
        R: Rng + ?Sized,
    {
        let x0 = target.value();
        let e: T = Exp1.sample(rng);
        let z = target.logp_plus_loglike() - e;

        let u: T = Standard.sample(rng);
        let mut xl = x0 - u * self.width;
        let mut xr = xl + self.width;
        xl = self.clamp(xl);
        xr = self.clamp(xr);

        for side in [Side::Left, Side::Right] {
            let mut iterations = 0;
            loop {
                let end = match side {
                    Side::Left => xl,
                    Side::Right => xr,
                };
                if self.at_bound(end, side) {
                    break;
                }
                target.set_value(end);
                self.n_eval += 1;
                if target.logp_plus_loglike() <= z {
                    break;
                }
                let end = match side {
                    Side::Left => {
                        xl = self.clamp(xl - self.width);
                        xl
                    }
                    Side::Right => {
                        xr = self.clamp(xr + self.width);
                        xr
                    }
                };
                iterations += 1;
                // An end clamped to its bound needs no further checks.
                if iterations >= self.max_iter && !self.at_bound(end, side) {
                    target.set_value(x0);
                    return Err(SliceError::StepOut { side, iterations });
                }
            }
        }

        for _ in 0..self.max_iter {
            let u: T = Standard.sample(rng);
            let xp = xl + u * (xr - xl);
            target.set_value(xp);
            self.n_eval += 1;
            if target.logp_plus_loglike() >= z {
                return Ok(SliceStep {
                    value: xp,
                    threshold: z,
                    interval: (xl, xr),
                });
            }
            if xp > x0 {
                xr = xp;
            } else {
                xl = xp;
            }
        }
        target.set_value(x0);
        Err(SliceError::ShrinkIn {
            iterations: self.max_iter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn accepted_values_lie_in_the_slice() {
        let f = |x: f64| -0.5 * (x - 1.0).powi(2) / 4.0;
        let mut target = LogDensity::new(3.0, f);
        let mut sampler = SliceSampler::new(0.7);
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..500 {
            let step = sampler.step(&mut target, &mut rng).unwrap();
            assert_eq!(target.x, step.value);
            assert!(f(step.value) >= step.threshold);
            assert!(step.interval.0 <= step.value && step.value < step.interval.1);
        }
        assert!(sampler.n_eval >= 1500);
    }

    #[test]
    fn flat_targets_exhaust_step_out() {
        let mut target = LogDensity::new(0.5, |_x: f64| 0.0);
        let mut sampler = SliceSampler::new(1e-3).max_iter(1);
        let mut rng = SmallRng::seed_from_u64(2);
        let err = sampler.step(&mut target, &mut rng).unwrap_err();
        assert_eq!(
            err,
            SliceError::StepOut {
                side: Side::Left,
                iterations: 1
            }
        );
        assert_eq!(target.x, 0.5);
    }

    #[test]
    fn step_out_budget_counts_extensions() {
        // Box of width 2 around 0 and an initial width of 1.5: one end always lies inside, so
        // every update needs exactly one extension.
        let f = |x: f64| if x.abs() < 1.0 { 0.0 } else { f64::NEG_INFINITY };
        for seed in 0..50 {
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut target = LogDensity::new(0.0, f);
            let mut sampler = SliceSampler::new(1.5).max_iter(1);
            let err = sampler.step(&mut target, &mut rng).unwrap_err();
            assert!(matches!(err, SliceError::StepOut { iterations: 1, .. }));
            assert_eq!(target.x, 0.0);

            let mut sampler = SliceSampler::new(1.5);
            let step = sampler.step(&mut target, &mut rng).unwrap();
            assert!(step.interval.1 - step.interval.0 > 1.5);
            assert!(step.value.abs() < 1.0);
        }
    }

    #[test]
    fn shrink_in_failure_restores_the_value() {
        // A spike far narrower than what max_iter halvings can reach.
        let f = |x: f64| if (x - 0.25).abs() < 1e-300 { 0.0 } else { -1e9 };
        let mut target = LogDensity::new(0.25, f);
        let mut sampler = SliceSampler::new(1.0).max_iter(5);
        let mut rng = SmallRng::seed_from_u64(3);
        let err = sampler.step(&mut target, &mut rng).unwrap_err();
        assert_eq!(err, SliceError::ShrinkIn { iterations: 5 });
        assert_eq!(target.x, 0.25);
    }

    #[test]
    fn bounds_are_never_crossed() {
        // Exponential(1) on x >= 0, flat enough that step-out would run far to the right.
        let f = |x: f64| if x < 0.0 { f64::NEG_INFINITY } else { -x };
        let mut target = LogDensity::new(0.01, f);
        let mut sampler = SliceSampler::new(0.5).bounds(Some(0.0), Some(3.0));
        let mut rng = SmallRng::seed_from_u64(4);
        let mut sum = 0.0;
        let n = 5000;
        for _ in 0..n {
            let step = sampler.step(&mut target, &mut rng).unwrap();
            assert!(step.interval.0 >= 0.0 && step.interval.1 <= 3.0);
            sum += step.value;
        }
        // mean of Exp(1) truncated to [0, 3]
        let e3 = (-3.0f64).exp();
        let expected = (1.0 - 4.0 * e3) / (1.0 - e3);
        assert_abs_diff_eq!(sum / n as f64, expected, epsilon = 0.1);
    }

    #[test]
    fn works_in_single_precision() {
        let mut target = LogDensity::new(0.0_f32, |x: f32| -0.5 * x * x);
        let mut sampler = SliceSampler::new(2.0_f32);
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..100 {
            assert!(sampler.step(&mut target, &mut rng).is_ok());
        }
    }
}
