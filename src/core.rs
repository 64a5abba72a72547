/*!
Chain-running machinery shared by every sampler: a [`MarkovChain`] is stepped `n_steps` times and
its states are collected row by row; anything that owns several chains gets parallel execution
(with optional progress bars) through [`ChainRunner`].

Steps are fallible. A failed step aborts the chain it happened in and, when chains run in
parallel, the first error is returned.
*/

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{s, Array2, Array3, ArrayView1};
use num_traits::Zero;
use rayon::prelude::*;

pub trait MarkovChain<S> {
    type Error: std::error::Error + Send;

    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> Result<&Vec<S>, Self::Error>;

    /// The current state without stepping.
    fn current_state(&self) -> &Vec<S>;
}

/// Steps `chain` `n_steps` times; row `i` of the result is the state after step `i`.
pub fn run_chain<S, M>(chain: &mut M, n_steps: usize) -> Result<Array2<S>, M::Error>
where
    M: MarkovChain<S>,
    S: Clone + Zero,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<S>::zeros((n_steps, dim));

    for i in 0..n_steps {
        let state = chain.step()?;
        out.row_mut(i).assign(&ArrayView1::from(state.as_slice()));
    }

    Ok(out)
}

pub fn run_chain_progress<S, M>(
    chain: &mut M,
    n_steps: usize,
    pb: &ProgressBar,
) -> Result<Array2<S>, M::Error>
where
    M: MarkovChain<S>,
    S: Clone + Zero,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<S>::zeros((n_steps, dim));

    pb.set_length(n_steps as u64);

    for i in 0..n_steps {
        let state = chain.step()?;
        out.row_mut(i).assign(&ArrayView1::from(state.as_slice()));
        pb.inc(1);
    }

    Ok(out)
}

/// A trait for "anything that owns multiple MarkovChains".
pub trait HasChains<S> {
    type Chain: MarkovChain<S> + Send;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub type ChainError<S, C> = <<C as HasChains<S>>::Chain as MarkovChain<S>>::Error;

/// Stacks per-chain traces into `[chains, samples, dim]`, dropping the first `discard` rows.
fn stack_traces<S: Clone + Zero>(traces: Vec<Array2<S>>, discard: usize) -> Array3<S> {
    let n_chains = traces.len();
    let (n_steps, dim) = traces.first().map_or((0, 0), |t| t.dim());
    let keep = n_steps.saturating_sub(discard);
    let mut out = Array3::<S>::zeros((n_chains, keep, dim));
    for (i, trace) in traces.iter().enumerate() {
        out.slice_mut(s![i, .., ..])
            .assign(&trace.slice(s![n_steps - keep.., ..]));
    }
    out
}

pub trait ChainRunner<S>: HasChains<S>
where
    S: Clone + Zero + Send + Sync + 'static,
{
    /// Runs the chains in parallel and returns `[chains, n_steps - discard, dim]`.
    fn run(&mut self, n_steps: usize, discard: usize) -> Result<Array3<S>, ChainError<S, Self>> {
        let traces = self
            .chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_steps))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stack_traces(traces, discard))
    }

    /// Like [`run`](Self::run), with one progress bar per chain.
    fn run_progress(
        &mut self,
        n_steps: usize,
        discard: usize,
    ) -> Result<Array3<S>, ChainError<S, Self>> {
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        let traces = self
            .chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new(n_steps as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());
                let trace = run_chain_progress(chain, n_steps, &pb);
                match &trace {
                    Ok(_) => pb.finish_with_message("Done!"),
                    Err(_) => pb.abandon_with_message("Failed"),
                }
                trace
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stack_traces(traces, discard))
    }
}

impl<S: Clone + Zero + Send + Sync + 'static, T: HasChains<S>> ChainRunner<S> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct Counter {
        state: Vec<f64>,
    }

    impl MarkovChain<f64> for Counter {
        type Error = Infallible;

        fn step(&mut self) -> Result<&Vec<f64>, Infallible> {
            for x in self.state.iter_mut() {
                *x += 1.0;
            }
            Ok(&self.state)
        }

        fn current_state(&self) -> &Vec<f64> {
            &self.state
        }
    }

    struct Counters(Vec<Counter>);

    impl HasChains<f64> for Counters {
        type Chain = Counter;

        fn chains_mut(&mut self) -> &mut Vec<Counter> {
            &mut self.0
        }
    }

    #[test]
    fn traces_are_stacked_after_burn_in() {
        let mut chains = Counters(vec![
            Counter {
                state: vec![0.0, 10.0],
            },
            Counter {
                state: vec![100.0, 200.0],
            },
        ]);
        let samples = chains.run(5, 2).unwrap();
        assert_eq!(samples.shape(), &[2, 3, 2]);
        assert_eq!(samples[[0, 0, 0]], 3.0);
        assert_eq!(samples[[0, 2, 1]], 15.0);
        assert_eq!(samples[[1, 0, 1]], 203.0);
    }

    #[test]
    fn discarding_everything_leaves_no_samples() {
        let mut chains = Counters(vec![Counter { state: vec![0.0] }]);
        let samples = chains.run(3, 10).unwrap();
        assert_eq!(samples.shape(), &[1, 0, 1]);
    }
}
