//! A small end-to-end demo: simulates reaction-time-like data for a handful of subjects under two
//! conditions, compiles a hierarchical model over it and samples the posterior with slice sampling.

use mini_hbm::core::ChainRunner;
use mini_hbm::data::DataTable;
use mini_hbm::distributions::DistKind;
use mini_hbm::graph::Graph;
use mini_hbm::hierarchical::{Hierarchical, ModelConfig, Observed};
use mini_hbm::mcmc::Mcmc;
use mini_hbm::params::{Knode, ParamTemplate, StepRule};
use mini_hbm::stats::{max_rhat, summarize, SummaryTable};

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::error::Error;

/// Main entry point: simulates data, compiles the model, runs the chains and prints a summary.
fn main() -> Result<(), Box<dyn Error>> {
    const N_SUBJECTS: i64 = 5;
    const N_TRIALS: usize = 40;
    const ITERATIONS: usize = 2000;
    const BURNIN: usize = 500;
    const N_CHAINS: usize = 4;
    const SEED: u64 = 42;

    // Simulate data: every subject has its own offset, condition "hard" adds 0.5.
    let mut rng = SmallRng::seed_from_u64(SEED);
    let offsets = Normal::new(1.0, 0.3)?;
    let noise = Normal::new(0.0, 0.2)?;
    let (mut subj, mut cond, mut x) = (Vec::new(), Vec::new(), Vec::new());
    for s in 0..N_SUBJECTS {
        let offset = offsets.sample(&mut rng);
        for trial in 0..N_TRIALS {
            let hard = trial % 2 == 1;
            subj.push(s);
            cond.push(if hard { "hard" } else { "easy" });
            x.push(offset + if hard { 0.5 } else { 0.0 } + noise.sample(&mut rng));
        }
    }
    let data = DataTable::new()
        .with_column("subj_idx", subj)?
        .with_column("cond", cond)?
        .with_column("x", x)?;
    println!("Simulated {} rows for {} subjects", data.n_rows(), N_SUBJECTS);

    // mu varies across conditions and subjects, sigma is a single group-level node.
    let params = vec![
        ParamTemplate::new("mu")
            .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 5.0))
            .dispersion(
                Knode::new(DistKind::HalfNormal)
                    .parent("sigma", 2.0)
                    .step(StepRule::Slice {
                        width: 0.5,
                        max_iter: 200,
                        lower: Some(0.0),
                        upper: None,
                    }),
            )
            .subject(Knode::new(DistKind::Normal))
            .labels("mu", "sigma"),
        ParamTemplate::new("sigma").group(
            Knode::new(DistKind::HalfNormal)
                .parent("sigma", 1.0)
                .init(0.5)
                .step(StepRule::Slice {
                    width: 0.2,
                    max_iter: 200,
                    lower: Some(0.0),
                    upper: None,
                }),
        ),
        ParamTemplate::bottom("rt"),
    ];
    let likelihood = Observed::new(DistKind::Normal, "x")
        .parent("mu", "mu")
        .parent("sigma", "sigma");
    let config = ModelConfig::default().depends("mu", &["cond"]);

    let model = Hierarchical::new(data, params, likelihood, config)?;
    let (graph, compiled) =
        model.create_nodes_with_retries(10, |attempt| Graph::new().set_seed(SEED + attempt as u64))?;
    println!(
        "Compiled {} registered nodes ({} tags for mu)",
        compiled.registry.len(),
        compiled.params["mu"].group.len()
    );

    let mut mcmc = Mcmc::from_model(&model, &compiled, graph, N_CHAINS).set_seed(SEED);
    let samples = mcmc.run_progress(BURNIN + ITERATIONS, BURNIN)?;
    println!("Generated {} samples per chain", samples.shape()[1]);

    let summary = summarize(samples.view(), &mcmc.names);
    print!("{}", SummaryTable(&summary));
    if let Some(r) = max_rhat(samples.view()) {
        println!("Max R-hat: {r:.3}");
    }
    Ok(())
}
