/*!
# Node-wise MCMC over a Compiled Model

[`Mcmc`] attaches an update rule to every latent node of a [`CompiledModel`] according to the
[`StepRule`] of the tier the node was created for, and runs several independent chains in
parallel. Every chain owns a clone of the runtime the model was compiled into, so chains never
share node values.

Each chain seeds its own `SmallRng`; [`Mcmc::set_seed`] gives chain `i` the seed `seed + i`.

# Examples

```rust
use mini_hbm::core::ChainRunner;
use mini_hbm::data::DataTable;
use mini_hbm::distributions::DistKind;
use mini_hbm::graph::Graph;
use mini_hbm::hierarchical::{Hierarchical, ModelConfig, Observed};
use mini_hbm::mcmc::Mcmc;
use mini_hbm::params::{Knode, ParamTemplate};

let data = DataTable::new().with_column("x", vec![0.9, 1.1, 1.0]).unwrap();
let params = vec![
    ParamTemplate::new("mu")
        .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 10.0)),
    ParamTemplate::bottom("obs"),
];
let lik = Observed::new(DistKind::Normal, "x").parent("mu", "mu").constant("sigma", 1.0);
let model = Hierarchical::new(data, params, lik, ModelConfig::default()).unwrap();

let mut graph = Graph::new().set_seed(1);
let compiled = model.create_nodes(&mut graph).unwrap();
let mut mcmc = Mcmc::from_model(&model, &compiled, graph, 2).set_seed(42);

let samples = mcmc.run(200, 50).unwrap();
assert_eq!(samples.shape(), &[2, 150, 1]);
assert_eq!(mcmc.names, vec!["mu_group".to_string()]);
```
*/

use log::{debug, warn};
use rand::prelude::*;

use crate::core::{HasChains, MarkovChain};
use crate::errors::{RuntimeError, SliceError};
use crate::graph::{NodeId, Runtime};
use crate::hierarchical::{CompiledModel, Hierarchical, Likelihood, Tier};
use crate::params::StepRule;
use crate::slice::{SliceSampler, SliceTarget};

/// What a chain does when a node update fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Return the error to the caller.
    #[default]
    Abort,
    /// Keep the node's previous value, count the failure and continue.
    Skip,
}

/// The update rule of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub id: NodeId,
    pub sampler: SliceSampler<f64>,
}

struct NodeTarget<'a, R> {
    runtime: &'a mut R,
    id: NodeId,
}

impl<R: Runtime> SliceTarget<f64> for NodeTarget<'_, R> {
    fn value(&self) -> f64 {
        self.runtime.value(self.id)
    }

    fn set_value(&mut self, x: f64) {
        let res = self.runtime.set_value(self.id, x);
        debug_assert!(res.is_ok(), "slice update of an observed node: {res:?}");
    }

    fn logp_plus_loglike(&self) -> f64 {
        self.runtime.logp_plus_loglike(self.id)
    }
}

/// One chain: a runtime plus one slice sampler per updated node.
#[derive(Debug, Clone)]
pub struct NodeChain<R> {
    pub runtime: R,
    pub updates: Vec<NodeUpdate>,
    /// Nodes whose values make up the chain state.
    pub traced: Vec<NodeId>,
    pub current_state: Vec<f64>,
    pub policy: FailurePolicy,
    /// Updates skipped under [`FailurePolicy::Skip`].
    pub failures: usize,
    pub seed: u64,
    pub rng: SmallRng,
}

impl<R: Runtime> NodeChain<R> {
    /// Fails if any updated node is observed.
    pub fn new(
        runtime: R,
        updates: Vec<NodeUpdate>,
        traced: Vec<NodeId>,
    ) -> Result<Self, RuntimeError> {
        if let Some(update) = updates.iter().find(|u| runtime.is_observed(u.id)) {
            return Err(RuntimeError::Observed(runtime.name(update.id).to_string()));
        }
        let current_state = traced.iter().map(|&id| runtime.value(id)).collect();
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            runtime,
            updates,
            traced,
            current_state,
            policy: FailurePolicy::default(),
            failures: 0,
            seed,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

impl<R: Runtime> MarkovChain<f64> for NodeChain<R> {
    type Error = SliceError;

    /// Updates every node once, in registration order.
    fn step(&mut self) -> Result<&Vec<f64>, SliceError> {
        for update in self.updates.iter_mut() {
            let mut target = NodeTarget {
                runtime: &mut self.runtime,
                id: update.id,
            };
            if let Err(err) = update.sampler.step(&mut target, &mut self.rng) {
                match self.policy {
                    FailurePolicy::Abort => return Err(err),
                    FailurePolicy::Skip => {
                        self.failures += 1;
                        warn!(
                            "skipping update of `{}`: {err}",
                            self.runtime.name(update.id)
                        );
                    }
                }
            }
        }
        for (state, &id) in self.current_state.iter_mut().zip(&self.traced) {
            *state = self.runtime.value(id);
        }
        Ok(&self.current_state)
    }

    fn current_state(&self) -> &Vec<f64> {
        &self.current_state
    }
}

/// Multi-chain slice sampler over the latent nodes of a compiled model.
#[derive(Debug, Clone)]
pub struct Mcmc<R> {
    pub chains: Vec<NodeChain<R>>,
    /// Registry name of every traced node, in state order.
    pub names: Vec<String>,
    pub seed: u64,
}

impl<R: Runtime + Clone> Mcmc<R> {
    /**
    Assigns step rules from the templates of `model` to the latent nodes of `compiled`.

    Observed nodes and nodes whose tier is [`StepRule::Frozen`] are not updated; frozen nodes are
    still traced. Nodes registered under several names (shared dispersion) are updated once.
    `runtime` must be the runtime `compiled` was built into.
    */
    pub fn from_model<L: Likelihood>(
        model: &Hierarchical<L>,
        compiled: &CompiledModel,
        runtime: R,
        n_chains: usize,
    ) -> Self {
        let mut updates = Vec::new();
        let mut traced = Vec::new();
        let mut names = Vec::new();

        for (name, entry) in compiled.registry.iter() {
            if runtime.is_observed(entry.id) || traced.contains(&entry.id) {
                continue;
            }
            traced.push(entry.id);
            names.push(name.to_string());

            let template = model.template(&entry.param);
            let knode = match entry.tier {
                Tier::Group => template.and_then(|t| t.group.as_ref()),
                Tier::Dispersion => template.and_then(|t| t.dispersion.as_ref()),
                Tier::Subject => template.and_then(|t| t.subject.as_ref()),
                Tier::Bottom => None,
            };
            let rule = knode.map(|k| k.step).unwrap_or_default();
            if let StepRule::Slice {
                width,
                max_iter,
                lower,
                upper,
            } = rule
            {
                updates.push(NodeUpdate {
                    id: entry.id,
                    sampler: SliceSampler::new(width)
                        .max_iter(max_iter)
                        .bounds(lower, upper),
                });
            }
        }
        debug!(
            "{} latent nodes, {} with slice updates",
            traced.len(),
            updates.len()
        );

        let seed = thread_rng().gen::<u64>();
        let chains = (0..n_chains)
            .map(|i| {
                let current_state = traced.iter().map(|&id| runtime.value(id)).collect();
                NodeChain {
                    runtime: runtime.clone(),
                    updates: updates.clone(),
                    traced: traced.clone(),
                    current_state,
                    policy: FailurePolicy::default(),
                    failures: 0,
                    seed: seed + i as u64,
                    rng: SmallRng::seed_from_u64(seed + i as u64),
                }
            })
            .collect();

        Self {
            chains,
            names,
            seed,
        }
    }
}

impl<R> Mcmc<R> {
    /// Sets a new global seed; chain `i` gets `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        for (i, chain) in self.chains.iter_mut().enumerate() {
            let chain_seed = seed + i as u64;
            chain.seed = chain_seed;
            chain.rng = SmallRng::seed_from_u64(chain_seed);
        }
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        for chain in self.chains.iter_mut() {
            chain.policy = policy;
        }
        self
    }

    /// Skipped updates over all chains.
    pub fn failures(&self) -> usize {
        self.chains.iter().map(|c| c.failures).sum()
    }
}

impl<R: Runtime + Send> HasChains<f64> for Mcmc<R> {
    type Chain = NodeChain<R>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}
