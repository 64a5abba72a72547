/*!
# mini-hbm

Compiles hierarchical Bayesian model descriptions into graphs of stochastic nodes and samples
them with per-node slice sampling.

A model is a list of [`params::ParamTemplate`]s (group, dispersion and subject tiers, or a
bottom likelihood) plus a [`hierarchical::ModelConfig`] naming which data columns each parameter
depends on. [`hierarchical::Hierarchical::create_nodes`] partitions the [`data::DataTable`] by
those columns and builds one node per parameter, tier, tag and subject inside any
[`graph::Runtime`]; [`mcmc::Mcmc`] then runs several chains over the compiled graph in parallel.
*/

pub mod core;
pub mod data;
pub mod distributions;
pub mod errors;
pub mod graph;
pub mod hierarchical;
pub mod map;
pub mod mcmc;
pub mod params;
pub mod partition;
pub mod slice;
pub mod stats;
