/*!
# Maximum a Posteriori Fits

The compiler does not optimise anything itself. An [`Optimizer`] is handed a runtime and the
latent nodes of a compiled model, moves their values to increase the total log-density and
reports where it ended up.

[`Hierarchical::map`] compiles the model afresh for every run (new random initial values), keeps
the best run and flags the fit as degenerate when the two best runs disagree by more than
`warn_crit`. [`Hierarchical::subj_by_subj_init`] fits every subject on its own, in parallel, and
uses the results as starting values for a group model. [`Hierarchical::init_from_existing`]
warm-starts a model from the node values of another, matching nodes by registry name.
*/

use indexmap::IndexMap;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::errors::ModelError;
use crate::graph::{NodeId, Runtime};
use crate::hierarchical::{CompiledModel, Hierarchical, Likelihood, ModelConfig};
use crate::params::{ParamTemplate, Shape};

/// Maximises the total log-density of a runtime over a set of free nodes.
pub trait Optimizer {
    /// Returns the log-density reached; the runtime is left at the optimum.
    fn maximize<R: Runtime>(&mut self, runtime: &mut R, free: &[NodeId]) -> Result<f64, ModelError>;
}

/// Latent nodes of `compiled`, each listed once, in registry order.
pub fn free_nodes<R: Runtime>(runtime: &R, compiled: &CompiledModel) -> Vec<NodeId> {
    let mut free = Vec::new();
    for id in compiled.registry.ids() {
        if !runtime.is_observed(id) && !free.contains(&id) {
            free.push(id);
        }
    }
    free
}

/// The best of several MAP runs.
#[derive(Debug, Clone)]
pub struct MapFit<R> {
    pub runtime: R,
    pub model: CompiledModel,
    pub logp: f64,
    /// Log-density reached by every run, in run order.
    pub run_logps: Vec<f64>,
    /// Distance between the two best runs, when it exceeds the warning criterion.
    pub degenerate: Option<f64>,
}

impl<L: Likelihood> Hierarchical<L> {
    /**
    Runs `runs` independent MAP fits (at least one) and returns the best.

    `make_runtime(run)` provides an empty runtime for every run.
    */
    pub fn map<R, O, F>(
        &self,
        runs: usize,
        warn_crit: f64,
        optimizer: &mut O,
        mut make_runtime: F,
    ) -> Result<MapFit<R>, ModelError>
    where
        R: Runtime,
        O: Optimizer,
        F: FnMut(usize) -> R,
    {
        let mut best: Option<(R, CompiledModel, f64)> = None;
        let mut run_logps = Vec::with_capacity(runs);

        for run in 0..runs.max(1) {
            let mut runtime = make_runtime(run);
            let model = self.create_nodes(&mut runtime)?;
            let free = free_nodes(&runtime, &model);
            let logp = optimizer.maximize(&mut runtime, &free)?;
            info!("MAP run {run}: logp = {logp:.4}");
            run_logps.push(logp);
            if best.as_ref().map_or(true, |(_, _, b)| logp > *b) {
                best = Some((runtime, model, logp));
            }
        }

        let mut sorted = run_logps.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let degenerate = match sorted.as_slice() {
            [first, second, ..] if (first - second).abs() > warn_crit => {
                let spread = (first - second).abs();
                warn!(
                    "two best MAP runs differ by {spread:.4} (> {warn_crit}); the fit may be degenerate"
                );
                Some(spread)
            }
            _ => None,
        };

        let (runtime, model, logp) = best.ok_or_else(|| {
            ModelError::Optimizer("no MAP run was performed".to_string())
        })?;
        Ok(MapFit {
            runtime,
            model,
            logp,
            run_logps,
            degenerate,
        })
    }

    /**
    Initialises a compiled group model from independent per-subject fits.

    Every subject's rows form a non-grouped model of their own, built into
    `make_runtime(subject)` and fitted with `make_optimizer()`, in parallel. The fitted group
    values are copied into the subject nodes of `compiled`; group nodes are set to the mean and
    dispersion nodes to the [`DispersionKind`](crate::params::DispersionKind) estimate of the
    subject values. Parameters without a subject tier get the mean of the per-subject fits.
    */
    pub fn subj_by_subj_init<R, S, O, FR, FO>(
        &self,
        runtime: &mut R,
        compiled: &CompiledModel,
        make_runtime: FR,
        make_optimizer: FO,
    ) -> Result<(), ModelError>
    where
        L: Sync,
        R: Runtime,
        S: Runtime,
        O: Optimizer,
        FR: Fn(usize) -> S + Sync,
        FO: Fn() -> O + Sync,
    {
        if !self.is_group_model() {
            return Err(ModelError::NotGroupModel);
        }
        let templates: Vec<ParamTemplate> = self.templates().cloned().collect();
        let config = ModelConfig {
            is_group_model: Some(false),
            subject_column: self.config().subject_column.clone(),
            depends_on: self.config().depends_on.clone(),
            include: self.config().include.clone(),
            update_params: IndexMap::new(),
            replace_params: Vec::new(),
        };

        let fits = (0..self.subjects().len())
            .into_par_iter()
            .map(|index| -> Result<IndexMap<String, IndexMap<String, f64>>, ModelError> {
                let rows = self
                    .data()
                    .view()
                    .select(&[config.subject_column.as_str()], &self.subjects()[index])?;
                let sub = Hierarchical::new(
                    rows.to_table(),
                    templates.clone(),
                    self.likelihood(),
                    config.clone(),
                )?;
                let mut sub_runtime = make_runtime(index);
                let sub_model = sub.create_nodes(&mut sub_runtime)?;
                let free = free_nodes(&sub_runtime, &sub_model);
                let logp = make_optimizer().maximize(&mut sub_runtime, &free)?;
                debug!("subject {}: logp = {logp:.4}", self.subjects()[index]);

                let fitted = sub_model
                    .params
                    .iter()
                    .map(|(name, nodes)| {
                        let values = nodes
                            .group
                            .iter()
                            .map(|(tag, &id)| (tag.clone(), sub_runtime.value(id)))
                            .collect();
                        (name.clone(), values)
                    })
                    .collect();
                Ok(fitted)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for template in self.active_params() {
            let Some(nodes) = compiled.param(&template.name) else {
                continue;
            };
            let fitted = |index: usize, tag: &str| {
                fits.get(index)
                    .and_then(|f| f.get(&template.name))
                    .and_then(|tags| tags.get(tag))
                    .copied()
            };
            match template.shape()? {
                Shape::Bottom => {}
                Shape::Group { .. } => {
                    for (tag, &id) in &nodes.group {
                        let values: Vec<f64> =
                            (0..fits.len()).filter_map(|i| fitted(i, tag.as_str())).collect();
                        if !values.is_empty() {
                            runtime.set_value(id, mean(&values))?;
                        }
                    }
                }
                Shape::Hierarchical { .. } => {
                    let mut pooled = Vec::new();
                    for (tag, subjects) in &nodes.subject {
                        let mut values = Vec::new();
                        for index in 0..fits.len() {
                            if let (Some(id), Some(v)) = (subjects.get(index), fitted(index, tag.as_str())) {
                                runtime.set_value(id, v)?;
                                values.push(v);
                            }
                        }
                        if values.is_empty() {
                            continue;
                        }
                        if let Some(&id) = nodes.group.get(tag) {
                            runtime.set_value(id, mean(&values))?;
                        }
                        if !template.shared_dispersion {
                            if let Some(&id) = nodes.dispersion.get(tag) {
                                set_estimate(runtime, id, template, &values)?;
                            }
                        }
                        pooled.extend(values);
                    }
                    if template.shared_dispersion && !pooled.is_empty() {
                        if let Some(&id) = nodes.dispersion.values().next() {
                            set_estimate(runtime, id, template, &pooled)?;
                        }
                    }
                }
            }
        }
        info!("initialised {} subjects from individual fits", fits.len());
        Ok(())
    }

    /**
    Copies node values from an earlier model into `compiled`.

    Every latent node of `compiled` whose registry name also names a latent node of
    `previous_model` (compiled into `previous`) takes that node's value; all other nodes keep
    theirs. The two models may differ in configuration, e.g. a pooled fit can seed the group
    nodes of a hierarchical one. Returns the number of nodes assigned.
    */
    pub fn init_from_existing<R, P>(
        &self,
        runtime: &mut R,
        compiled: &CompiledModel,
        previous: &P,
        previous_model: &CompiledModel,
    ) -> Result<usize, ModelError>
    where
        R: Runtime,
        P: Runtime,
    {
        let n_latent = free_nodes(runtime, compiled).len();
        let mut assigned: Vec<NodeId> = Vec::new();
        for (name, entry) in compiled.registry.iter() {
            if runtime.is_observed(entry.id) || assigned.contains(&entry.id) {
                continue;
            }
            let Some(source) = previous_model.node(name) else {
                continue;
            };
            if previous.is_observed(source) {
                continue;
            }
            runtime.set_value(entry.id, previous.value(source))?;
            assigned.push(entry.id);
        }
        info!(
            "assigned values to {} nodes (out of {n_latent}) from an existing model",
            assigned.len()
        );
        Ok(assigned.len())
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn set_estimate<R: Runtime>(
    runtime: &mut R,
    id: NodeId,
    template: &ParamTemplate,
    values: &[f64],
) -> Result<(), ModelError> {
    let estimate = template.dispersion_kind.estimate(values);
    if estimate.is_finite() && estimate > 0.0 {
        runtime.set_value(id, estimate)?;
    } else {
        debug!(
            "`{}`: keeping dispersion, estimate {estimate} from {} values",
            template.name,
            values.len()
        );
    }
    Ok(())
}
