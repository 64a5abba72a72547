/*!
# Hierarchical Model Compiler

[`Hierarchical`] turns a list of [`ParamTemplate`]s, a [`DataTable`] and a [`ModelConfig`] into a
graph of nodes inside a [`Runtime`]. Compilation ([`Hierarchical::create_nodes`]) runs in strictly
ordered phases:

1. the active parameter set is resolved when the model is built (overrides are applied first,
   optional parameters that were not included are replaced by their default);
2. for every non-bottom parameter and every tag of its dependency columns, a group node is
   created and, in group models with a subject tier, a dispersion node plus one subject node per
   subject that has rows under that tag;
3. slots for every bottom partition are allocated;
4. the data is partitioned once per bottom parameter and the [`Likelihood`] is asked for one
   node per partition (and subject), with every parent resolved through the parent's own tag;
5. all nodes are registered under qualified names in a flat [`NodeRegistry`].

Every configuration error is raised by [`Hierarchical::new`]. Compilation never mutates the
model, so calling it again on a fresh runtime rebuilds an identical topology.

# Examples

```rust
use mini_hbm::data::DataTable;
use mini_hbm::distributions::DistKind;
use mini_hbm::graph::{Graph, Runtime};
use mini_hbm::hierarchical::{Hierarchical, ModelConfig, Observed};
use mini_hbm::params::{Knode, ParamTemplate};

let data = DataTable::new()
    .with_column("subj_idx", vec![0_i64, 0, 1, 1])
    .unwrap()
    .with_column("x", vec![0.1, -0.3, 1.2, 0.9])
    .unwrap();

let params = vec![
    ParamTemplate::new("mu")
        .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 5.0))
        .dispersion(Knode::new(DistKind::HalfNormal).parent("sigma", 2.0))
        .subject(Knode::new(DistKind::Normal))
        .labels("mu", "sigma"),
    ParamTemplate::bottom("obs"),
];
let likelihood = Observed::new(DistKind::Normal, "x")
    .parent("mu", "mu")
    .constant("sigma", 1.0);

let model = Hierarchical::new(data, params, likelihood, ModelConfig::default()).unwrap();
let mut graph = Graph::new().set_seed(7);
let compiled = model.create_nodes(&mut graph).unwrap();

assert!(model.is_group_model());
assert_eq!(compiled.params["mu"].group.len(), 1);
assert_eq!(graph.len(), 1 + 1 + 2 + 2);
assert!(compiled.node("obs_subj.1").is_some());
```
*/

use std::fmt;

use indexmap::IndexMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::data::{DataTable, DataView, Key};
use crate::distributions::DistKind;
use crate::errors::ModelError;
use crate::graph::{NodeId, NodeSpec, Parent, Runtime};
use crate::params::{FieldValue, Knode, ParamTemplate, Shape};
use crate::partition::{partition, DependencyEntry, Partition};

/// Model-level options and template overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Forces (or forbids) a group model. When unset, the model is grouped if the subject column
    /// exists and holds more than one subject.
    pub is_group_model: Option<bool>,
    pub subject_column: String,
    /// Parameter name to the data columns it varies across, in declaration order.
    pub depends_on: IndexMap<String, Vec<String>>,
    /// Optional parameters to keep as nodes.
    pub include: Vec<String>,
    /// Field-level overrides, keyed by parameter name and then by field name.
    pub update_params: IndexMap<String, IndexMap<String, FieldValue>>,
    /// Templates that replace the template of the same name.
    #[serde(skip)]
    pub replace_params: Vec<ParamTemplate>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            is_group_model: None,
            subject_column: "subj_idx".to_string(),
            depends_on: IndexMap::new(),
            include: Vec::new(),
            update_params: IndexMap::new(),
            replace_params: Vec::new(),
        }
    }
}

impl ModelConfig {
    pub fn group_model(mut self, grouped: bool) -> Self {
        self.is_group_model = Some(grouped);
        self
    }

    pub fn subject_column(mut self, column: impl Into<String>) -> Self {
        self.subject_column = column.into();
        self
    }

    pub fn depends(mut self, param: impl Into<String>, columns: &[impl AsRef<str>]) -> Self {
        self.depends_on.insert(
            param.into(),
            columns.iter().map(|c| c.as_ref().to_string()).collect(),
        );
        self
    }

    pub fn include(mut self, param: impl Into<String>) -> Self {
        self.include.push(param.into());
        self
    }

    pub fn update(
        mut self,
        param: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.update_params
            .entry(param.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn replace(mut self, template: ParamTemplate) -> Self {
        self.replace_params.push(template);
        self
    }
}

/// Everything a [`Likelihood`] gets to build one bottom node.
pub struct BottomContext<'a> {
    pub param: &'a ParamTemplate,
    /// Qualified node name.
    pub name: String,
    pub tag: String,
    /// Position of the subject in [`Hierarchical::subjects`], in group models.
    pub subject: Option<usize>,
    /// Rows of this partition (and subject).
    pub data: DataView<'a>,
    /// Resolved node of every active non-bottom parameter.
    pub parents: IndexMap<String, Parent>,
    defaults: &'a IndexMap<String, f64>,
}

impl BottomContext<'_> {
    /// The binding of parameter `name`: its resolved node if active, else its default.
    pub fn parent(&self, name: &str) -> Result<Parent, ModelError> {
        lookup(name, &self.parents, self.defaults)
            .ok_or_else(|| ModelError::UnknownParam(name.to_string()))
    }
}

impl fmt::Debug for BottomContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BottomContext")
            .field("param", &self.param.name)
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("subject", &self.subject)
            .field("rows", &self.data.rows())
            .field("parents", &self.parents)
            .finish()
    }
}

fn lookup(
    name: &str,
    parents: &IndexMap<String, Parent>,
    defaults: &IndexMap<String, f64>,
) -> Option<Parent> {
    parents
        .get(name)
        .cloned()
        .or_else(|| defaults.get(name).map(|&d| Parent::Const(d)))
}

/// Builds the likelihood node of a bottom parameter.
pub trait Likelihood {
    fn bottom_node<R: Runtime>(
        &self,
        runtime: &mut R,
        ctx: &BottomContext<'_>,
    ) -> Result<NodeId, ModelError>;

    /// Checks the data the likelihood reads; called once by [`Hierarchical::new`].
    fn validate(&self, _data: &DataTable) -> Result<(), ModelError> {
        Ok(())
    }
}

impl<L: Likelihood + ?Sized> Likelihood for &L {
    fn bottom_node<R: Runtime>(
        &self,
        runtime: &mut R,
        ctx: &BottomContext<'_>,
    ) -> Result<NodeId, ModelError> {
        (**self).bottom_node(runtime, ctx)
    }

    fn validate(&self, data: &DataTable) -> Result<(), ModelError> {
        (**self).validate(data)
    }
}

/// A likelihood that observes one numeric column under a fixed distribution kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub kind: DistKind,
    pub column: String,
    /// Distribution parent label to the parameter that feeds it.
    pub parents: IndexMap<String, String>,
    pub constants: IndexMap<String, f64>,
}

impl Observed {
    pub fn new(kind: DistKind, column: impl Into<String>) -> Self {
        Self {
            kind,
            column: column.into(),
            parents: IndexMap::new(),
            constants: IndexMap::new(),
        }
    }

    pub fn parent(mut self, label: impl Into<String>, param: impl Into<String>) -> Self {
        self.parents.insert(label.into(), param.into());
        self
    }

    pub fn constant(mut self, label: impl Into<String>, value: f64) -> Self {
        self.constants.insert(label.into(), value);
        self
    }
}

impl Likelihood for Observed {
    fn bottom_node<R: Runtime>(
        &self,
        runtime: &mut R,
        ctx: &BottomContext<'_>,
    ) -> Result<NodeId, ModelError> {
        let mut spec = NodeSpec::new(ctx.name.clone(), self.kind)
            .observed(ctx.data.column_f64(&self.column)?);
        for (label, param) in &self.parents {
            spec = spec.parent(label.clone(), ctx.parent(param)?);
        }
        for (label, &value) in &self.constants {
            spec = spec.parent(label.clone(), value);
        }
        Ok(runtime.create_node(spec)?)
    }

    /// The observed column must exist and be numeric.
    fn validate(&self, data: &DataTable) -> Result<(), ModelError> {
        data.view().column_f64(&self.column)?;
        Ok(())
    }
}

/// The per-subject nodes of one tag.
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectNodes {
    /// One slot per subject; `None` for subjects without rows under this tag.
    Grouped(Vec<Option<NodeId>>),
    /// A non-grouped bottom node.
    Single(Option<NodeId>),
}

impl SubjectNodes {
    /// The node of subject `index`. `Single` ignores the index.
    pub fn get(&self, index: usize) -> Option<NodeId> {
        match self {
            SubjectNodes::Grouped(slots) => slots.get(index).copied().flatten(),
            SubjectNodes::Single(node) => *node,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        let slots = match self {
            SubjectNodes::Grouped(slots) => slots.as_slice(),
            SubjectNodes::Single(node) => std::slice::from_ref(node),
        };
        slots.iter().filter_map(|s| *s)
    }
}

/// The nodes of one parameter, by tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamNodes {
    pub group: IndexMap<String, NodeId>,
    pub dispersion: IndexMap<String, NodeId>,
    pub subject: IndexMap<String, SubjectNodes>,
}

impl ParamNodes {
    pub fn subject_node(&self, tag: &str, index: usize) -> Option<NodeId> {
        self.subject.get(tag).and_then(|s| s.get(index))
    }
}

/// The tier a registered node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Group,
    Dispersion,
    Subject,
    Bottom,
}

impl Tier {
    fn suffix(&self) -> &'static str {
        match self {
            Tier::Group => "_group",
            Tier::Dispersion => "_var",
            Tier::Subject | Tier::Bottom => "_subj",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub id: NodeId,
    pub param: String,
    pub tier: Tier,
    pub tag: String,
    pub subject: Option<usize>,
}

/// Flat, read-only view of every compiled node under its qualified name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRegistry {
    entries: IndexMap<String, RegistryEntry>,
}

impl NodeRegistry {
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.entries.get(name).map(|e| e.id)
    }

    pub fn entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegistryEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.values().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, entry: RegistryEntry, subject: Option<&Key>) {
        let mut name = format!("{}{}{}", entry.param, entry.tag, entry.tier.suffix());
        if let Some(key) = subject {
            name.push_str(&format!(".{key}"));
        }
        self.entries.insert(name, entry);
    }
}

/// The result of one compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledModel {
    /// Nodes of every active parameter, in template order.
    pub params: IndexMap<String, ParamNodes>,
    pub registry: NodeRegistry,
    /// Unique keys over the whole dataset of every active dependent parameter.
    pub dependency_values: IndexMap<String, Vec<Key>>,
    pub subjects: Vec<Key>,
}

impl CompiledModel {
    pub fn param(&self, name: &str) -> Option<&ParamNodes> {
        self.params.get(name)
    }

    /// Looks a node up by its registry name.
    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.registry.get(name)
    }

    pub fn dependency_values(&self, param: &str) -> Option<&[Key]> {
        self.dependency_values.get(param).map(Vec::as_slice)
    }
}

/// A validated hierarchical model, ready to be compiled into any [`Runtime`].
pub struct Hierarchical<L> {
    data: DataTable,
    templates: IndexMap<String, ParamTemplate>,
    active: Vec<String>,
    defaults: IndexMap<String, f64>,
    likelihood: L,
    config: ModelConfig,
    grouped: bool,
    subjects: Vec<Key>,
    dependency_values: IndexMap<String, Vec<Key>>,
}

impl<L: fmt::Debug> fmt::Debug for Hierarchical<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hierarchical")
            .field("active", &self.active)
            .field("defaults", &self.defaults)
            .field("likelihood", &self.likelihood)
            .field("grouped", &self.grouped)
            .field("subjects", &self.subjects.len())
            .finish()
    }
}

impl<L: Likelihood> Hierarchical<L> {
    /**
    Validates templates, overrides and dependency declarations against `data`.

    # Errors

    Every configuration error: duplicate or malformed templates, overrides of unknown parameters
    or fields, unknown `include` or `depends_on` entries, missing dependency or subject columns,
    and optional parameters without a default. Errors of [`Likelihood::validate`] are returned
    as they are.
    */
    pub fn new(
        data: DataTable,
        params: Vec<ParamTemplate>,
        likelihood: L,
        mut config: ModelConfig,
    ) -> Result<Self, ModelError> {
        let mut templates = IndexMap::new();
        for p in params {
            if templates.contains_key(&p.name) {
                return Err(ModelError::InvalidTemplate {
                    param: p.name,
                    reason: "duplicate parameter name".to_string(),
                });
            }
            templates.insert(p.name.clone(), p);
        }
        for replacement in std::mem::take(&mut config.replace_params) {
            let slot = templates
                .get_mut(&replacement.name)
                .ok_or_else(|| ModelError::UnknownParam(replacement.name.clone()))?;
            *slot = replacement;
        }
        for (name, fields) in &config.update_params {
            let template = templates
                .get_mut(name)
                .ok_or_else(|| ModelError::UnknownParam(name.clone()))?;
            for (key, value) in fields {
                template.apply_update(key, value)?;
            }
        }
        for template in templates.values() {
            template.shape()?;
        }
        if let Some(name) = config.include.iter().find(|n| !templates.contains_key(*n)) {
            return Err(ModelError::UnknownParam(name.clone()));
        }

        let mut active = Vec::new();
        let mut defaults = IndexMap::new();
        for t in templates.values() {
            if t.optional && !config.include.contains(&t.name) {
                let default = t
                    .default
                    .ok_or_else(|| ModelError::MissingDefault(t.name.clone()))?;
                defaults.insert(t.name.clone(), default);
            } else {
                active.push(t.name.clone());
            }
        }

        for (param, columns) in &config.depends_on {
            if !templates.contains_key(param) {
                return Err(ModelError::UnknownParam(param.clone()));
            }
            if let Some(column) = columns.iter().find(|c| !data.has_column(c)) {
                return Err(ModelError::MissingColumn {
                    param: param.clone(),
                    column: column.clone(),
                });
            }
        }

        likelihood.validate(&data)?;

        let subject_column = config.subject_column.as_str();
        let grouped = match config.is_group_model {
            Some(true) if !data.has_column(subject_column) => {
                return Err(ModelError::MissingSubjectColumn(subject_column.to_string()))
            }
            Some(grouped) => grouped,
            None => {
                data.has_column(subject_column)
                    && data.view().unique(&[subject_column])?.len() > 1
            }
        };
        let subjects = if grouped {
            data.view().unique(&[subject_column])?
        } else {
            Vec::new()
        };

        let mut dependency_values = IndexMap::new();
        for (param, columns) in &config.depends_on {
            if active.contains(param) && !columns.is_empty() {
                dependency_values.insert(param.clone(), data.view().unique(columns)?);
            }
        }

        debug!(
            "model with {} active parameters ({} replaced by defaults), grouped: {}",
            active.len(),
            defaults.len(),
            grouped
        );
        Ok(Self {
            data,
            templates,
            active,
            defaults,
            likelihood,
            config,
            grouped,
            subjects,
            dependency_values,
        })
    }

    pub fn data(&self) -> &DataTable {
        &self.data
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn likelihood(&self) -> &L {
        &self.likelihood
    }

    pub fn is_group_model(&self) -> bool {
        self.grouped
    }

    /// Sorted subject keys of a group model; empty otherwise.
    pub fn subjects(&self) -> &[Key] {
        &self.subjects
    }

    /// Every template after overrides, in declaration order.
    pub fn templates(&self) -> impl Iterator<Item = &ParamTemplate> {
        self.templates.values()
    }

    pub fn template(&self, name: &str) -> Option<&ParamTemplate> {
        self.templates.get(name)
    }

    /// Templates that become nodes.
    pub fn active_params(&self) -> impl Iterator<Item = &ParamTemplate> {
        self.active.iter().filter_map(|n| self.templates.get(n))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.iter().any(|n| n == name)
    }

    /**
    Resolves parameter `name` against a set of parent bindings: active parameters must be bound,
    optional parameters that were not included resolve to their default.

    # Examples

    ```rust
    use indexmap::IndexMap;
    use mini_hbm::data::DataTable;
    use mini_hbm::distributions::DistKind;
    use mini_hbm::graph::Parent;
    use mini_hbm::hierarchical::{Hierarchical, ModelConfig, Observed};
    use mini_hbm::params::{Knode, ParamTemplate};

    let data = DataTable::new().with_column("x", vec![0.0, 1.0]).unwrap();
    let params = vec![
        ParamTemplate::new("z")
            .group(Knode::new(DistKind::Uniform).parent("lower", 0.0).parent("upper", 1.0))
            .optional(0.5),
        ParamTemplate::bottom("obs"),
    ];
    let lik = Observed::new(DistKind::Normal, "x").parent("mu", "z").constant("sigma", 1.0);
    let model = Hierarchical::new(data, params, lik, ModelConfig::default()).unwrap();

    assert_eq!(model.get_node("z", &IndexMap::new()).unwrap(), Parent::Const(0.5));
    ```
    */
    pub fn get_node(
        &self,
        name: &str,
        parents: &IndexMap<String, Parent>,
    ) -> Result<Parent, ModelError> {
        if !self.templates.contains_key(name) {
            return Err(ModelError::UnknownParam(name.to_string()));
        }
        lookup(name, parents, &self.defaults).ok_or_else(|| ModelError::Unresolved {
            param: name.to_string(),
            tag: String::new(),
            subject: None,
        })
    }

    fn depends(&self, name: &str) -> Option<&[String]> {
        self.config
            .depends_on
            .get(name)
            .filter(|cols| !cols.is_empty())
            .map(Vec::as_slice)
    }

    /// Dependency entries that partition the data for bottom parameter `bottom`.
    fn bottom_entries(&self, bottom: &str) -> Vec<DependencyEntry> {
        self.config
            .depends_on
            .iter()
            .filter(|(_, cols)| !cols.is_empty())
            .filter_map(|(param, cols)| {
                let template = self.templates.get(param)?;
                if param == bottom {
                    Some(DependencyEntry::new(param.clone(), cols).split_only())
                } else if !template.is_bottom && self.is_active(param) {
                    Some(DependencyEntry::new(param.clone(), cols))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Every tag of parameter `name` with its rows.
    fn tagged_slices(&self, name: &str) -> Result<Vec<(String, DataView<'_>)>, ModelError> {
        let view = self.data.view();
        match self.depends(name) {
            None => Ok(vec![(String::new(), view)]),
            Some(columns) => view
                .unique(columns)?
                .into_iter()
                .map(|key| -> Result<_, ModelError> {
                    Ok((key.to_string(), view.select(columns, &key)?))
                })
                .collect(),
        }
    }

    /// The rows of subject `index` within `view`.
    fn subject_rows<'a>(&self, view: &DataView<'a>, index: usize) -> Result<DataView<'a>, ModelError> {
        Ok(view.select(&[self.config.subject_column.as_str()], &self.subjects[index])?)
    }

    /**
    Builds every node of the model into `runtime`.

    # Errors

    [`ModelError::Unresolved`] if a bottom node's parent has no node under the required tag,
    [`ModelError::ZeroProbability`] if any created node starts with zero probability, and errors
    forwarded from the runtime and the likelihood.
    */
    pub fn create_nodes<R: Runtime>(&self, runtime: &mut R) -> Result<CompiledModel, ModelError> {
        let mut params: IndexMap<String, ParamNodes> = IndexMap::new();

        for template in self.active_params() {
            match template.shape()? {
                Shape::Bottom => {}
                shape => {
                    let nodes = self.create_param(runtime, template, shape)?;
                    debug!(
                        "`{}`: {} group, {} dispersion, {} subject nodes",
                        template.name,
                        nodes.group.len(),
                        nodes.dispersion.len(),
                        nodes.subject.values().map(|s| s.ids().count()).sum::<usize>()
                    );
                    params.insert(template.name.clone(), nodes);
                }
            }
        }

        // Bottom slots are allocated for every partition before any of them is filled.
        let mut bottoms = Vec::new();
        for template in self.active_params().filter(|t| t.is_bottom) {
            let parts = partition(&self.data.view(), &self.bottom_entries(&template.name))?;
            let mut nodes = ParamNodes::default();
            for part in &parts {
                let slot = if self.grouped {
                    SubjectNodes::Grouped(vec![None; self.subjects.len()])
                } else {
                    SubjectNodes::Single(None)
                };
                nodes.subject.insert(part.tag(), slot);
            }
            debug!("`{}`: {} partitions", template.name, parts.len());
            bottoms.push((template, parts, nodes));
        }

        for (template, parts, mut nodes) in bottoms {
            for part in &parts {
                let tag = part.tag();
                if self.grouped {
                    for index in 0..self.subjects.len() {
                        let rows = self.subject_rows(&part.data, index)?;
                        if rows.is_empty() {
                            continue;
                        }
                        let name = format!("{}{}.{}", template.name, tag, self.subjects[index]);
                        let id = self.bottom_node(runtime, &params, template, part, name, rows, Some(index))?;
                        if let Some(SubjectNodes::Grouped(slots)) = nodes.subject.get_mut(&tag) {
                            slots[index] = Some(id);
                        }
                    }
                } else {
                    let name = format!("{}{}", template.name, tag);
                    let id = self.bottom_node(runtime, &params, template, part, name, part.data.clone(), None)?;
                    nodes.subject.insert(tag, SubjectNodes::Single(Some(id)));
                }
            }
            params.insert(template.name.clone(), nodes);
        }

        // Restore template order.
        let params: IndexMap<String, ParamNodes> = self
            .active
            .iter()
            .filter_map(|n| params.shift_remove(n).map(|nodes| (n.clone(), nodes)))
            .collect();
        let registry = self.register(&params);

        for (name, entry) in registry.iter() {
            let lp = runtime.logp(entry.id);
            if lp.is_nan() || lp == f64::NEG_INFINITY {
                return Err(ModelError::ZeroProbability {
                    node: name.to_string(),
                });
            }
        }

        info!(
            "compiled {} nodes for {} parameters ({} subjects)",
            registry.len(),
            params.len(),
            self.subjects.len()
        );
        Ok(CompiledModel {
            params,
            registry,
            dependency_values: self.dependency_values.clone(),
            subjects: self.subjects.clone(),
        })
    }

    /**
    Calls [`create_nodes`](Self::create_nodes) on a fresh runtime until it no longer fails with
    [`ModelError::ZeroProbability`], at most `max_retries` times after the first attempt.

    `make_runtime(attempt)` provides the runtime of every attempt, counting from zero. Runtimes
    that draw initial values should be seeded from `attempt`, otherwise every retry rebuilds the
    same start.
    */
    pub fn create_nodes_with_retries<R, F>(
        &self,
        max_retries: usize,
        mut make_runtime: F,
    ) -> Result<(R, CompiledModel), ModelError>
    where
        R: Runtime,
        F: FnMut(usize) -> R,
    {
        let mut attempt = 0;
        loop {
            let mut runtime = make_runtime(attempt);
            match self.create_nodes(&mut runtime) {
                Ok(model) => return Ok((runtime, model)),
                Err(ModelError::ZeroProbability { node }) if attempt < max_retries => {
                    attempt += 1;
                    warn!("node `{node}` started with zero probability, rebuilding (attempt {attempt}/{max_retries})");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn create_param<R: Runtime>(
        &self,
        runtime: &mut R,
        template: &ParamTemplate,
        shape: Shape<'_>,
    ) -> Result<ParamNodes, ModelError> {
        let name = &template.name;
        let mut nodes = ParamNodes::default();
        let mut shared = None;

        for (tag, slice) in self.tagged_slices(name)? {
            let group = match shape {
                Shape::Group { group } | Shape::Hierarchical { group, .. } => group,
                Shape::Bottom => continue,
            };
            let group_id = runtime.create_node(knode_spec(format!("{name}{tag}"), group))?;
            nodes.group.insert(tag.clone(), group_id);

            let (dispersion, subject) = match shape {
                Shape::Hierarchical {
                    dispersion,
                    subject,
                    ..
                } if self.grouped => (dispersion, subject),
                _ => continue,
            };

            let dispersion_id = match shared {
                Some(id) => id,
                None => {
                    let label = if template.shared_dispersion {
                        format!("{name}_var")
                    } else {
                        format!("{name}_var{tag}")
                    };
                    let id = runtime.create_node(knode_spec(label, dispersion))?;
                    if template.shared_dispersion {
                        shared = Some(id);
                    }
                    id
                }
            };
            nodes.dispersion.insert(tag.clone(), dispersion_id);

            let (group_parent, dispersion_parent) = match &template.transform {
                Some(f) => f(Parent::Node(group_id), Parent::Node(dispersion_id)),
                None => (Parent::Node(group_id), Parent::Node(dispersion_id)),
            };
            let mut slots = vec![None; self.subjects.len()];
            for (index, slot) in slots.iter_mut().enumerate() {
                if self.subject_rows(&slice, index)?.is_empty() {
                    continue;
                }
                let mut spec = knode_spec(format!("{name}{tag}.{}", self.subjects[index]), subject);
                if let Some(label) = &template.group_label {
                    spec = spec.parent(label.clone(), group_parent.clone());
                }
                if let Some(label) = &template.dispersion_label {
                    spec = spec.parent(label.clone(), dispersion_parent.clone());
                }
                *slot = Some(runtime.create_node(spec)?);
            }
            nodes.subject.insert(tag, SubjectNodes::Grouped(slots));
        }
        Ok(nodes)
    }

    #[allow(clippy::too_many_arguments)]
    fn bottom_node<'a, R: Runtime>(
        &'a self,
        runtime: &mut R,
        params: &IndexMap<String, ParamNodes>,
        template: &'a ParamTemplate,
        part: &Partition<'a>,
        name: String,
        rows: DataView<'a>,
        subject: Option<usize>,
    ) -> Result<NodeId, ModelError> {
        let mut parents = IndexMap::new();
        for other in self.active_params().filter(|t| !t.is_bottom) {
            let tag = part
                .bindings
                .get(&other.name)
                .map(Key::to_string)
                .unwrap_or_default();
            let nodes = params.get(&other.name);
            let id = match subject {
                Some(index) if other.subject.is_some() => {
                    nodes.and_then(|n| n.subject_node(&tag, index))
                }
                _ => nodes.and_then(|n| n.group.get(&tag).copied()),
            };
            let id = id.ok_or_else(|| ModelError::Unresolved {
                param: other.name.clone(),
                tag,
                subject,
            })?;
            parents.insert(other.name.clone(), Parent::Node(id));
        }

        let ctx = BottomContext {
            param: template,
            name,
            tag: part.tag(),
            subject,
            data: rows,
            parents,
            defaults: &self.defaults,
        };
        self.likelihood.bottom_node(runtime, &ctx)
    }

    fn register(&self, params: &IndexMap<String, ParamNodes>) -> NodeRegistry {
        let mut registry = NodeRegistry::default();
        for (param, nodes) in params {
            let Some(template) = self.templates.get(param) else {
                continue;
            };
            let entry = |id, tier, tag: &str, subject| RegistryEntry {
                id,
                param: param.clone(),
                tier,
                tag: tag.to_string(),
                subject,
            };
            for (tag, &id) in &nodes.group {
                registry.insert(entry(id, Tier::Group, tag, None), None);
            }
            for (tag, &id) in &nodes.dispersion {
                if template.shared_dispersion {
                    registry.insert(entry(id, Tier::Dispersion, "", None), None);
                } else {
                    registry.insert(entry(id, Tier::Dispersion, tag, None), None);
                }
            }
            let tier = if template.is_bottom {
                Tier::Bottom
            } else {
                Tier::Subject
            };
            for (tag, subject) in &nodes.subject {
                match subject {
                    SubjectNodes::Grouped(slots) => {
                        for (index, id) in slots.iter().enumerate() {
                            if let Some(id) = *id {
                                registry.insert(
                                    entry(id, tier, tag, Some(index)),
                                    Some(&self.subjects[index]),
                                );
                            }
                        }
                    }
                    SubjectNodes::Single(Some(id)) => {
                        registry.insert(entry(*id, tier, tag, None), None);
                    }
                    SubjectNodes::Single(None) => {}
                }
            }
        }
        registry
    }
}

fn knode_spec(name: String, knode: &Knode) -> NodeSpec {
    let mut spec = NodeSpec::new(name, knode.kind).parents(knode.parents.clone());
    spec.init = knode.init;
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn data() -> DataTable {
        DataTable::new()
            .with_column("subj_idx", vec![0_i64, 0, 0, 1, 1, 2])
            .unwrap()
            .with_column("cond", vec!["a", "b", "a", "a", "a", "b"])
            .unwrap()
            .with_column("x", vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6])
            .unwrap()
    }

    fn mu() -> ParamTemplate {
        ParamTemplate::new("mu")
            .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 1.0))
            .dispersion(Knode::new(DistKind::HalfNormal).parent("sigma", 1.0))
            .subject(Knode::new(DistKind::Normal))
            .labels("mu", "sigma")
    }

    fn likelihood() -> Observed {
        Observed::new(DistKind::Normal, "x")
            .parent("mu", "mu")
            .constant("sigma", 1.0)
    }

    #[test]
    fn subjects_without_rows_get_no_node() {
        let config = ModelConfig::default().depends("mu", &["cond"]);
        let model =
            Hierarchical::new(data(), vec![mu(), ParamTemplate::bottom("obs")], likelihood(), config)
                .unwrap();
        let mut graph = Graph::new().set_seed(3);
        let compiled = model.create_nodes(&mut graph).unwrap();

        let nodes = &compiled.params["mu"];
        assert_eq!(nodes.group.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        // subject 1 never saw condition b, subject 2 never saw a
        assert!(nodes.subject_node("a", 2).is_none());
        assert!(nodes.subject_node("b", 1).is_none());
        assert!(nodes.subject_node("b", 2).is_some());
        assert!(compiled.node("mub_subj.1").is_none());
        assert!(compiled.node("mub_subj.2").is_some());
        assert_eq!(
            compiled.dependency_values("mu").map(|v| v.len()),
            Some(2)
        );
    }

    #[test]
    fn shared_dispersion_is_registered_once() {
        let config = ModelConfig::default()
            .depends("mu", &["cond"])
            .update("mu", "shared_dispersion", true);
        let model =
            Hierarchical::new(data(), vec![mu(), ParamTemplate::bottom("obs")], likelihood(), config)
                .unwrap();
        let mut graph = Graph::new().set_seed(5);
        let compiled = model.create_nodes(&mut graph).unwrap();
        let nodes = &compiled.params["mu"];
        assert_eq!(nodes.dispersion["a"], nodes.dispersion["b"]);
        let dispersion_entries = compiled
            .registry
            .iter()
            .filter(|(_, e)| e.tier == Tier::Dispersion)
            .count();
        assert_eq!(dispersion_entries, 1);
        assert!(compiled.node("mu_var").is_some());
    }

    #[test]
    fn non_group_models_only_create_group_nodes() {
        let config = ModelConfig::default().group_model(false);
        let model =
            Hierarchical::new(data(), vec![mu(), ParamTemplate::bottom("obs")], likelihood(), config)
                .unwrap();
        let mut graph = Graph::new();
        let compiled = model.create_nodes(&mut graph).unwrap();
        assert!(model.subjects().is_empty());
        assert_eq!(graph.len(), 2);
        assert_eq!(
            compiled.params["obs"].subject[""],
            SubjectNodes::Single(compiled.node("obs_subj"))
        );
        let obs = compiled.node("obs_subj").unwrap();
        assert_eq!(graph.parent_ids(obs), vec![compiled.node("mu_group"), None]);
    }

    #[test]
    fn transform_feeds_subject_parents() {
        let mu = mu()
            .labels("mu", "sigma")
            .transform(|g, d| (g, d.map(|s| s * 10.0)));
        let model = Hierarchical::new(
            data(),
            vec![mu, ParamTemplate::bottom("obs")],
            likelihood(),
            ModelConfig::default(),
        )
        .unwrap();
        let mut graph = Graph::new().set_seed(11);
        let compiled = model.create_nodes(&mut graph).unwrap();
        let d = compiled.node("mu_var").unwrap();
        let s0 = compiled.node("mu_subj.0").unwrap();
        let values = graph.parent_values(s0);
        assert!((values[1] - graph.value(d) * 10.0).abs() < 1e-12);
    }

    #[test]
    fn zero_probability_starts_are_reported() {
        let bad = ParamTemplate::new("s")
            .group(Knode::new(DistKind::HalfNormal).parent("sigma", 1.0).init(-1.0));
        let lik = Observed::new(DistKind::Normal, "x")
            .parent("sigma", "s")
            .constant("mu", 0.0);
        let model = Hierarchical::new(
            data(),
            vec![bad, ParamTemplate::bottom("obs")],
            lik,
            ModelConfig::default(),
        )
        .unwrap();
        let err = model.create_nodes(&mut Graph::new()).unwrap_err();
        assert_eq!(
            err,
            ModelError::ZeroProbability {
                node: "s_group".to_string()
            }
        );
        let mut attempts = Vec::new();
        let err = model
            .create_nodes_with_retries(2, |attempt| {
                attempts.push(attempt);
                Graph::new().set_seed(attempt as u64)
            })
            .unwrap_err();
        assert!(matches!(err, ModelError::ZeroProbability { .. }));
        assert_eq!(attempts, vec![0, 1, 2]);
    }

    #[test]
    fn config_deserializes_from_json() {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "depends_on": {"mu": ["cond"]},
                "include": [],
                "update_params": {"mu": {"subject_step": "frozen", "dispersion_kind": "var"}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.subject_column, "subj_idx");
        assert_eq!(config.is_group_model, None);
        let model =
            Hierarchical::new(data(), vec![mu(), ParamTemplate::bottom("obs")], likelihood(), config)
                .unwrap();
        let template = model.template("mu").unwrap();
        assert_eq!(
            template.dispersion_kind,
            crate::params::DispersionKind::Var
        );
    }
}
