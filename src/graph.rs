/*!
# Stochastic Node Runtime

The model compiler never evaluates densities itself. It talks to a [`Runtime`]: something that
can create named stochastic nodes from a distribution kind and a set of parent bindings, and that
exposes each node's current value and log-density.

[`Graph`] is the reference runtime: an arena of nodes indexed by [`NodeId`], where each node
records the nodes that use it as a parent so that `logp_plus_loglike` (the log-density a
single-site sampler needs) only visits the node's Markov blanket.

# Examples

```rust
use mini_hbm::distributions::DistKind;
use mini_hbm::graph::{Graph, NodeSpec, Parent, Runtime};
use ndarray::arr1;

let mut graph = Graph::new().set_seed(42);
let mu = graph
    .create_node(
        NodeSpec::new("mu", DistKind::Normal)
            .parent("mu", 0.0)
            .parent("sigma", 10.0)
            .init(1.0),
    )
    .unwrap();
let obs = graph
    .create_node(
        NodeSpec::new("x", DistKind::Normal)
            .parent("mu", mu)
            .parent("sigma", 1.0)
            .observed(arr1(&[0.8, 1.2])),
    )
    .unwrap();

assert!(graph.is_observed(obs));
let blanket = graph.logp_plus_loglike(mu);
assert!((blanket - (graph.logp(mu) + graph.logp(obs))).abs() < 1e-12);
```
*/

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};

use crate::distributions::DistKind;
use crate::errors::RuntimeError;

/// Handle of a node inside a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// A deterministic map applied to a parent's value.
pub type ValueMap = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// How a node receives the value of one of its parents.
#[derive(Clone)]
pub enum Parent {
    /// A fixed value.
    Const(f64),
    /// The current value of another node.
    Node(NodeId),
    /// A deterministic function of another node's current value.
    Mapped { node: NodeId, f: ValueMap },
}

impl Parent {
    /// Composes `f` onto this binding. Constants are mapped eagerly.
    pub fn map<F>(self, f: F) -> Parent
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        match self {
            Parent::Const(v) => Parent::Const(f(v)),
            Parent::Node(node) => Parent::Mapped {
                node,
                f: Arc::new(f),
            },
            Parent::Mapped { node, f: inner } => Parent::Mapped {
                node,
                f: Arc::new(move |x| f(inner(x))),
            },
        }
    }

    /// The node this binding reads from, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Parent::Const(_) => None,
            Parent::Node(id) | Parent::Mapped { node: id, .. } => Some(*id),
        }
    }

    /// Resolves the binding against a runtime's current values.
    pub fn resolve<R: Runtime + ?Sized>(&self, runtime: &R) -> f64 {
        match self {
            Parent::Const(v) => *v,
            Parent::Node(id) => runtime.value(*id),
            Parent::Mapped { node, f } => f(runtime.value(*node)),
        }
    }
}

impl fmt::Debug for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Const(v) => write!(f, "Const({v})"),
            Parent::Node(id) => write!(f, "Node({})", id.0),
            Parent::Mapped { node, .. } => write!(f, "Mapped({})", node.0),
        }
    }
}

impl PartialEq for Parent {
    /// Mapped bindings compare by source node and function identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Parent::Const(a), Parent::Const(b)) => a == b,
            (Parent::Node(a), Parent::Node(b)) => a == b,
            (Parent::Mapped { node: a, f: fa }, Parent::Mapped { node: b, f: fb }) => {
                a == b && Arc::ptr_eq(fa, fb)
            }
            _ => false,
        }
    }
}

impl From<f64> for Parent {
    fn from(v: f64) -> Self {
        Parent::Const(v)
    }
}

impl From<NodeId> for Parent {
    fn from(id: NodeId) -> Self {
        Parent::Node(id)
    }
}

/// Everything a runtime needs to create one node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub kind: DistKind,
    pub parents: IndexMap<String, Parent>,
    /// Observed data; observed nodes have a fixed value and contribute a log-likelihood.
    pub observed: Option<Array1<f64>>,
    /// Initial value; drawn from the node's prior when absent.
    pub init: Option<f64>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: DistKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parents: IndexMap::new(),
            observed: None,
            init: None,
        }
    }

    pub fn parent(mut self, label: impl Into<String>, parent: impl Into<Parent>) -> Self {
        self.parents.insert(label.into(), parent.into());
        self
    }

    pub fn parents(mut self, parents: IndexMap<String, Parent>) -> Self {
        self.parents.extend(parents);
        self
    }

    pub fn observed(mut self, data: Array1<f64>) -> Self {
        self.observed = Some(data);
        self
    }

    pub fn init(mut self, value: f64) -> Self {
        self.init = Some(value);
        self
    }
}

/// The stochastic-variable runtime consumed by the model compiler and the samplers.
pub trait Runtime {
    /// Creates a node and returns its handle.
    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RuntimeError>;

    /// Current value of a node. Observed nodes report the first observation.
    fn value(&self, id: NodeId) -> f64;

    /// Reassigns a latent node's value.
    fn set_value(&mut self, id: NodeId, value: f64) -> Result<(), RuntimeError>;

    /// The node's own log-density (log-prior, or log-likelihood for observed nodes).
    fn logp(&self, id: NodeId) -> f64;

    /// The node's log-density plus the log-density of every node that depends on it.
    fn logp_plus_loglike(&self, id: NodeId) -> f64;

    fn is_observed(&self, id: NodeId) -> bool;

    fn name(&self, id: NodeId) -> &str;

    /// Number of nodes created so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of every node's log-density.
    fn total_logp(&self) -> f64 {
        (0..self.len()).map(|i| self.logp(NodeId(i))).sum()
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: DistKind,
    parents: Vec<Parent>,
    value: f64,
    observed: Option<Array1<f64>>,
    children: Vec<NodeId>,
}

/// Arena-backed reference [`Runtime`].
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    name_to_node: IndexMap<String, NodeId>,
    /// Seed of the random number generator used for initial values.
    pub seed: u64,
    rng: SmallRng,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            nodes: Vec::new(),
            name_to_node: IndexMap::new(),
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Reseeds the generator that draws initial values.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Looks a node up by its qualified name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    /// Parent nodes of `id`, in the order of the distribution's parent names.
    pub fn parent_ids(&self, id: NodeId) -> Vec<Option<NodeId>> {
        self.nodes[id.0].parents.iter().map(Parent::node).collect()
    }

    /// Nodes that use `id` as a parent.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Current values of every parent of `id`.
    pub fn parent_values(&self, id: NodeId) -> Vec<f64> {
        self.nodes[id.0]
            .parents
            .iter()
            .map(|p| p.resolve(self))
            .collect()
    }

    fn node_logp(&self, node: &Node) -> f64 {
        let p: Vec<f64> = node.parents.iter().map(|p| p.resolve(self)).collect();
        match &node.observed {
            Some(data) => data.iter().map(|&x| node.kind.ln_pdf(&p, x)).sum(),
            None => node.kind.ln_pdf(&p, node.value),
        }
    }
}

impl Runtime for Graph {
    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, RuntimeError> {
        let NodeSpec {
            name,
            kind,
            mut parents,
            observed,
            init,
        } = spec;

        if let Some(extra) = parents
            .keys()
            .find(|label| !kind.parent_names().contains(&label.as_str()))
        {
            return Err(RuntimeError::UnexpectedParent {
                node: name,
                parent: extra.clone(),
            });
        }
        let mut ordered = Vec::with_capacity(kind.parent_names().len());
        for &label in kind.parent_names() {
            let parent = parents
                .shift_remove(label)
                .ok_or_else(|| RuntimeError::MissingParent {
                    node: name.clone(),
                    parent: label.to_string(),
                })?;
            if let Some(pid) = parent.node() {
                if pid.0 >= self.nodes.len() {
                    return Err(RuntimeError::UnknownNode {
                        node: name,
                        id: pid.0,
                    });
                }
            }
            ordered.push(parent);
        }

        let id = NodeId(self.nodes.len());
        let value = match (&observed, init) {
            (Some(data), _) => data.first().copied().unwrap_or(f64::NAN),
            (None, Some(v)) => v,
            (None, None) => {
                let p: Vec<f64> = ordered.iter().map(|p| p.resolve(&*self)).collect();
                kind.sample(&p, &mut self.rng).unwrap_or(f64::NAN)
            }
        };
        for pid in ordered.iter().filter_map(Parent::node) {
            let children = &mut self.nodes[pid.0].children;
            if !children.contains(&id) {
                children.push(id);
            }
        }
        self.name_to_node.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            kind,
            parents: ordered,
            value,
            observed,
            children: Vec::new(),
        });
        Ok(id)
    }

    fn value(&self, id: NodeId) -> f64 {
        self.nodes[id.0].value
    }

    fn set_value(&mut self, id: NodeId, value: f64) -> Result<(), RuntimeError> {
        let node = &mut self.nodes[id.0];
        if node.observed.is_some() {
            return Err(RuntimeError::Observed(node.name.clone()));
        }
        node.value = value;
        Ok(())
    }

    fn logp(&self, id: NodeId) -> f64 {
        self.node_logp(&self.nodes[id.0])
    }

    fn logp_plus_loglike(&self, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        let own = self.node_logp(node);
        if own == f64::NEG_INFINITY {
            return own;
        }
        own + node
            .children
            .iter()
            .map(|c| self.node_logp(&self.nodes[c.0]))
            .sum::<f64>()
    }

    fn is_observed(&self, id: NodeId) -> bool {
        self.nodes[id.0].observed.is_some()
    }

    fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn normal(name: &str, mu: impl Into<Parent>, sigma: impl Into<Parent>) -> NodeSpec {
        NodeSpec::new(name, DistKind::Normal)
            .parent("mu", mu)
            .parent("sigma", sigma)
    }

    #[test]
    fn parents_are_validated() {
        let mut g = Graph::new();
        let err = g
            .create_node(NodeSpec::new("a", DistKind::Normal).parent("mu", 0.0))
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::MissingParent {
                node: "a".to_string(),
                parent: "sigma".to_string()
            }
        );
        let err = g
            .create_node(normal("a", 0.0, 1.0).parent("tau", 1.0))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnexpectedParent { .. }));
        let err = g.create_node(normal("a", NodeId(7), 1.0)).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownNode { id: 7, .. }));
        assert!(g.is_empty());
    }

    #[test]
    fn markov_blanket_sums_children() {
        let mut g = Graph::new().set_seed(1);
        let mu = g.create_node(normal("mu", 0.0, 1.0).init(0.5)).unwrap();
        let a = g.create_node(normal("a", mu, 1.0).init(1.0)).unwrap();
        let b = g.create_node(normal("b", mu, 2.0).init(-1.0)).unwrap();
        let unrelated = g.create_node(normal("c", 0.0, 1.0).init(3.0)).unwrap();

        assert_eq!(g.children(mu), &[a, b]);
        let expected = g.logp(mu) + g.logp(a) + g.logp(b);
        assert_abs_diff_eq!(g.logp_plus_loglike(mu), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(
            g.total_logp(),
            expected + g.logp(unrelated),
            epsilon = 1e-12
        );
    }

    #[test]
    fn mapped_parents_follow_their_source() {
        let mut g = Graph::new();
        let s = g
            .create_node(NodeSpec::new("s", DistKind::HalfNormal).parent("sigma", 1.0).init(2.0))
            .unwrap();
        let doubled = Parent::Node(s).map(|v| v * 2.0).map(|v| v + 1.0);
        let x = g.create_node(normal("x", 0.0, doubled).init(0.0)).unwrap();
        assert_eq!(g.parent_values(x), vec![0.0, 5.0]);
        g.set_value(s, 0.5).unwrap();
        assert_eq!(g.parent_values(x), vec![0.0, 2.0]);
        assert_eq!(g.parent_ids(x), vec![None, Some(s)]);
    }

    #[test]
    fn observed_nodes_are_fixed() {
        let mut g = Graph::new();
        let mu = g.create_node(normal("mu", 0.0, 1.0)).unwrap();
        let obs = g
            .create_node(normal("x", mu, 1.0).observed(arr1(&[0.1, -0.2, 0.3])))
            .unwrap();
        assert_eq!(g.value(obs), 0.1);
        assert!(matches!(g.set_value(obs, 1.0), Err(RuntimeError::Observed(_))));
        assert_eq!(g.node_id("x"), Some(obs));
        assert_eq!(g.name(mu), "mu");
    }

    #[test]
    fn impossible_values_short_circuit() {
        let mut g = Graph::new();
        let s = g
            .create_node(NodeSpec::new("s", DistKind::HalfNormal).parent("sigma", 1.0).init(-1.0))
            .unwrap();
        g.create_node(normal("x", 0.0, s).observed(arr1(&[0.0])))
            .unwrap();
        assert_eq!(g.logp_plus_loglike(s), f64::NEG_INFINITY);
    }
}
