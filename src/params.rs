/*!
# Parameter Templates

A [`ParamTemplate`] declares one named quantity of a hierarchical model. Non-bottom parameters
carry up to three tier specifications ([`Knode`]s): a group-level node, a dispersion node and a
per-subject node whose parents are the group and dispersion nodes of the same tag. Bottom
parameters carry no tiers; their nodes are built by a user-supplied
[`Likelihood`](crate::hierarchical::Likelihood).

Which tiers a template has is checked once through [`ParamTemplate::shape`], so the compiler can
match exhaustively on [`Shape`] instead of inspecting flags.

# Examples

```rust
use mini_hbm::distributions::DistKind;
use mini_hbm::params::{Knode, ParamTemplate, Shape};

let v = ParamTemplate::new("v")
    .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 2.0))
    .dispersion(Knode::new(DistKind::HalfNormal).parent("sigma", 1.0))
    .subject(Knode::new(DistKind::Normal))
    .labels("mu", "sigma");

assert!(matches!(v.shape(), Ok(Shape::Hierarchical { .. })));
assert!(v.has_subject());
```
*/

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::distributions::DistKind;
use crate::errors::ModelError;
use crate::graph::Parent;

/// Maps the (group, dispersion) parent bindings before they reach the subject tier.
pub type Transform = Arc<dyn Fn(Parent, Parent) -> (Parent, Parent) + Send + Sync>;

/// How a node is updated by the sampling driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRule {
    /// Univariate slice sampling.
    Slice {
        #[serde(default = "default_width")]
        width: f64,
        #[serde(default = "default_max_iter")]
        max_iter: usize,
        #[serde(default)]
        lower: Option<f64>,
        #[serde(default)]
        upper: Option<f64>,
    },
    /// The node keeps its value.
    Frozen,
}

fn default_width() -> f64 {
    0.5
}

fn default_max_iter() -> usize {
    200
}

impl Default for StepRule {
    fn default() -> Self {
        StepRule::Slice {
            width: default_width(),
            max_iter: default_max_iter(),
            lower: None,
            upper: None,
        }
    }
}

impl FromStr for StepRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slice" => Ok(StepRule::default()),
            "frozen" => Ok(StepRule::Frozen),
            other => Err(format!("unknown step rule `{other}`")),
        }
    }
}

/// Rule for reducing per-subject values to a dispersion estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispersionKind {
    /// Population standard deviation.
    #[default]
    Std,
    Var,
    Precision,
    /// Method-of-moments equivalent sample size of a beta distribution.
    SampleSize,
}

impl DispersionKind {
    /// Estimates the dispersion of `values`. Returns NaN for an empty slice.
    pub fn estimate(&self, values: &[f64]) -> f64 {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        match self {
            DispersionKind::Std => var.sqrt(),
            DispersionKind::Var => var,
            DispersionKind::Precision => 1.0 / var,
            DispersionKind::SampleSize => mean * (1.0 - mean) / var - 1.0,
        }
    }
}

impl FromStr for DispersionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "std" => Ok(DispersionKind::Std),
            "var" => Ok(DispersionKind::Var),
            "precision" => Ok(DispersionKind::Precision),
            "sample_size" => Ok(DispersionKind::SampleSize),
            other => Err(format!("unknown dispersion kind `{other}`")),
        }
    }
}

/// Specification of one tier of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Knode {
    pub kind: DistKind,
    /// Fixed parent bindings. The subject tier's group and dispersion labels are filled in by the
    /// compiler.
    pub parents: IndexMap<String, Parent>,
    pub step: StepRule,
    pub init: Option<f64>,
}

impl Knode {
    pub fn new(kind: DistKind) -> Self {
        Self {
            kind,
            parents: IndexMap::new(),
            step: StepRule::default(),
            init: None,
        }
    }

    pub fn parent(mut self, label: impl Into<String>, parent: impl Into<Parent>) -> Self {
        self.parents.insert(label.into(), parent.into());
        self
    }

    pub fn step(mut self, step: StepRule) -> Self {
        self.step = step;
        self
    }

    pub fn init(mut self, value: f64) -> Self {
        self.init = Some(value);
        self
    }
}

/// The tiers a validated template has.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape<'a> {
    /// A likelihood parameter, built per subject by the likelihood callback.
    Bottom,
    /// A single group-level node per tag.
    Group { group: &'a Knode },
    /// Group, dispersion and per-subject nodes per tag.
    Hierarchical {
        group: &'a Knode,
        dispersion: &'a Knode,
        subject: &'a Knode,
    },
}

/// A value in an `update_params` override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Step(StepRule),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<StepRule> for FieldValue {
    fn from(v: StepRule) -> Self {
        FieldValue::Step(v)
    }
}

impl From<DispersionKind> for FieldValue {
    fn from(v: DispersionKind) -> Self {
        let text = match v {
            DispersionKind::Std => "std",
            DispersionKind::Var => "var",
            DispersionKind::Precision => "precision",
            DispersionKind::SampleSize => "sample_size",
        };
        FieldValue::Text(text.to_string())
    }
}

/// Declarative description of one model parameter.
#[derive(Clone)]
pub struct ParamTemplate {
    pub name: String,
    pub is_bottom: bool,
    pub group: Option<Knode>,
    pub dispersion: Option<Knode>,
    pub subject: Option<Knode>,
    /// Parent label under which subject nodes receive their group node.
    pub group_label: Option<String>,
    /// Parent label under which subject nodes receive their dispersion node.
    pub dispersion_label: Option<String>,
    pub transform: Option<Transform>,
    pub dispersion_kind: DispersionKind,
    pub shared_dispersion: bool,
    pub optional: bool,
    pub default: Option<f64>,
}

impl fmt::Debug for ParamTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamTemplate")
            .field("name", &self.name)
            .field("is_bottom", &self.is_bottom)
            .field("group", &self.group)
            .field("dispersion", &self.dispersion)
            .field("subject", &self.subject)
            .field("group_label", &self.group_label)
            .field("dispersion_label", &self.dispersion_label)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("dispersion_kind", &self.dispersion_kind)
            .field("shared_dispersion", &self.shared_dispersion)
            .field("optional", &self.optional)
            .field("default", &self.default)
            .finish()
    }
}

impl ParamTemplate {
    /// A non-bottom parameter without tiers; add them with the builder methods.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_bottom: false,
            group: None,
            dispersion: None,
            subject: None,
            group_label: None,
            dispersion_label: None,
            transform: None,
            dispersion_kind: DispersionKind::default(),
            shared_dispersion: false,
            optional: false,
            default: None,
        }
    }

    /// A likelihood parameter.
    pub fn bottom(name: impl Into<String>) -> Self {
        Self {
            is_bottom: true,
            ..Self::new(name)
        }
    }

    pub fn group(mut self, knode: Knode) -> Self {
        self.group = Some(knode);
        self
    }

    pub fn dispersion(mut self, knode: Knode) -> Self {
        self.dispersion = Some(knode);
        self
    }

    pub fn subject(mut self, knode: Knode) -> Self {
        self.subject = Some(knode);
        self
    }

    /// Sets the parent labels of the subject tier.
    pub fn labels(mut self, group: impl Into<String>, dispersion: impl Into<String>) -> Self {
        self.group_label = Some(group.into());
        self.dispersion_label = Some(dispersion.into());
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Parent, Parent) -> (Parent, Parent) + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(f));
        self
    }

    pub fn dispersion_kind(mut self, kind: DispersionKind) -> Self {
        self.dispersion_kind = kind;
        self
    }

    pub fn shared_dispersion(mut self, shared: bool) -> Self {
        self.shared_dispersion = shared;
        self
    }

    /// Marks the parameter optional; unless included it is replaced by `default` everywhere.
    pub fn optional(mut self, default: f64) -> Self {
        self.optional = true;
        self.default = Some(default);
        self
    }

    /// Validates the tier combination.
    pub fn shape(&self) -> Result<Shape<'_>, ModelError> {
        match (
            self.is_bottom,
            &self.group,
            &self.dispersion,
            &self.subject,
        ) {
            (true, None, None, None) => Ok(Shape::Bottom),
            (true, ..) => Err(self.invalid("bottom parameters can not carry tier specifications")),
            (false, Some(group), None, None) => Ok(Shape::Group { group }),
            (false, Some(group), Some(dispersion), Some(subject)) => Ok(Shape::Hierarchical {
                group,
                dispersion,
                subject,
            }),
            (false, None, ..) => Err(self.invalid("a group tier is required")),
            (false, Some(_), ..) => {
                Err(self.invalid("dispersion and subject tiers must be given together"))
            }
        }
    }

    /// Whether the parameter is realised per subject in a group model.
    pub fn has_subject(&self) -> bool {
        self.is_bottom || self.subject.is_some()
    }

    /// Applies one `update_params` field override.
    pub fn apply_update(&mut self, key: &str, value: &FieldValue) -> Result<(), ModelError> {
        match key {
            "is_bottom" => self.is_bottom = self.expect_bool(key, value)?,
            "shared_dispersion" => self.shared_dispersion = self.expect_bool(key, value)?,
            "optional" => self.optional = self.expect_bool(key, value)?,
            "group_label" => self.group_label = self.expect_label(key, value)?,
            "dispersion_label" => self.dispersion_label = self.expect_label(key, value)?,
            "default" => {
                self.default = match value {
                    FieldValue::Null => None,
                    FieldValue::Number(v) => Some(*v),
                    _ => return Err(self.bad_value(key, "a number or null")),
                }
            }
            "dispersion_kind" => {
                self.dispersion_kind = match value {
                    FieldValue::Text(s) => s
                        .parse()
                        .map_err(|_| self.bad_value(key, "a dispersion kind"))?,
                    _ => return Err(self.bad_value(key, "a dispersion kind")),
                }
            }
            "group_step" | "dispersion_step" | "subject_step" => {
                let step = match value {
                    FieldValue::Step(step) => *step,
                    FieldValue::Text(s) => s.parse().map_err(|_| self.bad_value(key, "a step rule"))?,
                    _ => return Err(self.bad_value(key, "a step rule")),
                };
                let err = self.bad_value(key, "a step rule for an existing tier");
                let knode = match key {
                    "group_step" => self.group.as_mut(),
                    "dispersion_step" => self.dispersion.as_mut(),
                    _ => self.subject.as_mut(),
                };
                knode.ok_or(err)?.step = step;
            }
            _ => {
                return Err(ModelError::InvalidOverrideKey {
                    param: self.name.clone(),
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    fn expect_bool(&self, key: &str, value: &FieldValue) -> Result<bool, ModelError> {
        match value {
            FieldValue::Bool(b) => Ok(*b),
            _ => Err(self.bad_value(key, "a boolean")),
        }
    }

    fn expect_label(&self, key: &str, value: &FieldValue) -> Result<Option<String>, ModelError> {
        match value {
            FieldValue::Null => Ok(None),
            FieldValue::Text(s) => Ok(Some(s.clone())),
            _ => Err(self.bad_value(key, "a label or null")),
        }
    }

    fn bad_value(&self, key: &str, expected: &'static str) -> ModelError {
        ModelError::InvalidOverrideValue {
            param: self.name.clone(),
            key: key.to_string(),
            expected,
        }
    }

    fn invalid(&self, reason: &str) -> ModelError {
        ModelError::InvalidTemplate {
            param: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn hierarchical() -> ParamTemplate {
        ParamTemplate::new("a")
            .group(Knode::new(DistKind::Gamma).parent("shape", 1.5).parent("rate", 0.75))
            .dispersion(Knode::new(DistKind::HalfNormal).parent("sigma", 0.1))
            .subject(Knode::new(DistKind::Normal))
            .labels("mu", "sigma")
    }

    #[test]
    fn dispersion_estimates() {
        let values = [0.2, 0.4, 0.6, 0.8];
        let var: f64 = 0.05;
        assert_abs_diff_eq!(DispersionKind::Std.estimate(&values), var.sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(DispersionKind::Var.estimate(&values), var, epsilon = 1e-12);
        assert_abs_diff_eq!(DispersionKind::Precision.estimate(&values), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            DispersionKind::SampleSize.estimate(&values),
            0.5 * 0.5 / var - 1.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn shapes_are_validated() {
        assert!(matches!(hierarchical().shape(), Ok(Shape::Hierarchical { .. })));
        assert!(matches!(ParamTemplate::bottom("wfpt").shape(), Ok(Shape::Bottom)));

        let no_group = ParamTemplate::new("t").subject(Knode::new(DistKind::Normal));
        assert!(matches!(
            no_group.shape(),
            Err(ModelError::InvalidTemplate { .. })
        ));

        let mut half = hierarchical();
        half.dispersion = None;
        assert!(matches!(half.shape(), Err(ModelError::InvalidTemplate { .. })));

        let mut bottom = hierarchical();
        bottom.is_bottom = true;
        assert!(bottom.shape().is_err());
    }

    #[test]
    fn updates_patch_fields() {
        let mut p = hierarchical();
        p.apply_update("shared_dispersion", &true.into()).unwrap();
        p.apply_update("dispersion_kind", &"precision".into()).unwrap();
        p.apply_update("group_label", &FieldValue::Null).unwrap();
        p.apply_update("subject_step", &"frozen".into()).unwrap();
        assert!(p.shared_dispersion);
        assert_eq!(p.dispersion_kind, DispersionKind::Precision);
        assert_eq!(p.group_label, None);
        assert_eq!(p.subject.as_ref().map(|k| k.step), Some(StepRule::Frozen));
    }

    #[test]
    fn invalid_updates_are_rejected() {
        let mut p = hierarchical();
        assert_eq!(
            p.apply_update("sigma", &1.0.into()),
            Err(ModelError::InvalidOverrideKey {
                param: "a".to_string(),
                key: "sigma".to_string()
            })
        );
        assert!(matches!(
            p.apply_update("optional", &1.0.into()),
            Err(ModelError::InvalidOverrideValue { .. })
        ));
        let mut g = ParamTemplate::new("g").group(Knode::new(DistKind::Normal));
        assert!(matches!(
            g.apply_update("subject_step", &StepRule::Frozen.into()),
            Err(ModelError::InvalidOverrideValue { .. })
        ));
    }

    #[test]
    fn transform_maps_parents() {
        let p = hierarchical().transform(|g, d| (g, d.map(|s| s.powi(-2))));
        let f = p.transform.clone().unwrap();
        let (g, d) = f(Parent::Const(1.0), Parent::Const(0.5));
        assert_eq!(g, Parent::Const(1.0));
        assert_eq!(d, Parent::Const(4.0));
        assert!(format!("{p:?}").contains("<fn>"));
    }
}
