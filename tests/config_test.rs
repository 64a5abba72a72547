//! Configuration handling: every configuration error is raised when the model is built, and
//! overrides loaded from JSON reach the templates and the sampler's step rules.

use mini_hbm::core::ChainRunner;
use mini_hbm::data::DataTable;
use mini_hbm::distributions::DistKind;
use mini_hbm::errors::{DataError, ModelError};
use mini_hbm::graph::{Graph, Runtime};
use mini_hbm::hierarchical::{Hierarchical, ModelConfig, Observed};
use mini_hbm::mcmc::Mcmc;
use mini_hbm::params::{DispersionKind, FieldValue, Knode, ParamTemplate, StepRule};

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> DataTable {
        DataTable::new()
            .with_column("subj_idx", vec![0_i64, 0, 1, 1, 2, 2])
            .unwrap()
            .with_column("cond", vec!["a", "b", "a", "b", "a", "b"])
            .unwrap()
            .with_column("x", vec![0.2, 0.4, 0.1, 0.5, 0.3, 0.6])
            .unwrap()
    }

    fn params() -> Vec<ParamTemplate> {
        vec![
            ParamTemplate::new("v")
                .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 1.0))
                .dispersion(Knode::new(DistKind::HalfNormal).parent("sigma", 1.0))
                .subject(Knode::new(DistKind::Normal))
                .labels("mu", "sigma"),
            ParamTemplate::new("z")
                .group(Knode::new(DistKind::Uniform).parent("lower", 0.0).parent("upper", 1.0))
                .optional(0.5),
            ParamTemplate::bottom("obs"),
        ]
    }

    fn lik() -> Observed {
        Observed::new(DistKind::Normal, "x")
            .parent("mu", "v")
            .constant("sigma", 1.0)
    }

    fn build(config: ModelConfig) -> Result<Hierarchical<Observed>, ModelError> {
        Hierarchical::new(data(), params(), lik(), config)
    }

    fn build_err(config: ModelConfig) -> ModelError {
        let err = build(config).unwrap_err();
        assert!(err.is_config(), "{err} should be a configuration error");
        err
    }

    #[test]
    fn missing_dependency_column() {
        let err = build_err(ModelConfig::default().depends("v", &["stim"]));
        assert_eq!(
            err,
            ModelError::MissingColumn {
                param: "v".to_string(),
                column: "stim".to_string()
            }
        );
    }

    #[test]
    fn observed_column_is_checked_up_front() {
        let missing = Observed::new(DistKind::Normal, "rt")
            .parent("mu", "v")
            .constant("sigma", 1.0);
        let err = Hierarchical::new(data(), params(), missing, ModelConfig::default()).unwrap_err();
        assert_eq!(err, ModelError::Data(DataError::MissingColumn("rt".to_string())));

        let text = Observed::new(DistKind::Normal, "cond")
            .parent("mu", "v")
            .constant("sigma", 1.0);
        let err = Hierarchical::new(data(), params(), text, ModelConfig::default()).unwrap_err();
        assert_eq!(err, ModelError::Data(DataError::NotNumeric("cond".to_string())));
    }

    #[test]
    fn unknown_parameters() {
        for config in [
            ModelConfig::default().depends("t", &["cond"]),
            ModelConfig::default().include("t"),
            ModelConfig::default().update("t", "optional", true),
            ModelConfig::default().replace(ParamTemplate::bottom("t")),
        ] {
            assert_eq!(build_err(config), ModelError::UnknownParam("t".to_string()));
        }
    }

    #[test]
    fn invalid_override_key() {
        let err = build_err(ModelConfig::default().update("v", "step_size", 0.1));
        assert_eq!(
            err,
            ModelError::InvalidOverrideKey {
                param: "v".to_string(),
                key: "step_size".to_string()
            }
        );
    }

    #[test]
    fn invalid_override_values() {
        for (key, value) in [
            ("optional", FieldValue::Number(1.0)),
            ("group_label", FieldValue::Bool(true)),
            ("dispersion_kind", FieldValue::Text("iqr".to_string())),
            ("subject_step", FieldValue::Text("nuts".to_string())),
            ("default", FieldValue::Text("half".to_string())),
        ] {
            let err = build_err(ModelConfig::default().update("v", key, value));
            assert!(
                matches!(&err, ModelError::InvalidOverrideValue { param, key: k, .. } if param == "v" && k == key),
                "unexpected error for `{key}`: {err}"
            );
        }
        // z has no subject tier to attach a step rule to
        let err = build_err(ModelConfig::default().update("z", "subject_step", "frozen"));
        assert!(matches!(err, ModelError::InvalidOverrideValue { .. }));
    }

    #[test]
    fn missing_subject_column() {
        let err = build_err(
            ModelConfig::default()
                .group_model(true)
                .subject_column("participant"),
        );
        assert_eq!(
            err,
            ModelError::MissingSubjectColumn("participant".to_string())
        );
        // without forcing a group model the missing column only disables grouping
        let model = build(ModelConfig::default().subject_column("participant")).unwrap();
        assert!(!model.is_group_model());
    }

    #[test]
    fn missing_default() {
        let err = build_err(ModelConfig::default().update("z", "default", FieldValue::Null));
        assert_eq!(err, ModelError::MissingDefault("z".to_string()));
        // including the parameter makes the default irrelevant
        let config = ModelConfig::default()
            .include("z")
            .update("z", "default", FieldValue::Null);
        assert!(build(config).unwrap().is_active("z"));
    }

    #[test]
    fn invalid_templates() {
        let no_group = vec![ParamTemplate::new("v"), ParamTemplate::bottom("obs")];
        let err = Hierarchical::new(data(), no_group, lik(), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidTemplate { ref param, .. } if param == "v"));

        let half = vec![
            ParamTemplate::new("v")
                .group(Knode::new(DistKind::Normal).parent("mu", 0.0).parent("sigma", 1.0))
                .subject(Knode::new(DistKind::Normal)),
            ParamTemplate::bottom("obs"),
        ];
        let err = Hierarchical::new(data(), half, lik(), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidTemplate { .. }));

        let mut duplicate = params();
        duplicate.push(ParamTemplate::bottom("obs"));
        let err = Hierarchical::new(data(), duplicate, lik(), ModelConfig::default()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidTemplate { ref param, .. } if param == "obs"));

        // turning a tiered parameter into a bottom one leaves it malformed
        let err = build_err(ModelConfig::default().update("v", "is_bottom", true));
        assert!(matches!(err, ModelError::InvalidTemplate { .. }));
    }

    #[test]
    fn compilation_errors_are_not_configuration_errors() {
        let err = ModelError::ZeroProbability {
            node: "v_group".to_string(),
        };
        assert!(!err.is_config());
    }

    #[test]
    fn replacements_swap_whole_templates() {
        let replacement = ParamTemplate::new("v")
            .group(Knode::new(DistKind::Normal).parent("mu", 10.0).parent("sigma", 0.1));
        let model = build(ModelConfig::default().replace(replacement)).unwrap();
        let mut graph = Graph::new().set_seed(3);
        let compiled = model.create_nodes(&mut graph).unwrap();
        // the replacement has no subject tier, so the likelihood reads the group node
        let obs = compiled.node("obs_subj.0").unwrap();
        let v = compiled.node("v_group").unwrap();
        assert_eq!(graph.parent_ids(obs)[0], Some(v));
        assert!((graph.value(v) - 10.0).abs() < 1.0);
    }

    #[test]
    fn json_overrides_reach_the_sampler() {
        let config: ModelConfig = serde_json::from_str(
            r#"{
                "depends_on": {"v": ["cond"]},
                "include": ["z"],
                "update_params": {
                    "v": {
                        "dispersion_kind": "precision",
                        "shared_dispersion": true,
                        "group_step": {"slice": {"width": 2.0, "lower": -5.0, "upper": 5.0}},
                        "subject_step": "frozen"
                    },
                    "z": {"default": null, "optional": false}
                }
            }"#,
        )
        .unwrap();
        let model = build(config).unwrap();
        let v = model.template("v").unwrap();
        assert_eq!(v.dispersion_kind, DispersionKind::Precision);
        assert!(v.shared_dispersion);
        assert_eq!(
            v.group.as_ref().map(|k| k.step),
            Some(StepRule::Slice {
                width: 2.0,
                max_iter: 200,
                lower: Some(-5.0),
                upper: Some(5.0)
            })
        );
        assert!(model.is_active("z"));

        let mut graph = Graph::new().set_seed(1);
        let compiled = model.create_nodes(&mut graph).unwrap();
        let frozen: Vec<_> = compiled
            .params["v"]
            .subject
            .values()
            .flat_map(|s| s.ids())
            .map(|id| (id, graph.value(id)))
            .collect();
        assert_eq!(frozen.len(), 6);

        let mut mcmc = Mcmc::from_model(&model, &compiled, graph, 2).set_seed(5);
        // 2 group nodes, 1 shared dispersion node, z: updated; 6 subject nodes: only traced
        assert_eq!(mcmc.chains[0].updates.len(), 4);
        assert_eq!(mcmc.names.len(), 10);
        assert!(mcmc.chains[0].updates.iter().any(|u| u.sampler.lower == Some(-5.0)));

        let samples = mcmc.run(20, 0).unwrap();
        for (column, name) in mcmc.names.iter().enumerate() {
            let Some(&(_, start)) = compiled
                .node(name)
                .and_then(|id| frozen.iter().find(|(f, _)| *f == id))
            else {
                continue;
            };
            assert!(samples
                .index_axis(ndarray::Axis(2), column)
                .iter()
                .all(|&x| x == start));
        }
    }

    #[test]
    fn config_serializes_without_replacements() {
        let config = ModelConfig::default()
            .depends("v", &["cond"])
            .update("v", "subject_step", "frozen")
            .replace(ParamTemplate::bottom("obs"));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("replace_params"));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.depends_on, config.depends_on);
        assert_eq!(back.update_params, config.update_params);
        assert!(back.replace_params.is_empty());
    }
}
