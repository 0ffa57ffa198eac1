//! Test: Source precedence and scope filtering

use stepconf::core::{
    merge, Config, ConfigDocuments, MapEnv, Mapping, ResolutionContext, StepConfig,
    StepConfigRequest, StepFilters, Value,
};
use std::sync::Arc;

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn filters(names: &[&str]) -> StepFilters {
    StepFilters {
        all: strings(names),
        general: strings(names),
        steps: strings(names),
        stages: strings(names),
        parameters: strings(names),
        env: strings(names),
    }
}

fn flags(pairs: &[(&str, &str)]) -> Mapping {
    stepconf::core::mapping(pairs.iter().copied())
}

/// Every layer overrides the one before it
#[test]
fn test_precedence_cascade() {
    let defaults1 = Config::from_yaml(
        r#"
general:
  p0: d0g
  p1: d0g1
steps:
  step1:
    p1: d0s
"#,
    )
    .unwrap();
    let defaults2 = Config::from_yaml(
        r#"
general:
  p2: d1g
  p3: d1g
"#,
    )
    .unwrap();
    let config = Config::from_yaml(
        r#"
general:
  p3: cg
  p4: cg
steps:
  step1:
    p4: cs
    p5: cs
stages:
  stage1:
    p5: cst
    p6: cst
"#,
    )
    .unwrap();

    let documents = ConfigDocuments::new(config).with_defaults(vec![defaults1, defaults2]);
    let request = StepConfigRequest::new("stage1", "step1")
        .with_filters(filters(&["p0", "p1", "p2", "p3", "p4", "p5", "p6", "p7"]))
        .with_param_json(r#"{"p6":"pj","p7":"pj"}"#)
        .with_flags(flags(&[("p7", "fl")]));

    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();

    let expected = flags(&[
        ("p0", "d0g"),
        ("p1", "d0s"),
        ("p2", "d1g"),
        ("p3", "cg"),
        ("p4", "cs"),
        ("p5", "cst"),
        ("p6", "pj"),
        ("p7", "fl"),
    ]);
    assert_eq!(step_config.config, expected);
}

/// A name kept out of one scope can still arrive through another
#[test]
fn test_filter_isolation() {
    let defaults = Config::from_yaml("general:\n  pX: x\n").unwrap();
    let config = Config::from_yaml("steps:\n  step1:\n    pX: y\n").unwrap();
    let documents = ConfigDocuments::new(config).with_defaults(vec![defaults.clone()]);

    let mut step_filters = filters(&["pX"]);
    step_filters.general = strings(&["other"]);
    let request = StepConfigRequest::new("stage1", "step1").with_filters(step_filters.clone());

    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();
    assert_eq!(step_config.get_str("pX"), Some("y"));

    // without the step section the filtered default never shows up
    let documents = ConfigDocuments::new(Config::default()).with_defaults(vec![defaults]);
    let request = StepConfigRequest::new("stage1", "step1").with_filters(step_filters);
    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();
    assert!(step_config.get("pX").is_none());
}

/// Deep merge keeps sibling keys of nested mappings
#[test]
fn test_nested_mappings_merge_deeply() {
    let defaults = Config::from_yaml(
        r#"
general:
  docker:
    image: maven:3
    options: [--rm]
"#,
    )
    .unwrap();
    let config = Config::from_yaml(
        r#"
steps:
  step1:
    docker:
      image: maven:3.9
"#,
    )
    .unwrap();
    let documents = ConfigDocuments::new(config).with_defaults(vec![defaults]);
    let request = StepConfigRequest::new("", "step1");

    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();
    let docker = step_config.get("docker").and_then(Value::as_mapping).unwrap();
    assert_eq!(docker.get("image"), Some(&Value::from("maven:3.9")));
    assert_eq!(docker.get("options"), Some(&Value::from(vec!["--rm"])));
}

/// Environment values beat project configuration but lose to parameter JSON
#[test]
fn test_environment_layer() {
    let config = Config::from_yaml("general:\n  a: config\n  b: config\n").unwrap();
    let documents = ConfigDocuments::new(config);
    let env = MapEnv::new()
        .with_var("PIPER_a", "env")
        .with_var("PIPER_b", "env")
        .with_var("PIPER_c", "");
    let ctx = ResolutionContext::hermetic().with_env(Arc::new(env));
    let request = StepConfigRequest::new("", "step1")
        .with_filters(filters(&["a", "b", "c"]))
        .with_param_json(r#"{"b":"json"}"#);

    let step_config = StepConfig::resolve(&documents, &request, &ctx).unwrap();
    assert_eq!(step_config.get_str("a"), Some("env"));
    assert_eq!(step_config.get_str("b"), Some("json"));
    assert!(step_config.get("c").is_none());
}

/// Merging the result back into itself changes nothing
#[test]
fn test_remerge_is_idempotent() {
    let config = Config::from_yaml(
        r#"
general:
  a: 1
  nested:
    x: y
steps:
  step1:
    b: [one, two]
"#,
    )
    .unwrap();
    let documents = ConfigDocuments::new(config);
    let request = StepConfigRequest::new("", "step1");
    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();

    let remerged = merge(&step_config.config, &step_config.config);
    assert_eq!(remerged, step_config.config);
    let filtered = stepconf::core::filter(&step_config.config, &strings(&["a"]));
    assert_eq!(merge(&step_config.config, &filtered), step_config.config);
}

/// Deprecated aliases warn once per context and are recorded
#[test]
fn test_deprecated_alias_is_noted_once() {
    let metadata = crate::helpers::metadata(
        r#"
metadata:
  name: step1
spec:
  inputs:
    params:
      - name: newName
        scope: [GENERAL, STEPS, PARAMETERS]
        aliases:
          - name: oldName
            deprecated: true
"#,
    );
    let config = Config::from_yaml(
        r#"
general:
  oldName: general
steps:
  step1:
    oldName: step
"#,
    )
    .unwrap();
    let documents = ConfigDocuments::new(config);
    let ctx = ResolutionContext::hermetic();
    let request = StepConfigRequest::new("", "step1").with_metadata(&metadata);

    let step_config = StepConfig::resolve(&documents, &request, &ctx).unwrap();
    assert_eq!(step_config.get_str("newName"), Some("step"));

    let notes = ctx.deprecation_notes();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].alias, "oldName");
    assert_eq!(notes[0].parameter, "newName");
}
