//! Test: Stage condition evaluation

use crate::helpers::*;
use stepconf::conditions::{
    ConditionCall, ConditionError, ConditionParam, ConditionRegistry, Deactivation, PipelineTaskCondition,
    RunConfig, StageConfig,
};
use stepconf::core::{mapping, ConfigResult, Mapping, Value};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn no_files(name: &str) -> io::Result<Box<dyn io::Read>> {
    Err(io::Error::new(io::ErrorKind::NotFound, name.to_string()))
}

fn evaluate_single(condition: PipelineTaskCondition, config: &Mapping) -> Result<bool, ConditionError> {
    let glob = map_glob(&[("**/pom.xml", &["pom.xml"])]);
    ConditionRegistry::new().evaluate(&condition, "step1", config, glob.as_ref(), &no_files)
}

fn fixed(config: Mapping) -> impl Fn(&str, &str) -> ConfigResult<Mapping> {
    move |_: &str, _: &str| Ok(config.clone())
}

/// config-equals against a list of candidates
#[test]
fn test_config_equals_array() {
    let config = mapping([("k", "v2")]);
    let condition = |candidates: Vec<&str>| {
        PipelineTaskCondition::new(
            "config-equals",
            vec![ConditionParam::new("configKey", "k"), ConditionParam::new("contains", candidates)],
        )
    };

    assert!(evaluate_single(condition(vec!["v1", "v2"]), &config).unwrap());
    assert!(!evaluate_single(condition(vec!["v3"]), &config).unwrap());

    let config = mapping([("k", Value::Int(2))]);
    assert!(matches!(
        evaluate_single(condition(vec!["v1"]), &config),
        Err(ConditionError::Type { .. })
    ));

    // an absent slot is simply false
    assert!(!evaluate_single(condition(vec!["v1"]), &Mapping::new()).unwrap());
}

/// file-exists reading its pattern from the configuration
#[test]
fn test_file_exists_indirect() {
    let condition = PipelineTaskCondition::new(
        "file-exists",
        vec![ConditionParam::new("filePatternFromConfig", "mvnPath")],
    );

    let config = mapping([("mvnPath", "**/pom.xml")]);
    assert!(evaluate_single(condition.clone(), &config).unwrap());

    let config = mapping([("mvnPath", "**/build.gradle")]);
    assert!(!evaluate_single(condition.clone(), &config).unwrap());

    assert!(!evaluate_single(condition.clone(), &Mapping::new()).unwrap());

    let config = mapping([("mvnPath", Value::Bool(true))]);
    assert!(matches!(
        evaluate_single(condition, &config),
        Err(ConditionError::Type { .. })
    ));
}

#[test]
fn test_malformed_conditions_are_rejected() {
    let config = mapping([("k", "v")]);
    let cases = vec![
        PipelineTaskCondition::new("config-equals", vec![ConditionParam::new("configKey", "k")]),
        PipelineTaskCondition::new(
            "config-exists",
            vec![ConditionParam::new("unknown", "k")],
        ),
        PipelineTaskCondition::new("file-exists", vec![ConditionParam::new("filePattern", "")]),
        PipelineTaskCondition::new("is-active", vec![ConditionParam::new("activation", "yes")]),
    ];
    for condition in cases {
        let result = evaluate_single(condition.clone(), &config);
        assert!(
            matches!(result, Err(ConditionError::Shape { .. }) | Err(ConditionError::Type { .. })),
            "{} should fail, got {:?}",
            condition.condition_ref,
            result
        );
    }
}

/// A deactivated step stays inactive whatever follows
#[test]
fn test_deactivation_is_final() {
    let yaml = r#"
stages:
  Build:
    stepConditions:
      mavenBuild:
        conditions:
          - conditionRef: file-exists
            params:
              - name: filePattern
                value: "**/build.gradle"
          - conditionRef: counted
          - conditionRef: is-active
            params:
              - name: activation
                value: "TRUE"
"#;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = ConditionRegistry::new();
    registry.register("counted", move |_: &ConditionCall<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    });

    let mut run = RunConfig::new(StageConfig::from_yaml(yaml).unwrap())
        .with_glob(map_glob(&[("**/pom.xml", &["pom.xml"])]))
        .with_registry(registry);
    run.evaluate(&fixed(Mapping::new())).unwrap();

    assert_eq!(run.step_active("Build", "mavenBuild"), Some(false));
    assert_eq!(run.stage_active("Build"), Some(false));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        run.deactivation_reason("Build", "mavenBuild"),
        Some(&Deactivation::Condition {
            condition_ref: "file-exists".to_string()
        })
    );
}

#[test]
fn test_npm_script_exists() {
    let yaml = r#"
stages:
  Test:
    stepConditions:
      npmExecuteLint:
        conditions:
          - conditionRef: npm-script-exists
            params:
              - name: npmScript
                value: lint
      npmExecuteTests:
        conditions:
          - conditionRef: npm-script-exists
            params:
              - name: npmScript
                value: ci-test
"#;
    let glob = map_glob(&[(
        "**/package.json",
        &["package.json", "node_modules/dep/package.json", "ui/package.json"],
    )]);
    let files = memory_files(&[
        ("package.json", r#"{"name": "app", "scripts": {"build": "tsc"}}"#),
        ("node_modules/dep/package.json", r#"{"scripts": {"ci-test": "jest"}}"#),
        ("ui/package.json", r#"{"scripts": {"lint": "eslint ."}}"#),
    ]);

    let mut run = RunConfig::new(StageConfig::from_yaml(yaml).unwrap())
        .with_glob(glob)
        .with_open_file(files);
    run.evaluate(&fixed(Mapping::new())).unwrap();

    assert_eq!(run.step_active("Test", "npmExecuteLint"), Some(true));
    assert_eq!(run.step_active("Test", "npmExecuteTests"), Some(false));
    assert_eq!(run.stage_active("Test"), Some(true));
}

#[test]
fn test_config_exists_with_step_name() {
    let condition = PipelineTaskCondition::new(
        "config-exists",
        vec![ConditionParam::new("stepName", "sonarExecuteScan")],
    );
    let steps = mapping([("sonarExecuteScan", Value::Mapping(mapping([("serverUrl", "x")])))]);
    let config = mapping([("steps", Value::Mapping(steps))]);
    assert!(evaluate_single(condition.clone(), &config).unwrap());
    assert!(!evaluate_single(condition, &Mapping::new()).unwrap());
}
