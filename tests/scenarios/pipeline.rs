//! Test: Step activation from a pipeline definition

use crate::helpers::*;
use stepconf::conditions::{Deactivation, Orchestrator, RunConfig, StageDefinition};
use stepconf::core::{mapping, ConfigResult, Mapping, Value};
use std::sync::Mutex;

const PIPELINE: &str = r#"
apiVersion: project.piper.io/v1
kind: PipelineDefinition
metadata:
  name: general-purpose
  description: build and release
spec:
  stages:
    - name: build
      displayName: Build
      steps:
        - name: mavenBuild
          conditions:
            - filePattern: "**/pom.xml"
            - config:
                buildTool: [maven]
        - name: npmBuild
          conditions:
            - npmScript: ci-build
          notActiveConditions:
            - configKey: npm/skip
        - name: versioning
          description: always runs
    - name: release
      displayName: Release
      steps:
        - name: githubRelease
          orchestrators: [GitHubActions]
        - name: jenkinsRelease
          orchestrators: [Jenkins]
          conditions:
            - inactive: true
"#;

fn fixed(config: Mapping) -> impl Fn(&str, &str) -> ConfigResult<Mapping> {
    move |_: &str, _: &str| Ok(config.clone())
}

fn run(orchestrator: Orchestrator) -> RunConfig {
    let definition = StageDefinition::from_yaml(PIPELINE).unwrap();
    assert!(matches!(definition, StageDefinition::Pipeline(_)));
    RunConfig::new(definition)
        .with_orchestrator(orchestrator)
        .with_glob(map_glob(&[("**/package.json", &["package.json"])]))
        .with_open_file(memory_files(&[(
            "package.json",
            r#"{"scripts": {"ci-build": "tsc"}}"#,
        )]))
}

/// Any one holding condition activates the step
#[test]
fn test_conditions_are_combined_with_or() {
    let mut maven = run(Orchestrator::Unknown);
    maven.evaluate(&fixed(mapping([("buildTool", "maven")]))).unwrap();
    // no pom.xml, but the config condition holds
    assert_eq!(maven.step_active("Build", "mavenBuild"), Some(true));
    assert_eq!(maven.step_active("Build", "versioning"), Some(true));
    assert_eq!(maven.stage_active("Build"), Some(true));

    let mut npm = run(Orchestrator::Unknown);
    npm.evaluate(&fixed(mapping([("buildTool", "npm")]))).unwrap();
    assert_eq!(npm.step_active("Build", "mavenBuild"), Some(false));
    assert_eq!(
        npm.deactivation_reason("Build", "mavenBuild"),
        Some(&Deactivation::NoConditionMet)
    );
    assert_eq!(npm.step_active("Build", "npmBuild"), Some(true));
}

/// A holding not-active condition wins over conditions and explicit activation
#[test]
fn test_not_active_conditions_override_active_steps() {
    let skip = Value::Mapping(mapping([("skip", Value::Bool(true))]));

    let mut by_condition = run(Orchestrator::Unknown);
    by_condition
        .evaluate(&fixed(mapping([("npm", skip.clone())])))
        .unwrap();
    assert_eq!(by_condition.step_active("Build", "npmBuild"), Some(false));
    assert_eq!(
        by_condition.deactivation_reason("Build", "npmBuild"),
        Some(&Deactivation::NotActiveCondition {
            condition: "configKey".to_string()
        })
    );

    let mut explicit = run(Orchestrator::Unknown);
    explicit
        .evaluate(&fixed(mapping([("npm", skip), ("npmBuild", Value::Bool(true))])))
        .unwrap();
    assert_eq!(explicit.step_active("Build", "npmBuild"), Some(false));

    // explicit deactivation stays the reported reason
    let mut off = run(Orchestrator::Unknown);
    off.evaluate(&fixed(mapping([("versioning", Value::Bool(false))])))
        .unwrap();
    assert_eq!(off.deactivation_reason("Build", "versioning"), Some(&Deactivation::Explicit));
}

/// Steps bound to another orchestrator are left out entirely
#[test]
fn test_orchestrator_specific_steps() {
    let mut github = run(Orchestrator::GitHubActions);
    github.evaluate(&fixed(Mapping::new())).unwrap();
    assert_eq!(github.step_active("Release", "githubRelease"), Some(true));
    assert_eq!(github.step_active("Release", "jenkinsRelease"), None);
    assert_eq!(github.stage_active("Release"), Some(true));

    let mut jenkins = run(Orchestrator::Jenkins);
    jenkins.evaluate(&fixed(Mapping::new())).unwrap();
    assert_eq!(jenkins.step_active("Release", "githubRelease"), None);
    assert_eq!(jenkins.step_active("Release", "jenkinsRelease"), Some(false));
    assert_eq!(jenkins.stage_active("Release"), Some(false));
}

/// Step configuration is requested under the stage display name
#[test]
fn test_steps_are_resolved_under_display_name() {
    let requested = Mutex::new(Vec::new());
    let provider = |stage: &str, step: &str| -> ConfigResult<Mapping> {
        requested
            .lock()
            .unwrap()
            .push(format!("{}/{}", stage, step));
        Ok(Mapping::new())
    };

    let mut run = run(Orchestrator::GitHubActions);
    run.evaluate(&provider).unwrap();

    assert_eq!(
        requested.into_inner().unwrap(),
        vec!["Build/mavenBuild", "Build/npmBuild", "Build/versioning", "Release/githubRelease"]
    );
    let stages: Vec<_> = run.run_stages.keys().cloned().collect();
    assert_eq!(stages, vec!["Build", "Release"]);
}

/// Both document formats are told apart by their top-level keys
#[test]
fn test_document_format_detection() {
    let conditions = StageDefinition::from_yaml(
        r#"
stages:
  Build:
    stepConditions:
      mavenBuild:
        conditions:
          - conditionRef: is-active
            params:
              - name: activation
                value: "true"
"#,
    )
    .unwrap();
    assert!(matches!(conditions, StageDefinition::Conditions(_)));
    assert_eq!(conditions.step_count(), 1);

    let lenient = StageDefinition::from_yaml(
        r#"
spec:
  stages:
    - displayName: Build
      owner: platform-team
      steps:
        - name: mavenBuild
          retries: 2
"#,
    )
    .unwrap();
    assert!(matches!(lenient, StageDefinition::Pipeline(_)));
    assert_eq!(lenient.step_count(), 1);
}
