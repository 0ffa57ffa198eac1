//! Test: `$(name)` interpolation of the merged configuration

use stepconf::core::interpolation::{interpolate, interpolate_mapping};
use stepconf::core::{mapping, Config, ConfigDocuments, ConfigError, ResolutionContext, StepConfig, StepConfigRequest};

#[test]
fn test_references_are_resolved() {
    let config = mapping([("prop1", "val1"), ("prop2", "val2"), ("prop3", "$(prop1)/$(prop2)")]);
    let resolved = interpolate_mapping(&config).unwrap();
    assert_eq!(resolved["prop3"].as_str(), Some("val1/val2"));
}

#[test]
fn test_cycle_is_reported() {
    let config = mapping([("a", "$(b)"), ("b", "$(a)")]);
    let err = interpolate_mapping(&config).unwrap_err();
    assert!(matches!(err, ConfigError::InterpolationCycle { passes: 10, .. }));
}

#[test]
fn test_interpolation_is_a_fixed_point() {
    let config = mapping([("base", "team"), ("path", "$(base)/secrets"), ("plain", "no refs")]);
    let once = interpolate_mapping(&config).unwrap();
    let twice = interpolate_mapping(&once).unwrap();
    assert_eq!(once, twice);
    assert_eq!(interpolate("plain", "no refs", &config).unwrap(), "no refs");
}

/// References may point at values from any layer of the merge
#[test]
fn test_references_across_layers() {
    let defaults = Config::from_yaml("general:\n  registry: docker.example.com\n").unwrap();
    let config = Config::from_yaml("steps:\n  build:\n    image: $(registry)/maven:$(tag)\n").unwrap();
    let documents = ConfigDocuments::new(config).with_defaults(vec![defaults]);
    let request = StepConfigRequest::new("", "build").with_param_json(r#"{"tag":"3.9"}"#);

    let step_config = StepConfig::resolve(&documents, &request, &ResolutionContext::hermetic()).unwrap();
    assert_eq!(step_config.get_str("image"), Some("docker.example.com/maven:3.9"));
}

#[test]
fn test_non_string_reference_is_a_type_error() {
    let config = stepconf::core::mapping([
        ("count", stepconf::core::Value::Int(3)),
        ("label", stepconf::core::Value::from("n=$(count)")),
    ]);
    assert!(matches!(
        interpolate_mapping(&config),
        Err(ConfigError::Type { .. })
    ));
}
