//! Test: Documents and globs on the local filesystem

use std::fs;

use stepconf::conditions::filesystem_glob;
use stepconf::core::{open_local_file, ConfigDocuments, ConfigError};
use tempfile::TempDir;

fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("module/sub")).unwrap();
    for file in ["pom.xml", "module/pom.xml", "module/sub/pom.xml"] {
        fs::write(dir.path().join(file), "<project/>").unwrap();
    }
    dir
}

#[test]
fn test_glob_double_star_spans_directories() {
    let dir = project();
    let root = dir.path().display();

    let mut deep = filesystem_glob(&format!("{}/**/pom.xml", root)).unwrap();
    deep.sort();
    assert_eq!(deep.len(), 3);

    let shallow = filesystem_glob(&format!("{}/*/pom.xml", root)).unwrap();
    assert_eq!(shallow.len(), 1);
    assert!(shallow[0].ends_with("module/pom.xml"));

    assert!(filesystem_glob(&format!("{}/*.json", root)).unwrap().is_empty());
}

#[test]
fn test_load_documents_with_custom_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let custom = dir.path().join("custom.yml");
    fs::write(&custom, "general:\n  verbose: true\n").unwrap();
    let config = dir.path().join("config.yml");
    fs::write(
        &config,
        format!(
            "customDefaults:\n  - {}\n  - {}\ngeneral:\n  buildTool: maven\n",
            custom.display(),
            dir.path().join("missing.yml").display()
        ),
    )
    .unwrap();
    let defaults = vec![dir.path().join("absent-defaults.yml").display().to_string()];

    let documents = ConfigDocuments::load(config.to_str(), &defaults, &open_local_file).unwrap();
    assert!(documents.defaults.is_empty());
    assert_eq!(documents.custom_defaults.len(), 1);
    assert_eq!(
        documents.config.general["buildTool"].as_str(),
        Some("maven")
    );
}

#[test]
fn test_unparsable_document_aborts_loading() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.yml");
    fs::write(&config, "general: [unclosed\n").unwrap();

    let err = ConfigDocuments::load(config.to_str(), &[], &open_local_file).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}
