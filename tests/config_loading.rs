use std::fs;

use petrel_script::{ScriptConfig, ScriptConfigOverrides, ScriptEngine};

#[test]
fn config_loads_from_a_json_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("script.json");
    fs::write(&path, r#"{ "timeout_millis": 750, "throw_on_error": true }"#).expect("write config");

    let config = ScriptConfig::load(&path).expect("load config");
    assert_eq!(config.timeout_millis, 750);
    assert!(config.throw_on_error);

    let engine = ScriptEngine::with_config(&config);
    assert_eq!(engine.timeout_millis(), 750);
    assert!(engine.throw_on_error());
    engine.shutdown();
}

#[test]
fn load_or_default_swallows_missing_files() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = ScriptConfig::load_or_default(dir.path().join("absent.json"));
    assert_eq!(config.timeout_millis, 0);
    assert!(!config.throw_on_error);
}

#[test]
fn load_rejects_malformed_json() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ not json").expect("write config");
    assert!(ScriptConfig::load(&path).is_err());
    let fallback = ScriptConfig::load_or_default(&path);
    assert_eq!(fallback.timeout_millis, 0);
}

#[test]
fn overrides_layer_onto_a_loaded_config() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("script.json");
    fs::write(&path, r#"{ "timeout_millis": 300 }"#).expect("write config");

    let mut config = ScriptConfig::load(&path).expect("load config");
    let overrides = ScriptConfigOverrides { timeout_millis: None, throw_on_error: Some(true) };
    assert_eq!(overrides.applied_fields(), vec!["throw_on_error"]);
    config.apply_overrides(&overrides);
    assert_eq!(config.timeout_millis, 300, "untouched fields keep their file value");
    assert!(config.throw_on_error);
}
