use super::*;

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(Some(&dir.path().join("nope.json"))).unwrap();
    assert_eq!(config.agent.max_iterations, 30);
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"agent":{"maxIterations":7}}"#).unwrap();
    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.agent.max_iterations, 7);
}

#[test]
fn malformed_json_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(load_config(Some(&path)).is_err());
}

#[test]
fn invalid_values_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"agent":{"maxIterations":0}}"#).unwrap();
    assert!(load_config(Some(&path)).is_err());
}
