use std::io::Write;

use flowrun_core::config::AppConfig;
use flowrun_core::FlowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_parallel = 4
continue_on_error = true
timeouts_always_fatal = false
default_max_retry_limit = 5
default_max_execution_time_secs = 120
allow_tagged_loops = true

[events]
live_capacity = 64
persist_capacity = 500
persist_batch_size = 25

[storage]
database = "/tmp/flowrun-test/flowrun.db"

[executor]
endpoint = "http://127.0.0.1:8700"
api_key = "fr-test-key"
request_timeout_secs = 30

[gateway]
bind = "0.0.0.0:9999"

[log]
enabled = false
dir = "/tmp/flowrun-test/logs"
output_dir = "/tmp/flowrun-test/out"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel, 4);
    assert!(config.engine.continue_on_error);
    assert!(!config.engine.timeouts_always_fatal);
    assert_eq!(config.engine.default_max_retry_limit, 5);
    assert_eq!(config.engine.default_max_execution_time_secs, 120);
    assert!(config.engine.allow_tagged_loops);

    assert_eq!(config.events.live_capacity, 64);
    assert_eq!(config.events.persist_capacity, 500);
    assert_eq!(config.events.persist_batch_size, 25);

    let executor = config.executor.as_ref().expect("executor present");
    assert_eq!(executor.endpoint, "http://127.0.0.1:8700");
    assert_eq!(executor.api_key, Some("fr-test-key".to_string()));
    assert_eq!(executor.request_timeout_secs, 30);

    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert!(!config.log.enabled);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/flowrun-test/flowrun.db")
    );
    assert_eq!(
        config.output_dir(),
        Some(std::path::PathBuf::from("/tmp/flowrun-test/out"))
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOWRUN_TEST_EXECUTOR_KEY", "expanded-key-value");

    let toml_content = r#"
[executor]
endpoint = "http://localhost:8700"
api_key = "${FLOWRUN_TEST_EXECUTOR_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let executor = config.executor.expect("executor present");
    assert_eq!(executor.api_key, Some("expanded-key-value".to_string()));
    assert_eq!(executor.request_timeout_secs, 900);

    std::env::remove_var("FLOWRUN_TEST_EXECUTOR_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[gateway]
bind = "127.0.0.1:8080"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel, 1);
    assert!(!config.engine.continue_on_error);
    assert!(config.engine.timeouts_always_fatal);
    assert_eq!(config.engine.default_max_retry_limit, 2);
    assert_eq!(config.engine.default_max_execution_time_secs, 600);
    assert!(!config.engine.allow_tagged_loops);
    assert_eq!(config.events.live_capacity, 256);
    assert!(config.executor.is_none());
    assert!(config.log.enabled);
    assert!(config.output_dir().is_none());
}

#[test]
fn test_invalid_values_rejected() {
    let toml_content = r#"
[events]
persist_batch_size = 0
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, FlowError::Configuration(_)));
}

#[test]
fn test_missing_file_reports_path() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/flowrun.toml")).unwrap_err();
    match err {
        FlowError::ConfigNotFound(path) => assert!(path.contains("flowrun.toml")),
        other => panic!("unexpected error: {}", other),
    }
}
