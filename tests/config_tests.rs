//! Configuration loading tests.

use std::io::Write;
use std::time::Duration;
use symbolica::config::EngineConfig;
use symbolica::engine::ErrorStrategy;
use tempfile::NamedTempFile;

#[test]
fn loads_full_config_from_file() {
    let mut file = NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
        [reason]
        error_strategy = "permissive"
        deadline_ms = 500
        verbose_trace = true
        max_chain_depth = 4

        [temporal]
        retention_ms = 7200000
        max_samples_per_key = 256
        "#
    )
    .expect("writes");

    let config =
        EngineConfig::from_file(file.path().to_str().expect("utf-8 path")).expect("loads");

    assert_eq!(config.reason.error_strategy, ErrorStrategy::Permissive);
    assert_eq!(config.reason.deadline(), Some(Duration::from_millis(500)));
    assert!(config.reason.verbose_trace);
    assert_eq!(config.reason.max_chain_depth, 4);
    assert_eq!(config.temporal.retention_ms, 7_200_000);
    assert_eq!(config.temporal.max_samples_per_key, 256);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let config = EngineConfig::from_file("/nonexistent/symbolica.toml").expect("defaults");
    assert_eq!(config.reason.error_strategy, ErrorStrategy::Strict);
    assert_eq!(config.reason.deadline(), None);
    assert_eq!(config.temporal.max_samples_per_key, 10_000);
}

#[test]
fn partial_file_keeps_remaining_defaults() {
    let mut file = NamedTempFile::new().expect("temp file");
    write!(file, "[temporal]\nmax_samples_per_key = 42\n").expect("writes");

    let config =
        EngineConfig::from_file(file.path().to_str().expect("utf-8 path")).expect("loads");

    assert_eq!(config.temporal.max_samples_per_key, 42);
    assert_eq!(config.temporal.retention_ms, 24 * 60 * 60 * 1000);
    assert_eq!(config.reason.error_strategy, ErrorStrategy::Strict);
}
