//! Configuration files on disk: loading, saving, provider resolution and validation

use std::time::Duration;
use tempfile::TempDir;
use tether::config::{LogLevel, TetherConfig};
use tether::error::{TetherError, EXIT_CONFIG};

const SAMPLE: &str = r#"
[logging]
log_level = "debug"

[defaults.retry]
max_attempts = 5
base_delay_ms = 250

[defaults.rate_limit]
requests_per_second = 4.0

[providers.ollama]
endpoint = "http://localhost:11434/api/tags"

[providers.ollama.pool]
max_size = 2

[providers.vllm]
endpoint = "http://gpu-box:8000/health"

[providers.vllm.retry]
max_attempts = 1
"#;

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_and_resolve_from_file() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "tether.toml", SAMPLE);

    let config = TetherConfig::from_file(&path).unwrap();
    assert_eq!(config.logging.log_level, LogLevel::Debug);
    config.validate().unwrap();

    let resolved = config.resolve_all().unwrap();
    let ids: Vec<&str> = resolved.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["ollama", "vllm"]);

    let ollama = &resolved[0];
    assert_eq!(ollama.settings.pool.max_size, 2);
    assert_eq!(ollama.settings.retry.max_attempts, 5);
    assert_eq!(ollama.settings.rate_limit.requests_per_second, 4.0);
    assert_eq!(
        ollama.settings.retry_config().base_delay,
        Duration::from_millis(250)
    );

    let vllm = &resolved[1];
    assert_eq!(vllm.settings.retry.max_attempts, 1);
    assert_eq!(vllm.settings.retry.base_delay_ms, 250);
    assert_eq!(vllm.settings.pool.max_size, 5);
    assert_eq!(vllm.endpoint.as_deref(), Some("http://gpu-box:8000/health"));
}

#[test]
fn test_save_and_reload() {
    let dir = TempDir::new().unwrap();
    let original = TetherConfig::from_toml_str(SAMPLE).unwrap();

    let path = dir.path().join("saved.toml");
    original.to_file(&path).unwrap();
    let reloaded = TetherConfig::from_file(&path).unwrap();

    assert_eq!(
        reloaded.resolve("ollama").unwrap(),
        original.resolve("ollama").unwrap()
    );
    assert_eq!(reloaded.defaults, original.defaults);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let err = TetherConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, TetherError::Io(_)));
}

#[test]
fn test_malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "broken.toml", "[defaults.retry\nmax_attempts = ");

    let err = TetherConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, TetherError::Toml(_)));
    assert_eq!(err.exit_code(), EXIT_CONFIG);
}

#[test]
fn test_invalid_override_names_provider() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "bad.toml",
        r#"
[providers.tiny]
endpoint = "http://localhost:9000"

[providers.tiny.pool]
max_size = 1
min_size = 3
"#,
    );

    let config = TetherConfig::from_file(&path).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("tiny"));
    assert_eq!(err.exit_code(), EXIT_CONFIG);
}

#[test]
fn test_bad_endpoint_rejected() {
    let config = TetherConfig::from_toml_str(
        r#"
[providers.local]
endpoint = "not a url"
"#,
    )
    .unwrap();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("not a url"));
}
