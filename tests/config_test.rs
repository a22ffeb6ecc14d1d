//! Config loading and defaults integration tests

use std::path::PathBuf;

use tempfile::TempDir;
use unique_keys_bot::{Config, ConfigError, DatabaseLocation};

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();

    assert!(config.bot.token.is_empty());
    assert_eq!(config.bot.api_url, "https://api.telegram.org");
    assert_eq!(config.bot.poll_timeout_secs, 30);
    assert!(config.storage.connection_string.is_empty());
    assert!(matches!(
        config.storage.location(),
        Err(ConfigError::MissingConnectionString)
    ));

    // No token configured: startup must refuse to run
    assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));
}

#[test]
fn test_config_with_all_fields() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bot.toml");
    std::fs::write(
        &path,
        r#"
[bot]
token = "123456:secret"
api_url = "http://localhost:8081"
poll_timeout_secs = 5
retry_delay_ms = 250

[storage]
connection_string = "Data Source=/var/lib/keys/keys.db"
op_timeout_ms = 1500
busy_timeout_ms = 100
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.bot.token, "123456:secret");
    assert_eq!(config.bot.api_url, "http://localhost:8081");
    assert_eq!(config.bot.poll_timeout_secs, 5);
    assert_eq!(config.bot.retry_delay_ms, 250);
    assert_eq!(
        config.storage.location().unwrap(),
        DatabaseLocation::File(PathBuf::from("/var/lib/keys/keys.db"))
    );
    assert_eq!(config.storage.op_timeout().as_millis(), 1500);
    assert_eq!(config.storage.busy_timeout().as_millis(), 100);
}

#[test]
fn test_partial_sections_fill_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bot.toml");
    std::fs::write(&path, "[bot]\ntoken = \"t\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.bot.retry_delay_ms, 5000);
    assert_eq!(config.storage.op_timeout_ms, 10_000);

    // A token alone is not enough: the database has no default location
    assert!(matches!(
        config.validate(),
        Err(ConfigError::MissingConnectionString)
    ));
}

#[test]
fn test_storage_section_completes_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bot.toml");
    std::fs::write(
        &path,
        "[bot]\ntoken = \"t\"\n\n[storage]\nconnection_string = \"sqlite://keys.db\"\n",
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(
        config.storage.location().unwrap(),
        DatabaseLocation::File(PathBuf::from("keys.db"))
    );
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bot.toml");
    std::fs::write(&path, "[bot\ntoken = ").unwrap();

    assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
}
