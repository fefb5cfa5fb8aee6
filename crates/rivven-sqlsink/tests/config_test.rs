//! Tests for configuration loading

use rivven_sqlsink::prelude::*;
use std::io::Write;
use std::time::Duration;

const MINIMAL: &str = r#"
connectionString: postgres://writer@localhost/events
statement:
  - "INSERT INTO log (ts, host, msg) VALUES (?, ?, ?)"
  - "@timestamp"
  - host
  - message
"#;

#[test]
fn test_from_file_with_env_expansion() {
    std::env::set_var("RIVVEN_SQLSINK_TEST_DB_HOST", "db.internal");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
connectionString: postgres://${{RIVVEN_SQLSINK_TEST_DB_HOST}}:5432/events
username: writer
password: ${{RIVVEN_SQLSINK_TEST_DB_PASSWORD_UNSET:-hunter2}}
statement: ["INSERT INTO t (a) VALUES (?)", "a"]
flushSize: 250
maxFlushExceptions: 0
retryInitialIntervalSeconds: 0.5
retryMaxIntervalSeconds: 30
driverAutoCommit: false
"#
    )
    .unwrap();

    let config = SqlSinkConfig::from_file(file.path()).unwrap();

    assert_eq!(config.connection_string, "postgres://db.internal:5432/events");
    assert_eq!(
        config.password.as_ref().map(|p| p.expose_secret()),
        Some("hunter2")
    );
    assert_eq!(config.flush_size, 250);
    assert!(!config.driver_auto_commit);

    let policy = config.retry_policy().unwrap();
    assert_eq!(policy.initial_interval, Duration::from_millis(500));
    assert_eq!(policy.max_interval, Duration::from_secs(30));
    assert!(policy.is_unbounded());

    let connection = config.connection_config();
    assert_eq!(connection.username.as_deref(), Some("writer"));
    assert!(!connection.auto_commit);
    assert!(!format!("{:?}", connection).contains("hunter2"));
}

#[test]
fn test_missing_file_is_config_error() {
    let err = SqlSinkConfig::from_file("/nonexistent/sqlsink.yaml").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_derived_settings() {
    let config = SqlSinkConfig::from_yaml(MINIMAL).unwrap();

    assert_eq!(config.driver().unwrap(), Driver::Postgres);
    assert_eq!(config.mode(), StatementMode::Safe);

    let template = config.template().unwrap();
    assert_eq!(template.fields(), ["@timestamp", "host", "message"]);

    let pool = config.pool_config();
    assert_eq!(pool.max_size, 5);
    assert_eq!(pool.acquire_timeout, Duration::from_secs(10));
    assert_eq!(pool.connection.connect_timeout_ms, 10_000);
}

#[test]
fn test_rejects_invalid_settings() {
    let cases = [
        "connectionString: postgres://localhost/x\nstatement: []\n",
        "connectionString: \"\"\nstatement: [\"SELECT 1\"]\n",
        "connectionString: postgres://localhost/x\nstatement: [\"SELECT 1\"]\nflushSize: 0\n",
        "connectionString: postgres://localhost/x\nstatement: [\"SELECT 1\"]\nmaxPoolSize: 0\n",
        "connectionString: postgres://localhost/x\nstatement: [\"SELECT 1\"]\nretryInitialIntervalSeconds: -1\n",
        "connectionString: postgres://localhost/x\nstatement: [\"SELECT 1\"]\ndriverClass: com.mysql.Driver\n",
        "connectionString: sqlite::memory:\nstatement: [\"SELECT 1\"]\n",
        "statement: [\"SELECT 1\"]\n",
    ];

    for yaml in cases {
        let err = SqlSinkConfig::from_yaml(yaml).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration, "{}", yaml);
    }
}

#[test]
fn test_unsafe_statement_mode() {
    let config = SqlSinkConfig::from_yaml(
        "connectionString: jdbc:postgresql://localhost/x\nstatement: [\"DELETE FROM t WHERE id=%{id}\"]\nunsafeStatement: true\n",
    )
    .unwrap();

    assert_eq!(config.mode(), StatementMode::Unsafe);
    assert!(!config.template().unwrap().has_parameters());
}

#[test]
fn test_json_schema_lists_options() {
    let schema = SqlSinkConfig::json_schema();
    let properties = schema["properties"].as_object().unwrap();

    for key in [
        "connectionString",
        "statement",
        "unsafeStatement",
        "flushSize",
        "maxFlushExceptions",
        "retryInitialIntervalSeconds",
        "retryMaxIntervalSeconds",
        "driverAutoCommit",
    ] {
        assert!(properties.contains_key(key), "missing {}", key);
    }
}
