use std::env;
use std::sync::{Mutex, OnceLock};

use parley_cli::commands::{catalog, config, migrate, seed};
use serde_json::Value;

const MEMORY_DB: &[(&str, &str)] =
    &[("PARLEY_DATABASE_URL", "sqlite::memory:"), ("PARLEY_DATABASE_MAX_CONNECTIONS", "1")];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(MEMORY_DB, || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_reports_config_failure_for_bad_override() {
    with_env(&[("PARLEY_DATABASE_MAX_CONNECTIONS", "many")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_reports_row_counts() {
    with_env(MEMORY_DB, || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "demo ledger seeded with 4 customers and 4 products");
    });
}

#[test]
fn catalog_lists_demo_ledger_actions() {
    with_env(MEMORY_DB, || {
        let result = catalog::run();
        assert_eq!(result.exit_code, 0, "expected catalog success: {}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "catalog");
        assert_eq!(payload["data"]["stats"]["total"], 3);

        let ids: Vec<&str> = payload["data"]["actions"]
            .as_array()
            .map(|actions| actions.iter().filter_map(|action| action["id"].as_str()).collect())
            .unwrap_or_default();
        assert_eq!(ids, vec!["create_customer", "create_invoice", "create_product"]);
        assert_eq!(payload["data"]["stats"]["by_executor"]["workflow"], 2);
    });
}

#[test]
fn config_output_attributes_env_sources_and_redacts_keys() {
    with_env(
        &[("PARLEY_LLM_API_KEY", "sk-secret-value"), ("PARLEY_LOG_LEVEL", "debug")],
        || {
            let output = config::run();
            assert!(output.starts_with("effective config"));
            assert!(output.contains("- llm.api_key = sk-*** (source: env (PARLEY_LLM_API_KEY))"));
            assert!(output.contains("- logging.level = debug"));
            assert!(output.contains("- database.url = sqlite://parley.db (source: default)"));
            assert!(!output.contains("secret-value"));
        },
    );
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "PARLEY_DATABASE_URL",
        "PARLEY_DATABASE_MAX_CONNECTIONS",
        "PARLEY_DATABASE_TIMEOUT_SECS",
        "PARLEY_LLM_PROVIDER",
        "PARLEY_LLM_API_KEY",
        "PARLEY_LLM_BASE_URL",
        "PARLEY_LLM_MODEL",
        "PARLEY_LLM_TIMEOUT_SECS",
        "PARLEY_LLM_MAX_TOKENS",
        "PARLEY_CATALOG_TYPE_CACHE_TTL_SECS",
        "PARLEY_CATALOG_PEER_TIMEOUT_MS",
        "PARLEY_CATALOG_PEERS",
        "PARLEY_EXTRACTION_MIN_CONFIDENCE",
        "PARLEY_EXTRACTION_REQUIRED_WEIGHT",
        "PARLEY_LOGGING_LEVEL",
        "PARLEY_LOGGING_FORMAT",
        "PARLEY_LOG_LEVEL",
        "PARLEY_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
