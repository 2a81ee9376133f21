use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value) in effective_values(&config) {
        let env_key = env_key_for(key);
        let source = field_source(
            key,
            Some(env_key.as_str()),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key, &value, source));
    }
    lines.join("\n")
}

/// Every reported key with its rendered value. Secrets are redacted here.
fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let peers = if config.catalog.peers.is_empty() {
        "<none>".to_string()
    } else {
        config
            .catalog
            .peers
            .iter()
            .map(|peer| format!("{}@{}", peer.node_id, peer.base_url))
            .collect::<Vec<_>>()
            .join(",")
    };

    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", api_key),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("llm.max_tokens", config.llm.max_tokens.to_string()),
        ("catalog.type_cache_ttl_secs", config.catalog.type_cache_ttl_secs.to_string()),
        ("catalog.peer_timeout_ms", config.catalog.peer_timeout_ms.to_string()),
        ("catalog.peers", peers),
        ("extraction.min_confidence", config.extraction.min_confidence.to_string()),
        ("extraction.required_weight", config.extraction.required_weight.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

fn env_key_for(key_path: &str) -> String {
    format!("PARLEY_{}", key_path.replace('.', "_").to_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("parley.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/parley.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use parley_core::config::{AppConfig, PeerConfig};

    use super::{contains_path, effective_values, env_key_for, redact_token};

    #[test]
    fn api_keys_never_render_in_full() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some(SecretString::from("sk-live-123456".to_string()));
        let values = effective_values(&config);
        let api_key = values.iter().find(|(key, _)| *key == "llm.api_key").map(|(_, v)| v);
        assert_eq!(api_key.map(String::as_str), Some("sk-***"));
        assert!(values.iter().all(|(_, value)| !value.contains("123456")));
    }

    #[test]
    fn peers_render_as_node_at_url() {
        let mut config = AppConfig::default();
        config.catalog.peers = vec![PeerConfig {
            node_id: "billing".to_string(),
            base_url: "http://billing.local".to_string(),
        }];
        let values = effective_values(&config);
        assert!(values.contains(&("catalog.peers", "billing@http://billing.local".to_string())));
    }

    #[test]
    fn env_keys_follow_the_section_layout() {
        assert_eq!(env_key_for("database.url"), "PARLEY_DATABASE_URL");
        assert_eq!(
            env_key_for("catalog.type_cache_ttl_secs"),
            "PARLEY_CATALOG_TYPE_CACHE_TTL_SECS"
        );
        assert_eq!(redact_token("   "), "<empty>");
        assert_eq!(redact_token("opaque"), "<redacted>");

        let doc: toml::Value = "[llm]\nmodel = \"m\"".parse().expect("toml");
        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.base_url"));
    }
}
