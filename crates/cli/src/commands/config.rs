use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use aidgent_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field<'a> {
    key_path: &'static str,
    value: String,
    env_keys: &'a [&'static str],
}

impl<'a> Field<'a> {
    fn new(key_path: &'static str, value: impl ToString, env_keys: &'a [&'static str]) -> Self {
        Self { key_path, value: value.to_string(), env_keys }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let fields = [
        Field::new("database.url", &config.database.url, &["AIDGENT_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections,
            &["AIDGENT_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs,
            &["AIDGENT_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new("llm.provider", config.llm.provider.as_str(), &["AIDGENT_LLM_PROVIDER"]),
        Field::new("llm.model", &config.llm.model, &["AIDGENT_LLM_MODEL"]),
        Field::new("llm.base_url", config.llm.effective_base_url(), &["AIDGENT_LLM_BASE_URL"]),
        Field::new("llm.api_key", api_key, &["AIDGENT_LLM_API_KEY", "OPENAI_API_KEY"]),
        Field::new("llm.temperature", config.llm.temperature, &["AIDGENT_LLM_TEMPERATURE"]),
        Field::new("llm.timeout_secs", config.llm.timeout_secs, &["AIDGENT_LLM_TIMEOUT_SECS"]),
        Field::new("llm.max_retries", config.llm.max_retries, &["AIDGENT_LLM_MAX_RETRIES"]),
        Field::new("retrieval.enabled", config.retrieval.enabled, &["AIDGENT_RETRIEVAL_ENABLED"]),
        Field::new(
            "retrieval.docs_dir",
            config.retrieval.docs_dir.display(),
            &["AIDGENT_RETRIEVAL_DOCS_DIR"],
        ),
        Field::new("retrieval.top_k", config.retrieval.top_k, &["AIDGENT_RETRIEVAL_TOP_K"]),
        Field::new(
            "retrieval.min_score",
            config.retrieval.min_score,
            &["AIDGENT_RETRIEVAL_MIN_SCORE"],
        ),
        Field::new("retrieval.mmr", config.retrieval.mmr, &["AIDGENT_RETRIEVAL_MMR"]),
        Field::new("retrieval.mmr_lambda", config.retrieval.mmr_lambda, &[]),
        Field::new(
            "retrieval.embedding_model",
            &config.retrieval.embedding_model,
            &["AIDGENT_RETRIEVAL_EMBEDDING_MODEL"],
        ),
        Field::new("policy.dir", config.policy.dir.display(), &["AIDGENT_POLICY_DIR"]),
        Field::new("policy.slot_policy_file", &config.policy.slot_policy_file, &[]),
        Field::new("policy.questions_file", &config.policy.questions_file, &[]),
        Field::new("policy.safety_file", &config.policy.safety_file, &[]),
        Field::new("policy.system_prompt_file", &config.policy.system_prompt_file, &[]),
        Field::new(
            "server.bind_address",
            &config.server.bind_address,
            &["AIDGENT_SERVER_BIND_ADDRESS"],
        ),
        Field::new("server.port", config.server.port, &["AIDGENT_SERVER_PORT"]),
        Field::new(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs,
            &["AIDGENT_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["AIDGENT_LOGGING_LEVEL", "AIDGENT_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["AIDGENT_LOGGING_FORMAT", "AIDGENT_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.iter().map(|field| {
        render_line(
            field.key_path,
            &field.value,
            field_source(
                field.key_path,
                field.env_keys,
                config_file_doc.as_ref(),
                config_file_path.as_deref(),
            ),
        )
    }));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("aidgent.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/aidgent.toml");
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
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
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
