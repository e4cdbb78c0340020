use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub policy: PolicyConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub enabled: bool,
    pub docs_dir: PathBuf,
    pub top_k: usize,
    pub min_score: f32,
    pub mmr: bool,
    pub mmr_lambda: f32,
    pub embedding_model: String,
    pub chunk_target_chars: usize,
    pub chunk_overlap_chars: usize,
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub dir: PathBuf,
    pub system_prompt_file: String,
    pub slot_policy_file: String,
    pub questions_file: String,
    pub safety_file: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub policy_dir: Option<PathBuf>,
    pub retrieval_enabled: Option<bool>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

pub const DEFAULT_CONFIG_FILE: &str = "aidgent.toml";

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://aidgent.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::OpenAi,
                api_key: None,
                base_url: None,
                model: "gpt-4o-mini".to_string(),
                temperature: 0.2,
                timeout_secs: 60,
                max_retries: 2,
            },
            retrieval: RetrievalConfig {
                enabled: true,
                docs_dir: PathBuf::from("rag/docs"),
                top_k: 5,
                min_score: 0.3,
                mmr: true,
                mmr_lambda: 0.7,
                embedding_model: "text-embedding-3-small".to_string(),
                chunk_target_chars: 900,
                chunk_overlap_chars: 120,
            },
            policy: PolicyConfig {
                dir: PathBuf::from("config"),
                system_prompt_file: "system_prompt_th.txt".to_string(),
                slot_policy_file: "slot_policy.toml".to_string(),
                questions_file: "slot_questions_th.toml".to_string(),
                safety_file: "safety_th.toml".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmConfig {
    /// Base URL the client talks to; falls back to the provider's default.
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

impl PolicyConfig {
    pub fn system_prompt_path(&self) -> PathBuf {
        self.dir.join(&self.system_prompt_file)
    }

    pub fn slot_policy_path(&self) -> PathBuf {
        self.dir.join(&self.slot_policy_file)
    }

    pub fn questions_path(&self) -> PathBuf {
        self.dir.join(&self.questions_file)
    }

    pub fn safety_path(&self) -> PathBuf {
        self.dir.join(&self.safety_file)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(enabled) = retrieval.enabled {
                self.retrieval.enabled = enabled;
            }
            if let Some(docs_dir) = retrieval.docs_dir {
                self.retrieval.docs_dir = docs_dir;
            }
            if let Some(top_k) = retrieval.top_k {
                self.retrieval.top_k = top_k;
            }
            if let Some(min_score) = retrieval.min_score {
                self.retrieval.min_score = min_score;
            }
            if let Some(mmr) = retrieval.mmr {
                self.retrieval.mmr = mmr;
            }
            if let Some(mmr_lambda) = retrieval.mmr_lambda {
                self.retrieval.mmr_lambda = mmr_lambda;
            }
            if let Some(embedding_model) = retrieval.embedding_model {
                self.retrieval.embedding_model = embedding_model;
            }
            if let Some(chunk_target_chars) = retrieval.chunk_target_chars {
                self.retrieval.chunk_target_chars = chunk_target_chars;
            }
            if let Some(chunk_overlap_chars) = retrieval.chunk_overlap_chars {
                self.retrieval.chunk_overlap_chars = chunk_overlap_chars;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(dir) = policy.dir {
                self.policy.dir = dir;
            }
            if let Some(system_prompt_file) = policy.system_prompt_file {
                self.policy.system_prompt_file = system_prompt_file;
            }
            if let Some(slot_policy_file) = policy.slot_policy_file {
                self.policy.slot_policy_file = slot_policy_file;
            }
            if let Some(questions_file) = policy.questions_file {
                self.policy.questions_file = questions_file;
            }
            if let Some(safety_file) = policy.safety_file {
                self.policy.safety_file = safety_file;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("AIDGENT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("AIDGENT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("AIDGENT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("AIDGENT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("AIDGENT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        let api_key = read_env("AIDGENT_LLM_API_KEY").or_else(|| read_env("OPENAI_API_KEY"));
        if let Some(value) = api_key {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AIDGENT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("AIDGENT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("AIDGENT_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("AIDGENT_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("AIDGENT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("AIDGENT_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("AIDGENT_RETRIEVAL_ENABLED") {
            self.retrieval.enabled = parse_bool("AIDGENT_RETRIEVAL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_RETRIEVAL_DOCS_DIR") {
            self.retrieval.docs_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("AIDGENT_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = parse_usize("AIDGENT_RETRIEVAL_TOP_K", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_RETRIEVAL_MIN_SCORE") {
            self.retrieval.min_score = parse_f32("AIDGENT_RETRIEVAL_MIN_SCORE", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_RETRIEVAL_MMR") {
            self.retrieval.mmr = parse_bool("AIDGENT_RETRIEVAL_MMR", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_RETRIEVAL_EMBEDDING_MODEL") {
            self.retrieval.embedding_model = value;
        }

        if let Some(value) = read_env("AIDGENT_POLICY_DIR") {
            self.policy.dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("AIDGENT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("AIDGENT_SERVER_PORT") {
            self.server.port = parse_u16("AIDGENT_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("AIDGENT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("AIDGENT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("AIDGENT_LOGGING_LEVEL").or_else(|| read_env("AIDGENT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("AIDGENT_LOGGING_FORMAT").or_else(|| read_env("AIDGENT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(policy_dir) = overrides.policy_dir {
            self.policy.dir = policy_dir;
        }
        if let Some(retrieval_enabled) = overrides.retrieval_enabled {
            self.retrieval.enabled = retrieval_enabled;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_retrieval(&self.retrieval)?;
        validate_policy(&self.policy)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config").join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if llm.provider == LlmProvider::OpenAi {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "llm.api_key is required for the openai provider. Set AIDGENT_LLM_API_KEY or OPENAI_API_KEY"
                    .to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if retrieval.top_k == 0 || retrieval.top_k > 50 {
        return Err(ConfigError::Validation("retrieval.top_k must be in range 1..=50".to_string()));
    }

    if !(0.0..=1.0).contains(&retrieval.mmr_lambda) {
        return Err(ConfigError::Validation(
            "retrieval.mmr_lambda must be in range 0.0..=1.0".to_string(),
        ));
    }

    if !(-1.0..=1.0).contains(&retrieval.min_score) {
        return Err(ConfigError::Validation(
            "retrieval.min_score must be a cosine score in range -1.0..=1.0".to_string(),
        ));
    }

    if retrieval.chunk_target_chars == 0 {
        return Err(ConfigError::Validation(
            "retrieval.chunk_target_chars must be greater than zero".to_string(),
        ));
    }

    if retrieval.chunk_overlap_chars >= retrieval.chunk_target_chars {
        return Err(ConfigError::Validation(
            "retrieval.chunk_overlap_chars must be smaller than retrieval.chunk_target_chars"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    let files = [
        ("policy.system_prompt_file", &policy.system_prompt_file),
        ("policy.slot_policy_file", &policy.slot_policy_file),
        ("policy.questions_file", &policy.questions_file),
        ("policy.safety_file", &policy.safety_file),
    ];
    for (key, value) in files {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{key} must not be empty")));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_env(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_env(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_env(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_env(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_env(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_env(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_env(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    retrieval: Option<RetrievalPatch>,
    policy: Option<PolicyPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    enabled: Option<bool>,
    docs_dir: Option<PathBuf>,
    top_k: Option<usize>,
    min_score: Option<f32>,
    mmr: Option<bool>,
    mmr_lambda: Option<f32>,
    embedding_model: Option<String>,
    chunk_target_chars: Option<usize>,
    chunk_overlap_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    dir: Option<PathBuf>,
    system_prompt_file: Option<String>,
    slot_policy_file: Option<String>,
    questions_file: Option<String>,
    safety_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_AIDGENT_OPENAI_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("aidgent.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_AIDGENT_OPENAI_KEY}"
temperature = 0.4
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let key = config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string());
            ensure(key.as_deref() == Some("sk-from-env"), "api key should be loaded from env")?;
            ensure(
                (config.llm.temperature - 0.4).abs() < f32::EPSILON,
                "temperature should come from the file",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_AIDGENT_OPENAI_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AIDGENT_LLM_API_KEY", "sk-test");
        env::set_var("AIDGENT_LOG_LEVEL", "warn");
        env::set_var("AIDGENT_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["AIDGENT_LLM_API_KEY", "AIDGENT_LOG_LEVEL", "AIDGENT_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AIDGENT_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("AIDGENT_LLM_API_KEY", "sk-from-env");
        env::set_var("AIDGENT_RETRIEVAL_TOP_K", "3");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("aidgent.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[llm]
api_key = "sk-from-file"
model = "gpt-4o"

[retrieval]
top_k = 8
mmr = false

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret().to_string())
                    == Some("sk-from-env".to_string()),
                "env api key should win over file and defaults",
            )?;
            ensure(config.llm.model == "gpt-4o", "file model should win over default")?;
            ensure(config.retrieval.top_k == 3, "env top_k should win over file")?;
            ensure(!config.retrieval.mmr, "file mmr flag should win over default")?;
            Ok(())
        })();

        clear_vars(&["AIDGENT_DATABASE_URL", "AIDGENT_LLM_API_KEY", "AIDGENT_RETRIEVAL_TOP_K"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        clear_vars(&["AIDGENT_LLM_API_KEY", "OPENAI_API_KEY"]);
        env::set_var("AIDGENT_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["AIDGENT_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn ollama_needs_no_key_and_uses_local_base_url() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        clear_vars(&["AIDGENT_LLM_API_KEY", "OPENAI_API_KEY"]);

        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                llm_provider: Some(LlmProvider::Ollama),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .map_err(|err| format!("config load failed: {err}"))?;

        ensure(
            config.llm.effective_base_url() == "http://localhost:11434/v1",
            "ollama should default to the local endpoint",
        )
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk_target() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let mut config = AppConfig::default();
        config.llm.api_key = Some("sk-test".to_string().into());
        config.retrieval.chunk_overlap_chars = config.retrieval.chunk_target_chars;

        let rejected = matches!(
            config.validate(),
            Err(ConfigError::Validation(ref message)) if message.contains("chunk_overlap_chars")
        );
        ensure(rejected, "overlap >= target should be rejected")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("AIDGENT_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(config.llm.model == "gpt-4o-mini", "default model should be gpt-4o-mini")?;
            Ok(())
        })();

        clear_vars(&["AIDGENT_LLM_API_KEY"]);
        result
    }
}
