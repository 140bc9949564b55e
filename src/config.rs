//! Runtime configuration, read from environment variables.
//!
//! Every variable is optional. Unparseable values are errors rather than
//! silently replaced by defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::agents::RunConfig;
use crate::queue::QueueConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when MODEL_TYPE=openai")]
    Missing(&'static str),
}

/// Which model gateway to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Ollama,
    OpenAi,
    /// Offline canned replies.
    Scripted,
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "scripted" => Ok(Self::Scripted),
            other => Err(format!("expected ollama, openai or scripted, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Sqlite,
    Off,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "off" | "none" | "disabled" => Ok(Self::Off),
            other => Err(format!("expected memory, sqlite or off, got '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub model_type: ModelType,
    pub model_name: String,
    pub temperature: f64,
    pub ollama_base_url: String,
    pub openai_base_url: String,
    /// Never serialized.
    pub openai_api_key: Option<String>,
    pub max_rounds: u32,
    pub max_context_tokens: u64,
    pub enable_tools: bool,
    pub dynamic_routing: bool,
    pub database_path: PathBuf,
    pub cache_backend: CacheBackendKind,
    pub cache_ttl: Duration,
    pub queue_workers: usize,
    pub queue_max_attempts: u32,
    pub task_time_limit: Duration,
    pub max_task_chars: usize,
    /// Submissions per client per minute; 0 disables the limit.
    pub rate_limit_submit: u32,
    /// List requests per client per minute; 0 disables the limit.
    pub rate_limit_list: u32,
    pub host: String,
    pub port: u16,
    /// `["*"]` allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_type: ModelType::Ollama,
            model_name: "llama3.2".to_string(),
            temperature: 0.7,
            ollama_base_url: "http://localhost:11434/v1".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            max_rounds: 12,
            max_context_tokens: 4000,
            enable_tools: true,
            dynamic_routing: false,
            database_path: PathBuf::from("research.db"),
            cache_backend: CacheBackendKind::Memory,
            cache_ttl: Duration::from_secs(3600),
            queue_workers: 2,
            queue_max_attempts: 3,
            task_time_limit: Duration::from_secs(600),
            max_task_chars: 5000,
            rate_limit_submit: 10,
            rate_limit_list: 30,
            host: "0.0.0.0".to_string(),
            port: 5001,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let model_type: ModelType = parse(&get, "MODEL_TYPE")?.unwrap_or(defaults.model_type);
        let model_name = get("MODEL_NAME").unwrap_or_else(|| match model_type {
            ModelType::OpenAi => "gpt-4".to_string(),
            _ => defaults.model_name.clone(),
        });
        let openai_api_key = get("OPENAI_API_KEY");
        if model_type == ModelType::OpenAi && openai_api_key.is_none() {
            return Err(ConfigError::Missing("OPENAI_API_KEY"));
        }

        let temperature: f64 = parse(&get, "TEMPERATURE")?.unwrap_or(defaults.temperature);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid("TEMPERATURE", temperature, "must be between 0 and 2"));
        }

        let max_rounds: u32 = parse(&get, "MAX_ROUNDS")?.unwrap_or(defaults.max_rounds);
        if max_rounds == 0 {
            return Err(invalid("MAX_ROUNDS", max_rounds, "must be at least 1"));
        }
        let queue_workers: usize = parse(&get, "QUEUE_WORKERS")?.unwrap_or(defaults.queue_workers);
        if queue_workers == 0 {
            return Err(invalid("QUEUE_WORKERS", queue_workers, "must be at least 1"));
        }
        let queue_max_attempts: u32 =
            parse(&get, "QUEUE_MAX_ATTEMPTS")?.unwrap_or(defaults.queue_max_attempts);
        if queue_max_attempts == 0 {
            return Err(invalid("QUEUE_MAX_ATTEMPTS", queue_max_attempts, "must be at least 1"));
        }
        let max_task_chars: usize =
            parse(&get, "MAX_TASK_CHARS")?.unwrap_or(defaults.max_task_chars);
        if max_task_chars == 0 {
            return Err(invalid("MAX_TASK_CHARS", max_task_chars, "must be at least 1"));
        }

        Ok(Self {
            model_type,
            model_name,
            temperature,
            ollama_base_url: get("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_api_key,
            max_rounds,
            max_context_tokens: parse(&get, "MAX_CONTEXT_TOKENS")?
                .unwrap_or(defaults.max_context_tokens),
            enable_tools: parse_flag(&get, "ENABLE_TOOLS")?.unwrap_or(defaults.enable_tools),
            dynamic_routing: parse_flag(&get, "DYNAMIC_ROUTING")?
                .unwrap_or(defaults.dynamic_routing),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            cache_backend: parse(&get, "CACHE_BACKEND")?.unwrap_or(defaults.cache_backend),
            cache_ttl: parse(&get, "CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            queue_workers,
            queue_max_attempts,
            task_time_limit: parse(&get, "TASK_TIME_LIMIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_time_limit),
            max_task_chars,
            rate_limit_submit: parse(&get, "RATE_LIMIT_SUBMIT_PER_MIN")?
                .unwrap_or(defaults.rate_limit_submit),
            rate_limit_list: parse(&get, "RATE_LIMIT_LIST_PER_MIN")?
                .unwrap_or(defaults.rate_limit_list),
            host: get("HOST").unwrap_or(defaults.host),
            port: parse(&get, "PORT")?.unwrap_or(defaults.port),
            cors_origins: get("CORS_ORIGINS")
                .map(|raw| parse_origins(&raw))
                .unwrap_or(defaults.cors_origins),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse()
            .map_err(|e: std::net::AddrParseError| invalid("HOST", &raw, e))
    }

    /// Base URL of the selected gateway, if it has one.
    pub fn gateway_url(&self) -> Option<&str> {
        match self.model_type {
            ModelType::Ollama => Some(&self.ollama_base_url),
            ModelType::OpenAi => Some(&self.openai_base_url),
            ModelType::Scripted => None,
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            model: self.model_name.clone(),
            temperature: self.temperature,
            max_turns: self.max_rounds,
            max_context_tokens: self.max_context_tokens,
            enable_tools: self.enable_tools,
            dynamic_routing: self.dynamic_routing,
            ..RunConfig::default()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            workers: self.queue_workers,
            max_attempts: self.queue_max_attempts,
            time_limit: self.task_time_limit,
            ..QueueConfig::default()
        }
    }

    /// What `/api/config` shows. Holds no secrets.
    pub fn public_view(&self) -> PublicConfig {
        PublicConfig {
            model_type: self.model_type,
            model_name: self.model_name.clone(),
            temperature: self.temperature,
            gateway_url: self.gateway_url().map(str::to_string),
            api_key_configured: self.openai_api_key.is_some(),
            max_rounds: self.max_rounds,
            max_context_tokens: self.max_context_tokens,
            enable_tools: self.enable_tools,
            dynamic_routing: self.dynamic_routing,
            cache_backend: self.cache_backend,
            cache_ttl_secs: self.cache_ttl.as_secs(),
            queue_workers: self.queue_workers,
            queue_max_attempts: self.queue_max_attempts,
            task_time_limit_secs: self.task_time_limit.as_secs(),
            max_task_chars: self.max_task_chars,
            rate_limit_submit_per_min: self.rate_limit_submit,
            rate_limit_list_per_min: self.rate_limit_list,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicConfig {
    pub model_type: ModelType,
    pub model_name: String,
    pub temperature: f64,
    pub gateway_url: Option<String>,
    pub api_key_configured: bool,
    pub max_rounds: u32,
    pub max_context_tokens: u64,
    pub enable_tools: bool,
    pub dynamic_routing: bool,
    pub cache_backend: CacheBackendKind,
    pub cache_ttl_secs: u64,
    pub queue_workers: usize,
    pub queue_max_attempts: u32,
    pub task_time_limit_secs: u64,
    pub max_task_chars: usize,
    pub rate_limit_submit_per_min: u32,
    pub rate_limit_list_per_min: u32,
}

fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(key, &raw, e)))
        .transpose()
}

fn parse_flag<G>(get: &G, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw, "expected true or false")),
        })
        .transpose()
}

/// Comma-separated origins; `*` alone means any.
pub fn parse_origins(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return vec!["*".to_string()];
    }
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
