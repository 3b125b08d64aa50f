use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

use super::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResearchMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChatTransport {
    Telegram,
    Http,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub transport: ChatTransport,
    pub telegram_token: Option<String>,
    pub http_addr: SocketAddr,

    pub postmark_token: String,
    pub email_from: String,
    pub postmark_url: Url,

    pub tavily_api_key: String,
    pub tavily_url: Url,
    pub serp_api_key: String,
    pub serp_url: Url,

    pub research_mode: ResearchMode,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Url,
    pub llm_model: String,
    pub writer_model: String,
    pub local_llm: String,
    pub ollama_host: String,
    pub ollama_port: u16,

    pub max_searches: usize,
    pub results_per_provider: usize,
    pub max_chars_per_source: usize,
    pub session_idle_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

const DEFAULT_POSTMARK_URL: &str = "https://api.postmarkapp.com/";
const DEFAULT_TAVILY_URL: &str = "https://api.tavily.com/";
const DEFAULT_SERP_URL: &str = "https://serpapi.com/";
const DEFAULT_LLM_BASE_URL: &str = "https://api.groq.com/openai/v1/";

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_local_llm() -> String {
    "deepseek-r1:8b".to_string()
}

fn default_ollama_host() -> String {
    "http://localhost".to_string()
}

fn default_ollama_port() -> u16 {
    11434
}

fn default_max_searches() -> usize {
    3
}

fn default_results_per_provider() -> usize {
    5
}

fn default_max_chars_per_source() -> usize {
    4000
}

fn default_session_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_http_timeout_secs() -> u64 {
    120
}

const ENV_VARS: &[&str] = &[
    "CHAT_TRANSPORT",
    "TELEGRAM_TOKEN",
    "HTTP_ADDR",
    "POSTMARK_TOKEN",
    "EMAIL_FROM",
    "TAVILY_API_KEY",
    "SERP_API_KEY",
    "RESEARCH_MODE",
    "LLM_API_KEY",
    "LLM_BASE_URL",
    "LLM_MODEL",
    "WRITER_MODEL",
    "LOCAL_LLM",
    "OLLAMA_HOST",
    "OLLAMA_PORT",
    "MAX_SEARCHES",
    "RESULTS_PER_PROVIDER",
    "MAX_CHARS_PER_SOURCE",
    "SESSION_IDLE_TIMEOUT_SECS",
    "HTTP_TIMEOUT_SECS",
    "TAVILY_URL",
    "SERP_URL",
    "POSTMARK_URL",
];

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// Blank values count as unset. Secrets are only ever logged masked.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        for &var in ENV_VARS.iter() {
            match get(var) {
                Some(value) => tracing::debug!(
                    "Found env var {}: {}",
                    var,
                    if var.contains("KEY") || var.contains("TOKEN") {
                        "***".to_string()
                    } else {
                        value
                    }
                ),
                None => tracing::debug!("{} not set", var),
            }
        }

        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let transport = match get("CHAT_TRANSPORT").as_deref() {
            None | Some("telegram") => ChatTransport::Telegram,
            Some("http") => ChatTransport::Http,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "CHAT_TRANSPORT",
                    value: other.to_string(),
                    reason: "expected 'telegram' or 'http'".to_string(),
                })
            }
        };

        let telegram_token = match transport {
            ChatTransport::Telegram => Some(require("TELEGRAM_TOKEN")?),
            ChatTransport::Http => get("TELEGRAM_TOKEN"),
        };

        let research_mode = match get("RESEARCH_MODE").as_deref() {
            None | Some("remote") => ResearchMode::Remote,
            Some("local") => ResearchMode::Local,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "RESEARCH_MODE",
                    value: other.to_string(),
                    reason: "expected 'remote' or 'local'".to_string(),
                })
            }
        };

        let llm_api_key = match research_mode {
            ResearchMode::Remote => Some(require("LLM_API_KEY")?),
            ResearchMode::Local => get("LLM_API_KEY"),
        };

        let llm_model = get("LLM_MODEL").unwrap_or_else(default_llm_model);
        let writer_model = get("WRITER_MODEL").unwrap_or_else(|| llm_model.clone());

        Ok(Configuration {
            transport,
            telegram_token,
            http_addr: parse_or(&get, "HTTP_ADDR", default_http_addr)?,
            postmark_token: require("POSTMARK_TOKEN")?,
            email_from: require("EMAIL_FROM")?,
            postmark_url: url_or(&get, "POSTMARK_URL", DEFAULT_POSTMARK_URL)?,
            tavily_api_key: require("TAVILY_API_KEY")?,
            tavily_url: url_or(&get, "TAVILY_URL", DEFAULT_TAVILY_URL)?,
            serp_api_key: require("SERP_API_KEY")?,
            serp_url: url_or(&get, "SERP_URL", DEFAULT_SERP_URL)?,
            research_mode,
            llm_api_key,
            llm_base_url: url_or(&get, "LLM_BASE_URL", DEFAULT_LLM_BASE_URL)?,
            llm_model,
            writer_model,
            local_llm: get("LOCAL_LLM").unwrap_or_else(default_local_llm),
            ollama_host: get("OLLAMA_HOST").unwrap_or_else(default_ollama_host),
            ollama_port: parse_or(&get, "OLLAMA_PORT", default_ollama_port)?,
            max_searches: parse_or(&get, "MAX_SEARCHES", default_max_searches)?.clamp(1, 6),
            results_per_provider: parse_or(&get, "RESULTS_PER_PROVIDER", default_results_per_provider)?
                .clamp(1, 10),
            max_chars_per_source: parse_or(&get, "MAX_CHARS_PER_SOURCE", default_max_chars_per_source)?,
            session_idle_timeout_secs: parse_or(
                &get,
                "SESSION_IDLE_TIMEOUT_SECS",
                default_session_idle_timeout_secs,
            )?,
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", default_http_timeout_secs)?,
        })
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_or<T, G, D>(get: &G, name: &'static str, default: D) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
    D: FnOnce() -> T,
{
    match get(name) {
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default()),
    }
}

// Base URLs get a trailing slash so `Url::join` keeps their path.
fn url_or<G>(get: &G, name: &'static str, default: &str) -> Result<Url, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = get(name).unwrap_or_else(|| default.to_string());
    let with_slash = if value.ends_with('/') {
        value.clone()
    } else {
        format!("{}/", value)
    };
    Url::parse(&with_slash).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
        value,
    })
}
