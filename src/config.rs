use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub llm: LlmConfig,
    pub bi: BiConfig,
    pub graph: GraphBudgetsConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// LLM facade defaults. Per-request `model`/`provider` fields (§6 HTTP
/// surface) take precedence over these when present.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub default_provider: String,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_cap_secs: u64,
}

/// BI (Tableau VizQL Data Service) connection defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BiConfig {
    pub server_url: String,
    pub site_name: String,
    /// One of "pat", "password", "connected_app".
    pub auth_mode: String,
    pub api_version: String,
    pub request_timeout_secs: u64,
}

/// VizQL Agent Graph retry budgets (spec.md §4.11).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphBudgetsConfig {
    pub max_build_attempts: u32,
    pub max_exec_attempts: u32,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub graph_timeout_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub step_timeout_secs: u64,
}

/// In-process cache sizing/TTLs. Neither cache is persisted (§5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub fingerprint_ttl_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub schema_enrichment_ttl_secs: u64,
    pub cardinality_threshold: u64,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "vizql-agent-runtime")]
#[command(version, about = "Stellar VizQL Agent Runtime")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,vizql_runtime=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Enable/disable the LLM facade (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub llm_enabled: Option<bool>,

    /// BI server URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub bi_server_url: Option<String>,

    /// Graph build-retry budget (overrides config file)
    #[arg(long, value_name = "N")]
    pub max_build_attempts: Option<u32>,

    /// Graph execution-retry budget (overrides config file)
    #[arg(long, value_name = "N")]
    pub max_exec_attempts: Option<u32>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Supported environment variables:
    /// - APP_SERVER_HOST, APP_SERVER_PORT, APP_DATABASE_URL, APP_LOG_LEVEL
    /// - APP_LLM_ENABLED, APP_BI_SERVER_URL
    /// - APP_MAX_BUILD_ATTEMPTS, APP_MAX_EXEC_ATTEMPTS
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(enabled) = std::env::var("APP_LLM_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.llm.enabled = val;
            tracing::info!("Override llm.enabled from env: {}", self.llm.enabled);
        }

        if let Ok(url) = std::env::var("APP_BI_SERVER_URL") {
            self.bi.server_url = url;
            tracing::info!("Override bi.server_url from env");
        }

        if let Ok(n) = std::env::var("APP_MAX_BUILD_ATTEMPTS")
            && let Ok(val) = n.parse()
        {
            self.graph.max_build_attempts = val;
            tracing::info!("Override graph.max_build_attempts from env: {}", val);
        }

        if let Ok(n) = std::env::var("APP_MAX_EXEC_ATTEMPTS")
            && let Ok(val) = n.parse()
        {
            self.graph.max_exec_attempts = val;
            tracing::info!("Override graph.max_exec_attempts from env: {}", val);
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(enabled) = args.llm_enabled {
            self.llm.enabled = enabled;
            tracing::info!("Override llm.enabled from CLI: {}", self.llm.enabled);
        }

        if let Some(url) = &args.bi_server_url {
            self.bi.server_url = url.clone();
            tracing::info!("Override bi.server_url from CLI");
        }

        if let Some(n) = args.max_build_attempts {
            self.graph.max_build_attempts = n;
            tracing::info!("Override graph.max_build_attempts from CLI: {}", n);
        }

        if let Some(n) = args.max_exec_attempts {
            self.graph.max_exec_attempts = n;
            tracing::info!("Override graph.max_exec_attempts from CLI: {}", n);
        }
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.database.url.is_empty() {
            anyhow::bail!("database.url cannot be empty");
        }
        if self.graph.max_build_attempts == 0 {
            anyhow::bail!("graph.max_build_attempts must be > 0");
        }
        if self.graph.max_exec_attempts == 0 {
            anyhow::bail!("graph.max_exec_attempts must be > 0");
        }
        if self.llm.enabled && self.bi.server_url.is_empty() {
            tracing::warn!("bi.server_url is empty; BI-backed requests will fail at runtime");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/vizql-agent-runtime.db".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,vizql_runtime=debug".to_string(),
            file: Some("logs/vizql-agent-runtime.log".to_string()),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_provider: "openai".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 60,
            max_retries: 3,
            backoff_cap_secs: 10,
        }
    }
}

impl Default for BiConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            site_name: String::new(),
            auth_mode: "pat".to_string(),
            api_version: "3.21".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for GraphBudgetsConfig {
    fn default() -> Self {
        Self {
            max_build_attempts: 3,
            max_exec_attempts: 2,
            graph_timeout_secs: 120,
            step_timeout_secs: 45,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fingerprint_ttl_secs: 300,
            schema_enrichment_ttl_secs: 600,
            cardinality_threshold: 10_000,
        }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

// Custom serde deserializer to support numeric or human-friendly string values
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_build_budget_fails_validation() {
        let mut config = Config::default();
        config.graph.max_build_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_duration_strings() {
        assert_eq!(parse_duration_to_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("1h").unwrap(), 3600);
        assert_eq!(parse_duration_to_secs("120").unwrap(), 120);
    }
}
