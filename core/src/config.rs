use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";
const DEFAULT_ENV_ALLOWLIST: &str = "NETBOX_URL,NETBOX_TOKEN,LOG_LEVEL";
const DEFAULT_TOOL_PREFIXES: &str = "netbox_";
const DEFAULT_TURN_BUDGET_SECS: u64 = 300;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Immutable configuration snapshot, built once at startup and shared by
/// reference. Constructors take an explicit lookup so nothing in this type
/// ever reads ambient process state on its own.
#[derive(Clone)]
pub struct Config {
    pub llm_api_key: String,
    pub tool_base_url: String,
    pub tool_auth_token: String,
    pub tool_server_command: String,
    pub tool_server_args: Vec<String>,
    pub tool_server_env_allowlist: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub allowed_tool_prefixes: Vec<String>,
    pub default_model_id: String,
    pub turn_budget: Duration,
    pub log_level: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "missing required environment variables: {}\nset these in your .env file or environment",
        .0.join(", ")
    )]
    Missing(Vec<String>),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl Config {
    /// Load from the process environment. Binaries call this once; tests use
    /// [`Config::from_lookup`] with a map instead.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str, missing: &mut Vec<String>| -> String {
            match lookup(key).filter(|value| !value.trim().is_empty()) {
                Some(value) => value.trim().to_string(),
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        };

        let mut missing = Vec::new();
        let llm_api_key = required("ANTHROPIC_API_KEY", &mut missing);
        let tool_base_url = required("NETBOX_URL", &mut missing);
        let tool_auth_token = required("NETBOX_TOKEN", &mut missing);
        let tool_server_command = required("TOOL_SERVER_COMMAND", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if !tool_base_url.starts_with("http://") && !tool_base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "NETBOX_URL",
                reason: format!("{tool_base_url} must start with http:// or https://"),
            });
        }

        let log_level = lookup("LOG_LEVEL")
            .map(|level| level.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "info".to_string());
        if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(ConfigError::Invalid {
                key: "LOG_LEVEL",
                reason: format!(
                    "{log_level} is not one of {}",
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        let turn_budget_secs = match lookup("TURN_BUDGET_SECS") {
            None => DEFAULT_TURN_BUDGET_SECS,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "TURN_BUDGET_SECS",
                        reason: format!("{raw} is not a positive integer"),
                    })
                }
            },
        };

        Ok(Self {
            llm_api_key,
            tool_base_url,
            tool_auth_token,
            tool_server_command,
            tool_server_args: lookup("TOOL_SERVER_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            tool_server_env_allowlist: parse_list(
                lookup("TOOL_SERVER_ENV_ALLOWLIST").as_deref(),
                DEFAULT_ENV_ALLOWLIST,
            ),
            allowed_origins: parse_list(
                lookup("CORS_ORIGINS").as_deref(),
                DEFAULT_ALLOWED_ORIGINS,
            ),
            allowed_tool_prefixes: parse_list(
                lookup("ALLOWED_TOOL_PREFIXES").as_deref(),
                DEFAULT_TOOL_PREFIXES,
            ),
            default_model_id: lookup("DEFAULT_MODEL")
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| "auto".to_string()),
            turn_budget: Duration::from_secs(turn_budget_secs),
            log_level,
        })
    }

    /// Environment for the tool-server child, built from scratch.
    ///
    /// Only allowlisted keys appear, with values taken from this snapshot.
    /// The gateway's own environment is never consulted here, so nothing the
    /// shell exports can shadow the configured credentials.
    pub fn child_env(&self) -> BTreeMap<String, String> {
        self.tool_server_env_allowlist
            .iter()
            .filter_map(|key| self.tool_env_value(key).map(|value| (key.clone(), value)))
            .collect()
    }

    fn tool_env_value(&self, key: &str) -> Option<String> {
        match key {
            "NETBOX_URL" => Some(self.tool_base_url.clone()),
            "NETBOX_TOKEN" => Some(self.tool_auth_token.clone()),
            "LOG_LEVEL" => Some(self.log_level.to_ascii_uppercase()),
            _ => {
                tracing::warn!("allowlisted env key {key} has no configured value");
                None
            }
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

fn parse_list(raw: Option<&str>, default: &str) -> Vec<String> {
    raw.unwrap_or(default)
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("llm_api_key", &redact(&self.llm_api_key))
            .field("tool_base_url", &self.tool_base_url)
            .field("tool_auth_token", &redact(&self.tool_auth_token))
            .field("tool_server_command", &self.tool_server_command)
            .field("tool_server_args", &self.tool_server_args)
            .field(
                "tool_server_env_allowlist",
                &self.tool_server_env_allowlist,
            )
            .field("allowed_origins", &self.allowed_origins)
            .field("allowed_tool_prefixes", &self.allowed_tool_prefixes)
            .field("default_model_id", &self.default_model_id)
            .field("turn_budget", &self.turn_budget)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "NOT SET"
    } else {
        "***"
    }
}
