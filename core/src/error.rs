use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Stable error tokens used in logs and in `error` chunk content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadFrame,
    Busy,
    UnknownModel,
    ModelUnavailable,
    ToolBackendUnavailable,
    ToolNotAllowed,
    Timeout,
    Cancelled,
    SlowConsumer,
    Internal,
}

impl ErrorKind {
    pub fn token(self) -> &'static str {
        match self {
            ErrorKind::BadFrame => "bad_frame",
            ErrorKind::Busy => "busy",
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::ToolBackendUnavailable => "tool_backend_unavailable",
            ErrorKind::ToolNotAllowed => "tool_not_allowed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SlowConsumer => "slow_consumer",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Fault raised by a transport or one of its children, already normalized
/// into the error taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }
}

static API_KEY_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-ant-[A-Za-z0-9_\-]+").expect("valid regex"));
static HEX_TOKEN_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[a-f0-9]{40}\b").expect("valid regex"));
static HOME_DIR_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/home/[^/\s]+/").expect("valid regex"));

/// Strip credentials and environment values from a detail string before it
/// can reach a client or a log line.
pub fn sanitize_detail(detail: &str, config: &Config) -> String {
    let mut out = detail.to_string();
    if !config.llm_api_key.is_empty() {
        out = out.replace(&config.llm_api_key, "***");
    }
    if !config.tool_auth_token.is_empty() {
        out = out.replace(&config.tool_auth_token, "***");
    }
    out = API_KEY_SHAPE.replace_all(&out, "sk-ant-***").into_owned();
    out = HEX_TOKEN_SHAPE.replace_all(&out, "***").into_owned();
    out = HOME_DIR_SHAPE.replace_all(&out, "/home/***/").into_owned();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let env = HashMap::from([
            ("ANTHROPIC_API_KEY", "sk-ant-private0001"),
            ("NETBOX_URL", "http://netbox.example.com"),
            ("NETBOX_TOKEN", "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef"),
            ("TOOL_SERVER_COMMAND", "uv"),
        ]);
        Config::from_lookup(|key| env.get(key).map(|value| value.to_string())).unwrap()
    }

    #[test]
    fn tokens_are_stable() {
        assert_eq!(ErrorKind::ToolBackendUnavailable.token(), "tool_backend_unavailable");
        assert_eq!(ErrorKind::SlowConsumer.to_string(), "slow_consumer");
    }

    #[test]
    fn strips_configured_credentials() {
        let config = test_config();
        let detail = "request failed for key sk-ant-private0001 against http://netbox.example.com";
        let sanitized = sanitize_detail(detail, &config);
        assert!(!sanitized.contains("sk-ant-private0001"));
        assert!(sanitized.contains("sk-ant-***") || sanitized.contains("***"));
    }

    #[test]
    fn strips_key_shapes_even_when_not_configured() {
        let config = test_config();
        let sanitized = sanitize_detail("other key sk-ant-api03-abcDEF123 leaked", &config);
        assert_eq!(sanitized, "other key sk-ant-*** leaked");
    }

    #[test]
    fn strips_hex_tokens_and_home_paths() {
        let config = test_config();
        let sanitized = sanitize_detail(
            "token deadbeefdeadbeefdeadbeefdeadbeefdeadbeef at /home/ola/dev/server.py",
            &config,
        );
        assert_eq!(sanitized, "token *** at /home/***/dev/server.py");
    }
}
