//! Vendor client for the Anthropic messages API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ErrorKind, TransportError};
use crate::transport::llm::{
    CompletionRequest, ContentBlock, LlmClient, ToolDefinition, VendorMessage, VendorTurn,
};

pub const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Vendor handle used when the public id is the auto sentinel.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::internal(format!("http client setup failed: {err}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(serde::Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [VendorMessage],
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tools: &'a [ToolDefinition],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<VendorTurn, TransportError> {
        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %request.model, messages = request.messages.len(), "vendor request");

        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools: &request.tools,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                TransportError::internal(format!("vendor request failed: {err}"))
            })?;

        let status = response.status();
        let payload = response.text().await.map_err(|err| {
            TransportError::internal(format!("vendor response read failed: {err}"))
        })?;

        if !status.is_success() {
            // Surface the vendor's own error type when the body parses;
            // otherwise only the status code leaves this function.
            if let Ok(error) = serde_json::from_str::<ApiError>(&payload) {
                return Err(TransportError::new(
                    ErrorKind::Internal,
                    format!("vendor error {}: {}", error.error.kind, error.error.message),
                ));
            }
            return Err(TransportError::internal(format!(
                "vendor returned HTTP {status}"
            )));
        }

        let decoded: MessagesResponse = serde_json::from_str(&payload).map_err(|err| {
            TransportError::internal(format!("invalid vendor response: {err}"))
        })?;

        Ok(VendorTurn {
            blocks: decoded.content,
            stop_reason: decoded.stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Minimal one-shot HTTP stub: answers the first request with the given
    /// status line and JSON body, then closes.
    async fn spawn_vendor_stub(status: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 64 * 1024];
            let mut read = 0;
            loop {
                let Ok(n) = stream.read(&mut buf[read..]).await else {
                    return;
                };
                if n == 0 {
                    break;
                }
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .and_then(|value| value.trim().parse::<usize>().ok())
                        })
                        .unwrap_or(0);
                    if read >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
        addr
    }

    fn stub_request() -> CompletionRequest {
        CompletionRequest {
            model: DEFAULT_MODEL.to_string(),
            system: "be brief".to_string(),
            messages: vec![VendorMessage::user_text("hello")],
            tools: Vec::new(),
            max_tokens: 4096,
        }
    }

    #[tokio::test]
    async fn complete_round_trips_against_a_stub_server() {
        let addr = spawn_vendor_stub(
            "200 OK",
            r#"{"content":[{"type":"text","text":"Hi"}],"stop_reason":"end_turn"}"#,
        )
        .await;
        let client = AnthropicClient::new("sk-ant-test0001")
            .expect("client")
            .with_base_url(format!("http://{addr}"));

        let turn = client.complete(stub_request()).await.expect("turn");
        assert_eq!(
            turn.blocks,
            vec![ContentBlock::Text {
                text: "Hi".to_string()
            }]
        );
        assert_eq!(turn.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn vendor_error_bodies_are_normalized() {
        let addr = spawn_vendor_stub(
            "400 Bad Request",
            r#"{"error":{"type":"invalid_request_error","message":"max_tokens required"}}"#,
        )
        .await;
        let client = AnthropicClient::new("sk-ant-test0001")
            .expect("client")
            .with_base_url(format!("http://{addr}"));

        let err = client.complete(stub_request()).await.expect_err("must fail");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.detail.contains("invalid_request_error"), "{}", err.detail);
    }

    #[test]
    fn request_body_omits_empty_tool_list() {
        let request = MessagesRequest {
            model: DEFAULT_MODEL,
            max_tokens: 4096,
            system: "be brief",
            messages: &[VendorMessage::user_text("hello")],
            tools: &[],
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("tools").is_none());
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[test]
    fn request_body_carries_tool_schemas() {
        let tools = vec![ToolDefinition {
            name: "netbox_get_objects".to_string(),
            description: "List objects".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let request = MessagesRequest {
            model: DEFAULT_MODEL,
            max_tokens: 4096,
            system: "",
            messages: &[],
            tools: &tools,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["tools"][0]["name"], "netbox_get_objects");
        assert!(body["tools"][0]["input_schema"].is_object());
    }
}
