use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use stepcore::{sanitize, Action, ActionContext, ActionError, ActionOutput, StepConfig};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebhookConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    /// Sent as-is; when absent the step's context is posted instead.
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl WebhookConfig {
    fn parse(config: &StepConfig) -> Result<Self, ActionError> {
        if !config.contains_key("url") {
            return Err(ActionError::MissingConfig("url".to_string()));
        }
        let parsed: WebhookConfig = serde_json::from_value(Value::Object(config.clone())).map_err(|e| {
            ActionError::InvalidConfig {
                field: "config".to_string(),
                reason: e.to_string(),
            }
        })?;

        if !(parsed.url.starts_with("http://") || parsed.url.starts_with("https://")) {
            return Err(ActionError::InvalidConfig {
                field: "url".to_string(),
                reason: "must be an http or https URL".to_string(),
            });
        }
        if !matches!(parsed.method.to_uppercase().as_str(), "GET" | "POST" | "PUT" | "PATCH" | "DELETE") {
            return Err(ActionError::InvalidConfig {
                field: "method".to_string(),
                reason: format!("unsupported method {}", parsed.method),
            });
        }
        Ok(parsed)
    }
}

/// Sends the step's context, or a configured body, to a webhook URL.
///
/// Webhooks usually have side effects, so failed calls are not repeated
/// unless the action is built with [`HttpWebhook::deduplicated`].
pub struct HttpWebhook {
    client: reqwest::Client,
    retry_safe: bool,
}

impl HttpWebhook {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            retry_safe: false,
        }
    }

    /// A webhook whose receiver deduplicates, so retries are harmless.
    pub fn deduplicated() -> Self {
        Self {
            retry_safe: true,
            ..Self::new()
        }
    }

    fn default_body(ctx: &ActionContext) -> Value {
        let inputs: Map<String, Value> = ctx.inputs.clone().into_iter().collect();
        json!({
            "execution_id": ctx.execution_id,
            "workflow_id": ctx.workflow_id,
            "step_id": ctx.step_id,
            "attempt": ctx.attempt,
            "trigger": ctx.trigger,
            "parameters": ctx.parameters,
            "inputs": inputs,
        })
    }
}

impl Default for HttpWebhook {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Action for HttpWebhook {
    fn action_type(&self) -> &str {
        "http.webhook"
    }

    async fn run(&self, config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let config = WebhookConfig::parse(config)?;
        let method = config.method.to_uppercase();

        ctx.events.info(sanitize(&format!("{} {}", method, config.url)));

        let mut request = match method.as_str() {
            "GET" => self.client.get(&config.url),
            "PUT" => self.client.put(&config.url),
            "PATCH" => self.client.patch(&config.url),
            "DELETE" => self.client.delete(&config.url),
            _ => self.client.post(&config.url),
        };
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if method != "GET" {
            let body = config.body.clone().unwrap_or_else(|| Self::default_body(&ctx));
            request = request.json(&body);
        }
        if let Some(seconds) = config.timeout_seconds {
            request = request.timeout(Duration::from_secs(seconds));
        }

        let response = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(ActionError::Cancelled),
            response = request.send() => response.map_err(|e| {
                if e.is_timeout() {
                    ActionError::Timeout { seconds: config.timeout_seconds.unwrap_or(0) }
                } else {
                    ActionError::failed(sanitize(&format!("HTTP request failed: {}", e)))
                }
            })?,
        };

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| ActionError::failed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if !status.is_success() {
            return Err(ActionError::failed(format!(
                "webhook returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = serde_json::from_str::<Value>(&body_text).unwrap_or(Value::String(body_text));
        Ok(ActionOutput::new()
            .with_output("status", status.as_u16())
            .with_output("body", body))
    }

    fn retry_safe(&self) -> bool {
        self.retry_safe
    }

    fn validate_config(&self, config: &StepConfig) -> Result<(), ActionError> {
        WebhookConfig::parse(config).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one connection, returns the raw request and answers with
    /// `status` and a JSON body.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let body = r#"{"accepted":true}"#;
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, task)
    }

    fn config(url: &str) -> StepConfig {
        let mut config = StepConfig::new();
        config.insert("url".into(), json!(url));
        config.insert("headers".into(), json!({"x-source": "stepwise"}));
        config
    }

    #[tokio::test]
    async fn posts_context_and_parses_json_reply() {
        let (url, server) = one_shot_server("200 OK").await;
        let mut ctx = context("notify");
        ctx.inputs.insert("review".into(), json!({"score": 7}));

        let out = HttpWebhook::new().run(&config(&url), ctx).await.unwrap();
        assert_eq!(out.value["status"], json!(200));
        assert_eq!(out.value["body"], json!({"accepted": true}));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("x-source: stepwise"));
        assert!(request.contains(r#""step_id":"notify""#));
        assert!(request.contains(r#""score":7"#));
    }

    #[tokio::test]
    async fn error_status_fails_the_step() {
        let (url, server) = one_shot_server("503 Service Unavailable").await;
        let err = HttpWebhook::new().run(&config(&url), context("notify")).await.unwrap_err();
        assert_eq!(err, ActionError::failed("webhook returned HTTP 503"));
        assert!(err.is_retryable());
        server.await.unwrap();
    }

    #[test]
    fn validates_config() {
        let webhook = HttpWebhook::new();
        assert_eq!(
            webhook.validate_config(&StepConfig::new()),
            Err(ActionError::MissingConfig("url".into()))
        );

        let mut bad = config("ftp://example.com");
        assert!(webhook.validate_config(&bad).is_err());

        bad = config("https://hooks.example.com/x");
        bad.insert("method".into(), json!("TRACE"));
        assert!(webhook.validate_config(&bad).is_err());

        bad = config("https://hooks.example.com/x");
        bad.insert("retries".into(), json!(3));
        assert!(webhook.validate_config(&bad).is_err());

        assert!(webhook.validate_config(&config("https://hooks.example.com/x")).is_ok());
    }

    #[test]
    fn webhooks_are_not_retried_by_default() {
        assert!(!HttpWebhook::new().retry_safe());
        assert!(HttpWebhook::deduplicated().retry_safe());
    }
}
