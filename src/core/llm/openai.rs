use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChatMessage, LanguageModel, ModelReply, Role, ToolCallRequest, ToolSpec};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCallOut<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize)]
struct OpenAiToolCallOut<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunctionOut<'a>,
}

#[derive(Serialize)]
struct OpenAiFunctionOut<'a> {
    name: &'a str,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCallIn>,
}

#[derive(Deserialize)]
struct OpenAiToolCallIn {
    id: String,
    function: OpenAiFunctionIn,
}

#[derive(Deserialize)]
struct OpenAiFunctionIn {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Chat-completions provider for any OpenAI-compatible endpoint.
pub struct OpenAiCompatProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client,
        })
    }

    fn build_request<'a>(&'a self, messages: &'a [ChatMessage], tools: &'a [ToolSpec]) -> OpenAiRequest<'a> {
        let messages = messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str(),
                content: match (&m.role, &m.tool_call) {
                    (Role::Assistant, Some(_)) if m.content.is_empty() => None,
                    _ => Some(m.content.as_str()),
                },
                tool_calls: m.tool_call.as_ref().map(|call| {
                    vec![OpenAiToolCallOut {
                        id: &call.id,
                        kind: "function",
                        function: OpenAiFunctionOut {
                            name: &call.name,
                            arguments: call.arguments.to_string(),
                        },
                    }]
                }),
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();

        OpenAiRequest {
            model: &self.model,
            messages,
            tools: tools
                .iter()
                .map(|function| OpenAiTool {
                    kind: "function",
                    function,
                })
                .collect(),
        }
    }
}

fn parse_reply(parsed: OpenAiResponse) -> Result<ModelReply> {
    let message = parsed
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| anyhow!("model response contained no choices"))?;

    let mut calls = message.tool_calls.into_iter();
    if let Some(call) = calls.next() {
        let dropped = calls.count();
        if dropped > 0 {
            debug!(dropped, "model requested several tool calls; running the first");
        }
        let arguments = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str::<Value>(&call.function.arguments).unwrap_or_else(|e| {
                warn!(tool = %call.function.name, "tool arguments are not valid JSON: {}", e);
                json!({})
            })
        };
        return Ok(ModelReply::ToolCall(ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments,
        }));
    }

    Ok(ModelReply::Final(message.content.unwrap_or_default()))
}

#[async_trait]
impl LanguageModel for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelReply> {
        let req = self.build_request(messages, tools);

        let mut request = self.client.post(&self.base_url).json(&req);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(anyhow!(
                "model API error ({}): {}",
                status,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: OpenAiResponse = res.json().await?;
        parse_reply(parsed)
    }
}
