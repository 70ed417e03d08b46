use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::catalog::ToolCatalog;
use crate::core::llm::{ChatMessage, LanguageModel, ModelReply, ToolCallRequest};
use crate::core::pool::ConnectionPool;
use crate::core::service::ServiceTag;

const WRAP_UP_INSTRUCTION: &str = "You have reached the limit of tool calls for this request. \
     Do not call any more tools. Answer the user now using only the information gathered so far, \
     and say plainly if something could not be found.";

const WRAP_UP_FALLBACK: &str =
    "I wasn't able to finish gathering the information needed to answer this request. Please try again or narrow the question.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("none of the requested services could be reached: {}", .0.join(", "))]
    NoServicesAvailable(Vec<String>),
}

/// What to do when services were requested but none resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoServicesPolicy {
    /// Answer as a plain conversational agent.
    #[default]
    Converse,
    Fail,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub history_window: usize,
    pub max_tool_result_chars: usize,
    pub when_no_services: NoServicesPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            history_window: 10,
            max_tool_result_chars: 16_000,
            when_no_services: NoServicesPolicy::Converse,
        }
    }
}

/// Inputs for one agent run.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub user_id: String,
    /// Prior turns, oldest first. Only the last `history_window` are used.
    pub history: Vec<ChatMessage>,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub text: String,
    pub iterations: usize,
    pub tool_calls: usize,
    pub unavailable_services: Vec<ServiceTag>,
    /// The iteration budget ran out and the answer came from the wrap-up call.
    pub exhausted: bool,
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let mut kept: String = text.chars().take(max_chars).collect();
    kept.push_str(&format!("\n...[truncated {} chars]", total - max_chars));
    kept
}

fn error_payload(kind: &str, message: &str) -> String {
    json!({ "error": { "kind": kind, "message": message } }).to_string()
}

/// Drives the model through a bounded sequence of tool calls.
pub struct AgentLoop {
    pool: Arc<ConnectionPool>,
    model: Arc<dyn LanguageModel>,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(pool: Arc<ConnectionPool>, model: Arc<dyn LanguageModel>, settings: AgentSettings) -> Self {
        Self { pool, model, settings }
    }

    /// Connect each enabled service and merge its tools. Services that fail
    /// are left out of this run.
    async fn resolve_services(
        &self,
        user_id: &str,
        enabled: &[ServiceTag],
    ) -> (ToolCatalog, Vec<ServiceTag>, Vec<ServiceTag>) {
        let mut catalog = ToolCatalog::new();
        let mut available = Vec::new();
        let mut unavailable = Vec::new();

        for service in enabled {
            if available.contains(service) || unavailable.contains(service) {
                continue;
            }
            let tools = match self.pool.get_connection(user_id, service).await {
                Ok(conn) => conn.list_tools().await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match tools {
                Ok(tools) => {
                    debug!(user = %user_id, service = %service, tools = tools.len(), "service resolved");
                    catalog.add_service(service, tools);
                    available.push(service.clone());
                }
                Err(reason) => {
                    warn!(user = %user_id, service = %service, "service unavailable for this turn: {}", reason);
                    unavailable.push(service.clone());
                }
            }
        }

        (catalog, available, unavailable)
    }

    fn system_prompt(&self, available: &[ServiceTag]) -> String {
        let mut prompt = String::from(
            "You are an assistant that answers questions using the user's connected services.\n",
        );
        if available.is_empty() {
            prompt.push_str(
                "No external services are connected for this conversation. \
                 Answer from the conversation alone.\n",
            );
            return prompt;
        }

        prompt.push_str("\nCONNECTED SERVICES:\n");
        for tag in available {
            let description = self
                .pool
                .services()
                .get(tag)
                .map(|d| d.description.as_str())
                .filter(|d| !d.is_empty())
                .unwrap_or("no description");
            prompt.push_str(&format!("- {}: {}\n", tag, description));
        }
        prompt.push_str(
            "\nRULES:\n\
             1. Tool names start with the tag of the service they belong to.\n\
             2. Call one tool at a time and wait for its result.\n\
             3. If a tool returns an error, try a different tool or arguments, or answer with what you have.\n\
             4. Be concise.\n",
        );
        prompt
    }

    async fn execute_tool(&self, user_id: &str, catalog: &ToolCatalog, call: &ToolCallRequest) -> String {
        let Some(route) = catalog.resolve(&call.name) else {
            warn!(user = %user_id, tool = %call.name, "model requested an unknown tool");
            return error_payload("unknown_tool", &format!("no tool named '{}' is available", call.name));
        };

        // Re-resolve per call so a reaped or replaced connection is never used.
        let conn = match self.pool.get_connection(user_id, &route.service).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(user = %user_id, service = %route.service, tool = %call.name, "tool service unavailable: {}", e);
                return error_payload("service_unavailable", &e.to_string());
            }
        };

        match conn.call_tool(&route.canonical_name, call.arguments.clone()).await {
            Ok(result) => {
                let rendered = match &result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                truncate_chars(rendered, self.settings.max_tool_result_chars)
            }
            Err(e) => {
                warn!(user = %user_id, service = %route.service, tool = %call.name, "tool call failed: {}", e);
                error_payload("invocation", &e.to_string())
            }
        }
    }

    async fn complete(&self, messages: &[ChatMessage], catalog: Option<&ToolCatalog>) -> Result<ModelReply, AgentError> {
        let specs = catalog.map(ToolCatalog::specs).unwrap_or_default();
        self.model
            .complete(messages, &specs)
            .await
            .map_err(|e| AgentError::ModelUnavailable(e.to_string()))
    }

    pub async fn run(&self, seed: SessionSeed, enabled: &[ServiceTag]) -> Result<AgentOutcome, AgentError> {
        let user_id = seed.user_id.as_str();
        let (catalog, available, unavailable) = self.resolve_services(user_id, enabled).await;

        if !enabled.is_empty() && available.is_empty() {
            match self.settings.when_no_services {
                NoServicesPolicy::Fail => {
                    return Err(AgentError::NoServicesAvailable(
                        unavailable.iter().map(ToString::to_string).collect(),
                    ));
                }
                NoServicesPolicy::Converse => {
                    warn!(user = %user_id, "no requested service resolved; continuing without tools");
                }
            }
        }

        let mut messages = vec![ChatMessage::system(self.system_prompt(&available))];
        let start = seed.history.len().saturating_sub(self.settings.history_window);
        messages.extend(seed.history.into_iter().skip(start));
        messages.push(ChatMessage::user(seed.prompt));

        let mut tool_calls = 0;
        for iteration in 1..=self.settings.max_iterations {
            let call = match self.complete(&messages, Some(&catalog)).await? {
                ModelReply::Final(text) => {
                    info!(user = %user_id, iteration, tool_calls, "agent loop finished");
                    return Ok(AgentOutcome {
                        text,
                        iterations: iteration,
                        tool_calls,
                        unavailable_services: unavailable,
                        exhausted: false,
                    });
                }
                ModelReply::ToolCall(call) => call,
            };

            info!(user = %user_id, iteration, tool = %call.name, "invoking tool");
            let result = self.execute_tool(user_id, &catalog, &call).await;
            tool_calls += 1;

            let call_id = call.id.clone();
            messages.push(ChatMessage::assistant_tool_call(call));
            messages.push(ChatMessage::tool_result(call_id, result));
        }

        info!(
            user = %user_id,
            iterations = self.settings.max_iterations,
            "iteration budget exhausted; requesting wrap-up answer"
        );
        messages.push(ChatMessage::system(WRAP_UP_INSTRUCTION));
        let text = match self.complete(&messages, None).await? {
            ModelReply::Final(text) => text,
            ModelReply::ToolCall(call) => {
                warn!(user = %user_id, tool = %call.name, "model asked for a tool during wrap-up");
                WRAP_UP_FALLBACK.to_string()
            }
        };

        Ok(AgentOutcome {
            text,
            iterations: self.settings.max_iterations,
            tool_calls,
            unavailable_services: unavailable,
            exhausted: true,
        })
    }
}
