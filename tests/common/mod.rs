#![allow(dead_code)]

use axum::{Json, Router, extract::State, routing::post};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A stdio worker in plain `sh`. It answers `whoami` with the refresh secret
/// read from the file named by `TOOLHOST_SECRET_FILE` and fails every other
/// tool call.
const WORKER_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"whoami","description":"Report the launch secret","inputSchema":{"type":"object","properties":{}}},{"name":"boom","description":"Always fails"}]}}\n' "$id" ;;
    *'"name":"whoami"'*)
      secret=$(sed -n 's/.*"refresh_secret": *"\([^"]*\)".*/\1/p' "$TOOLHOST_SECRET_FILE")
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"token=%s"}]}}\n' "$id" "$secret" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"worker failure"}],"isError":true}}\n' "$id" ;;
  esac
done
"#;

pub fn write_worker_script(dir: &Path) -> TestResult<PathBuf> {
    let path = dir.join("worker.sh");
    std::fs::write(&path, WORKER_SCRIPT)?;
    Ok(path)
}

pub fn final_reply(text: &str) -> Value {
    json!({
        "choices": [{
            "message": { "role": "assistant", "content": text }
        }]
    })
}

pub fn tool_call_reply(id: &str, name: &str, arguments: Value) -> Value {
    json!({
        "choices": [{
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments.to_string() }
                }]
            }
        }]
    })
}

#[derive(Clone, Default)]
struct MockState {
    replies: Arc<Mutex<VecDeque<Value>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn mock_chat_completion(State(state): State<MockState>, Json(payload): Json<Value>) -> Json<Value> {
    state.requests.lock().unwrap().push(payload);
    let reply = state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| final_reply("script exhausted"));
    Json(reply)
}

/// OpenAI-compatible endpoint replaying canned replies.
pub struct MockModel {
    pub base_url: String,
    state: MockState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl MockModel {
    pub async fn start(replies: Vec<Value>) -> TestResult<Self> {
        let state = MockState {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/v1/chat/completions", post(mock_chat_completion))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            base_url: format!("http://127.0.0.1:{}/v1/chat/completions", port),
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Last message of a recorded chat-completions request.
pub fn last_message(request: &Value) -> &Value {
    request["messages"]
        .as_array()
        .and_then(|m| m.last())
        .unwrap_or(&Value::Null)
}
