use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::service::ServiceTag;

const PROTOCOL_VERSION: &str = "2024-11-05";
const STDERR_CAPTURE_LIMIT: usize = 2000;
const MAX_TOOL_PAGES: usize = 32;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to connect to service '{service}': {reason}")]
    Connection { service: String, reason: String },

    #[error("connection to service '{0}' is not connected")]
    NotConnected(String),

    #[error("tool invocation failed: {0}")]
    Invocation(String),
}

/// Lifecycle of one worker connection. Only `Connected` serves requests;
/// `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// A named, schema-bearing capability surfaced by a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

/// Everything needed to start a worker for one (user, service) pair.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub user_id: String,
    pub service: ServiceTag,
    pub command: String,
    pub args: Vec<String>,
    /// Added on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimeouts {
    pub handshake: Duration,
    pub call: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(15),
            call: Duration::from_secs(60),
        }
    }
}

/// The pool's view of a live worker connection.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn user_id(&self) -> &str;
    fn service(&self) -> &ServiceTag;
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProviderError>;
    async fn disconnect(&self);
}

/// Creates connected providers from launch parameters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: LaunchParams) -> Result<Arc<dyn ToolProvider>, ProviderError>;
}

/// Spawns stdio workers speaking newline-delimited JSON-RPC.
pub struct StdioConnector {
    timeouts: ConnectionTimeouts,
}

impl StdioConnector {
    pub fn new(timeouts: ConnectionTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, params: LaunchParams) -> Result<Arc<dyn ToolProvider>, ProviderError> {
        let connection = McpConnection::spawn(params, self.timeouts).await?;
        Ok(connection)
    }
}

enum RpcFailure {
    /// The worker is gone or unreachable.
    Transport(String),
    Timeout,
    /// The worker answered with a JSON-RPC error object.
    Remote(Value),
}

impl RpcFailure {
    fn describe(&self) -> String {
        match self {
            RpcFailure::Transport(reason) => reason.clone(),
            RpcFailure::Timeout => "request timed out".to_string(),
            RpcFailure::Remote(err) => {
                let message = err.get("message").and_then(Value::as_str);
                match message {
                    Some(m) => m.to_string(),
                    None => err.to_string(),
                }
            }
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;
type SharedState = Arc<std::sync::Mutex<ConnectionState>>;

fn read_state(state: &SharedState) -> ConnectionState {
    *state.lock().unwrap_or_else(|e| e.into_inner())
}

fn write_state(state: &SharedState, next: ConnectionState) {
    let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
    // Disconnected is terminal.
    if *guard != ConnectionState::Disconnected {
        *guard = next;
    }
}

/// One worker subprocess (or any byte stream) speaking MCP over JSON lines.
pub struct McpConnection {
    user_id: String,
    service: ServiceTag,
    state: SharedState,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    pending: PendingMap,
    tx_req: mpsc::Sender<String>,
    stderr: Arc<Mutex<String>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    call_timeout: Duration,
}

impl McpConnection {
    /// Launch the worker, perform the handshake and cache its tool catalog.
    pub async fn spawn(
        params: LaunchParams,
        timeouts: ConnectionTimeouts,
    ) -> Result<Arc<Self>, ProviderError> {
        info!(
            user = %params.user_id,
            service = %params.service,
            command = %params.command,
            "starting tool worker"
        );
        let connection_error = |reason: String| ProviderError::Connection {
            service: params.service.to_string(),
            reason,
        };

        let mut child = Command::new(&params.command)
            .args(&params.args)
            .envs(&params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| connection_error(format!("spawn '{}' failed: {}", params.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_error("failed to open worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_error("failed to open worker stdout".to_string()))?;
        let stderr = child.stderr.take();

        let connection = Self::attach(
            params.user_id.clone(),
            params.service.clone(),
            stdout,
            stdin,
            stderr,
            Some(child),
            timeouts.call,
        );

        if let Err(e) = connection.handshake(timeouts.handshake).await {
            connection.disconnect_inner().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Wire a connection over an existing transport. The connection starts
    /// `Uninitialized`; call [`McpConnection::handshake`] before use.
    pub fn attach<R, W, E>(
        user_id: String,
        service: ServiceTag,
        reader: R,
        writer: W,
        stderr: Option<E>,
        child: Option<Child>,
        call_timeout: Duration,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx_req, mut rx_req) = mpsc::channel::<String>(100);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state: SharedState = Arc::new(std::sync::Mutex::new(ConnectionState::Uninitialized));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut tasks = Vec::new();

        let label = format!("{}/{}", user_id, service);

        // Writer: serialized requests go out one per line.
        let writer_label = label.clone();
        let writer_state = state.clone();
        let mut stdin_writer = tokio::io::BufWriter::new(writer);
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = rx_req.recv().await {
                debug!("MCP TX [{}]: {}", writer_label, msg);
                let sent = async {
                    stdin_writer.write_all(msg.as_bytes()).await?;
                    stdin_writer.write_all(b"\n").await?;
                    stdin_writer.flush().await
                }
                .await;
                if let Err(e) = sent {
                    error!("Failed to write to worker [{}]: {}", writer_label, e);
                    write_state(&writer_state, ConnectionState::Disconnected);
                    break;
                }
            }
        }));

        // Reader: route responses to waiting callers, answer worker requests.
        let reader_label = label.clone();
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        let reply_tx = tx_req.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("MCP RX [{}]: {}", reader_label, line);
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    warn!("Unparsed MCP RX [{}]: {}", reader_label, line);
                    continue;
                };
                if let Some(method) = message.get("method").and_then(Value::as_str) {
                    // Worker-initiated request or notification.
                    if let Some(id) = message.get("id").cloned() {
                        let reply = if method == "ping" {
                            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
                        } else {
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": { "code": -32601, "message": format!("method not supported: {}", method) }
                            })
                        };
                        let _ = reply_tx.send(reply.to_string()).await;
                    }
                    continue;
                }
                match serde_json::from_value::<JsonRpcResponse>(message) {
                    Ok(resp) => {
                        let mut p = reader_pending.lock().await;
                        if let Some(tx) = p.remove(&resp.id) {
                            let _ = tx.send(resp);
                        }
                    }
                    Err(_) => warn!("Unexpected MCP RX [{}]: {}", reader_label, line),
                }
            }
            warn!("Worker stdout closed for [{}]", reader_label);
            write_state(&reader_state, ConnectionState::Disconnected);
            // Dropping the senders fails every pending request.
            reader_pending.lock().await.clear();
        }));

        if let Some(stderr_pipe) = stderr {
            let stderr_log = stderr_buf.clone();
            let stderr_label = label;
            tasks.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stderr_pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut s = stderr_log.lock().await;
                    if s.len() < STDERR_CAPTURE_LIMIT {
                        s.push_str(&line);
                        s.push('\n');
                    }
                    debug!("Worker STDERR [{}]: {}", stderr_label, line);
                }
            }));
        }

        Arc::new(Self {
            user_id,
            service,
            state,
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            pending,
            tx_req,
            stderr: stderr_buf,
            tools: Mutex::new(Vec::new()),
            tasks: std::sync::Mutex::new(tasks),
            call_timeout,
        })
    }

    /// `initialize` → `notifications/initialized` → first `tools/list`.
    pub async fn handshake(&self, timeout: Duration) -> Result<(), ProviderError> {
        write_state(&self.state, ConnectionState::Connecting);

        let outcome = tokio::time::timeout(timeout, async {
            self.initialize(timeout).await?;
            let tools = self.fetch_tools(timeout).await?;
            *self.tools.lock().await = tools;
            Ok::<(), RpcFailure>(())
        })
        .await;

        let reason = match outcome {
            Ok(Ok(())) => {
                write_state(&self.state, ConnectionState::Connected);
                if self.state() == ConnectionState::Connected {
                    let count = self.tools.lock().await.len();
                    info!(user = %self.user_id, service = %self.service, tools = count, "tool worker connected");
                    return Ok(());
                }
                "worker exited during handshake".to_string()
            }
            Ok(Err(failure)) => failure.describe(),
            Err(_elapsed) => "handshake timed out".to_string(),
        };

        write_state(&self.state, ConnectionState::Disconnected);
        let stderr = self.stderr.lock().await.clone();
        error!(
            service = %self.service,
            "tool worker failed to initialize: {}. Stderr: {}",
            reason,
            stderr.trim()
        );
        Err(ProviderError::Connection {
            service: self.service.to_string(),
            reason: if stderr.trim().is_empty() {
                reason
            } else {
                format!("{} (stderr: {})", reason, stderr.trim())
            },
        })
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value, RpcFailure> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        let req_str = serde_json::to_string(&req).map_err(|e| RpcFailure::Transport(e.to_string()))?;
        let (tx, rx) = oneshot::channel();

        self.pending.lock().await.insert(id, tx);

        if self.tx_req.send(req_str).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(RpcFailure::Transport("worker input closed".to_string()));
        }

        let resp = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(RpcFailure::Transport("worker closed the connection".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(RpcFailure::Timeout);
            }
        };

        if let Some(error) = resp.error {
            return Err(RpcFailure::Remote(error));
        }
        resp.result
            .ok_or_else(|| RpcFailure::Remote(json!({ "message": "response missing result" })))
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), RpcFailure> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolhost",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let resp = self.request("initialize", Some(params), timeout).await?;
        debug!("MCP initialized [{}]: {:?}", self.service, resp);

        let notif = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        })
        .to_string();
        self.tx_req
            .send(notif)
            .await
            .map_err(|_| RpcFailure::Transport("worker input closed".to_string()))
    }

    async fn fetch_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, RpcFailure> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, timeout).await?;

            if let Some(tools_arr) = result.get("tools").and_then(Value::as_array) {
                for raw in tools_arr {
                    match serde_json::from_value::<ToolDescriptor>(raw.clone()) {
                        Ok(tool) => tools.push(tool),
                        Err(e) => warn!(service = %self.service, "skipping malformed tool descriptor: {}", e),
                    }
                }
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    fn ensure_connected(&self) -> Result<(), ProviderError> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ProviderError::NotConnected(self.service.to_string()))
        }
    }

    async fn disconnect_inner(&self) {
        write_state(&self.state, ConnectionState::Disconnected);

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(5), child.wait())
                .await
                .is_err()
            {
                warn!(service = %self.service, "tool worker did not exit after kill");
            }
        }

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.pending.lock().await.clear();
    }
}

#[async_trait]
impl ToolProvider for McpConnection {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn service(&self) -> &ServiceTag {
        &self.service
    }

    fn state(&self) -> ConnectionState {
        read_state(&self.state)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError> {
        self.ensure_connected()?;
        // Holding the cache lock keeps concurrent callers to a single fetch.
        let mut cache = self.tools.lock().await;
        if cache.is_empty() {
            let fetched = self.fetch_tools(self.call_timeout).await.map_err(|failure| {
                if matches!(failure, RpcFailure::Transport(_)) {
                    write_state(&self.state, ConnectionState::Disconnected);
                }
                ProviderError::Invocation(format!("tools/list failed: {}", failure.describe()))
            })?;
            *cache = fetched;
        }
        Ok(cache.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProviderError> {
        self.ensure_connected()?;
        let params = json!({
            "name": name,
            "arguments": arguments
        });

        let result = self
            .request("tools/call", Some(params), self.call_timeout)
            .await
            .map_err(|failure| {
                if matches!(failure, RpcFailure::Transport(_)) {
                    write_state(&self.state, ConnectionState::Disconnected);
                }
                ProviderError::Invocation(format!("{}: {}", name, failure.describe()))
            })?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(ProviderError::Invocation(format!(
                "{}: {}",
                name,
                content_text(&result)
            )));
        }
        Ok(result)
    }

    async fn disconnect(&self) {
        self.disconnect_inner().await;
        debug!(user = %self.user_id, service = %self.service, "tool worker disconnected");
    }
}

/// Concatenate the text parts of a `tools/call` result.
pub fn content_text(result: &Value) -> String {
    let parts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if parts.is_empty() {
        result.to_string()
    } else {
        parts.join("\n")
    }
}
