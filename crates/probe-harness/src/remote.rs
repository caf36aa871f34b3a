//! Stdio remote tool client.
//!
//! A child process speaks newline-delimited JSON-RPC on stdin/stdout. The
//! client performs the `initialize` handshake, lists the server's tools and
//! wraps each one as a [`ToolHandler`] whose `execute` issues `tools/call`.
//! Transport and protocol failures during a call come back as failed tool
//! results, never as errors crossing into the conversation loop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mcp::{
    CallToolParams, CallToolResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, RemoteServerConfig, RemoteToolDef, CLIENT_NAME, PROTOCOL_VERSION,
};
use crate::message::ToolSpec;
use crate::tool::{ToolError, ToolExecutionResult, ToolHandler};

#[derive(Debug, thiserror::Error)]
pub enum McpClientError {
    #[error("failed to start tool server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tool server connection closed")]
    ConnectionClosed,
    #[error("tool server request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("tool server error: {0}")]
    Server(JsonRpcError),
    #[error("invalid tool server reply: {0}")]
    InvalidResponse(String),
    #[error("remote tool client is not connected")]
    NotConnected,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Reply = Result<Value, JsonRpcError>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ===========================================================================
// StdioTransport
// ===========================================================================

/// Request/response multiplexer over a line-oriented byte stream.
///
/// A writer task serializes outgoing lines; a reader task routes replies to
/// waiting callers by request id.
pub struct StdioTransport {
    write_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Start the server process described by `config`.
    pub fn spawn(config: &RemoteServerConfig) -> Result<Self, McpClientError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| McpClientError::Spawn {
            command: config.command.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(McpClientError::ConnectionClosed)?;
        let stdout = child.stdout.take().ok_or(McpClientError::ConnectionClosed)?;

        let mut transport = Self::from_io(stdout, stdin, config.request_timeout);
        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            transport.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{line}");
                }
            }));
        }
        transport.child = tokio::sync::Mutex::new(Some(child));
        info!(server = %config.name, command = %config.command, "tool server started");
        Ok(transport)
    }

    /// Wrap an already-open stream pair.
    pub fn from_io<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        let alive_writer = Arc::clone(&alive);
        let mut writer = writer;
        let writer_task = tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                let sent = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.flush().await
                };
                if let Err(e) = sent.await {
                    warn!(error = %e, "tool server write failed");
                    alive_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let alive_reader = Arc::clone(&alive);
        let pending_reader = Arc::clone(&pending);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_reply(&pending_reader, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "tool server read failed");
                        break;
                    }
                }
            }
            alive_reader.store(false, Ordering::SeqCst);
            // Dropping the senders wakes every waiter with ConnectionClosed.
            lock(&pending_reader).clear();
        });

        Self {
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            timeout,
            tasks: vec![writer_task, reader_task],
            child: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpClientError> {
        if !self.is_alive() {
            return Err(McpClientError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = format!(
            "{}\n",
            serde_json::to_string(&JsonRpcRequest::new(id, method, params))?
        );

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        if self.write_tx.send(line).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(McpClientError::ConnectionClosed);
        }
        debug!(id, method, "tool server request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(McpClientError::Server(err)),
            Ok(Err(_)) => Err(McpClientError::ConnectionClosed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(McpClientError::Timeout {
                    method: method.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpClientError> {
        if !self.is_alive() {
            return Err(McpClientError::ConnectionClosed);
        }
        let line = format!(
            "{}\n",
            serde_json::to_string(&JsonRpcRequest::notification(method, params))?
        );
        self.write_tx
            .send(line)
            .await
            .map_err(|_| McpClientError::ConnectionClosed)
    }

    /// Stop the I/O tasks and kill the server process, if any.
    pub async fn shutdown(&self) -> Result<(), McpClientError> {
        self.alive.store(false, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        lock(&self.pending).clear();
        if let Some(mut child) = self.child.lock().await.take() {
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn route_reply(pending: &PendingMap, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let reply: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(reply) => reply,
        Err(e) => {
            debug!(error = %e, line, "ignoring unparseable tool server line");
            return;
        }
    };
    let Some(id) = reply.request_id() else {
        return;
    };
    if let Some(tx) = lock(pending).remove(&id) {
        let _ = tx.send(reply.into_result());
    }
}

// ===========================================================================
// RemoteToolClient
// ===========================================================================

/// Session with one tool server. Restartable via [`RemoteToolClient::reconfigure`].
pub struct RemoteToolClient {
    config: RemoteServerConfig,
    transport: Option<Arc<StdioTransport>>,
}

impl RemoteToolClient {
    pub fn new(config: RemoteServerConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Attach an existing transport and run the handshake on it.
    pub async fn with_transport(
        config: RemoteServerConfig,
        transport: StdioTransport,
    ) -> Result<Self, McpClientError> {
        let transport = Arc::new(transport);
        handshake(&transport).await?;
        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    pub fn config(&self) -> &RemoteServerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_alive())
    }

    /// Start the server and open a session. No-op when already connected.
    pub async fn connect(&mut self) -> Result<(), McpClientError> {
        if self.is_connected() {
            return Ok(());
        }
        let transport = Arc::new(StdioTransport::spawn(&self.config)?);
        if let Err(e) = handshake(&transport).await {
            let _ = transport.shutdown().await;
            return Err(e);
        }
        self.transport = Some(transport);
        Ok(())
    }

    /// `tools/list`, each entry wrapped as a local tool handler.
    pub async fn discover(&self) -> Result<Vec<Arc<dyn ToolHandler>>, McpClientError> {
        let transport = self.transport.as_ref().ok_or(McpClientError::NotConnected)?;
        let listed = transport.request("tools/list", Some(json!({}))).await?;
        let listed: ListToolsResult = serde_json::from_value(listed)
            .map_err(|e| McpClientError::InvalidResponse(format!("tools/list: {e}")))?;
        info!(server = %self.config.name, tools = listed.tools.len(), "discovered remote tools");

        Ok(listed
            .tools
            .into_iter()
            .map(|def| {
                Arc::new(RemoteTool {
                    def,
                    transport: Arc::clone(transport),
                }) as Arc<dyn ToolHandler>
            })
            .collect())
    }

    /// Tear down the current session and start a new one with `config`.
    pub async fn reconfigure(&mut self, config: RemoteServerConfig) -> Result<(), McpClientError> {
        info!(server = %config.name, "reconfiguring tool server");
        self.shutdown().await;
        self.config = config;
        self.connect().await
    }

    /// Close the session. Failures are logged.
    pub async fn shutdown(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        match transport.shutdown().await {
            Ok(()) => debug!(server = %self.config.name, "tool server stopped"),
            Err(e) => warn!(server = %self.config.name, error = %e, "tool server shutdown failed"),
        }
    }
}

async fn handshake(transport: &StdioTransport) -> Result<(), McpClientError> {
    transport
        .request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
            })),
        )
        .await?;
    transport.notify("notifications/initialized", None).await
}

// ===========================================================================
// RemoteTool
// ===========================================================================

/// A tool hosted by the server; `execute` issues `tools/call`.
pub struct RemoteTool {
    def: RemoteToolDef,
    transport: Arc<StdioTransport>,
}

#[async_trait]
impl ToolHandler for RemoteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.def.name.clone(),
            description: self.def.description.clone(),
            parameters: self.def.input_schema.clone(),
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolExecutionResult, ToolError> {
        let params = serde_json::to_value(CallToolParams {
            name: self.def.name.clone(),
            arguments: args,
        })
        .map_err(|e| ToolError::InvalidArgs(e.to_string()))?;

        let reply = match self.transport.request("tools/call", Some(params)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(tool = %self.def.name, error = %e, "remote tool call failed");
                return Ok(ToolExecutionResult::failed(e.to_string()).with_code("REMOTE_ERROR"));
            }
        };
        let result: CallToolResult = match serde_json::from_value(reply) {
            Ok(result) => result,
            Err(e) => {
                return Ok(ToolExecutionResult::failed(format!("invalid tools/call reply: {e}"))
                    .with_code("REMOTE_PROTOCOL"))
            }
        };

        let text = result.text();
        if result.is_error {
            Ok(ToolExecutionResult::failed(text).with_code("REMOTE_TOOL_ERROR"))
        } else {
            Ok(ToolExecutionResult::ok(text))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let config = RemoteServerConfig::new("missing", "/definitely/not/a/binary");
        let mut client = RemoteToolClient::new(config);
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, McpClientError::Spawn { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn discover_requires_connection() {
        let client = RemoteToolClient::new(RemoteServerConfig::new("x", "true"));
        assert!(matches!(
            client.discover().await,
            Err(McpClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn shutdown_without_session_is_a_no_op() {
        let mut client = RemoteToolClient::new(RemoteServerConfig::new("x", "true"));
        client.shutdown().await;
        assert!(!client.is_connected());
    }

    #[test]
    fn replies_route_by_id() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        lock(&pending).insert(4, tx);
        route_reply(&pending, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        route_reply(&pending, "not json");
        assert!(rx.try_recv().is_err());
        route_reply(&pending, r#"{"jsonrpc":"2.0","id":4,"result":{"ok":true}}"#);
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"ok": true}));
        assert!(lock(&pending).is_empty());
    }
}
