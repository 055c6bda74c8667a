use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tomb_core::TurnRequest;
use tomb_game::{GameSession, TurnService};
use uuid::Uuid;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes.
pub const ERR_PARSE: i64 = -32700;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
pub const ERR_INTERNAL: i64 = -32603;

// Application-level error codes.
pub const ERR_SESSION_NOT_FOUND: i64 = -32000;
pub const ERR_ENGINE_FAILURE: i64 = -32001;

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Value,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// A handler failure that maps onto a specific JSON-RPC error code.
///
/// Any other error returned by a handler is reported as [`ERR_INTERNAL`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Trait for handling JSON-RPC method dispatching.
pub trait RpcHandler {
    fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

/// Run a JSON-RPC 2.0 server over stdio (newline-delimited JSON).
pub fn run_stdio_server(handler: &dyn RpcHandler) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(handler, stdin.lock(), stdout.lock())
}

/// Serve newline-delimited requests from `reader` until EOF or `shutdown`.
pub fn serve(handler: &dyn RpcHandler, reader: impl BufRead, mut writer: impl Write) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
            Ok(req) => {
                if req.method == "shutdown" {
                    let resp = JsonRpcResponse::success(req.id, json!({"ok": true}));
                    let out = serde_json::to_string(&resp)?;
                    writeln!(writer, "{out}")?;
                    writer.flush()?;
                    return Ok(());
                }
                match handler.handle(&req.method, req.params) {
                    Ok(result) => JsonRpcResponse::success(req.id, result),
                    Err(e) => match e.downcast::<RpcError>() {
                        Ok(rpc) => JsonRpcResponse::error_with_data(
                            req.id,
                            rpc.code,
                            rpc.message,
                            rpc.data,
                        ),
                        Err(e) => JsonRpcResponse::error(req.id, ERR_INTERNAL, e.to_string()),
                    },
                }
            }
            Err(_) => JsonRpcResponse::error(Value::Null, ERR_PARSE, "Parse error"),
        };

        let out = serde_json::to_string(&response)?;
        writeln!(writer, "{out}")?;
        writer.flush()?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Game handler: many independent sessions over one turn service
// ---------------------------------------------------------------------------

/// Hosts game sessions keyed by id. Sessions share the turn service and nothing else.
pub struct GameRpcHandler {
    service: Arc<TurnService>,
    advance_delay: Duration,
    sessions: Mutex<HashMap<Uuid, GameSession>>,
}

impl GameRpcHandler {
    pub fn new(service: Arc<TurnService>, advance_delay: Duration) -> Self {
        Self {
            service,
            advance_delay,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, GameSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clones the session handle so the map lock is not held across an engine call.
    fn session(&self, params: &Value) -> Result<GameSession> {
        let session_id = require_uuid(params, "session_id")?;
        self.sessions().get(&session_id).cloned().ok_or_else(|| {
            RpcError::new(
                ERR_SESSION_NOT_FOUND,
                format!("session not found: {session_id}"),
            )
            .into()
        })
    }

    // -- Session methods --

    fn handle_session_open(&self, _params: Value) -> Result<Value> {
        let session = GameSession::new(Arc::clone(&self.service), self.advance_delay);
        self.sessions().insert(session.id(), session.clone());
        let init = session.initialize();
        let snapshot = session.snapshot();
        Ok(json!({
            "session_id": snapshot.session_id.to_string(),
            "init": init,
            "state": snapshot.state,
            "phase": snapshot.phase,
            "transcript": snapshot.transcript,
        }))
    }

    fn handle_session_submit(&self, params: Value) -> Result<Value> {
        let session = self.session(&params)?;
        let input = params
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::new(ERR_INVALID_PARAMS, "missing 'input' parameter"))?;
        let wait = params
            .get("wait_for_init")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let offset = session.transcript_len();
        let outcome = session.submit(input);
        let scheduled = if wait {
            session.wait_for_scheduled()
        } else {
            Vec::new()
        };
        Ok(json!({
            "session_id": session.id().to_string(),
            "outcome": outcome,
            "scheduled": scheduled,
            "state": session.state(),
            "turns": session.turns_since(offset),
        }))
    }

    fn handle_session_state(&self, params: Value) -> Result<Value> {
        let snapshot = self.session(&params)?.snapshot();
        Ok(json!({
            "session_id": snapshot.session_id.to_string(),
            "state": snapshot.state,
            "phase": snapshot.phase,
        }))
    }

    fn handle_session_transcript(&self, params: Value) -> Result<Value> {
        let session = self.session(&params)?;
        let since = params
            .get("since")
            .and_then(|v| v.as_u64())
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(0);
        let turns = session.turns_since(since);
        Ok(json!({
            "session_id": session.id().to_string(),
            "since": since,
            "turns": turns,
        }))
    }

    fn handle_session_close(&self, params: Value) -> Result<Value> {
        let session_id = require_uuid(&params, "session_id")?;
        let removed = self.sessions().remove(&session_id);
        let Some(session) = removed else {
            return Err(RpcError::new(
                ERR_SESSION_NOT_FOUND,
                format!("session not found: {session_id}"),
            )
            .into());
        };
        session.wait_for_scheduled();
        Ok(json!({
            "session_id": session_id.to_string(),
            "closed": true,
        }))
    }

    // -- Stateless turn --

    fn handle_turn(&self, params: Value) -> Result<Value> {
        let request: TurnRequest = serde_json::from_value(params)
            .map_err(|e| RpcError::new(ERR_INVALID_PARAMS, format!("invalid turn request: {e}")))?;
        match self.service.handle_turn(Uuid::now_v7(), &request) {
            Ok(reply) => Ok(serde_json::to_value(reply.result)?),
            Err(err) => Err(RpcError::new(ERR_ENGINE_FAILURE, err.narrator_message())
                .with_data(json!({
                    "kind": err.kind(),
                    "detail": err.to_string(),
                }))
                .into()),
        }
    }
}

impl RpcHandler for GameRpcHandler {
    fn handle(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            // Basic lifecycle
            "initialize" => Ok(json!({
                "name": "tomb",
                "version": env!("CARGO_PKG_VERSION"),
                "levels": self.service.catalog().level_count(),
                "capabilities": [
                    "session/open", "session/submit", "session/state",
                    "session/transcript", "session/close",
                    "turn",
                    "status", "shutdown"
                ]
            })),
            "status" => Ok(json!({
                "status": "ready",
                "sessions": self.sessions().len(),
            })),

            // Session management
            "session/open" => self.handle_session_open(params),
            "session/submit" => self.handle_session_submit(params),
            "session/state" => self.handle_session_state(params),
            "session/transcript" => self.handle_session_transcript(params),
            "session/close" => self.handle_session_close(params),

            // Stateless request/response
            "turn" => self.handle_turn(params),

            _ => Err(
                RpcError::new(ERR_METHOD_NOT_FOUND, format!("method not found: {method}")).into(),
            ),
        }
    }
}

/// Extract a UUID from a JSON params object.
fn require_uuid(params: &Value, field: &str) -> Result<Uuid> {
    let s = params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            RpcError::new(ERR_INVALID_PARAMS, format!("missing '{field}' parameter"))
        })?;
    Uuid::parse_str(s).map_err(|e| {
        anyhow!(RpcError::new(
            ERR_INVALID_PARAMS,
            format!("invalid UUID for '{field}': {e}"),
        ))
    })
}
