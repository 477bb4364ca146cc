//! Wire types for the Odoo JSON-RPC endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC 2.0 request envelope.
///
/// Odoo exposes one endpoint (`/jsonrpc`) where `method` is always `"call"`
/// and the routing lives in `params.service` / `params.method`.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: CallParams,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(service: &'static str, method: String, args: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: "call",
            params: CallParams {
                service,
                method,
                args,
            },
            id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CallParams {
    pub service: &'static str,
    pub method: String,
    pub args: Vec<Value>,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcFault>,
}

/// The `error` member of a failed JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcFault {
    pub code: i64,
    pub message: String,
    pub data: Option<FaultData>,
}

impl JsonRpcFault {
    /// Best human-readable description of the fault.
    ///
    /// Odoo puts the useful text (e.g. "ValidationError: ...") in
    /// `data.message`; the top-level `message` is usually just
    /// "Odoo Server Error".
    pub fn description(&self) -> String {
        match &self.data {
            Some(data) => match (&data.name, &data.message) {
                (Some(name), Some(msg)) => format!("{}: {}", name, msg),
                (None, Some(msg)) => msg.clone(),
                _ => self.message.clone(),
            },
            None => self.message.clone(),
        }
    }
}

/// Server-side exception details attached to a fault.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultData {
    pub name: Option<String>,
    pub message: Option<String>,
    pub debug: Option<String>,
}
