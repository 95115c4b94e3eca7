//! Wire shapes of both bridge channels.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Sandbox bridge: deep access to host globals.
pub const RPC_CHANNEL: &str = "hb_higanbana_rpc_v1";
pub const RPC_REQ: &str = "HB_BRIDGE_RPC_REQ";
pub const RPC_RES: &str = "HB_BRIDGE_RPC_RES";

/// Host-page bridge: enveloped project and CSRF operations.
pub const HTML_BRIDGE_CHANNEL: &str = "hb_higanbana_html_bridge_v1";
pub const ENVELOPE_TAG: &str = "higanbana";
pub const ENVELOPE_VERSION: u64 = 1;

pub const IFRAME_HEIGHT: &str = "HB_IFRAME_HEIGHT";
pub const SKIP_WAITING: &str = "HB_SKIP_WAITING";

pub const FUNCTION_MARKER: &str = "__hb_rpc_function__";
pub const OBJECT_MARKER: &str = "__hb_rpc_object__";
pub const UNSERIALIZABLE_MARKER: &str = "__hb_rpc_unserializable__";
pub const CYCLE_MARKER: &str = "__hb_rpc_cycle__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub root: String,
    pub path: Vec<String>,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn success(id: String, client_id: Option<String>, result: Value) -> Self {
        Self {
            kind: RPC_RES.to_string(),
            id,
            client_id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: String, client_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            kind: RPC_RES.to_string(),
            id,
            client_id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Lazy handle on something the host could not send by value.
pub fn reference_descriptor(marker: &str, root: &str, path: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert(marker.to_string(), Value::Bool(true));
    obj.insert("root".to_string(), json!(root));
    obj.insert("path".to_string(), json!(path));
    Value::Object(obj)
}

/// `(root, path)` of a function/object descriptor, if `value` is one.
pub fn parse_reference_descriptor(value: &Value) -> Option<(String, Vec<String>)> {
    let obj = value.as_object()?;
    let marked = [FUNCTION_MARKER, OBJECT_MARKER]
        .iter()
        .any(|m| obj.get(*m) == Some(&Value::Bool(true)));
    if !marked {
        return None;
    }
    let root = obj.get("root")?.as_str()?.trim();
    if root.is_empty() {
        return None;
    }
    let path = obj
        .get("path")
        .and_then(Value::as_array)
        .map(|p| {
            p.iter()
                .map(|s| match s {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    Some((root.to_string(), path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOp {
    GetCsrfToken,
    CallStApi,
    GetProject,
    CreateProject,
    UpdateProject,
    DeleteProject,
}

impl BridgeOp {
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "getCsrfToken" => Self::GetCsrfToken,
            "callSTAPI" => Self::CallStApi,
            "getProject" => Self::GetProject,
            "createProject" => Self::CreateProject,
            "updateProject" => Self::UpdateProject,
            "deleteProject" => Self::DeleteProject,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetCsrfToken => "getCsrfToken",
            Self::CallStApi => "callSTAPI",
            Self::GetProject => "getProject",
            Self::CreateProject => "createProject",
            Self::UpdateProject => "updateProject",
            Self::DeleteProject => "deleteProject",
        }
    }

    /// Ops that overwrite or remove card data.
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::UpdateProject | Self::DeleteProject)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    #[serde(rename = "__hb")]
    pub tag: String,
    pub v: u64,
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub op: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl BridgeRequest {
    pub fn new(id: impl Into<String>, op: BridgeOp, payload: Value) -> Self {
        Self {
            tag: ENVELOPE_TAG.to_string(),
            v: ENVELOPE_VERSION,
            kind: "req".to_string(),
            id: id.into(),
            op: op.as_str().to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    #[serde(rename = "__hb")]
    pub tag: String,
    pub v: u64,
    pub kind: String,
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    fn base(id: &str) -> Self {
        Self {
            tag: ENVELOPE_TAG.to_string(),
            v: ENVELOPE_VERSION,
            kind: "res".to_string(),
            id: id.to_string(),
            ok: false,
            data: None,
            error: None,
        }
    }

    pub fn success(id: &str, data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            ..Self::base(id)
        }
    }

    pub fn failure(id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(id)
        }
    }
}

/// Envelope check shared by both ends of the host-page channel.
pub fn is_envelope(data: &Value, kind: &str) -> bool {
    data.get("__hb").and_then(Value::as_str) == Some(ENVELOPE_TAG)
        && data.get("v").and_then(Value::as_u64) == Some(ENVELOPE_VERSION)
        && data.get("kind").and_then(Value::as_str) == Some(kind)
}
