//! The host page's ambient capabilities, plus instrumentation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Which storage area an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    /// `localStorage`
    Local,
    /// `sessionStorage`
    Session,
}

impl StorageArea {
    /// Global name of the area.
    pub fn global_name(&self) -> &'static str {
        match self {
            StorageArea::Local => "localStorage",
            StorageArea::Session => "sessionStorage",
        }
    }
}

/// One capability use by code running in the host context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityAccess {
    /// Capability, e.g. `localStorage` or `document.cookie`
    pub capability: String,
    /// Operation detail, e.g. `getItem(authToken)`
    pub detail: String,
}

/// A request that left (or tried to leave) the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRequest {
    /// Target URL
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Request body, if any
    pub body: Option<String>,
}

/// What the network answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResponse {
    /// HTTP status
    pub status: u16,
    /// Response body
    pub body: String,
}

/// Console output produced by candidate code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// `log`, `info`, `warn`, `error` or `debug`
    pub level: String,
    /// Space-joined arguments
    pub message: String,
}

/// Outbound network for the host context.
pub trait NetworkGateway: Send + Sync {
    /// Perform `request`.
    fn send(&self, request: &EgressRequest) -> NetworkResponse;
}

/// Gateway that never connects; every request gets `503`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineGateway;

impl NetworkGateway for OfflineGateway {
    fn send(&self, _request: &EgressRequest) -> NetworkResponse {
        NetworkResponse {
            status: 503,
            body: "offline".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    title: String,
    local: BTreeMap<String, String>,
    session: BTreeMap<String, String>,
    cookies: Vec<(String, String)>,
    accesses: Vec<CapabilityAccess>,
    egress: Vec<EgressRequest>,
    console: Vec<ConsoleEntry>,
    dialogs: Vec<String>,
}

impl HostState {
    fn area(&mut self, area: StorageArea) -> &mut BTreeMap<String, String> {
        match area {
            StorageArea::Local => &mut self.local,
            StorageArea::Session => &mut self.session,
        }
    }
}

/// The host page: origin, storage, cookies, title and network, with logs
/// of everything candidate code did with them.
///
/// Only the direct tiers ever see this. The isolated tier's nested context
/// is built without a reference to it.
pub struct HostEnvironment {
    origin: String,
    gateway: Box<dyn NetworkGateway>,
    state: Mutex<HostState>,
    evaluations: AtomicUsize,
}

impl std::fmt::Debug for HostEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnvironment")
            .field("origin", &self.origin)
            .field("evaluations", &self.evaluations())
            .finish_non_exhaustive()
    }
}

impl HostEnvironment {
    /// Start building a host.
    pub fn builder() -> HostEnvironmentBuilder {
        HostEnvironmentBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host origin, e.g. `https://app.example`.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Count one evaluation of candidate code in the host context.
    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
    }

    /// How many times candidate code was evaluated in the host context.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    fn record_access(&self, state: &mut HostState, capability: &str, detail: String) {
        tracing::debug!(capability, %detail, "host capability used");
        state.accesses.push(CapabilityAccess {
            capability: capability.to_string(),
            detail,
        });
    }

    /// Read a storage item.
    pub fn storage_get(&self, area: StorageArea, key: &str) -> Option<String> {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), format!("getItem({key})"));
        state.area(area).get(key).cloned()
    }

    /// Write a storage item.
    pub fn storage_set(&self, area: StorageArea, key: &str, value: &str) {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), format!("setItem({key})"));
        state.area(area).insert(key.to_string(), value.to_string());
    }

    /// Remove a storage item.
    pub fn storage_remove(&self, area: StorageArea, key: &str) {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), format!("removeItem({key})"));
        state.area(area).remove(key);
    }

    /// Empty a storage area.
    pub fn storage_clear(&self, area: StorageArea) {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), "clear()".to_string());
        state.area(area).clear();
    }

    /// Key at `index` in insertion-independent (sorted) order.
    pub fn storage_key(&self, area: StorageArea, index: usize) -> Option<String> {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), format!("key({index})"));
        state.area(area).keys().nth(index).cloned()
    }

    /// Number of items in an area.
    pub fn storage_len(&self, area: StorageArea) -> usize {
        let mut state = self.state();
        self.record_access(&mut state, area.global_name(), "length".to_string());
        state.area(area).len()
    }

    /// `document.cookie` read.
    pub fn cookie_read(&self) -> String {
        let mut state = self.state();
        self.record_access(&mut state, "document.cookie", "read".to_string());
        join_cookies(&state.cookies)
    }

    /// `document.cookie` write. Attributes after the first `;` are ignored.
    pub fn cookie_write(&self, assignment: &str) {
        let mut state = self.state();
        self.record_access(&mut state, "document.cookie", "write".to_string());
        let pair = assignment.split(';').next().unwrap_or_default();
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let (name, value) = (name.trim().to_string(), value.trim().to_string());
        match state.cookies.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = value,
            None => state.cookies.push((name, value)),
        }
    }

    /// Send a request through the gateway, logging it as egress.
    pub fn network_send(&self, request: EgressRequest) -> NetworkResponse {
        {
            let mut state = self.state();
            self.record_access(&mut state, "network", format!("{} {}", request.method, request.url));
            state.egress.push(request.clone());
        }
        tracing::info!(url = %request.url, method = %request.method, "egress from host context");
        self.gateway.send(&request)
    }

    /// Current document title.
    pub fn title(&self) -> String {
        self.state().title.clone()
    }

    /// Set the document title.
    pub fn set_title(&self, title: &str) {
        let mut state = self.state();
        self.record_access(&mut state, "document.title", "write".to_string());
        state.title = title.to_string();
    }

    /// Record console output from candidate code.
    pub fn console(&self, level: &str, message: &str) {
        tracing::info!(target: "genui::console", level, "{message}");
        self.state().console.push(ConsoleEntry {
            level: level.to_string(),
            message: message.to_string(),
        });
    }

    /// Record a modal dialog.
    pub fn dialog(&self, kind: &str, message: &str) {
        let mut state = self.state();
        self.record_access(&mut state, "dialog", kind.to_string());
        state.dialogs.push(message.to_string());
    }

    /// Cookie header as the host would send it.
    pub fn cookie_header(&self) -> String {
        join_cookies(&self.state().cookies)
    }

    /// Copy of a storage area, without logging an access.
    pub fn storage_snapshot(&self, area: StorageArea) -> BTreeMap<String, String> {
        self.state().area(area).clone()
    }

    /// Capability uses so far.
    pub fn accesses(&self) -> Vec<CapabilityAccess> {
        self.state().accesses.clone()
    }

    /// Requests sent so far.
    pub fn egress(&self) -> Vec<EgressRequest> {
        self.state().egress.clone()
    }

    /// Console entries so far.
    pub fn console_entries(&self) -> Vec<ConsoleEntry> {
        self.state().console.clone()
    }

    /// Dialog messages so far.
    pub fn dialogs(&self) -> Vec<String> {
        self.state().dialogs.clone()
    }
}

fn join_cookies(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(n, v)| format!("{n}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Builder for [`HostEnvironment`].
pub struct HostEnvironmentBuilder {
    origin: String,
    gateway: Box<dyn NetworkGateway>,
    state: HostState,
}

impl Default for HostEnvironmentBuilder {
    fn default() -> Self {
        Self {
            origin: "https://preview.localhost".to_string(),
            gateway: Box::new(OfflineGateway),
            state: HostState {
                title: "Preview".to_string(),
                ..Default::default()
            },
        }
    }
}

impl HostEnvironmentBuilder {
    /// Builder: set the origin
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Builder: set the document title
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.state.title = title.into();
        self
    }

    /// Builder: seed a `localStorage` item
    pub fn local_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.local.insert(key.into(), value.into());
        self
    }

    /// Builder: seed a `sessionStorage` item
    pub fn session_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.session.insert(key.into(), value.into());
        self
    }

    /// Builder: seed a cookie
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.state.cookies.push((name.into(), value.into()));
        self
    }

    /// Builder: replace the network gateway
    pub fn gateway(mut self, gateway: impl NetworkGateway + 'static) -> Self {
        self.gateway = Box::new(gateway);
        self
    }

    /// Finish.
    pub fn build(self) -> Arc<HostEnvironment> {
        Arc::new(HostEnvironment {
            origin: self.origin,
            gateway: self.gateway,
            state: Mutex::new(self.state),
            evaluations: AtomicUsize::new(0),
        })
    }
}
