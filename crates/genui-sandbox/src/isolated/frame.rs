//! The nested context: a separately-originated rendering environment.
//!
//! Each [`ThreadFrame`] owns an OS thread. The thread receives posted
//! messages over a `std::sync::mpsc` channel, renders each candidate in a
//! fresh engine built from a sealed capability context, and posts replies
//! to the host's [`MessagePort`] under the opaque origin. The host
//! environment never reaches this thread.

use super::config::IsolationConfig;
use super::wire::{decode_request, Inbound, MessagePort, Origin, RenderReply, RenderRequest};
use crate::capability::{BridgeFault, CapabilityBridge, CapabilityContext, ConsoleEntry};
use crate::compile::{compile, is_js_identifier, CompileErrorKind};
use crate::error::{Result, SandboxError};
use crate::policy::{FramePolicy, SandboxToken};
use crate::result::{ErrorKind, Failure};
use crate::runtime::{ComponentEngine, EngineLimits, KillSwitch, UiEvent, VisualTree};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

static FRAME_IDS: AtomicU64 = AtomicU64::new(1);

/// Stack of each frame thread. The engine's own stack limit sits well
/// below it, so runaway component recursion surfaces as a `RangeError`.
pub const FRAME_STACK_BYTES: usize = 16 * 1024 * 1024;

/// Host-side handle on a mounted nested context.
pub trait NestedFrame: Send {
    /// Deliver one structured message to the frame.
    fn post(&self, data: Value) -> Result<()>;

    /// Window onto whatever request `sequence` rendered.
    fn viewport(&self, sequence: u64) -> FrameViewport;

    /// Stop the frame. Anything it is running is interrupted.
    fn teardown(&mut self);
}

/// Creates nested contexts.
pub trait FrameFactory: Send + Sync {
    /// Mount a frame that replies through `port`.
    fn mount(&self, config: &IsolationConfig, port: MessagePort, journal: Arc<FrameJournal>) -> Result<Box<dyn NestedFrame>>;
}

/// A blocked network request inside the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CspViolation {
    /// Directive that refused it
    pub directive: String,
    /// What was requested
    pub blocked_uri: String,
}

/// What happened inside the frame, as the frame's own devtools would show it.
#[derive(Debug, Default)]
pub struct FrameJournal {
    console: Mutex<Vec<ConsoleEntry>>,
    violations: Mutex<Vec<CspViolation>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FrameJournal {
    /// Console output so far.
    pub fn console(&self) -> Vec<ConsoleEntry> {
        relock(&self.console).clone()
    }

    /// CSP violations so far.
    pub fn violations(&self) -> Vec<CspViolation> {
        relock(&self.violations).clone()
    }
}

/// Capabilities the frame's engine can reach: its own console, violation
/// reports and `parent.postMessage`.
struct FrameBridge {
    port: MessagePort,
    journal: Arc<FrameJournal>,
}

fn str_field<'a>(payload: &'a Value, field: &str) -> std::result::Result<&'a str, BridgeFault> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeFault::type_error(format!("missing string field {field}")))
}

impl CapabilityBridge for FrameBridge {
    fn invoke(&self, op: &str, payload: Value) -> std::result::Result<Value, BridgeFault> {
        match op {
            "console" => {
                let level = str_field(&payload, "level")?;
                let message = str_field(&payload, "message")?;
                match level {
                    "error" => tracing::error!(target: "genui::frame", "{message}"),
                    "warn" => tracing::warn!(target: "genui::frame", "{message}"),
                    "debug" => tracing::debug!(target: "genui::frame", "{message}"),
                    _ => tracing::info!(target: "genui::frame", level, "{message}"),
                }
                relock(&self.journal.console).push(ConsoleEntry {
                    level: level.to_string(),
                    message: message.to_string(),
                });
                Ok(Value::Null)
            }
            "csp.violation" => {
                let violation = CspViolation {
                    directive: str_field(&payload, "directive")?.to_string(),
                    blocked_uri: str_field(&payload, "blockedUri")?.to_string(),
                };
                tracing::warn!(
                    target: "genui::frame",
                    directive = %violation.directive,
                    blocked = %violation.blocked_uri,
                    "refused to connect: violates Content-Security-Policy"
                );
                relock(&self.journal.violations).push(violation);
                Ok(Value::Null)
            }
            "parent.post" => {
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                self.port.post(Origin::Opaque, data);
                Ok(Value::Null)
            }
            "dialog" => {
                let kind = str_field(&payload, "kind")?;
                let message = str_field(&payload, "message")?;
                tracing::info!(target: "genui::frame", kind, "{message}");
                Ok(Value::Null)
            }
            other => Err(BridgeFault::unsupported(other)),
        }
    }
}

enum ViewOp {
    Snapshot,
    Dispatch { target: u32, event: UiEvent },
    Tick { ms: u64 },
}

enum FrameInput {
    Message(Value),
    View {
        sequence: u64,
        op: ViewOp,
        reply: Sender<std::result::Result<VisualTree, Failure>>,
    },
    Close,
}

/// The user's window onto a component rendered inside the frame.
///
/// Every call is a round trip to the frame thread; nothing in the
/// component's tree is shared with the host.
pub struct FrameViewport {
    sequence: u64,
    input: Sender<FrameInput>,
    timeout: Duration,
}

impl fmt::Debug for FrameViewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameViewport")
            .field("sequence", &self.sequence)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FrameViewport {
    fn request(&self, op: ViewOp) -> std::result::Result<VisualTree, Failure> {
        let (reply, answer) = mpsc::channel();
        self.input
            .send(FrameInput::View {
                sequence: self.sequence,
                op,
                reply,
            })
            .map_err(|_| Failure::new(ErrorKind::ChannelError, "nested context has been torn down"))?;
        match answer.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(Failure::new(
                ErrorKind::Timeout,
                format!("nested context did not answer within {} ms", self.timeout.as_millis()),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Failure::new(ErrorKind::ChannelError, "nested context has been torn down"))
            }
        }
    }

    /// A viewport whose frame is already gone; every call fails with
    /// `channel-error`.
    pub fn detached(sequence: u64) -> Self {
        let (input, _) = mpsc::channel();
        Self {
            sequence,
            input,
            timeout: Duration::ZERO,
        }
    }

    /// Request this viewport belongs to.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current rendered output.
    pub fn snapshot(&self) -> std::result::Result<VisualTree, Failure> {
        self.request(ViewOp::Snapshot)
    }

    /// Deliver `event` to element `target`.
    pub fn dispatch(&mut self, target: u32, event: &UiEvent) -> std::result::Result<(), Failure> {
        self.request(ViewOp::Dispatch {
            target,
            event: event.clone(),
        })
        .map(|_| ())
    }

    /// Advance the frame's virtual clock.
    pub fn advance_timers(&mut self, ms: u64) -> std::result::Result<(), Failure> {
        self.request(ViewOp::Tick { ms }).map(|_| ())
    }
}

/// The frame thread's state.
struct NestedContext {
    id: u64,
    policy: FramePolicy,
    limits: EngineLimits,
    bridge: Arc<FrameBridge>,
    port: MessagePort,
    kill: Arc<Mutex<Option<KillSwitch>>>,
    last_sequence: u64,
    current: Option<(u64, ComponentEngine)>,
}

fn compile_failure(kind: CompileErrorKind) -> ErrorKind {
    match kind {
        CompileErrorKind::Syntax => ErrorKind::SyntaxError,
        CompileErrorKind::Transform => ErrorKind::RuntimeError,
    }
}

impl NestedContext {
    fn run(mut self, inbox: Receiver<FrameInput>) {
        tracing::debug!(frame = self.id, "nested context started");
        while let Ok(input) = inbox.recv() {
            match input {
                FrameInput::Message(data) => self.on_message(&data),
                FrameInput::View { sequence, op, reply } => {
                    let _ = reply.send(self.on_view(sequence, op));
                }
                FrameInput::Close => break,
            }
        }
        tracing::debug!(frame = self.id, "nested context stopped");
    }

    fn on_message(&mut self, data: &Value) {
        let request = match decode_request(data) {
            Inbound::Message(request) => request,
            Inbound::Ignored => {
                tracing::debug!(frame = self.id, "ignoring message of unknown type");
                return;
            }
            Inbound::Malformed { sequence, reason } => {
                tracing::debug!(frame = self.id, ?sequence, %reason, "malformed render request");
                if let Some(sequence) = sequence.filter(|s| *s > self.last_sequence) {
                    self.last_sequence = sequence;
                    self.reply(sequence, Err(Failure::new(ErrorKind::ChannelError, reason)));
                }
                return;
            }
        };
        if request.sequence <= self.last_sequence {
            tracing::debug!(frame = self.id, sequence = request.sequence, "ignoring stale render request");
            return;
        }
        self.last_sequence = request.sequence;
        let outcome = self.render(&request);
        self.reply(request.sequence, outcome);
    }

    fn reply(&self, sequence: u64, outcome: std::result::Result<(), Failure>) {
        let reply = RenderReply { sequence, outcome };
        if !self.port.post(Origin::Opaque, reply.to_value()) {
            tracing::debug!(frame = self.id, sequence, "host port closed; reply dropped");
        }
    }

    fn render(&mut self, request: &RenderRequest) -> std::result::Result<(), Failure> {
        self.current = None;
        if !self.policy.sandbox.allows(SandboxToken::AllowScripts) {
            tracing::debug!(frame = self.id, sequence = request.sequence, "scripts blocked by sandbox");
            return Err(Failure::new(
                ErrorKind::RuntimeError,
                "scripts are blocked by the sandbox (no allow-scripts)",
            ));
        }
        let name = request.component_name.as_str();
        if !is_js_identifier(name) {
            return Err(Failure::new(ErrorKind::RuntimeError, format!("invalid component name {name:?}")));
        }
        let unit = compile(&request.source).map_err(|e| Failure::new(compile_failure(e.kind), e.to_string()))?;

        let bridge: Arc<dyn CapabilityBridge> = self.bridge.clone();
        let context = CapabilityContext::sealed(&self.policy, bridge);
        let mut engine = ComponentEngine::new(&context, self.limits.clone())
            .map_err(|e| Failure::new(ErrorKind::RuntimeError, e.to_string()))?;
        *relock(&self.kill) = Some(engine.kill_switch());

        match engine.mount(&unit, name) {
            Ok(()) => {
                tracing::debug!(frame = self.id, sequence = request.sequence, component = name, "rendered in frame");
                self.current = Some((request.sequence, engine));
                Ok(())
            }
            Err(fault) => {
                tracing::debug!(frame = self.id, sequence = request.sequence, %fault, "render failed in frame");
                Err(Failure::from(fault))
            }
        }
    }

    fn on_view(&mut self, sequence: u64, op: ViewOp) -> std::result::Result<VisualTree, Failure> {
        let engine = match &mut self.current {
            Some((current, engine)) if *current == sequence => engine,
            _ => {
                return Err(Failure::new(
                    ErrorKind::ChannelError,
                    format!("request {sequence} is no longer rendered in this frame"),
                ))
            }
        };
        match op {
            ViewOp::Snapshot => {}
            ViewOp::Dispatch { target, event } => engine.dispatch(target, &event)?,
            ViewOp::Tick { ms } => engine.advance_timers(ms)?,
        }
        Ok(engine.tree()?)
    }
}

/// A nested context on its own thread.
pub struct ThreadFrame {
    id: u64,
    input: Sender<FrameInput>,
    kill: Arc<Mutex<Option<KillSwitch>>>,
    timeout: Duration,
    closed: bool,
}

impl NestedFrame for ThreadFrame {
    fn post(&self, data: Value) -> Result<()> {
        self.input
            .send(FrameInput::Message(data))
            .map_err(|_| SandboxError::FrameError(format!("frame {} has exited", self.id)))
    }

    fn viewport(&self, sequence: u64) -> FrameViewport {
        FrameViewport {
            sequence,
            input: self.input.clone(),
            timeout: self.timeout,
        }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(kill) = relock(&self.kill).as_ref() {
            kill.kill();
        }
        let _ = self.input.send(FrameInput::Close);
        tracing::debug!(frame = self.id, "frame torn down");
    }
}

impl Drop for ThreadFrame {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Mounts [`ThreadFrame`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadFrameFactory;

impl FrameFactory for ThreadFrameFactory {
    fn mount(&self, config: &IsolationConfig, port: MessagePort, journal: Arc<FrameJournal>) -> Result<Box<dyn NestedFrame>> {
        let id = FRAME_IDS.fetch_add(1, Ordering::Relaxed);
        let (input, inbox) = mpsc::channel();
        let kill = Arc::new(Mutex::new(None));
        let policy = config.policy.clone();
        let limits = config.frame_limits();
        let bridge = Arc::new(FrameBridge {
            port: port.clone(),
            journal,
        });
        let frame_kill = kill.clone();
        // The engine is not `Send`; the context is assembled on its own thread.
        std::thread::Builder::new()
            .name(format!("genui-frame-{id}"))
            .stack_size(FRAME_STACK_BYTES)
            .spawn(move || {
                NestedContext {
                    id,
                    policy,
                    limits,
                    bridge,
                    port,
                    kill: frame_kill,
                    last_sequence: 0,
                    current: None,
                }
                .run(inbox)
            })?;
        tracing::debug!(frame = id, sandbox = %config.policy.sandbox.attribute_value(), "frame mounted");
        Ok(Box::new(ThreadFrame {
            id,
            input,
            kill,
            timeout: config.reply_timeout(),
            closed: false,
        }))
    }
}
