//! Outcome of one render attempt.

use crate::isolated::FrameViewport;
use crate::runtime::{ComponentEngine, EngineFault, UiEvent, VisualTree};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure taxonomy, with wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Candidate does not parse
    SyntaxError,
    /// Candidate references a denylisted capability (validator verdict)
    ForbiddenCapability,
    /// Validated tier refused the candidate
    PolicyViolation,
    /// Candidate threw while compiling, instantiating or rendering
    RuntimeError,
    /// No reply within the configured bound
    Timeout,
    /// Message channel failed or the request was superseded
    ChannelError,
}

impl ErrorKind {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "syntax-error",
            ErrorKind::ForbiddenCapability => "forbidden-capability",
            ErrorKind::PolicyViolation => "policy-violation",
            ErrorKind::RuntimeError => "runtime-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChannelError => "channel-error",
        }
    }

    /// Parse a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "syntax-error" => ErrorKind::SyntaxError,
            "forbidden-capability" => ErrorKind::ForbiddenCapability,
            "policy-violation" => ErrorKind::PolicyViolation,
            "runtime-error" => ErrorKind::RuntimeError,
            "timeout" => ErrorKind::Timeout,
            "channel-error" => ErrorKind::ChannelError,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed attempt. Terminal; nothing retries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Category
    pub kind: ErrorKind,
    /// Human-readable detail (for policy violations, the matched pattern)
    pub message: String,
}

impl Failure {
    /// New failure.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<EngineFault> for Failure {
    fn from(fault: EngineFault) -> Self {
        match fault {
            EngineFault::Interrupted => Failure::new(ErrorKind::Timeout, fault.to_string()),
            other => Failure::new(ErrorKind::RuntimeError, other.to_string()),
        }
    }
}

/// Component rendered in the host context by a direct tier.
pub struct HostView {
    engine: ComponentEngine,
}

impl fmt::Debug for HostView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostView").finish_non_exhaustive()
    }
}

impl HostView {
    pub(crate) fn new(engine: ComponentEngine) -> Self {
        Self { engine }
    }
}

/// Handle on a rendered component.
#[derive(Debug)]
pub enum RenderSurface {
    /// Tree lives in the host's own engine
    Host(HostView),
    /// Tree lives in the nested context; this is a window onto it
    Framed(FrameViewport),
}

impl RenderSurface {
    /// Current rendered output.
    pub fn snapshot(&self) -> Result<VisualTree, Failure> {
        match self {
            RenderSurface::Host(view) => view.engine.tree().map_err(Failure::from),
            RenderSurface::Framed(viewport) => viewport.snapshot(),
        }
    }

    /// Deliver `event` to the element with render id `target`.
    pub fn dispatch(&mut self, target: u32, event: &UiEvent) -> Result<(), Failure> {
        match self {
            RenderSurface::Host(view) => view.engine.dispatch(target, event).map_err(Failure::from),
            RenderSurface::Framed(viewport) => viewport.dispatch(target, event),
        }
    }

    /// Click the clickable element labelled `label`.
    pub fn click_text(&mut self, label: &str) -> Result<(), Failure> {
        let target = self
            .snapshot()?
            .find_clickable(label)
            .ok_or_else(|| Failure::new(ErrorKind::RuntimeError, format!("no clickable element labelled {label:?}")))?;
        self.dispatch(target, &UiEvent::click())
    }

    /// Advance the component's virtual clock.
    pub fn advance_timers(&mut self, ms: u64) -> Result<(), Failure> {
        match self {
            RenderSurface::Host(view) => view.engine.advance_timers(ms).map_err(Failure::from),
            RenderSurface::Framed(viewport) => viewport.advance_timers(ms),
        }
    }

    /// Whether this surface is rendered inside the nested context.
    pub fn is_framed(&self) -> bool {
        matches!(self, RenderSurface::Framed(_))
    }
}

/// Result of one render attempt.
#[derive(Debug)]
pub enum ExecutionResult {
    /// Rendered; interact through the surface
    Rendered(RenderSurface),
    /// Failed; see the failure
    Failed(Failure),
}

impl ExecutionResult {
    pub(crate) fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        ExecutionResult::Failed(Failure::new(kind, message))
    }

    /// The failure, if any.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionResult::Failed(failure) => Some(failure),
            ExecutionResult::Rendered(_) => None,
        }
    }

    /// The surface, if rendered.
    pub fn surface(&self) -> Option<&RenderSurface> {
        match self {
            ExecutionResult::Rendered(surface) => Some(surface),
            ExecutionResult::Failed(_) => None,
        }
    }

    /// The surface, mutably, if rendered.
    pub fn surface_mut(&mut self) -> Option<&mut RenderSurface> {
        match self {
            ExecutionResult::Rendered(surface) => Some(surface),
            ExecutionResult::Failed(_) => None,
        }
    }

    /// Whether the attempt rendered.
    pub fn is_rendered(&self) -> bool {
        matches!(self, ExecutionResult::Rendered(_))
    }

    /// Short status string: `rendered` or the error kind.
    pub fn status(&self) -> &'static str {
        match self {
            ExecutionResult::Rendered(_) => "rendered",
            ExecutionResult::Failed(failure) => failure.kind.as_str(),
        }
    }
}
