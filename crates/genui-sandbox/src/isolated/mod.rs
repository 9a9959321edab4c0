//! Isolated execution: the candidate renders inside a nested context.
//!
//! ## Security Model
//!
//! - **Separate origin**: the nested context has the opaque origin `"null"`;
//!   storage, cookies and parent traversal throw `SecurityError`
//! - **No network**: `connect-src 'none'`; `fetch` rejects and files a CSP
//!   violation
//! - **Message passing only**: the host sends one render request and accepts
//!   exactly one reply, matched on origin and sequence number
//! - **Bounded**: replies that do not arrive within the configured timeout
//!   fail the request, and the nested context is torn down and remounted
//!
//! ## Usage
//!
//! ```rust,ignore
//! use genui_sandbox::{sanitize, IsolatedExecutor, IsolationConfig};
//!
//! let executor = IsolatedExecutor::mount(IsolationConfig::default())?;
//! let mut result = executor.render(sanitize(raw), "SafeCounter").await;
//! if let Some(surface) = result.surface_mut() {
//!     surface.click_text("Increment")?;
//! }
//! ```

mod config;
mod exchange;
mod frame;
mod wire;

pub use config::IsolationConfig;
pub use exchange::{ExchangeState, PendingReplies, RenderExchange, ReplyOutcome};
pub use frame::{
    CspViolation, FrameFactory, FrameJournal, FrameViewport, NestedFrame, ThreadFrame, ThreadFrameFactory,
};
pub use wire::{decode_reply, decode_request, Inbound, MessagePort, Origin, PostedMessage, RenderReply, RenderRequest};

use crate::error::{Result, SandboxError};
use crate::result::{ErrorKind, ExecutionResult, Failure, RenderSurface};
use crate::sanitize::SourceCandidate;
use crate::Tier;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Routes inbox traffic to the outstanding request.
async fn listen(mut inbox: mpsc::UnboundedReceiver<PostedMessage>, pending: Arc<Mutex<PendingReplies>>) {
    while let Some(posted) = inbox.recv().await {
        if posted.origin != Origin::Opaque {
            tracing::debug!(origin = %posted.origin, "dropping message from unexpected origin");
            continue;
        }
        match decode_reply(&posted.data) {
            Inbound::Message(reply) => {
                let sequence = reply.sequence;
                if !relock(&pending).resolve(sequence, reply.outcome) {
                    tracing::debug!(sequence, "dropping reply that matches no outstanding request");
                }
            }
            Inbound::Malformed {
                sequence: Some(sequence),
                reason,
            } => {
                let failure = Failure::new(ErrorKind::ChannelError, reason);
                if !relock(&pending).resolve(sequence, Err(failure)) {
                    tracing::debug!(sequence, "dropping malformed reply for no outstanding request");
                }
            }
            Inbound::Malformed { sequence: None, reason } => {
                tracing::debug!(%reason, "dropping malformed reply");
            }
            Inbound::Ignored => tracing::debug!("ignoring message of unknown type"),
        }
    }
}

/// Renders candidates inside a sandboxed nested context.
///
/// Mounting needs a tokio runtime: a listener task owns the host inbox for
/// as long as the executor lives.
pub struct IsolatedExecutor {
    config: IsolationConfig,
    factory: Arc<dyn FrameFactory>,
    port: MessagePort,
    frame: Mutex<Option<Box<dyn NestedFrame>>>,
    pending: Arc<Mutex<PendingReplies>>,
    journal: Arc<FrameJournal>,
    listener: JoinHandle<()>,
}

impl fmt::Debug for IsolatedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedExecutor")
            .field("config", &self.config)
            .field("state", &relock(&self.pending).state())
            .finish_non_exhaustive()
    }
}

impl IsolatedExecutor {
    /// Mount a thread-backed nested context.
    pub fn mount(config: IsolationConfig) -> Result<Self> {
        Self::mount_with(config, Arc::new(ThreadFrameFactory))
    }

    /// Mount a nested context from `factory`.
    pub fn mount_with(config: IsolationConfig, factory: Arc<dyn FrameFactory>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SandboxError::UnsupportedTier(Tier::Isolated, "needs a tokio runtime".into()))?;

        let (port, inbox) = MessagePort::channel();
        let journal = Arc::new(FrameJournal::default());
        let frame = factory.mount(&config, port.clone(), journal.clone())?;
        let pending = Arc::new(Mutex::new(PendingReplies::default()));
        let listener = runtime.spawn(listen(inbox, pending.clone()));

        tracing::info!(
            sandbox = %config.policy.sandbox.attribute_value(),
            reply_timeout_ms = config.reply_timeout_ms,
            "isolated executor mounted"
        );
        Ok(Self {
            config,
            factory,
            port,
            frame: Mutex::new(Some(frame)),
            pending,
            journal,
            listener,
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Console output and CSP violations from inside the frame.
    pub fn journal(&self) -> &FrameJournal {
        &self.journal
    }

    /// State of the most recent request.
    pub fn exchange_state(&self) -> ExchangeState {
        relock(&self.pending).state()
    }

    fn remount(&self, slot: &mut Option<Box<dyn NestedFrame>>) {
        if let Some(mut old) = slot.take() {
            old.teardown();
        }
        match self.factory.mount(&self.config, self.port.clone(), self.journal.clone()) {
            Ok(frame) => {
                tracing::info!("nested context remounted");
                *slot = Some(frame);
            }
            Err(e) => tracing::warn!(error = %e, "failed to remount nested context"),
        }
    }

    fn post(&self, data: serde_json::Value) -> Result<()> {
        let mut slot = relock(&self.frame);
        if let Some(frame) = slot.as_ref() {
            match frame.post(data.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => tracing::warn!(error = %e, "nested context unreachable"),
            }
        }
        self.remount(&mut slot);
        match slot.as_ref() {
            Some(frame) => frame.post(data),
            None => Err(SandboxError::FrameError("nested context is not mounted".into())),
        }
    }

    /// Render `candidate` as component `name` inside the nested context.
    ///
    /// Starting a render supersedes one still in flight: that caller resolves
    /// to `channel-error`.
    pub async fn render(&self, candidate: SourceCandidate, name: &str) -> ExecutionResult {
        let (sequence, reply) = relock(&self.pending).begin();
        let request = RenderRequest {
            sequence,
            source: candidate.into_string(),
            component_name: name.to_string(),
        };
        tracing::debug!(sequence, component = name, "posting render request");

        if let Err(e) = self.post(request.to_value()) {
            relock(&self.pending).time_out(sequence);
            return ExecutionResult::failed(ErrorKind::ChannelError, e.to_string());
        }

        match tokio::time::timeout(self.config.reply_timeout(), reply).await {
            Ok(Ok(Ok(()))) => {
                let viewport = match relock(&self.frame).as_ref() {
                    Some(frame) => frame.viewport(sequence),
                    None => FrameViewport::detached(sequence),
                };
                ExecutionResult::Rendered(RenderSurface::Framed(viewport))
            }
            Ok(Ok(Err(failure))) => {
                tracing::debug!(sequence, %failure, "frame reported failure");
                ExecutionResult::Failed(failure)
            }
            Ok(Err(_)) => ExecutionResult::failed(ErrorKind::ChannelError, format!("reply channel for request {sequence} closed")),
            Err(_) => {
                if relock(&self.pending).time_out(sequence) {
                    tracing::warn!(sequence, timeout_ms = self.config.reply_timeout_ms, "no reply from nested context");
                    self.remount(&mut relock(&self.frame));
                }
                ExecutionResult::failed(
                    ErrorKind::Timeout,
                    format!("no reply to request {sequence} within {} ms", self.config.reply_timeout_ms),
                )
            }
        }
    }
}

impl Drop for IsolatedExecutor {
    fn drop(&mut self) {
        self.listener.abort();
        if let Some(mut frame) = relock(&self.frame).take() {
            frame.teardown();
        }
    }
}

#[cfg(test)]
mod tests;
