//! Request/reply bookkeeping for the isolated executor.
//!
//! [`RenderExchange`] is the per-request state machine and knows nothing
//! about channels. [`PendingReplies`] pairs it with the `oneshot` responder
//! of the single outstanding caller.

use crate::result::{ErrorKind, Failure};
use tokio::sync::oneshot;

/// State of the most recent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Nothing sent yet
    Idle,
    /// Sent, no reply accepted yet
    AwaitingReply(u64),
    /// Reply accepted
    Resolved(u64),
    /// Gave up waiting
    TimedOut(u64),
    /// A newer request replaced it before any reply arrived
    Superseded(u64),
}

/// Sequence allocation and the `Idle → AwaitingReply → {Resolved, TimedOut,
/// Superseded}` transitions.
#[derive(Debug, Clone)]
pub struct RenderExchange {
    last_sequence: u64,
    state: ExchangeState,
    settled: Option<ExchangeState>,
}

impl Default for RenderExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderExchange {
    /// Fresh exchange; the first request gets sequence 1.
    pub fn new() -> Self {
        Self {
            last_sequence: 0,
            state: ExchangeState::Idle,
            settled: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Terminal state of the most recently settled request.
    pub fn last_settled(&self) -> Option<ExchangeState> {
        self.settled
    }

    fn settle(&mut self, state: ExchangeState) {
        self.state = state;
        self.settled = Some(state);
    }

    /// Sequence awaiting a reply, if any.
    pub fn outstanding(&self) -> Option<u64> {
        match self.state {
            ExchangeState::AwaitingReply(sequence) => Some(sequence),
            _ => None,
        }
    }

    /// Start a new request. Returns its sequence and the sequence it
    /// superseded, if one was still awaiting a reply.
    pub fn begin(&mut self) -> (u64, Option<u64>) {
        let superseded = self.outstanding();
        if let Some(old) = superseded {
            self.settle(ExchangeState::Superseded(old));
        }
        self.last_sequence += 1;
        self.state = ExchangeState::AwaitingReply(self.last_sequence);
        (self.last_sequence, superseded)
    }

    /// Accept a reply for `sequence`. False (and no transition) unless it is
    /// the outstanding request.
    pub fn accept(&mut self, sequence: u64) -> bool {
        if self.outstanding() == Some(sequence) {
            self.settle(ExchangeState::Resolved(sequence));
            true
        } else {
            false
        }
    }

    /// Give up on `sequence`. False unless it is the outstanding request.
    pub fn time_out(&mut self, sequence: u64) -> bool {
        if self.outstanding() == Some(sequence) {
            self.settle(ExchangeState::TimedOut(sequence));
            true
        } else {
            false
        }
    }
}

/// What the waiting caller receives.
pub type ReplyOutcome = std::result::Result<(), Failure>;

/// The exchange plus the responder of the outstanding caller.
#[derive(Debug, Default)]
pub struct PendingReplies {
    exchange: RenderExchange,
    responder: Option<(u64, oneshot::Sender<ReplyOutcome>)>,
}

impl PendingReplies {
    /// Start a request. A still-waiting previous caller is told it was
    /// superseded.
    pub fn begin(&mut self) -> (u64, oneshot::Receiver<ReplyOutcome>) {
        let (sequence, superseded) = self.exchange.begin();
        if let (Some(old), Some((_, responder))) = (superseded, self.responder.take()) {
            tracing::debug!(sequence = old, by = sequence, "render request superseded");
            let _ = responder.send(Err(Failure::new(
                ErrorKind::ChannelError,
                format!("request {old} superseded by request {sequence}"),
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.responder = Some((sequence, tx));
        (sequence, rx)
    }

    /// Route a reply. False if it does not answer the outstanding request.
    pub fn resolve(&mut self, sequence: u64, outcome: ReplyOutcome) -> bool {
        if !self.exchange.accept(sequence) {
            return false;
        }
        if let Some((_, responder)) = self.responder.take().filter(|(s, _)| *s == sequence) {
            let _ = responder.send(outcome);
        }
        true
    }

    /// Give up on `sequence`.
    pub fn time_out(&mut self, sequence: u64) -> bool {
        if !self.exchange.time_out(sequence) {
            return false;
        }
        self.responder = None;
        true
    }

    /// Current state.
    pub fn state(&self) -> ExchangeState {
        self.exchange.state()
    }
}
