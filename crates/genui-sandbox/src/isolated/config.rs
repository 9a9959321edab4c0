//! Configuration for the isolated executor.

use crate::error::{Result, SandboxError};
use crate::policy::{FramePolicy, SandboxToken};
use crate::runtime::EngineLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the nested context is created and how long the host waits on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// How long the host waits for a render reply before giving up and
    /// remounting the nested context
    pub reply_timeout_ms: u64,

    /// Wall-clock budget per script run inside the nested context; a runaway
    /// candidate is interrupted and reported as `timeout` by the frame itself
    pub render_budget_ms: u64,

    /// Sandbox attributes and CSP of the nested context
    pub policy: FramePolicy,

    /// Engine limits inside the nested context (the budget above overrides
    /// `budget_ms`)
    pub engine: EngineLimits,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5_000,
            render_budget_ms: 2_000,
            policy: FramePolicy::default(),
            engine: EngineLimits::default(),
        }
    }
}

impl IsolationConfig {
    /// Short bounds, for tests and interactive previews.
    pub fn fast() -> Self {
        Self {
            reply_timeout_ms: 1_000,
            render_budget_ms: 250,
            ..Default::default()
        }
    }

    /// Builder: set the reply timeout
    pub fn reply_timeout_ms(mut self, ms: u64) -> Self {
        self.reply_timeout_ms = ms;
        self
    }

    /// Builder: set the in-frame render budget
    pub fn render_budget_ms(mut self, ms: u64) -> Self {
        self.render_budget_ms = ms;
        self
    }

    /// Builder: set the frame policy
    pub fn policy(mut self, policy: FramePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder: set the in-frame engine limits
    pub fn engine(mut self, limits: EngineLimits) -> Self {
        self.engine = limits;
        self
    }

    /// Reply timeout as a duration.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Limits each in-frame engine is created with.
    pub fn frame_limits(&self) -> EngineLimits {
        self.engine.clone().with_budget(Duration::from_millis(self.render_budget_ms))
    }

    /// Reject bounds the executor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.reply_timeout_ms == 0 {
            return Err(SandboxError::ConfigError("reply_timeout_ms must be positive".into()));
        }
        if self.render_budget_ms == 0 {
            return Err(SandboxError::ConfigError("render_budget_ms must be positive".into()));
        }
        if self.render_budget_ms >= self.reply_timeout_ms {
            tracing::warn!(
                render_budget_ms = self.render_budget_ms,
                reply_timeout_ms = self.reply_timeout_ms,
                "render budget is not below the reply timeout; runaway candidates will surface as host timeouts"
            );
        }
        if !self.policy.sandbox.allows(SandboxToken::AllowScripts) {
            tracing::warn!(
                sandbox = %self.policy.sandbox.attribute_value(),
                "sandbox lacks allow-scripts; every render will fail"
            );
        }
        self.policy.csp.validate()
    }
}
