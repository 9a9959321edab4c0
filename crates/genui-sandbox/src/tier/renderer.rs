//! Renderer facade and builder.

use super::{PreviewConfig, Tier};
use crate::capability::HostEnvironment;
use crate::direct::{UnsafeDirectExecutor, ValidatedDirectExecutor};
use crate::error::Result;
use crate::isolated::IsolatedExecutor;
use crate::policy::CapabilityDenylist;
use crate::result::ExecutionResult;
use crate::sanitize::{sanitize, SourceCandidate};
use std::sync::Arc;

enum Executor {
    Original(UnsafeDirectExecutor),
    Enhanced(ValidatedDirectExecutor),
    Isolated(IsolatedExecutor),
}

/// One mounted tier, ready to render candidates.
pub struct PreviewRenderer {
    tier: Tier,
    host: Arc<HostEnvironment>,
    executor: Executor,
}

impl std::fmt::Debug for PreviewRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewRenderer")
            .field("tier", &self.tier)
            .field("origin", &self.host.origin())
            .finish_non_exhaustive()
    }
}

impl PreviewRenderer {
    /// Create a new renderer builder
    pub fn builder() -> PreviewRendererBuilder {
        PreviewRendererBuilder::new()
    }

    /// Tier this renderer executes with.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Host page the direct tiers run against.
    pub fn host(&self) -> &Arc<HostEnvironment> {
        &self.host
    }

    /// The isolated executor, when this renderer is mounted on that tier.
    pub fn isolated(&self) -> Option<&IsolatedExecutor> {
        match &self.executor {
            Executor::Isolated(executor) => Some(executor),
            _ => None,
        }
    }

    /// Render an already sanitized candidate.
    pub async fn render(&self, candidate: SourceCandidate, component: &str) -> ExecutionResult {
        let result = match &self.executor {
            Executor::Original(executor) => executor.render(candidate, component),
            Executor::Enhanced(executor) => executor.render(candidate, component),
            Executor::Isolated(executor) => executor.render(candidate, component).await,
        };
        tracing::info!(tier = %self.tier, component, status = result.status(), "render finished");
        result
    }

    /// Sanitize raw generated text, then render it.
    pub async fn render_generated(&self, raw: &str, component: &str) -> ExecutionResult {
        self.render(sanitize(raw), component).await
    }
}

/// Builder for [`PreviewRenderer`]
#[derive(Debug, Clone)]
pub struct PreviewRendererBuilder {
    tier: Tier,
    host: Option<Arc<HostEnvironment>>,
    config: PreviewConfig,
    denylist: Option<CapabilityDenylist>,
}

impl PreviewRendererBuilder {
    /// Builder for the isolated tier with default configuration
    pub fn new() -> Self {
        Self {
            tier: Tier::Isolated,
            host: None,
            config: PreviewConfig::default(),
            denylist: None,
        }
    }

    /// Set the tier
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the host page the direct tiers run against
    pub fn host(mut self, host: Arc<HostEnvironment>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set engine and isolation configuration
    pub fn config(mut self, config: PreviewConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate with a custom denylist (enhanced tier)
    pub fn denylist(mut self, denylist: CapabilityDenylist) -> Self {
        self.denylist = Some(denylist);
        self
    }

    /// Mount the tier. The isolated tier must be built inside a tokio runtime.
    pub fn build(self) -> Result<PreviewRenderer> {
        let host = self.host.unwrap_or_else(|| HostEnvironment::builder().build());
        let engine = self.config.engine;
        let executor = match self.tier {
            Tier::Original => Executor::Original(UnsafeDirectExecutor::with_limits(host.clone(), engine)),
            Tier::Enhanced => {
                let executor = ValidatedDirectExecutor::new(host.clone()).with_limits(engine);
                Executor::Enhanced(match self.denylist {
                    Some(denylist) => executor.with_denylist(denylist),
                    None => executor,
                })
            }
            Tier::Isolated => Executor::Isolated(IsolatedExecutor::mount(self.config.isolation)?),
        };
        tracing::debug!(tier = %self.tier, description = self.tier.description(), "renderer ready");
        Ok(PreviewRenderer {
            tier: self.tier,
            host,
            executor,
        })
    }
}

impl Default for PreviewRendererBuilder {
    fn default() -> Self {
        Self::new()
    }
}
