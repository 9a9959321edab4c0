//! Execution tiers and the renderer that routes to them.

mod renderer;

pub use renderer::{PreviewRenderer, PreviewRendererBuilder};

use crate::error::{Result, SandboxError};
use crate::isolated::IsolationConfig;
use crate::runtime::EngineLimits;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Execution tiers, from least to most isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Tier {
    /// Candidate runs in the host context with full ambient access
    ///
    /// Provides: nothing
    /// Use case: baseline for comparison
    Original = 1,

    /// Static validation, then the host context
    ///
    /// Provides: refusal of candidates that name a denylisted capability
    /// Bypassed by: computed member access, aliasing, prototype tricks
    Enhanced = 2,

    /// Nested context with an opaque origin, reached over a message channel
    ///
    /// Provides: no host storage, cookies, network or parent traversal
    /// Requires: a tokio runtime
    Isolated = 3,
}

impl Tier {
    /// Every tier, in order.
    pub const ALL: [Tier; 3] = [Tier::Original, Tier::Enhanced, Tier::Isolated];

    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Original => "original",
            Tier::Enhanced => "enhanced",
            Tier::Isolated => "isolated",
        }
    }

    /// Human-readable description of the tier
    pub fn description(&self) -> &'static str {
        match self {
            Tier::Original => "direct execution in the host context (unsafe)",
            Tier::Enhanced => "static policy validation, then direct execution",
            Tier::Isolated => "sandboxed nested context over a message channel",
        }
    }

    /// Whether the tier holds against candidates written to evade it.
    pub fn is_security_boundary(&self) -> bool {
        matches!(self, Tier::Isolated)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "original" | "unsafe" | "1" => Ok(Tier::Original),
            "enhanced" | "validated" | "2" => Ok(Tier::Enhanced),
            "isolated" | "secure" | "iframe" | "3" => Ok(Tier::Isolated),
            other => Err(SandboxError::ConfigError(format!("unknown tier {other:?}"))),
        }
    }
}

/// Everything configurable about previews, as loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Engine limits for the direct tiers
    pub engine: EngineLimits,

    /// Isolated tier settings
    pub isolation: IsolationConfig,
}

impl PreviewConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.isolation.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}
