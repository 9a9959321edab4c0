//! # genui sandbox
//!
//! Tiered execution for previewing generated UI components.
//!
//! A model emits a component as TSX text. This crate strips the markdown
//! around it, then renders it with one of three tiers that trade fidelity to
//! the host page against containment of what the component can reach.
//!
//! ## Execution Tiers
//!
//! | Tier | Mechanism | Holds against |
//! |------|-----------|---------------|
//! | [`Tier::Original`] | Direct execution in the host context | nothing |
//! | [`Tier::Enhanced`] | Static denylist validation, then direct execution | candidates that name a capability literally |
//! | [`Tier::Isolated`] | Nested context with an opaque origin, message channel, timeout | storage, cookie, network and parent access, however written |
//!
//! Only the isolated tier is a security boundary. The enhanced tier is a
//! filter: `window["local" + "Storage"]` walks straight past it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use genui_sandbox::{PreviewRenderer, Tier};
//!
//! let renderer = PreviewRenderer::builder()
//!     .tier(Tier::Isolated)
//!     .build()?;
//!
//! let mut result = renderer.render_generated(model_output, "SafeCounter").await;
//! match result.surface_mut() {
//!     Some(surface) => {
//!         surface.click_text("Increment")?;
//!         println!("{}", surface.snapshot()?.to_markup());
//!     }
//!     None => eprintln!("{}", result.failure().unwrap()),
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod capability;
pub mod catalog;
pub mod compile;
pub mod direct;
pub mod error;
pub mod isolated;
pub mod nesting;
pub mod policy;
pub mod result;
pub mod runtime;
pub mod sanitize;
pub mod tier;
pub mod validator;

// Re-export main types
pub use capability::{CapabilityContext, CapabilityGrants, HostEnvironment};
pub use direct::{UnsafeDirectExecutor, ValidatedDirectExecutor};
pub use error::{Result, SandboxError};
pub use isolated::{IsolatedExecutor, IsolationConfig};
pub use nesting::NestingError;
pub use policy::{CapabilityDenylist, DenyRule, FramePolicy, HostSecurityHeaders, SandboxAttributes, SandboxToken};
pub use result::{ErrorKind, ExecutionResult, Failure, RenderSurface};
pub use runtime::{EngineLimits, UiEvent, VisualNode, VisualTree};
pub use sanitize::{sanitize, SourceCandidate};
pub use tier::{PreviewConfig, PreviewRenderer, PreviewRendererBuilder, Tier};
pub use validator::{validate, PolicyValidator, RejectionReason, ValidationVerdict};
