//! Direct executors: the candidate runs in the host's own context.

use crate::capability::{CapabilityContext, HostEnvironment};
use crate::compile::{compile, is_js_identifier};
use crate::policy::CapabilityDenylist;
use crate::result::{ErrorKind, ExecutionResult, Failure, HostView, RenderSurface};
use crate::runtime::{ComponentEngine, EngineLimits};
use crate::sanitize::SourceCandidate;
use crate::validator::{PolicyValidator, RejectionReason, ValidationVerdict};
use std::sync::Arc;

/// Renders whatever it is given with the host's full ambient capabilities.
///
/// Offers no protection at all. It exists as the baseline the other tiers
/// are measured against.
#[derive(Debug, Clone)]
pub struct UnsafeDirectExecutor {
    host: Arc<HostEnvironment>,
    limits: EngineLimits,
}

impl UnsafeDirectExecutor {
    /// Executor over `host` with default limits.
    pub fn new(host: Arc<HostEnvironment>) -> Self {
        Self::with_limits(host, EngineLimits::default())
    }

    /// Executor over `host` with explicit limits.
    pub fn with_limits(host: Arc<HostEnvironment>, limits: EngineLimits) -> Self {
        Self { host, limits }
    }

    /// The host this executor runs against.
    pub fn host(&self) -> &Arc<HostEnvironment> {
        &self.host
    }

    /// Compile and render `candidate` as component `name`.
    pub fn render(&self, candidate: SourceCandidate, name: &str) -> ExecutionResult {
        if !is_js_identifier(name) {
            return ExecutionResult::failed(ErrorKind::RuntimeError, format!("invalid component name {name:?}"));
        }
        self.host.record_evaluation();
        tracing::debug!(component = name, len = candidate.len(), "evaluating candidate in host context");

        let unit = match compile(candidate.as_str()) {
            Ok(unit) => unit,
            Err(e) => return ExecutionResult::failed(ErrorKind::RuntimeError, e.to_string()),
        };
        let context = CapabilityContext::ambient(self.host.clone());
        let mut engine = match ComponentEngine::new(&context, self.limits.clone()) {
            Ok(engine) => engine,
            Err(e) => return ExecutionResult::failed(ErrorKind::RuntimeError, e.to_string()),
        };
        match engine.mount(&unit, name) {
            Ok(()) => ExecutionResult::Rendered(RenderSurface::Host(HostView::new(engine))),
            Err(fault) => {
                tracing::debug!(component = name, %fault, "candidate failed in host context");
                ExecutionResult::Failed(Failure::from(fault))
            }
        }
    }
}

/// Validates first; on acceptance behaves exactly like
/// [`UnsafeDirectExecutor`], in the same ambient context.
///
/// A filter, not a boundary: anything the validator cannot see (computed
/// member access, aliasing) runs with full host access.
#[derive(Debug, Clone)]
pub struct ValidatedDirectExecutor {
    inner: UnsafeDirectExecutor,
    denylist: Option<CapabilityDenylist>,
}

impl ValidatedDirectExecutor {
    /// Executor over `host` using the standard denylist.
    pub fn new(host: Arc<HostEnvironment>) -> Self {
        Self {
            inner: UnsafeDirectExecutor::new(host),
            denylist: None,
        }
    }

    /// Builder: use explicit engine limits
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.inner.limits = limits;
        self
    }

    /// Builder: validate against a custom denylist
    pub fn with_denylist(mut self, denylist: CapabilityDenylist) -> Self {
        self.denylist = Some(denylist);
        self
    }

    fn validator(&self) -> PolicyValidator<'_> {
        match &self.denylist {
            Some(list) => PolicyValidator::with_denylist(list),
            None => PolicyValidator::standard(),
        }
    }

    /// Validate, then render only if accepted.
    pub fn render(&self, candidate: SourceCandidate, name: &str) -> ExecutionResult {
        match self.validator().validate(&candidate) {
            ValidationVerdict::Accepted => self.inner.render(candidate, name),
            ValidationVerdict::Rejected {
                reason: RejectionReason::SyntaxError,
                offending_token,
            } => ExecutionResult::failed(ErrorKind::SyntaxError, offending_token),
            ValidationVerdict::Rejected {
                reason: RejectionReason::ForbiddenCapability,
                offending_token,
            } => {
                tracing::info!(component = name, token = %offending_token, "candidate refused by policy");
                ExecutionResult::failed(ErrorKind::PolicyViolation, offending_token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::policy::DenyRule;
    use crate::sanitize::sanitize;

    fn host() -> Arc<HostEnvironment> {
        HostEnvironment::builder()
            .local_item("authToken", "secret-token")
            .cookie("session", "s3ss10n")
            .build()
    }

    #[test]
    fn test_unsafe_reads_host_token() {
        let host = host();
        let executor = UnsafeDirectExecutor::new(host.clone());
        let result = executor.render(sanitize(catalog::MALICIOUS.source), catalog::MALICIOUS.component);
        let tree = result.surface().unwrap().snapshot().unwrap();
        assert!(tree.contains_text("Got token: secret-token"), "{}", tree.text_content());
        assert_eq!(host.evaluations(), 1);
        assert!(host.accesses().iter().any(|a| a.capability == "localStorage"));
        let egress = host.egress();
        assert_eq!(egress.len(), 1);
        assert!(egress[0].body.as_deref().unwrap_or_default().contains("s3ss10n"));
    }

    #[test]
    fn test_unsafe_syntax_error_is_runtime_error() {
        let host = host();
        let result = UnsafeDirectExecutor::new(host.clone()).render(sanitize("function A() { return <div>; "), "A");
        assert_eq!(result.failure().unwrap().kind, ErrorKind::RuntimeError);
        assert_eq!(host.evaluations(), 1);
    }

    #[test]
    fn test_unsafe_invalid_name() {
        let host = host();
        let result = UnsafeDirectExecutor::new(host.clone()).render(sanitize("function A() { return null }"), "A;x");
        assert_eq!(result.failure().unwrap().kind, ErrorKind::RuntimeError);
        assert_eq!(host.evaluations(), 0);
    }

    #[test]
    fn test_validated_refuses_without_evaluating() {
        let host = host();
        let executor = ValidatedDirectExecutor::new(host.clone());
        let result = executor.render(sanitize(catalog::MALICIOUS.source), catalog::MALICIOUS.component);
        assert_eq!(
            result.failure(),
            Some(&Failure::new(ErrorKind::PolicyViolation, "localStorage"))
        );
        assert_eq!(host.evaluations(), 0);
        assert!(host.accesses().is_empty());
    }

    #[test]
    fn test_validated_syntax_error() {
        let host = host();
        let result = ValidatedDirectExecutor::new(host.clone()).render(sanitize("function A() { return <div>; "), "A");
        assert_eq!(result.failure().unwrap().kind, ErrorKind::SyntaxError);
        assert_eq!(host.evaluations(), 0);
    }

    #[test]
    fn test_validated_leaks_through_computed_access() {
        let host = host();
        let result = ValidatedDirectExecutor::new(host.clone()).render(sanitize(catalog::EVASIVE.source), catalog::EVASIVE.component);
        let tree = result.surface().unwrap().snapshot().unwrap();
        assert!(tree.contains_text("secret-token"));
        assert_eq!(host.evaluations(), 1);
    }

    #[test]
    fn test_validated_custom_denylist() {
        let host = host();
        let executor = ValidatedDirectExecutor::new(host.clone())
            .with_denylist(CapabilityDenylist::from_rules(vec![DenyRule::identifier("useState")]));
        let result = executor.render(sanitize(catalog::SAFE_COUNTER.source), catalog::SAFE_COUNTER.component);
        assert_eq!(result.failure().unwrap().message, "useState");
    }
}
