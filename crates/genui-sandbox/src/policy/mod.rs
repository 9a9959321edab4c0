//! Capability policy: the static denylist and the nested-context policy.
//!
//! The denylist is a blocklist, not a proof of safety. It matches what is
//! literally written in the candidate: computed members
//! (`window["local" + "Storage"]`), aliases (`const w = window; w.top`),
//! `globalThis`/`self` indirection and prototype tricks all get past it.
//! That gap is the difference between the enhanced tier (a filter) and the
//! isolated tier (a boundary), and it is kept on purpose.

mod frame;

pub use frame::{ContentSecurityPolicy, FramePolicy, HostSecurityHeaders, SandboxAttributes, SandboxToken};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// A reference the validator found in the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// Bare identifier reference, e.g. `fetch`
    Identifier(&'a str),
    /// Static member chain rooted at an identifier, e.g. `window.top.location`
    MemberPath(&'a str),
    /// Module specifier from `import`, `export … from`, `import()` or `require()`
    Import(&'a str),
    /// `import()` whose specifier is not a literal
    DynamicImport,
}

impl Reference<'_> {
    /// Leading identifier of an identifier or member path.
    fn root(&self) -> Option<&str> {
        match self {
            Reference::Identifier(name) => Some(name),
            Reference::MemberPath(path) => path.split('.').next(),
            _ => None,
        }
    }
}

/// One tagged denylist rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", content = "pattern", rename_all = "kebab-case")]
pub enum DenyRule {
    /// Forbidden global; also matches any member path rooted at it
    Identifier(String),
    /// Forbidden member path; matches itself and any longer path below it
    MemberPath(String),
    /// Forbids every module specifier outside the listed packages
    ImportOutside(Vec<String>),
}

impl DenyRule {
    /// Shorthand for an identifier rule.
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::Identifier(name.into())
    }

    /// Shorthand for a member-path rule.
    pub fn member_path(path: impl Into<String>) -> Self {
        Self::MemberPath(path.into())
    }

    /// Return the matched pattern if this rule forbids `reference`.
    pub fn matches(&self, reference: &Reference<'_>) -> Option<String> {
        match self {
            DenyRule::Identifier(name) => {
                (reference.root() == Some(name.as_str())).then(|| name.clone())
            }
            DenyRule::MemberPath(entry) => match reference {
                Reference::MemberPath(path) if path_has_prefix(path, entry) => Some(entry.clone()),
                _ => None,
            },
            DenyRule::ImportOutside(allowed) => match reference {
                Reference::Import(specifier) => (!allowed
                    .iter()
                    .any(|package| path_has_prefix_sep(specifier, package, '/')))
                .then(|| format!("import(\"{specifier}\")")),
                Reference::DynamicImport => Some("import(<dynamic>)".to_string()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for DenyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyRule::Identifier(name) => write!(f, "identifier {name}"),
            DenyRule::MemberPath(path) => write!(f, "member {path}"),
            DenyRule::ImportOutside(allowed) => write!(f, "import outside [{}]", allowed.join(", ")),
        }
    }
}

fn path_has_prefix(path: &str, entry: &str) -> bool {
    path_has_prefix_sep(path, entry, '.')
}

/// `entry` equals `path` or is a leading run of whole segments of it.
fn path_has_prefix_sep(path: &str, entry: &str, sep: char) -> bool {
    match path.strip_prefix(entry) {
        Some("") => true,
        Some(rest) => rest.starts_with(sep),
        None => false,
    }
}

/// Ordered set of forbidden capability patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDenylist {
    rules: Vec<DenyRule>,
}

static STANDARD: LazyLock<CapabilityDenylist> = LazyLock::new(|| {
    let identifiers = [
        "localStorage",
        "sessionStorage",
        "indexedDB",
        "fetch",
        "XMLHttpRequest",
        "WebSocket",
        "EventSource",
        "eval",
        "Function",
    ];
    let members = [
        "document.cookie",
        "document.domain",
        "window.top",
        "window.parent",
        "window.opener",
        "window.localStorage",
        "window.sessionStorage",
        "window.fetch",
        "navigator.sendBeacon",
    ];
    let mut rules: Vec<DenyRule> = identifiers.iter().map(|name| DenyRule::identifier(*name)).collect();
    rules.extend(members.iter().map(|path| DenyRule::member_path(*path)));
    rules.push(DenyRule::ImportOutside(vec!["react".to_string()]));
    CapabilityDenylist { rules }
});

impl CapabilityDenylist {
    /// The process-wide denylist. Built on first use, never mutated.
    pub fn standard() -> &'static CapabilityDenylist {
        &STANDARD
    }

    /// Build a custom list. Rule order decides which pattern is reported
    /// when several match the same reference.
    pub fn from_rules(rules: Vec<DenyRule>) -> Self {
        Self { rules }
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[DenyRule] {
        &self.rules
    }

    /// First rule matching `reference`, as its reported pattern.
    pub fn check(&self, reference: &Reference<'_>) -> Option<String> {
        self.rules.iter().find_map(|rule| rule.matches(reference))
    }
}

impl Default for CapabilityDenylist {
    fn default() -> Self {
        Self::standard().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_rule() {
        let rule = DenyRule::identifier("localStorage");
        assert_eq!(rule.matches(&Reference::Identifier("localStorage")).as_deref(), Some("localStorage"));
        assert_eq!(
            rule.matches(&Reference::MemberPath("localStorage.getItem")).as_deref(),
            Some("localStorage")
        );
        assert!(rule.matches(&Reference::Identifier("localStorageKey")).is_none());
        assert!(rule.matches(&Reference::MemberPath("window.localStorage")).is_none());
    }

    #[test]
    fn test_member_path_prefix() {
        let rule = DenyRule::member_path("window.top");
        assert_eq!(rule.matches(&Reference::MemberPath("window.top")).as_deref(), Some("window.top"));
        assert_eq!(
            rule.matches(&Reference::MemberPath("window.top.location")).as_deref(),
            Some("window.top")
        );
        assert!(rule.matches(&Reference::MemberPath("window.topmost")).is_none());
        assert!(rule.matches(&Reference::Identifier("window")).is_none());
    }

    #[test]
    fn test_import_rule() {
        let rule = DenyRule::ImportOutside(vec!["react".into()]);
        assert!(rule.matches(&Reference::Import("react")).is_none());
        assert!(rule.matches(&Reference::Import("react/jsx-runtime")).is_none());
        assert_eq!(
            rule.matches(&Reference::Import("react-dom")).as_deref(),
            Some("import(\"react-dom\")")
        );
        assert!(rule.matches(&Reference::DynamicImport).is_some());
        assert!(rule.matches(&Reference::Identifier("react")).is_none());
    }

    #[test]
    fn test_standard_list_order() {
        let list = CapabilityDenylist::standard();
        assert_eq!(list.check(&Reference::MemberPath("document.cookie")).as_deref(), Some("document.cookie"));
        assert_eq!(list.check(&Reference::Identifier("eval")).as_deref(), Some("eval"));
        assert!(list.check(&Reference::MemberPath("document.title")).is_none());
        assert!(list.check(&Reference::Identifier("useState")).is_none());
        // same instance every time
        assert!(std::ptr::eq(list, CapabilityDenylist::standard()));
    }

    #[test]
    fn test_rule_serde_shape() {
        let json = serde_json::to_string(&DenyRule::member_path("window.top")).unwrap();
        assert_eq!(json, r#"{"match":"member-path","pattern":"window.top"}"#);
    }
}
