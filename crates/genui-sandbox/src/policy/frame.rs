//! Nested-context policy: sandbox attributes, CSP, and host page headers.

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Tokens of the `sandbox` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxToken {
    /// Scripts may run
    AllowScripts,
    /// `alert`/`confirm`/`prompt` reach the user
    AllowModals,
    /// Forms may submit
    AllowForms,
    /// Popups may open (still sandboxed)
    AllowPopups,
    /// Keeps the embedder's origin; with scripts this undoes the sandbox
    AllowSameOrigin,
    /// Frame may navigate the top-level page
    AllowTopNavigation,
    /// Popups shed the sandbox
    AllowPopupsToEscapeSandbox,
}

impl SandboxToken {
    /// Attribute spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxToken::AllowScripts => "allow-scripts",
            SandboxToken::AllowModals => "allow-modals",
            SandboxToken::AllowForms => "allow-forms",
            SandboxToken::AllowPopups => "allow-popups",
            SandboxToken::AllowSameOrigin => "allow-same-origin",
            SandboxToken::AllowTopNavigation => "allow-top-navigation",
            SandboxToken::AllowPopupsToEscapeSandbox => "allow-popups-to-escape-sandbox",
        }
    }

    /// Tokens that would let framed code reach the host.
    pub fn breaks_isolation(&self) -> bool {
        matches!(
            self,
            SandboxToken::AllowSameOrigin
                | SandboxToken::AllowTopNavigation
                | SandboxToken::AllowPopupsToEscapeSandbox
        )
    }
}

impl fmt::Display for SandboxToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated `sandbox` attribute set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxAttributes {
    tokens: BTreeSet<SandboxToken>,
}

impl SandboxAttributes {
    /// Build from tokens, refusing any that break isolation.
    pub fn new(tokens: impl IntoIterator<Item = SandboxToken>) -> Result<Self> {
        let tokens: BTreeSet<_> = tokens.into_iter().collect();
        if let Some(bad) = tokens.iter().find(|t| t.breaks_isolation()) {
            return Err(SandboxError::PolicyViolation(format!(
                "sandbox token {bad} would break isolation"
            )));
        }
        Ok(Self { tokens })
    }

    /// Whether `token` is present.
    pub fn allows(&self, token: SandboxToken) -> bool {
        self.tokens.contains(&token)
    }

    /// Attribute value, space separated.
    pub fn attribute_value(&self) -> String {
        self.tokens.iter().map(SandboxToken::as_str).collect::<Vec<_>>().join(" ")
    }
}

impl Default for SandboxAttributes {
    fn default() -> Self {
        Self {
            tokens: BTreeSet::from([SandboxToken::AllowScripts]),
        }
    }
}

impl<'de> Deserialize<'de> for SandboxAttributes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            tokens: Vec<SandboxToken>,
        }
        let raw = Raw::deserialize(deserializer)?;
        SandboxAttributes::new(raw.tokens).map_err(serde::de::Error::custom)
    }
}

/// Content-Security-Policy for the nested context.
///
/// `default-src` and `connect-src` are always `'none'`; only script, style,
/// image and font sources can be allow-listed. A source is a single
/// token: anything that could end the directive or start another is
/// refused by [`validate`](Self::validate) and left out of the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSecurityPolicy {
    /// Extra `script-src` sources
    pub script_src: Vec<String>,
    /// Extra `style-src` sources
    pub style_src: Vec<String>,
    /// Extra `img-src` sources
    pub img_src: Vec<String>,
    /// Extra `font-src` sources
    pub font_src: Vec<String>,
}

impl Default for ContentSecurityPolicy {
    fn default() -> Self {
        Self {
            script_src: vec!["'unsafe-inline'".into(), "'unsafe-eval'".into()],
            style_src: vec!["'unsafe-inline'".into()],
            img_src: vec!["data:".into()],
            font_src: Vec::new(),
        }
    }
}

impl ContentSecurityPolicy {
    /// Builder: allow a script source
    pub fn script_src(mut self, source: impl Into<String>) -> Self {
        self.script_src.push(source.into());
        self
    }

    /// Builder: allow a style source
    pub fn style_src(mut self, source: impl Into<String>) -> Self {
        self.style_src.push(source.into());
        self
    }

    /// Builder: allow an image source
    pub fn img_src(mut self, source: impl Into<String>) -> Self {
        self.img_src.push(source.into());
        self
    }

    /// Builder: allow a font source
    pub fn font_src(mut self, source: impl Into<String>) -> Self {
        self.font_src.push(source.into());
        self
    }

    fn directives(&self) -> [(&'static str, &Vec<String>); 4] {
        [
            ("script-src", &self.script_src),
            ("style-src", &self.style_src),
            ("img-src", &self.img_src),
            ("font-src", &self.font_src),
        ]
    }

    /// Refuse sources that are not a single source expression.
    pub fn validate(&self) -> Result<()> {
        for (name, sources) in self.directives() {
            if let Some(bad) = sources.iter().find(|source| !is_source_expression(source)) {
                return Err(SandboxError::PolicyViolation(format!("{name} source {bad:?} is not a single source")));
            }
        }
        Ok(())
    }

    /// Header value.
    pub fn header_value(&self) -> String {
        let mut directives = vec!["default-src 'none'".to_string()];
        for (name, sources) in self.directives() {
            let mut kept = Vec::with_capacity(sources.len());
            for source in sources {
                if is_source_expression(source) {
                    kept.push(source.as_str());
                } else {
                    tracing::warn!(directive = name, source = %source, "dropping malformed CSP source");
                }
            }
            if !kept.is_empty() {
                directives.push(format!("{name} {}", kept.join(" ")));
            }
        }
        directives.push("connect-src 'none'".to_string());
        directives.join("; ")
    }
}

/// Non-empty, with no separator, whitespace or control character.
fn is_source_expression(source: &str) -> bool {
    !source.is_empty()
        && !source
            .chars()
            .any(|c| c == ';' || c == ',' || c.is_whitespace() || c.is_control())
}

/// Everything the nested context is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramePolicy {
    /// `sandbox` attribute
    pub sandbox: SandboxAttributes,
    /// Content-Security-Policy
    pub csp: ContentSecurityPolicy,
}

impl FramePolicy {
    /// Builder: replace the sandbox attribute set
    pub fn with_sandbox(mut self, sandbox: SandboxAttributes) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Builder: replace the CSP
    pub fn with_csp(mut self, csp: ContentSecurityPolicy) -> Self {
        self.csp = csp;
        self
    }

    /// Attributes for the embedding element.
    pub fn iframe_attributes(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sandbox", self.sandbox.attribute_value()),
            ("referrerpolicy", "no-referrer".to_string()),
        ]
    }

    /// CSP header value for the frame document.
    pub fn csp_header(&self) -> String {
        self.csp.header_value()
    }
}

/// Response headers of the host page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSecurityHeaders {
    headers: Vec<(&'static str, &'static str)>,
}

impl HostSecurityHeaders {
    /// The standard header set.
    pub fn standard() -> Self {
        Self {
            headers: vec![
                ("X-Frame-Options", "SAMEORIGIN"),
                ("X-Content-Type-Options", "nosniff"),
                ("Referrer-Policy", "strict-origin-when-cross-origin"),
                ("Permissions-Policy", "geolocation=(), microphone=(), camera=()"),
                (
                    "Content-Security-Policy",
                    "default-src 'self'; script-src 'self' 'unsafe-eval' 'unsafe-inline'; \
                     style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; \
                     frame-src 'self' blob: data:; connect-src 'self' https:; \
                     font-src 'self' data:",
                ),
            ],
        }
    }

    /// Header name/value pairs in emission order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.headers.iter().copied()
    }

    /// Look up a header, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&'static str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }
}
