//! Code sanitizer: turns raw model output into a [`SourceCandidate`].

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Fence markers, language-tagged or bare. Alternation order matters:
/// the tagged forms must win over the bare one.
static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:typescript|tsx|javascript|jsx)?").expect("fence pattern is valid")
});

/// Sanitized component source.
///
/// Only produced by [`sanitize`], so it never contains a fence marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceCandidate(String);

impl SourceCandidate {
    /// Borrow the source text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the source in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sanitized source is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the source text by value.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for SourceCandidate {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip markdown fences from anywhere in `raw` and trim the result.
///
/// Removal repeats until no marker is left, which keeps the function
/// idempotent even for inputs like ```` `````` ```` where one pass could
/// leave a fresh marker behind.
pub fn sanitize(raw: &str) -> SourceCandidate {
    let mut text = raw.trim().to_string();
    loop {
        let stripped = FENCE.replace_all(&text, "");
        if stripped.len() == text.len() {
            break;
        }
        text = stripped.into_owned();
    }
    let candidate = SourceCandidate(text.trim().to_string());
    tracing::trace!(
        raw_len = raw.len(),
        sanitized_len = candidate.len(),
        "sanitized candidate"
    );
    candidate
}
