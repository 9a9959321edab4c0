//! Rendered output of a component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of rendered output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VisualNode {
    /// Host element such as `div` or `button`
    Element {
        /// Tag name
        tag: String,
        /// Render-local id; event dispatch targets it
        id: u32,
        /// Attributes, stringified
        #[serde(default)]
        attributes: BTreeMap<String, String>,
        /// Names of attached handlers, e.g. `onClick`
        #[serde(default)]
        events: Vec<String>,
        /// Child nodes
        #[serde(default)]
        children: Vec<VisualNode>,
    },
    /// Text run
    Text {
        /// Text content
        text: String,
    },
}

impl VisualNode {
    fn collect_text(&self, out: &mut String) {
        match self {
            VisualNode::Text { text } => out.push_str(text),
            VisualNode::Element { children, .. } => {
                for child in children {
                    child.collect_text(out);
                }
            }
        }
    }

    /// Concatenated text below this node.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn write_markup(&self, out: &mut String) {
        match self {
            VisualNode::Text { text } => out.push_str(&escape(text)),
            VisualNode::Element {
                tag,
                attributes,
                children,
                ..
            } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attributes {
                    let name = if name == "className" { "class" } else { name.as_str() };
                    out.push_str(&format!(" {name}=\"{}\"", escape(value)));
                }
                out.push('>');
                for child in children {
                    child.write_markup(out);
                }
                out.push_str(&format!("</{tag}>"));
            }
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Top-level rendered nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisualTree(pub Vec<VisualNode>);

impl VisualTree {
    /// Top-level nodes.
    pub fn nodes(&self) -> &[VisualNode] {
        &self.0
    }

    /// Whether nothing was rendered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All text, in document order.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for node in &self.0 {
            node.collect_text(&mut out);
        }
        out
    }

    /// Whether `needle` appears in the rendered text.
    pub fn contains_text(&self, needle: &str) -> bool {
        self.text_content().contains(needle)
    }

    /// Element with the given render id.
    pub fn find_by_id(&self, target: u32) -> Option<&VisualNode> {
        fn walk(nodes: &[VisualNode], target: u32) -> Option<&VisualNode> {
            nodes.iter().find_map(|node| match node {
                VisualNode::Element { id, .. } if *id == target => Some(node),
                VisualNode::Element { children, .. } => walk(children, target),
                VisualNode::Text { .. } => None,
            })
        }
        walk(&self.0, target)
    }

    /// Id of the innermost element with an `onClick` handler whose text is
    /// `label` (trimmed).
    pub fn find_clickable(&self, label: &str) -> Option<u32> {
        fn walk(nodes: &[VisualNode], label: &str) -> Option<u32> {
            for node in nodes {
                if let VisualNode::Element {
                    id, events, children, ..
                } = node
                {
                    if let Some(inner) = walk(children, label) {
                        return Some(inner);
                    }
                    if events.iter().any(|e| e == "onClick") && node.text_content().trim() == label {
                        return Some(*id);
                    }
                }
            }
            None
        }
        walk(&self.0, label.trim())
    }

    /// HTML-like rendering, for display and snapshots.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        for node in &self.0 {
            node.write_markup(&mut out);
        }
        out
    }
}
