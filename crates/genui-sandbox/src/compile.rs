//! TSX to plain JavaScript lowering.
//!
//! The engine evaluates a candidate as the body of a function, so module
//! syntax has to go first. That is done with span edits on the parsed
//! module: `react` imports become destructuring of the `React` binding the
//! runtime supplies, any other import throws when evaluated, `export`
//! keywords are dropped, and a default export is bound to `__default`.
//! The edited text is then run through the oxc transformer (TypeScript
//! stripping, classic JSX runtime) and printed back out.
//!
//! Source that nests too deeply is refused as a syntax error before the
//! parser sees it, and all oxc work runs on the parser thread from
//! [`crate::nesting`].

use crate::nesting::{self, NestingError};
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_semantic::SemanticBuilder;
use oxc_span::{GetSpan, SourceType};
use oxc_transformer::{JsxRuntime, TransformOptions, Transformer};
use std::fmt;
use std::path::Path;

/// Binding the default export is assigned to.
pub const DEFAULT_EXPORT_BINDING: &str = "__default";

/// Where lowering failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Source does not parse
    Syntax,
    /// Parsed, but could not be lowered
    Transform,
}

/// Lowering failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Failure stage
    pub kind: CompileErrorKind,
    /// First diagnostic
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CompileErrorKind::Syntax => write!(f, "SyntaxError: {}", self.message),
            CompileErrorKind::Transform => write!(f, "TransformError: {}", self.message),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<NestingError> for CompileError {
    fn from(err: NestingError) -> Self {
        Self {
            kind: CompileErrorKind::Syntax,
            message: err.to_string(),
        }
    }
}

/// Plain script ready to be wrapped in a function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Lowered JavaScript
    pub code: String,
    /// Whether the source had a default export, now bound to `__default`
    pub has_default_export: bool,
}

/// Lower a TSX candidate to a script.
pub fn compile(source: &str) -> Result<CompiledUnit, CompileError> {
    nesting::scan(source)?;
    let lowered = nesting::on_parser_stack(|| -> Result<(String, bool), CompileError> {
        let (script, has_default_export) = strip_module_syntax(source)?;
        Ok((lower(&script)?, has_default_export))
    });
    let (code, has_default_export) = match lowered {
        Ok(result) => result?,
        Err(message) => {
            return Err(CompileError {
                kind: CompileErrorKind::Transform,
                message,
            })
        }
    };
    tracing::trace!(source_len = source.len(), code_len = code.len(), "lowered candidate");
    Ok(CompiledUnit {
        code,
        has_default_export,
    })
}

fn first_diagnostic<E: fmt::Display>(kind: CompileErrorKind, errors: &[E]) -> CompileError {
    CompileError {
        kind,
        message: errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into()),
    }
}

struct Edit {
    start: u32,
    end: u32,
    text: String,
}

impl Edit {
    fn replace(start: u32, end: u32, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    fn remove(start: u32, end: u32) -> Self {
        Self::replace(start, end, "")
    }
}

fn strip_module_syntax(source: &str) -> Result<(String, bool), CompileError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, source, SourceType::tsx()).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return Err(first_diagnostic(CompileErrorKind::Syntax, &ret.errors));
    }
    crate::validator::check_syntax_depth(&ret.program)?;

    let mut edits = Vec::new();
    let mut default_name: Option<String> = None;
    let mut has_default = false;

    for stmt in &ret.program.body {
        let span = stmt.span();
        match stmt {
            Statement::ImportDeclaration(decl) => {
                edits.push(Edit::replace(span.start, span.end, import_replacement(decl)));
            }
            Statement::ExportAllDeclaration(_) | Statement::TSExportAssignment(_) => {
                edits.push(Edit::remove(span.start, span.end));
            }
            Statement::ExportNamedDeclaration(decl) => match &decl.declaration {
                Some(declaration) => {
                    edits.push(Edit::remove(span.start, declaration.span().start));
                }
                None => {
                    let mut text = String::new();
                    if decl.source.is_none() {
                        for spec in &decl.specifiers {
                            if spec.exported.name().as_str() == "default" {
                                has_default = true;
                                text = format!("var {DEFAULT_EXPORT_BINDING} = {};", spec.local.name());
                            }
                        }
                    }
                    edits.push(Edit::replace(span.start, span.end, text));
                }
            },
            Statement::ExportDefaultDeclaration(decl)
                if matches!(decl.declaration, ExportDefaultDeclarationKind::TSInterfaceDeclaration(_)) =>
            {
                edits.push(Edit::remove(span.start, span.end));
            }
            Statement::ExportDefaultDeclaration(decl) => {
                has_default = true;
                let inner = decl.declaration.span().start;
                let named = match &decl.declaration {
                    ExportDefaultDeclarationKind::FunctionDeclaration(f) => f.id.as_ref(),
                    ExportDefaultDeclarationKind::ClassDeclaration(c) => c.id.as_ref(),
                    _ => None,
                };
                match named {
                    Some(id) => {
                        edits.push(Edit::remove(span.start, inner));
                        default_name = Some(id.name.to_string());
                    }
                    None => {
                        edits.push(Edit::replace(
                            span.start,
                            inner,
                            format!("var {DEFAULT_EXPORT_BINDING} = "),
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    let mut script = String::with_capacity(source.len() + 64);
    let mut cursor = 0usize;
    for edit in &edits {
        let (start, end) = (edit.start as usize, edit.end as usize);
        script.push_str(&source[cursor..start]);
        script.push_str(&edit.text);
        cursor = end;
    }
    script.push_str(&source[cursor..]);
    if let Some(name) = default_name {
        script.push_str(&format!("\nvar {DEFAULT_EXPORT_BINDING} = {name};\n"));
    }
    Ok((script, has_default))
}

/// `react` imports read from the supplied binding; anything else fails
/// the same way an unresolvable module would.
fn import_replacement(decl: &ImportDeclaration<'_>) -> String {
    if decl.import_kind.is_type() {
        return String::new();
    }
    let specifier = decl.source.value.as_str();
    if specifier != "react" && !specifier.starts_with("react/") {
        return format!(
            "throw new Error({});",
            serde_json::Value::String(format!("Cannot find module '{specifier}'"))
        );
    }
    let Some(specifiers) = &decl.specifiers else {
        return String::new();
    };
    let mut lines = Vec::new();
    let mut named = Vec::new();
    for spec in specifiers {
        match spec {
            ImportDeclarationSpecifier::ImportDefaultSpecifier(s) => {
                if s.local.name.as_str() != "React" {
                    lines.push(format!("var {} = React;", s.local.name));
                }
            }
            ImportDeclarationSpecifier::ImportNamespaceSpecifier(s) => {
                if s.local.name.as_str() != "React" {
                    lines.push(format!("var {} = React;", s.local.name));
                }
            }
            ImportDeclarationSpecifier::ImportSpecifier(s) => {
                if s.import_kind.is_type() {
                    continue;
                }
                let imported = s.imported.name();
                if imported.as_str() == s.local.name.as_str() {
                    named.push(imported.to_string());
                } else {
                    named.push(format!("{imported}: {}", s.local.name));
                }
            }
        }
    }
    if !named.is_empty() {
        lines.push(format!("var {{ {} }} = React;", named.join(", ")));
    }
    lines.join(" ")
}

fn lower(script: &str) -> Result<String, CompileError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, script, SourceType::tsx()).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return Err(first_diagnostic(CompileErrorKind::Transform, &ret.errors));
    }
    let mut program = ret.program;

    let (symbols, scopes) = SemanticBuilder::new()
        .build(&program)
        .semantic
        .into_symbol_table_and_scope_tree();

    let mut options = TransformOptions::default();
    options.jsx.jsx_plugin = true;
    options.jsx.display_name_plugin = false;
    options.jsx.runtime = JsxRuntime::Classic;

    let transformed = Transformer::new(&allocator, Path::new("component.tsx"), &options)
        .build_with_symbols_and_scopes(symbols, scopes, &mut program);
    if !transformed.errors.is_empty() {
        return Err(first_diagnostic(CompileErrorKind::Transform, &transformed.errors));
    }

    Ok(Codegen::new().build(&program).code)
}

const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "import", "in",
    "instanceof", "let", "new", "null", "return", "static", "super", "switch", "this", "throw",
    "true", "try", "typeof", "var", "void", "while", "with", "yield", "await",
];

/// Whether `name` can be used verbatim as a binding name.
pub fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        && !RESERVED.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsx_becomes_create_element() {
        let unit = compile("function A() { return <div className=\"x\">hi</div> }").unwrap();
        assert!(unit.code.contains("React.createElement"), "{}", unit.code);
        assert!(!unit.code.contains("<div"));
        assert!(!unit.has_default_export);
    }

    #[test]
    fn test_fragments_use_react_fragment() {
        let unit = compile("const A = () => <><p/></>;").unwrap();
        assert!(unit.code.contains("React.Fragment"), "{}", unit.code);
    }

    #[test]
    fn test_types_are_stripped() {
        let src = "interface P { n: number }\nfunction A({ n }: P): JSX.Element { const x: number = n as number; return <p>{x}</p> }";
        let unit = compile(src).unwrap();
        assert!(!unit.code.contains("interface"));
        assert!(!unit.code.contains(": number"));
    }

    #[test]
    fn test_react_imports_rewritten() {
        let src = "import React, { useState, useEffect as ue } from 'react';\nimport type { FC } from 'react';\nfunction A() { return null }";
        let unit = compile(src).unwrap();
        assert!(!unit.code.contains("import"));
        assert!(unit.code.contains("useState"));
        assert!(unit.code.contains("ue"));
    }

    #[test]
    fn test_foreign_import_throws() {
        let unit = compile("import axios from 'axios';\nfunction A() { return null }").unwrap();
        assert!(unit.code.contains("Cannot find module 'axios'"));
    }

    #[test]
    fn test_default_exports() {
        let unit = compile("export default function Card() { return <p/> }").unwrap();
        assert!(unit.has_default_export);
        assert!(unit.code.contains("__default = Card"));
        assert!(!unit.code.contains("export"));

        let unit = compile("export default () => <p/>;").unwrap();
        assert!(unit.has_default_export);
        assert!(unit.code.contains("__default ="));

        let unit = compile("function B() { return null }\nexport { B as default };").unwrap();
        assert!(unit.has_default_export);
        assert!(unit.code.contains("__default = B"));
    }

    #[test]
    fn test_named_export_keeps_declaration() {
        let unit = compile("export const A = () => null;\nexport function B() { return null }").unwrap();
        assert!(!unit.code.contains("export"));
        assert!(unit.code.contains("const A"));
        assert!(unit.code.contains("function B"));
    }

    #[test]
    fn test_syntax_error() {
        let err = compile("function A() { return <div>; ").unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
        assert!(err.to_string().starts_with("SyntaxError"));
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let parens = format!("const x = {}1{};", "(".repeat(10_000), ")".repeat(10_000));
        let unary = format!("const x = {}y;", "!".repeat(100_000));
        let binary = format!("const x = 1{};", "+1".repeat(100_000));
        for src in [parens, unary, binary] {
            let err = compile(&src).unwrap_err();
            assert_eq!(err.kind, CompileErrorKind::Syntax);
            assert!(err.message.contains("exceeds maximum"), "{}", err.message);
        }
    }

    #[test]
    fn test_deep_member_chain_is_a_syntax_error() {
        let src = format!("const x = a{};", ".b".repeat(5_000));
        let err = compile(&src).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Syntax);
        assert!(err.message.contains("syntax tree nests deeper"), "{}", err.message);
    }

    #[test]
    fn test_brackets_in_strings_compile() {
        let parens = "(".repeat(300);
        let src = format!("function A() {{ return <p>{{\"{parens}\"}}</p> }}");
        let unit = compile(&src).unwrap();
        assert!(unit.code.contains(&parens));
    }

    #[test]
    fn test_identifiers() {
        assert!(is_js_identifier("SafeCounter"));
        assert!(is_js_identifier("_x$1"));
        assert!(!is_js_identifier(""));
        assert!(!is_js_identifier("1abc"));
        assert!(!is_js_identifier("a-b"));
        assert!(!is_js_identifier("x);alert(1"));
        assert!(!is_js_identifier("class"));
    }
}
