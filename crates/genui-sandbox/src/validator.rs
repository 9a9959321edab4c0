//! Static policy validator.
//!
//! Parses a candidate as a TSX module and walks the tree looking for
//! references the [`CapabilityDenylist`] forbids. The walk is a plain
//! recursive `match` over the node types that can hold expressions; it
//! stops at the first match, or when the tree gets deeper than
//! [`MAX_SYNTAX_DEPTH`].

use crate::nesting::{self, NestingError, MAX_SYNTAX_DEPTH};
use crate::policy::{CapabilityDenylist, Reference};
use crate::sanitize::SourceCandidate;
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::Parser;
use oxc_span::SourceType;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;

pub use crate::nesting::MAX_NESTING_DEPTH;

/// Why a candidate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    /// Candidate does not parse
    SyntaxError,
    /// Candidate references a denylisted capability
    ForbiddenCapability,
}

impl RejectionReason {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::SyntaxError => "syntax-error",
            RejectionReason::ForbiddenCapability => "forbidden-capability",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one candidate. Computed fresh every time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum ValidationVerdict {
    /// No denylisted reference found
    Accepted,
    /// Parse failure or first denylisted reference
    #[serde(rename_all = "camelCase")]
    Rejected {
        /// Rejection category
        reason: RejectionReason,
        /// Parser message, or the matched denylist pattern
        offending_token: String,
    },
}

impl ValidationVerdict {
    /// Whether the candidate passed.
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationVerdict::Accepted)
    }

    fn syntax(message: impl Into<String>) -> Self {
        ValidationVerdict::Rejected {
            reason: RejectionReason::SyntaxError,
            offending_token: message.into(),
        }
    }
}

/// Validate against the standard denylist.
pub fn validate(candidate: &SourceCandidate) -> ValidationVerdict {
    PolicyValidator::standard().validate(candidate)
}

/// Validator bound to one denylist.
#[derive(Debug, Clone, Copy)]
pub struct PolicyValidator<'d> {
    denylist: &'d CapabilityDenylist,
}

impl PolicyValidator<'static> {
    /// Validator over the process-wide denylist.
    pub fn standard() -> Self {
        Self {
            denylist: CapabilityDenylist::standard(),
        }
    }
}

impl<'d> PolicyValidator<'d> {
    /// Validator over a custom denylist.
    pub fn with_denylist(denylist: &'d CapabilityDenylist) -> Self {
        Self { denylist }
    }

    /// Parse and walk `candidate`.
    pub fn validate(&self, candidate: &SourceCandidate) -> ValidationVerdict {
        let code = candidate.as_str();
        if let Err(err) = nesting::scan(code) {
            tracing::debug!(%err, "candidate nests too deeply to parse");
            return ValidationVerdict::syntax(err.to_string());
        }
        nesting::on_parser_stack(|| self.parse_and_walk(code)).unwrap_or_else(|message| {
            tracing::warn!(%message, "validation aborted");
            ValidationVerdict::syntax(message)
        })
    }

    fn parse_and_walk(&self, code: &str) -> ValidationVerdict {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, code, SourceType::tsx()).parse();
        if ret.panicked || !ret.errors.is_empty() {
            let message = ret
                .errors
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "parser gave up on malformed input".into());
            tracing::debug!(%message, "candidate failed to parse");
            return ValidationVerdict::syntax(message);
        }

        match Walker::new(Some(self.denylist)).statements(&ret.program.body) {
            Ok(()) => ValidationVerdict::Accepted,
            Err(Stop::Forbidden(pattern)) => {
                tracing::debug!(%pattern, "candidate references a forbidden capability");
                ValidationVerdict::Rejected {
                    reason: RejectionReason::ForbiddenCapability,
                    offending_token: pattern,
                }
            }
            Err(Stop::TooDeep) => {
                let err = NestingError::syntax_tree();
                tracing::debug!(%err, "candidate syntax tree too deep");
                ValidationVerdict::syntax(err.to_string())
            }
        }
    }
}

/// Refuse a parsed program deeper than [`MAX_SYNTAX_DEPTH`].
pub(crate) fn check_syntax_depth(program: &Program<'_>) -> std::result::Result<(), NestingError> {
    match Walker::new(None).statements(&program.body) {
        Err(Stop::TooDeep) => Err(NestingError::syntax_tree()),
        _ => Ok(()),
    }
}

/// Why a walk stopped early.
enum Stop {
    /// Matched denylist pattern
    Forbidden(String),
    TooDeep,
}

type Walk = std::result::Result<(), Stop>;

/// Without a denylist the walk only measures depth.
struct Walker<'d> {
    denylist: Option<&'d CapabilityDenylist>,
    depth: Cell<usize>,
}

impl<'d> Walker<'d> {
    fn new(denylist: Option<&'d CapabilityDenylist>) -> Self {
        Self {
            denylist,
            depth: Cell::new(0),
        }
    }

    fn check(&self, reference: Reference<'_>) -> Walk {
        match self.denylist.and_then(|list| list.check(&reference)) {
            Some(pattern) => Err(Stop::Forbidden(pattern)),
            None => Ok(()),
        }
    }

    /// Run `step` one level further down.
    fn nested(&self, step: impl FnOnce(&Self) -> Walk) -> Walk {
        let depth = self.depth.get() + 1;
        if depth > MAX_SYNTAX_DEPTH {
            return Err(Stop::TooDeep);
        }
        self.depth.set(depth);
        let result = step(self);
        self.depth.set(depth - 1);
        result
    }

    fn import(&self, source: &StringLiteral<'_>) -> Walk {
        self.check(Reference::Import(source.value.as_str()))
    }

    // --- statements ---

    fn statements(&self, body: &[Statement<'_>]) -> Walk {
        body.iter().try_for_each(|stmt| self.statement(stmt))
    }

    fn statement(&self, stmt: &Statement<'_>) -> Walk {
        self.nested(|walker| walker.statement_kind(stmt))
    }

    fn statement_kind(&self, stmt: &Statement<'_>) -> Walk {
        match stmt {
            Statement::ExpressionStatement(es) => self.expression(&es.expression),
            Statement::BlockStatement(block) => self.statements(&block.body),
            Statement::IfStatement(ifs) => {
                self.expression(&ifs.test)?;
                self.statement(&ifs.consequent)?;
                match &ifs.alternate {
                    Some(alt) => self.statement(alt),
                    None => Ok(()),
                }
            }
            Statement::ReturnStatement(ret) => self.opt_expression(ret.argument.as_ref()),
            Statement::ThrowStatement(ts) => self.expression(&ts.argument),
            Statement::VariableDeclaration(decl) => self.variable_declaration(decl),
            Statement::FunctionDeclaration(fd) => self.function(fd),
            Statement::ClassDeclaration(cd) => self.class(cd),
            Statement::ForStatement(fors) => {
                if let Some(init) = &fors.init {
                    match init {
                        ForStatementInit::VariableDeclaration(decl) => self.variable_declaration(decl)?,
                        _ => {
                            if let Some(expr) = init.as_expression() {
                                self.expression(expr)?;
                            }
                        }
                    }
                }
                self.opt_expression(fors.test.as_ref())?;
                self.opt_expression(fors.update.as_ref())?;
                self.statement(&fors.body)
            }
            Statement::ForInStatement(fis) => {
                self.for_left(&fis.left)?;
                self.expression(&fis.right)?;
                self.statement(&fis.body)
            }
            Statement::ForOfStatement(fos) => {
                self.for_left(&fos.left)?;
                self.expression(&fos.right)?;
                self.statement(&fos.body)
            }
            Statement::WhileStatement(ws) => {
                self.expression(&ws.test)?;
                self.statement(&ws.body)
            }
            Statement::DoWhileStatement(dws) => {
                self.statement(&dws.body)?;
                self.expression(&dws.test)
            }
            Statement::WithStatement(ws) => {
                self.expression(&ws.object)?;
                self.statement(&ws.body)
            }
            Statement::SwitchStatement(ss) => {
                self.expression(&ss.discriminant)?;
                for case in &ss.cases {
                    self.opt_expression(case.test.as_ref())?;
                    self.statements(&case.consequent)?;
                }
                Ok(())
            }
            Statement::TryStatement(ts) => {
                self.statements(&ts.block.body)?;
                if let Some(handler) = &ts.handler {
                    if let Some(param) = &handler.param {
                        self.binding(&param.pattern)?;
                    }
                    self.statements(&handler.body.body)?;
                }
                match &ts.finalizer {
                    Some(finalizer) => self.statements(&finalizer.body),
                    None => Ok(()),
                }
            }
            Statement::LabeledStatement(ls) => self.statement(&ls.body),

            // module syntax
            Statement::ImportDeclaration(decl) => self.import(&decl.source),
            Statement::ExportAllDeclaration(decl) => self.import(&decl.source),
            Statement::ExportNamedDeclaration(decl) => {
                if let Some(source) = &decl.source {
                    self.import(source)?;
                }
                match &decl.declaration {
                    Some(declaration) => self.declaration(declaration),
                    None => Ok(()),
                }
            }
            Statement::ExportDefaultDeclaration(decl) => match &decl.declaration {
                ExportDefaultDeclarationKind::FunctionDeclaration(fd) => self.function(fd),
                ExportDefaultDeclarationKind::ClassDeclaration(cd) => self.class(cd),
                other => match other.as_expression() {
                    Some(expr) => self.expression(expr),
                    None => Ok(()),
                },
            },
            Statement::TSExportAssignment(assign) => self.expression(&assign.expression),

            // break, continue, empty, debugger, type-only declarations
            _ => Ok(()),
        }
    }

    fn declaration(&self, declaration: &Declaration<'_>) -> Walk {
        match declaration {
            Declaration::VariableDeclaration(decl) => self.variable_declaration(decl),
            Declaration::FunctionDeclaration(fd) => self.function(fd),
            Declaration::ClassDeclaration(cd) => self.class(cd),
            _ => Ok(()),
        }
    }

    fn variable_declaration(&self, decl: &VariableDeclaration<'_>) -> Walk {
        for declarator in &decl.declarations {
            self.binding(&declarator.id)?;
            self.opt_expression(declarator.init.as_ref())?;
        }
        Ok(())
    }

    fn for_left(&self, left: &ForStatementLeft<'_>) -> Walk {
        match left {
            ForStatementLeft::VariableDeclaration(decl) => self.variable_declaration(decl),
            other => match other.as_member_expression() {
                Some(member) => self.member(member),
                None => Ok(()),
            },
        }
    }

    /// Bindings only matter for their default values and computed keys.
    fn binding(&self, pattern: &BindingPattern<'_>) -> Walk {
        self.nested(|walker| walker.binding_kind(pattern))
    }

    fn binding_kind(&self, pattern: &BindingPattern<'_>) -> Walk {
        match &pattern.kind {
            BindingPatternKind::BindingIdentifier(_) => Ok(()),
            BindingPatternKind::AssignmentPattern(assign) => {
                self.binding(&assign.left)?;
                self.expression(&assign.right)
            }
            BindingPatternKind::ObjectPattern(obj) => {
                for prop in &obj.properties {
                    if prop.computed {
                        if let Some(key) = prop.key.as_expression() {
                            self.expression(key)?;
                        }
                    }
                    self.binding(&prop.value)?;
                }
                match &obj.rest {
                    Some(rest) => self.binding(&rest.argument),
                    None => Ok(()),
                }
            }
            BindingPatternKind::ArrayPattern(arr) => {
                for element in arr.elements.iter().flatten() {
                    self.binding(element)?;
                }
                match &arr.rest {
                    Some(rest) => self.binding(&rest.argument),
                    None => Ok(()),
                }
            }
        }
    }

    fn function(&self, func: &Function<'_>) -> Walk {
        for param in &func.params.items {
            self.binding(&param.pattern)?;
        }
        match &func.body {
            Some(body) => self.statements(&body.statements),
            None => Ok(()),
        }
    }

    fn class(&self, class: &Class<'_>) -> Walk {
        self.opt_expression(class.super_class.as_ref())?;
        for element in &class.body.body {
            match element {
                ClassElement::MethodDefinition(md) => {
                    if md.computed {
                        if let Some(key) = md.key.as_expression() {
                            self.expression(key)?;
                        }
                    }
                    self.function(&md.value)?;
                }
                ClassElement::PropertyDefinition(pd) => self.opt_expression(pd.value.as_ref())?,
                ClassElement::AccessorProperty(ap) => self.opt_expression(ap.value.as_ref())?,
                ClassElement::StaticBlock(sb) => self.statements(&sb.body)?,
                _ => {}
            }
        }
        Ok(())
    }

    // --- expressions ---

    fn opt_expression(&self, expr: Option<&Expression<'_>>) -> Walk {
        match expr {
            Some(expr) => self.expression(expr),
            None => Ok(()),
        }
    }

    fn arguments(&self, arguments: &[Argument<'_>]) -> Walk {
        for arg in arguments {
            match arg {
                Argument::SpreadElement(spread) => self.expression(&spread.argument)?,
                _ => {
                    if let Some(expr) = arg.as_expression() {
                        self.expression(expr)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn call(&self, call: &CallExpression<'_>) -> Walk {
        if let Expression::Identifier(ident) = &call.callee {
            if ident.name.as_str() == "require" {
                match call.arguments.first() {
                    Some(Argument::StringLiteral(lit)) => self.import(lit)?,
                    _ => self.check(Reference::DynamicImport)?,
                }
            }
        }
        self.expression(&call.callee)?;
        self.arguments(&call.arguments)
    }

    fn member(&self, member: &MemberExpression<'_>) -> Walk {
        match member {
            MemberExpression::StaticMemberExpression(m) => self.static_member(m),
            MemberExpression::ComputedMemberExpression(m) => {
                self.expression(&m.object)?;
                self.expression(&m.expression)
            }
            MemberExpression::PrivateFieldExpression(pf) => self.expression(&pf.object),
        }
    }

    /// A static chain rooted at an identifier is checked once as a whole
    /// path; otherwise the walk continues into whatever the chain hangs off.
    fn static_member(&self, member: &StaticMemberExpression<'_>) -> Walk {
        let mut segments = vec![member.property.name.as_str()];
        let mut object = &member.object;
        loop {
            if self.depth.get() + segments.len() > MAX_SYNTAX_DEPTH {
                return Err(Stop::TooDeep);
            }
            match object {
                Expression::StaticMemberExpression(inner) => {
                    segments.push(inner.property.name.as_str());
                    object = &inner.object;
                }
                Expression::Identifier(root) => {
                    segments.push(root.name.as_str());
                    segments.reverse();
                    let path = segments.join(".");
                    return self.check(Reference::MemberPath(&path));
                }
                other => return self.expression(other),
            }
        }
    }

    fn expression(&self, expr: &Expression<'_>) -> Walk {
        self.nested(|walker| walker.expression_kind(expr))
    }

    fn expression_kind(&self, expr: &Expression<'_>) -> Walk {
        match expr {
            Expression::Identifier(ident) => self.check(Reference::Identifier(ident.name.as_str())),
            Expression::StaticMemberExpression(member) => self.static_member(member),
            Expression::ComputedMemberExpression(member) => {
                self.expression(&member.object)?;
                self.expression(&member.expression)
            }
            Expression::PrivateFieldExpression(pf) => self.expression(&pf.object),
            Expression::CallExpression(call) => self.call(call),
            Expression::NewExpression(new_expr) => {
                self.expression(&new_expr.callee)?;
                self.arguments(&new_expr.arguments)
            }
            Expression::ImportExpression(imp) => match &imp.source {
                Expression::StringLiteral(lit) => self.import(lit),
                _ => self.check(Reference::DynamicImport),
            },
            Expression::ChainExpression(chain) => match &chain.expression {
                ChainElement::CallExpression(call) => self.call(call),
                ChainElement::TSNonNullExpression(nn) => self.expression(&nn.expression),
                other => match other.as_member_expression() {
                    Some(member) => self.member(member),
                    None => Ok(()),
                },
            },
            Expression::TaggedTemplateExpression(tagged) => {
                self.expression(&tagged.tag)?;
                tagged.quasi.expressions.iter().try_for_each(|e| self.expression(e))
            }
            Expression::TemplateLiteral(tl) => tl.expressions.iter().try_for_each(|e| self.expression(e)),
            Expression::ArrowFunctionExpression(arrow) => {
                for param in &arrow.params.items {
                    self.binding(&param.pattern)?;
                }
                self.statements(&arrow.body.statements)
            }
            Expression::FunctionExpression(func) => self.function(func),
            Expression::ClassExpression(class) => self.class(class),
            Expression::AssignmentExpression(assign) => {
                match &assign.left {
                    AssignmentTarget::AssignmentTargetIdentifier(ident) => {
                        self.check(Reference::Identifier(ident.name.as_str()))?
                    }
                    other => {
                        if let Some(member) = other.as_member_expression() {
                            self.member(member)?;
                        }
                    }
                }
                self.expression(&assign.right)
            }
            Expression::UpdateExpression(update) => match &update.argument {
                SimpleAssignmentTarget::AssignmentTargetIdentifier(ident) => {
                    self.check(Reference::Identifier(ident.name.as_str()))
                }
                other => match other.as_member_expression() {
                    Some(member) => self.member(member),
                    None => Ok(()),
                },
            },
            Expression::BinaryExpression(bin) => {
                self.expression(&bin.left)?;
                self.expression(&bin.right)
            }
            Expression::LogicalExpression(log) => {
                self.expression(&log.left)?;
                self.expression(&log.right)
            }
            Expression::ConditionalExpression(cond) => {
                self.expression(&cond.test)?;
                self.expression(&cond.consequent)?;
                self.expression(&cond.alternate)
            }
            Expression::UnaryExpression(unary) => self.expression(&unary.argument),
            Expression::AwaitExpression(aw) => self.expression(&aw.argument),
            Expression::YieldExpression(y) => self.opt_expression(y.argument.as_ref()),
            Expression::SequenceExpression(seq) => seq.expressions.iter().try_for_each(|e| self.expression(e)),
            Expression::ParenthesizedExpression(paren) => self.expression(&paren.expression),
            Expression::ArrayExpression(arr) => {
                for elem in &arr.elements {
                    match elem {
                        ArrayExpressionElement::SpreadElement(spread) => self.expression(&spread.argument)?,
                        ArrayExpressionElement::Elision(_) => {}
                        _ => {
                            if let Some(expr) = elem.as_expression() {
                                self.expression(expr)?;
                            }
                        }
                    }
                }
                Ok(())
            }
            Expression::ObjectExpression(obj) => {
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) => {
                            if p.computed {
                                if let Some(key) = p.key.as_expression() {
                                    self.expression(key)?;
                                }
                            }
                            self.expression(&p.value)?;
                        }
                        ObjectPropertyKind::SpreadProperty(spread) => self.expression(&spread.argument)?,
                    }
                }
                Ok(())
            }

            // type-level wrappers around a runtime expression
            Expression::TSAsExpression(e) => self.expression(&e.expression),
            Expression::TSSatisfiesExpression(e) => self.expression(&e.expression),
            Expression::TSNonNullExpression(e) => self.expression(&e.expression),
            Expression::TSTypeAssertion(e) => self.expression(&e.expression),
            Expression::TSInstantiationExpression(e) => self.expression(&e.expression),

            Expression::JSXElement(element) => self.jsx_element(element),
            Expression::JSXFragment(fragment) => self.nested(|walker| walker.jsx_children(&fragment.children)),

            // literals, this, super, meta properties
            _ => Ok(()),
        }
    }

    // --- JSX ---

    fn jsx_element(&self, element: &JSXElement<'_>) -> Walk {
        self.nested(|walker| walker.jsx_element_parts(element))
    }

    fn jsx_element_parts(&self, element: &JSXElement<'_>) -> Walk {
        for item in &element.opening_element.attributes {
            match item {
                JSXAttributeItem::Attribute(attr) => match &attr.value {
                    Some(JSXAttributeValue::ExpressionContainer(container)) => {
                        self.jsx_expression(&container.expression)?
                    }
                    Some(JSXAttributeValue::Element(nested)) => self.jsx_element(nested)?,
                    Some(JSXAttributeValue::Fragment(nested)) => self.jsx_children(&nested.children)?,
                    _ => {}
                },
                JSXAttributeItem::SpreadAttribute(spread) => self.expression(&spread.argument)?,
            }
        }
        self.jsx_children(&element.children)
    }

    fn jsx_children(&self, children: &[JSXChild<'_>]) -> Walk {
        for child in children {
            match child {
                JSXChild::Element(element) => self.jsx_element(element)?,
                JSXChild::Fragment(fragment) => self.nested(|walker| walker.jsx_children(&fragment.children))?,
                JSXChild::ExpressionContainer(container) => self.jsx_expression(&container.expression)?,
                JSXChild::Spread(spread) => self.expression(&spread.expression)?,
                JSXChild::Text(_) => {}
            }
        }
        Ok(())
    }

    fn jsx_expression(&self, expr: &JSXExpression<'_>) -> Walk {
        match expr.as_expression() {
            Some(expr) => self.expression(expr),
            None => Ok(()),
        }
    }
}
