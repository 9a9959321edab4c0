//! Recursion bounds for candidate source.
//!
//! The oxc parser and every pass after it recurse once per level of
//! syntax, and running a thread out of stack aborts the whole process
//! rather than failing one render. Every path that parses a candidate
//! therefore does three things:
//!
//! 1. [`scan`] the raw text and refuse anything nesting deeper than
//!    [`MAX_NESTING_DEPTH`], before any parser sees it.
//! 2. Parse, measure the tree with the validator's walker and refuse
//!    anything deeper than [`MAX_SYNTAX_DEPTH`].
//! 3. Do all of it [`on_parser_stack`], a worker thread whose stack is
//!    sized well past what those two limits allow.
//!
//! The scan is lexical. Brackets count as levels, except inside strings,
//! template text, comments and regular expression bodies. Operators and
//! prefix keywords add pressure to the level they appear on, because
//! `!!!!x` and `1+1+1` recurse without a single bracket. Pressure drops at
//! `;`, at `,` and at line breaks that end a statement.

use std::fmt;

/// Deepest nesting [`scan`] lets through to the parser.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Deepest parsed tree handed to the passes after the parser.
pub const MAX_SYNTAX_DEPTH: usize = 1024;

/// Stack of the thread candidates are parsed and lowered on.
pub const PARSER_STACK_BYTES: usize = 64 * 1024 * 1024;

/// Candidate nests deeper than a limit allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestingError {
    /// Measured depth, when the check counted to the end
    pub depth: Option<usize>,
    /// Limit that was exceeded
    pub limit: usize,
}

impl NestingError {
    /// The parsed tree went past [`MAX_SYNTAX_DEPTH`].
    pub(crate) fn syntax_tree() -> Self {
        Self {
            depth: None,
            limit: MAX_SYNTAX_DEPTH,
        }
    }
}

impl fmt::Display for NestingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.depth {
            Some(depth) => write!(f, "nesting depth {depth} exceeds maximum {}", self.limit),
            None => write!(f, "syntax tree nests deeper than {} levels", self.limit),
        }
    }
}

impl std::error::Error for NestingError {}

/// Refuse `code` if it nests deeper than [`MAX_NESTING_DEPTH`].
pub fn scan(code: &str) -> Result<(), NestingError> {
    let depth = Scanner::new(code.as_bytes()).run();
    if depth > MAX_NESTING_DEPTH {
        Err(NestingError {
            depth: Some(depth),
            limit: MAX_NESTING_DEPTH,
        })
    } else {
        Ok(())
    }
}

/// Run `task` on a scoped thread with [`PARSER_STACK_BYTES`] of stack.
///
/// `Err` carries a message when the thread could not be started or the
/// task panicked.
pub(crate) fn on_parser_stack<T, F>(task: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send,
    T: Send,
{
    std::thread::scope(|scope| {
        let worker = std::thread::Builder::new()
            .name("genui-parse".into())
            .stack_size(PARSER_STACK_BYTES)
            .spawn_scoped(scope, task)
            .map_err(|e| format!("parser thread failed to start: {e}"))?;
        worker.join().map_err(|_| "parser thread panicked".to_string())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    /// `(`, `[` or `{` in code; `control` when it holds an `if (...)` test
    Code { control: bool },
    /// `${` in a template literal
    Substitution,
    /// Between `<tag` and its `>`
    Tag,
    /// Element children
    Children,
    /// `(` or `[` in element text
    TextBracket,
}

#[derive(Debug)]
struct Frame {
    level: Level,
    /// Pressure dropped at the next `;`, `,` or statement break
    run: usize,
    /// Pressure kept across an `else` chain
    chain: usize,
}

impl Frame {
    fn new(level: Level) -> Self {
        Self { level, run: 0, chain: 0 }
    }
}

/// What the last significant token was, for `/` and `<` disambiguation
/// and statement breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    /// Start of input, or just after `;`
    Start,
    /// Something an operator or a call can follow
    Operand,
    /// A closing `}`
    Brace,
    /// A `.`; the next word is a property name
    Dot,
    /// Anything that expects an expression next
    Operator,
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    frames: Vec<Frame>,
    pressure: usize,
    deepest: usize,
    prev: Prev,
    newline: bool,
    control: bool,
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'#' | b'\\') || b >= 0x80
}

fn is_operator_byte(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'~' | b'+' | b'-' | b'*' | b'/' | b'%' | b'=' | b'<' | b'>' | b'&' | b'|' | b'^' | b'?' | b':' | b'@'
    )
}

/// Tokens that can open a statement after a line break.
fn starts_statement(b: u8) -> bool {
    is_word_byte(b) || matches!(b, b'\'' | b'"' | b'{' | b'}' | b';')
}

impl<'a> Scanner<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self {
            src,
            pos: 0,
            frames: vec![Frame::new(Level::Code { control: false })],
            pressure: 0,
            deepest: 0,
            prev: Prev::Start,
            newline: false,
            control: false,
        }
    }

    fn run(mut self) -> usize {
        while self.pos < self.src.len() {
            match self.top() {
                Level::Tag => self.tag(),
                Level::Children | Level::TextBracket => self.text(),
                Level::Code { .. } | Level::Substitution => self.code(),
            }
        }
        self.deepest
    }

    // --- bookkeeping ---

    fn top(&self) -> Level {
        self.frames
            .last()
            .map(|f| f.level)
            .unwrap_or(Level::Code { control: false })
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn note(&mut self, extra: usize) {
        let depth = self.frames.len() - 1 + self.pressure + extra;
        self.deepest = self.deepest.max(depth);
    }

    fn bump(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.run += 1;
            self.pressure += 1;
        }
        self.note(0);
    }

    fn bump_chain(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.chain += 1;
            self.pressure += 1;
        }
        self.note(0);
    }

    fn reset_run(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            self.pressure -= frame.run;
            frame.run = 0;
        }
    }

    fn reset_all(&mut self) {
        self.reset_run();
        if let Some(frame) = self.frames.last_mut() {
            self.pressure -= frame.chain;
            frame.chain = 0;
        }
    }

    fn push(&mut self, level: Level) {
        self.frames.push(Frame::new(level));
        self.note(0);
    }

    /// The root frame is never popped.
    fn pop(&mut self) -> Option<Frame> {
        if self.frames.len() < 2 {
            return None;
        }
        let frame = self.frames.pop()?;
        self.pressure -= frame.run + frame.chain;
        Some(frame)
    }

    fn word_at(&self, at: usize) -> &'a [u8] {
        let end = self.src[at..]
            .iter()
            .position(|b| !is_word_byte(*b))
            .map_or(self.src.len(), |n| at + n);
        &self.src[at..end]
    }

    // --- code ---

    fn code(&mut self) {
        let b = self.src[self.pos];
        match b {
            b'\n' => {
                self.newline = true;
                self.pos += 1;
            }
            b if b.is_ascii_whitespace() => self.pos += 1,
            b'/' if self.peek(1) == Some(b'/') => {
                self.pos = self.src[self.pos..]
                    .iter()
                    .position(|c| *c == b'\n')
                    .map_or(self.src.len(), |n| self.pos + n);
            }
            b'/' if self.peek(1) == Some(b'*') => self.block_comment(),
            _ => {
                self.statement_break(b);
                self.token(b);
            }
        }
    }

    fn block_comment(&mut self) {
        let body = self.pos + 2;
        match self.src[body..].windows(2).position(|w| w == b"*/") {
            Some(n) => {
                if self.src[body..body + n].contains(&b'\n') {
                    self.newline = true;
                }
                self.pos = body + n + 2;
            }
            None => {
                self.statement_break(b'/');
                self.operator();
            }
        }
    }

    /// Drop pressure when the next token opens a new statement.
    fn statement_break(&mut self, next: u8) {
        let newline = std::mem::take(&mut self.newline);
        let at_break = match self.prev {
            Prev::Start => true,
            Prev::Operand => newline && starts_statement(next),
            Prev::Brace => (newline && starts_statement(next)) || is_word_byte(next),
            Prev::Dot | Prev::Operator => false,
        };
        if !at_break {
            return;
        }
        let continues = is_word_byte(next)
            && matches!(
                self.word_at(self.pos),
                b"else" | b"catch" | b"finally" | b"in" | b"instanceof" | b"of" | b"as" | b"satisfies" | b"extends"
            );
        if !continues {
            self.reset_all();
            self.prev = Prev::Start;
        }
    }

    fn token(&mut self, b: u8) {
        let control = std::mem::take(&mut self.control);
        match b {
            b'\'' | b'"' => self.string(b),
            b'`' => {
                self.pos += 1;
                self.template();
            }
            b'0'..=b'9' => self.number(),
            b'.' => self.dot(),
            b'(' | b'[' | b'{' => self.open(b, control),
            b')' | b']' | b'}' => self.close(b),
            b'<' if self.expects_operand() && self.starts_element() => self.element(),
            b'/' if self.expects_operand() => self.regex(),
            b';' => {
                self.reset_run();
                self.prev = Prev::Start;
                self.pos += 1;
            }
            b',' => {
                self.reset_run();
                self.prev = Prev::Operator;
                self.pos += 1;
            }
            b if is_operator_byte(b) => self.operator(),
            b if is_word_byte(b) => self.word(control),
            _ => self.pos += 1,
        }
    }

    fn expects_operand(&self) -> bool {
        matches!(self.prev, Prev::Start | Prev::Operator | Prev::Brace)
    }

    /// `==`, `=>`, `&&`, `||`, `??` and friends count once; prefix
    /// operators count every time.
    fn operator(&mut self) {
        let b = self.src[self.pos];
        let joined = matches!(b, b'=' | b'>' | b'&' | b'|' | b'?')
            && self.pos > 0
            && is_operator_byte(self.src[self.pos - 1]);
        self.pos += 1;
        if !joined {
            self.bump();
        }
        self.prev = Prev::Operator;
    }

    fn word(&mut self, control: bool) {
        let word = self.word_at(self.pos);
        self.pos += word.len();
        if self.prev == Prev::Dot {
            self.prev = Prev::Operand;
            return;
        }
        self.prev = Prev::Operator;
        match word {
            b"if" | b"while" | b"for" | b"with" => {
                self.bump();
                self.control = true;
            }
            b"await" if control => self.control = true,
            b"else" => self.bump_chain(),
            b"typeof" | b"void" | b"delete" | b"await" | b"new" | b"yield" | b"do" | b"in" | b"instanceof"
            | b"extends" => self.bump(),
            b"return" | b"throw" | b"case" | b"of" | b"default" | b"export" => {}
            _ => self.prev = Prev::Operand,
        }
    }

    fn number(&mut self) {
        while self.pos < self.src.len() && (is_word_byte(self.src[self.pos]) || self.src[self.pos] == b'.') {
            self.pos += 1;
        }
        self.prev = Prev::Operand;
    }

    fn dot(&mut self) {
        if self.src[self.pos..].starts_with(b"...") {
            self.pos += 3;
            self.bump();
            self.prev = Prev::Operator;
        } else if self.prev != Prev::Operand && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.number();
        } else {
            self.pos += 1;
            self.prev = Prev::Dot;
        }
    }

    /// A string that does not close on its own line is not skipped.
    fn string(&mut self, quote: u8) {
        let mut i = self.pos + 1;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => i += 2,
                b'\n' => break,
                c if c == quote => {
                    self.pos = i + 1;
                    self.prev = Prev::Operand;
                    return;
                }
                _ => i += 1,
            }
        }
        self.pos += 1;
        self.prev = Prev::Operand;
    }

    /// Template text from the cursor up to the closing backtick or the next
    /// `${`. Unterminated text is scanned as code.
    fn template(&mut self) {
        let mut i = self.pos;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => i += 2,
                b'`' => {
                    self.pos = i + 1;
                    self.prev = Prev::Operand;
                    return;
                }
                b'$' if self.src.get(i + 1) == Some(&b'{') => {
                    self.pos = i + 2;
                    self.push(Level::Substitution);
                    self.prev = Prev::Operator;
                    return;
                }
                _ => i += 1,
            }
        }
        self.prev = Prev::Operand;
    }

    /// A regular expression body does not open levels, but its brackets
    /// and operators still count while it lasts. A `/` that does not close
    /// on its own line is division.
    fn regex(&mut self) {
        let mut i = self.pos + 1;
        let mut class = false;
        let mut open = 0usize;
        let mut operators = 0usize;
        let mut widest = 0usize;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => {
                    i += 2;
                    continue;
                }
                b'\n' => break,
                b'/' if !class => {
                    self.pos = i + 1;
                    while self.pos < self.src.len() && is_word_byte(self.src[self.pos]) {
                        self.pos += 1;
                    }
                    self.note(widest);
                    self.prev = Prev::Operand;
                    return;
                }
                b'[' => {
                    class = true;
                    open += 1;
                }
                b']' => {
                    class = false;
                    open = open.saturating_sub(1);
                }
                b'(' | b'{' => open += 1,
                b')' | b'}' => open = open.saturating_sub(1),
                c if is_operator_byte(c) => operators += 1,
                _ => {}
            }
            widest = widest.max(open + operators);
            i += 1;
        }
        self.operator();
    }

    fn open(&mut self, b: u8, control: bool) {
        if b != b'{' && self.prev == Prev::Operand {
            // call or index on the operand before it
            self.bump();
        }
        self.pos += 1;
        self.push(Level::Code {
            control: control && b == b'(',
        });
        self.prev = Prev::Operator;
    }

    fn close(&mut self, b: u8) {
        self.pos += 1;
        match self.top() {
            Level::Substitution if b == b'}' => {
                self.pop();
                self.template();
            }
            Level::Code { control } => {
                self.pop();
                self.prev = if control {
                    Prev::Operator
                } else if b == b'}' {
                    Prev::Brace
                } else {
                    Prev::Operand
                };
            }
            _ => self.prev = Prev::Operand,
        }
    }

    // --- JSX ---

    /// `<` followed by a tag name or `>`, but not `<T,>` or `<T extends`.
    fn starts_element(&self) -> bool {
        match self.peek(1) {
            Some(b'>') => true,
            Some(c) if c.is_ascii_alphabetic() => {
                let name = self.word_at(self.pos + 1);
                let rest = &self.src[self.pos + 1 + name.len()..];
                let after = rest.iter().position(|c| !c.is_ascii_whitespace()).map(|n| &rest[n..]);
                !matches!(after, Some(tail) if tail.starts_with(b",") || tail.starts_with(b"extends "))
            }
            _ => false,
        }
    }

    fn element(&mut self) {
        self.pos += 1;
        if self.peek(0) == Some(b'>') {
            self.pos += 1;
            self.push(Level::Children);
        } else {
            self.push(Level::Tag);
        }
    }

    fn tag(&mut self) {
        let b = self.src[self.pos];
        match b {
            b'"' | b'\'' => {
                self.pos = self.src[self.pos + 1..]
                    .iter()
                    .position(|c| *c == b)
                    .map_or(self.pos + 1, |n| self.pos + n + 2);
            }
            b'{' => {
                self.pos += 1;
                self.push(Level::Code { control: false });
                self.prev = Prev::Operator;
            }
            b'/' if self.peek(1) == Some(b'>') => {
                self.pos += 2;
                self.pop();
                self.prev = Prev::Operand;
            }
            b'>' => {
                self.pos += 1;
                if let Some(frame) = self.frames.last_mut() {
                    frame.level = Level::Children;
                }
            }
            _ => self.pos += 1,
        }
    }

    /// Element text. Quotes mean nothing here; operators still count, in
    /// case the `<` that opened the element was really a type.
    fn text(&mut self) {
        let b = self.src[self.pos];
        match b {
            b'{' => {
                self.pos += 1;
                self.push(Level::Code { control: false });
                self.prev = Prev::Operator;
            }
            b'<' if self.peek(1) == Some(b'/') => self.closing_tag(),
            b'<' if self.starts_element() => self.element(),
            b'(' | b'[' => {
                self.pos += 1;
                self.push(Level::TextBracket);
            }
            b')' | b']' => {
                self.pos += 1;
                if self.top() == Level::TextBracket {
                    self.pop();
                }
            }
            b if is_operator_byte(b) => {
                self.pos += 1;
                self.bump();
            }
            _ => self.pos += 1,
        }
    }

    fn closing_tag(&mut self) {
        while let Some(frame) = self.pop() {
            if frame.level == Level::Children {
                break;
            }
        }
        self.pos = self.src[self.pos..]
            .iter()
            .position(|c| *c == b'>')
            .map_or(self.src.len(), |n| self.pos + n + 1);
        self.prev = Prev::Operand;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::sanitize::sanitize;

    fn depth(code: &str) -> usize {
        Scanner::new(code.as_bytes()).run()
    }

    #[test]
    fn test_catalog_components_pass() {
        for entry in catalog::ALL {
            let candidate = sanitize(entry.source);
            let code = candidate.as_str();
            assert!(scan(code).is_ok(), "{} nests {}", entry.key, depth(code));
        }
    }

    #[test]
    fn test_brackets_at_limit_pass() {
        let code = format!("{}1{}", "(".repeat(MAX_NESTING_DEPTH), ")".repeat(MAX_NESTING_DEPTH));
        assert!(scan(&code).is_ok());
    }

    #[test]
    fn test_brackets_over_limit_rejected() {
        let code = format!("{}1{}", "[".repeat(MAX_NESTING_DEPTH + 1), "]".repeat(MAX_NESTING_DEPTH + 1));
        assert_eq!(
            scan(&code),
            Err(NestingError {
                depth: Some(MAX_NESTING_DEPTH + 1),
                limit: MAX_NESTING_DEPTH
            })
        );
    }

    #[test]
    fn test_brackets_inside_literals_do_not_count() {
        let parens = "(".repeat(300);
        for code in [
            format!("const s = \"{parens}\";"),
            format!("const s = '{parens}';"),
            format!("const s = `{parens}`;"),
            format!("// {parens}\nconst s = 1;"),
            format!("/* {parens} */ const s = 1;"),
            format!("const r = /{}/;", "\\(".repeat(300)),
            format!("const s = `${{ '{parens}' }}`;"),
        ] {
            assert!(scan(&code).is_ok(), "{code:.60} nests {}", depth(&code));
        }
    }

    #[test]
    fn test_bracket_free_chains_rejected() {
        let unary = format!("const x = {}y;", "!".repeat(5000));
        assert!(scan(&unary).is_err());
        let binary = format!("const x = 1{};", "+1".repeat(5000));
        assert!(scan(&binary).is_err());
        let arrows = format!("const f = {}0;", "a => ".repeat(5000));
        assert!(scan(&arrows).is_err());
        let calls = format!("f{};", "()".repeat(5000));
        assert!(scan(&calls).is_err());
    }

    #[test]
    fn test_chains_split_across_lines_still_count() {
        let unary = format!("const x =\n{}y;", "!\n".repeat(5000));
        assert!(scan(&unary).is_err());
        let binary = format!("const x = 1{};", "\n+ 1".repeat(5000));
        assert!(scan(&binary).is_err());
    }

    #[test]
    fn test_else_if_chains_count() {
        let chain = format!("if (a) x = 1;\n{}", "else if (a) x = 1;\n".repeat(1000));
        assert!(scan(&chain).is_err());
        let braced = format!("if (a) {{}}{}", " else if (a) {{}}".repeat(1000));
        assert!(scan(&braced).is_err());
        let nested = format!("{}x;", "if (a)\n".repeat(1000));
        assert!(scan(&nested).is_err());
    }

    #[test]
    fn test_statements_reset_pressure() {
        let many = "x = 1 + 1 + 1;\n".repeat(2000);
        assert!(scan(&many).is_ok());
        let no_semicolons = "const a = f(b) + c\n".repeat(2000);
        assert!(scan(&no_semicolons).is_ok());
        let ifs = "if (a) { x = 1 } else { x = 2 }\n".repeat(2000);
        assert!(scan(&ifs).is_ok());
        let items = format!("const xs = [{}];", "a + 1, ".repeat(2000));
        assert!(scan(&items).is_ok());
    }

    #[test]
    fn test_jsx_elements_are_levels() {
        let code = format!("const x = {}hi{};", "<div>".repeat(300), "</div>".repeat(300));
        assert!(scan(&code).is_err());
        let code = format!("const x = {}hi{};", "<div>".repeat(50), "</div>".repeat(50));
        assert!(scan(&code).is_ok());
        let fragments = format!("const x = {}{};", "<>".repeat(300), "</>".repeat(300));
        assert!(scan(&fragments).is_err());
    }

    #[test]
    fn test_jsx_text_quotes_are_text() {
        let code = "function A() { return <p>Don't {\"stop\"} (really)</p>; }\nconst b = 1;";
        assert!(scan(code).is_ok());
        let code = "const C = <T,>(x: T) => x;\nconst d = <div className=\"a(b\">ok</div>;";
        assert!(scan(code).is_ok());
    }

    #[test]
    fn test_error_message() {
        let err = NestingError {
            depth: Some(300),
            limit: MAX_NESTING_DEPTH,
        };
        assert_eq!(err.to_string(), "nesting depth 300 exceeds maximum 256");
        assert_eq!(
            NestingError::syntax_tree().to_string(),
            "syntax tree nests deeper than 1024 levels"
        );
    }

    #[test]
    fn test_parser_stack_runs_task() {
        assert_eq!(on_parser_stack(|| 6 * 7), Ok(42));
        let borrowed = String::from("candidate");
        assert_eq!(on_parser_stack(|| borrowed.len()), Ok(9));
    }
}
