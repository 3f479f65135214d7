//! Layout-aware lexer.
//!
//! Converts source text into a token stream with `NL`/`INDENT`/`DEDENT`
//! layout tokens. Indentation is tab-based and only significant at the
//! start of logical lines outside hook bodies and expression groupings.
//! Braces are classified as hook-scoped (after `pre hook` / `post hook`)
//! or expression-scoped; inside hook bodies no layout tokens are
//! emitted. Paths are a single token after an HTTP method keyword.

pub mod token;

use std::collections::VecDeque;

use crate::ast::{Position, Span};
use crate::diagnostics::Diagnostic;

pub use token::{lookup_keyword, Token, TokenKind};

pub struct Lexer<'a> {
    path: &'a str,
    src: &'a str,

    pos: usize,
    line: usize,
    col: usize,

    line_start: bool,
    line_start_pos: Position,

    indent_stack: Vec<usize>,
    expect_indent: bool,
    line_had_colon: bool,

    hook_candidate: Option<TokenKind>,
    pending_hook_brace: bool,

    allow_path: bool,
    allow_bare_key: bool,

    hook_depth: usize,
    paren_depth: usize,
    bracket_depth: usize,
    brace_expr_depth: usize,

    queue: VecDeque<Token>,
    diags: Vec<Diagnostic>,

    eof_processed: bool,
}

/// Lexes the full source, returning all tokens (ending with `EOF`) and
/// any lex diagnostics.
pub fn lex(path: &str, src: &str) -> (Vec<Token>, Vec<Diagnostic>) {
    let mut lx = Lexer::new(path, src);
    let mut tokens = Vec::new();
    loop {
        let tok = lx.next_token();
        let done = tok.kind == TokenKind::Eof;
        tokens.push(tok);
        if done {
            break;
        }
    }
    (tokens, lx.into_diags())
}

impl<'a> Lexer<'a> {
    pub fn new(path: &'a str, src: &'a str) -> Self {
        Lexer {
            path,
            src,
            pos: 0,
            line: 1,
            col: 1,
            line_start: true,
            line_start_pos: Position { offset: 0, line: 1, column: 1 },
            indent_stack: vec![0],
            expect_indent: false,
            line_had_colon: false,
            hook_candidate: None,
            pending_hook_brace: false,
            allow_path: false,
            allow_bare_key: false,
            hook_depth: 0,
            paren_depth: 0,
            bracket_depth: 0,
            brace_expr_depth: 0,
            queue: VecDeque::new(),
            diags: Vec::new(),
            eof_processed: false,
        }
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn into_diags(self) -> Vec<Diagnostic> {
        self.diags
    }

    pub fn next_token(&mut self) -> Token {
        if let Some(tok) = self.queue.pop_front() {
            return tok;
        }

        loop {
            if self.pos >= self.src.len() {
                return self.emit_eof();
            }

            if self.line_start {
                self.handle_line_start();
                if let Some(tok) = self.queue.pop_front() {
                    return tok;
                }
                if self.pos >= self.src.len() {
                    return self.emit_eof();
                }
            }

            match self.peek() {
                Some(' ') | Some('\t') => self.consume_whitespace(),
                Some('#') if self.hash_starts_comment() => self.skip_comment(),
                Some('\n') | Some('\r') => {
                    self.handle_newline();
                    if let Some(tok) = self.queue.pop_front() {
                        return tok;
                    }
                }
                _ => return self.scan_token(),
            }
        }
    }

    fn emit_eof(&mut self) -> Token {
        if !self.eof_processed {
            self.eof_processed = true;
            self.allow_path = false;
            self.allow_bare_key = false;
            self.hook_candidate = None;
            self.pending_hook_brace = false;

            if self.hook_depth > 0 {
                self.add_error(
                    "E_PARSE_UNTERMINATED_HOOK",
                    "unterminated hook block",
                    "close the hook block with '}'",
                    Span::at(self.position()),
                );
                self.hook_depth = 0;
            }
            if self.paren_depth > 0 || self.bracket_depth > 0 || self.brace_expr_depth > 0 {
                self.add_error(
                    "E_PARSE_UNTERMINATED_DELIM",
                    "unterminated expression grouping",
                    "close the open delimiter before EOF",
                    Span::at(self.position()),
                );
                self.paren_depth = 0;
                self.bracket_depth = 0;
                self.brace_expr_depth = 0;
            }

            while self.indent_stack.len() > 1 {
                self.indent_stack.pop();
                let span = Span::at(self.position());
                self.queue.push_back(Token::new(TokenKind::Dedent, "", span));
            }
        }

        if let Some(tok) = self.queue.pop_front() {
            return tok;
        }
        Token::new(TokenKind::Eof, "", Span::at(self.position()))
    }

    fn handle_line_start(&mut self) {
        let mut indent = 0usize;
        loop {
            match self.peek() {
                Some('\t') => {
                    if self.hook_depth == 0 && self.expr_depth() == 0 {
                        indent += 1;
                    }
                    self.advance();
                }
                Some(' ') => {
                    if self.hook_depth == 0 && self.expr_depth() == 0 {
                        self.add_error(
                            "E_PARSE_TAB",
                            "space indentation is not allowed",
                            "replace spaces with tabs",
                            Span::at(self.position()),
                        );
                        while self.peek() == Some(' ') {
                            self.advance();
                        }
                    } else {
                        self.advance();
                    }
                }
                _ => break,
            }
        }

        match self.peek() {
            Some('#') if self.hash_starts_comment() => {
                self.skip_comment();
                return;
            }
            Some('\n') | Some('\r') | None => return,
            _ => {}
        }

        if self.hook_depth == 0 && self.expr_depth() == 0 {
            self.process_indent(indent);
            self.expect_indent = false;
        }

        self.line_start = false;
    }

    fn process_indent(&mut self, indent: usize) {
        let top = *self.indent_stack.last().unwrap();
        if self.expect_indent {
            if indent <= top {
                self.add_error(
                    "E_PARSE_INDENT",
                    "expected an indented block",
                    "indent this line to start the block",
                    Span::at(self.indent_pos(indent)),
                );
            } else {
                self.indent_stack.push(indent);
                let span = Span { start: self.line_start_pos, end: self.indent_pos(indent) };
                self.queue.push_back(Token::new(TokenKind::Indent, "", span));
                return;
            }
        }

        if indent > top {
            self.add_error(
                "E_PARSE_INDENT",
                "unexpected indentation",
                "remove extra indentation or add ':' to open a block",
                Span::at(self.indent_pos(indent)),
            );
            self.indent_stack.push(indent);
            let span = Span { start: self.line_start_pos, end: self.indent_pos(indent) };
            self.queue.push_back(Token::new(TokenKind::Indent, "", span));
            return;
        }

        if indent < top {
            while self.indent_stack.len() > 1 && indent < *self.indent_stack.last().unwrap() {
                self.indent_stack.pop();
                let span = Span { start: self.line_start_pos, end: self.indent_pos(indent) };
                self.queue.push_back(Token::new(TokenKind::Dedent, "", span));
            }
            if indent != *self.indent_stack.last().unwrap() {
                self.add_error(
                    "E_PARSE_DEDENT",
                    "dedent does not match any outer indentation level",
                    "align indentation with an existing block",
                    Span::at(self.indent_pos(indent)),
                );
            }
        }
    }

    fn handle_newline(&mut self) {
        let start = self.position();
        self.consume_newline();
        self.allow_path = false;
        self.allow_bare_key = false;
        self.hook_candidate = None;
        self.pending_hook_brace = false;

        if self.expr_depth() == 0 {
            let span = Span { start, end: self.position() };
            self.queue.push_back(Token::new(TokenKind::Nl, "", span));
            if self.line_had_colon {
                self.expect_indent = true;
            }
            self.line_had_colon = false;
        }
    }

    fn consume_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.advance();
        }
    }

    /// `#` starts a comment only when followed by whitespace or the end
    /// of the line; `#.token` is the response-root operator.
    fn hash_starts_comment(&self) -> bool {
        match self.peek_n(1) {
            None => true,
            Some(c) => c == '\n' || c == '\r' || c.is_whitespace(),
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' {
                return;
            }
            self.advance();
        }
    }

    fn scan_token(&mut self) -> Token {
        let start = self.position();
        self.line_start = false;

        if self.allow_bare_key {
            self.allow_bare_key = false;
            match self.peek() {
                Some('"') | Some('`') => return self.scan_string(),
                Some(c) if is_bare_key_char(c) => return self.scan_bare_key(),
                _ => {}
            }
        }

        if self.allow_path {
            self.allow_path = false;
            if self.peek() == Some('/') || self.peek_path_prefix() {
                return self.scan_path();
            }
        }

        if let Some(tok) = self.scan_operator_or_punct() {
            return tok;
        }

        match self.peek() {
            Some('"') | Some('`') => return self.scan_string(),
            Some(c) if c.is_ascii_digit() => return self.scan_number_or_duration(),
            _ => {}
        }

        if self.peek_path_prefix() {
            return self.scan_path();
        }

        if let Some(c) = self.peek() {
            if is_ident_start(c) {
                return self.scan_ident_or_keyword();
            }
        }

        self.advance();
        let span = Span { start, end: self.position() };
        self.add_error(
            "E_PARSE_UNEXPECTED_CHAR",
            "unexpected character",
            "remove or replace the character",
            span,
        );
        let lit = self.src[start.offset..self.pos].to_string();
        self.token(TokenKind::Illegal, lit, start)
    }

    fn scan_operator_or_punct(&mut self) -> Option<Token> {
        let start = self.position();
        let rest = self.remaining();

        for (text, kind) in [
            ("->", TokenKind::Arrow),
            ("<=", TokenKind::Le),
            (">=", TokenKind::Ge),
            ("==", TokenKind::Eq),
            ("!=", TokenKind::Ne),
        ] {
            if rest.starts_with(text) {
                self.advance_n(2);
                return Some(self.token(kind, text, start));
            }
        }

        let c = self.peek()?;
        let kind = match c {
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '=' => TokenKind::Assign,
            ':' => TokenKind::Colon,
            '?' => TokenKind::Question,
            '$' => TokenKind::Dollar,
            '#' => TokenKind::Hash,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ';' => TokenKind::Semicolon,
            '!' => TokenKind::Not,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '~' => TokenKind::Tilde,
            '(' => {
                self.advance();
                self.paren_depth += 1;
                return Some(self.token(TokenKind::LParen, "(", start));
            }
            ')' => {
                self.advance();
                if self.paren_depth > 0 {
                    self.paren_depth -= 1;
                } else {
                    let span = Span { start, end: self.position() };
                    self.add_error(
                        "E_PARSE_UNMATCHED_BRACE",
                        "unmatched ')'",
                        "remove the extra parenthesis",
                        span,
                    );
                }
                return Some(self.token(TokenKind::RParen, ")", start));
            }
            '[' => {
                self.advance();
                self.bracket_depth += 1;
                return Some(self.token(TokenKind::LBrack, "[", start));
            }
            ']' => {
                self.advance();
                if self.bracket_depth > 0 {
                    self.bracket_depth -= 1;
                } else {
                    let span = Span { start, end: self.position() };
                    self.add_error(
                        "E_PARSE_UNMATCHED_BRACE",
                        "unmatched ']'",
                        "remove the extra bracket",
                        span,
                    );
                }
                return Some(self.token(TokenKind::RBrack, "]", start));
            }
            '{' => {
                self.advance();
                if self.pending_hook_brace {
                    self.hook_depth += 1;
                    self.pending_hook_brace = false;
                } else {
                    self.brace_expr_depth += 1;
                }
                return Some(self.token(TokenKind::LBrace, "{", start));
            }
            '}' => {
                self.advance();
                if self.brace_expr_depth > 0 {
                    self.brace_expr_depth -= 1;
                } else if self.hook_depth > 0 {
                    self.hook_depth -= 1;
                } else {
                    let span = Span { start, end: self.position() };
                    self.add_error(
                        "E_PARSE_UNMATCHED_BRACE",
                        "unmatched '}'",
                        "remove the extra brace",
                        span,
                    );
                }
                return Some(self.token(TokenKind::RBrace, "}", start));
            }
            _ => return None,
        };
        self.advance();
        let lit = c.to_string();
        Some(self.token(kind, lit, start))
    }

    fn scan_string(&mut self) -> Token {
        let start = self.position();
        let quote = self.peek().unwrap();
        self.advance();

        if quote == '`' {
            loop {
                match self.peek() {
                    None => {
                        let span = Span { start, end: self.position() };
                        self.add_error(
                            "E_PARSE_UNTERMINATED_RAW_STRING",
                            "unterminated raw string",
                            "close the string with a backtick",
                            span,
                        );
                        break;
                    }
                    Some('`') => {
                        self.advance();
                        break;
                    }
                    Some(_) => self.advance(),
                }
            }
            let lit = self.src[start.offset..self.pos].to_string();
            return self.token(TokenKind::Str, lit, start);
        }

        loop {
            match self.peek() {
                None | Some('\n') | Some('\r') => {
                    let span = Span { start, end: self.position() };
                    self.add_error(
                        "E_PARSE_UNTERMINATED_STRING",
                        "unterminated string literal",
                        "close the string with '\"'",
                        span,
                    );
                    break;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    if self.peek().is_none() {
                        break;
                    }
                    self.advance();
                }
                Some(_) => self.advance(),
            }
        }

        let lit = self.src[start.offset..self.pos].to_string();
        self.token(TokenKind::Str, lit, start)
    }

    fn scan_number_or_duration(&mut self) -> Token {
        let start = self.position();
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') {
            if matches!(self.peek_n(1), Some(c) if c.is_ascii_digit()) {
                self.advance();
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        if self.scan_duration_unit() {
            let lit = self.src[start.offset..self.pos].to_string();
            return self.token(TokenKind::Duration, lit, start);
        }
        let lit = self.src[start.offset..self.pos].to_string();
        self.token(TokenKind::Number, lit, start)
    }

    fn scan_duration_unit(&mut self) -> bool {
        let rest = self.remaining();
        if rest.starts_with("ms") {
            let after = rest.chars().nth(2);
            if !after.is_some_and(is_ident_char) {
                self.advance_n(2);
                return true;
            }
        }

        let mut chars = rest.chars();
        match chars.next() {
            Some('s' | 'm' | 'h' | 'd') => {
                let after = chars.next();
                if after.is_some_and(is_ident_char) {
                    return false;
                }
                self.advance();
                true
            }
            _ => false,
        }
    }

    fn scan_bare_key(&mut self) -> Token {
        let start = self.position();
        while matches!(self.peek(), Some(c) if is_bare_key_char(c)) {
            self.advance();
        }
        let lit = self.src[start.offset..self.pos].to_string();
        self.token(TokenKind::BareKey, lit, start)
    }

    fn scan_ident_or_keyword(&mut self) -> Token {
        let start = self.position();
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.advance();
        }
        let lit = self.src[start.offset..self.pos].to_string();
        let kind = lookup_keyword(&lit).unwrap_or(TokenKind::Ident);
        self.token(kind, lit, start)
    }

    fn peek_path_prefix(&self) -> bool {
        let rest = self.remaining();
        rest.starts_with("http://") || rest.starts_with("https://")
    }

    fn scan_path(&mut self) -> Token {
        let start = self.position();
        while let Some(c) = self.peek() {
            if c == '\n' || c == '\r' || c.is_whitespace() || c == '#' {
                break;
            }
            self.advance();
        }
        let lit = self.src[start.offset..self.pos].to_string();
        self.token(TokenKind::Path, lit, start)
    }

    fn token(&mut self, kind: TokenKind, lit: impl Into<String>, start: Position) -> Token {
        let tok = Token::new(kind, lit, Span { start, end: self.position() });
        self.after_token(&tok);
        tok
    }

    fn after_token(&mut self, tok: &Token) {
        if tok.kind.is_http_method() {
            self.allow_path = true;
        }
        if tok.kind == TokenKind::Header || tok.kind == TokenKind::Query {
            self.allow_bare_key = true;
        }

        match tok.kind {
            TokenKind::Pre | TokenKind::Post => {
                self.hook_candidate = Some(tok.kind);
            }
            TokenKind::Hook => {
                if self.hook_candidate.is_some() {
                    self.pending_hook_brace = true;
                }
                self.hook_candidate = None;
            }
            TokenKind::Nl | TokenKind::Indent | TokenKind::Dedent => {}
            _ => {
                if self.pending_hook_brace && tok.kind != TokenKind::LBrace {
                    self.pending_hook_brace = false;
                }
                self.hook_candidate = None;
            }
        }

        if tok.kind == TokenKind::Colon && self.expr_depth() == 0 && self.hook_depth == 0 {
            self.line_had_colon = true;
        } else if self.line_had_colon
            && !matches!(tok.kind, TokenKind::Nl | TokenKind::Indent | TokenKind::Dedent)
        {
            self.line_had_colon = false;
        }
    }

    fn expr_depth(&self) -> usize {
        self.paren_depth + self.bracket_depth + self.brace_expr_depth
    }

    fn add_error(&mut self, code: &str, msg: &str, hint: &str, span: Span) {
        self.diags.push(Diagnostic::error(code, msg, self.path, span, hint));
    }

    fn position(&self) -> Position {
        Position { offset: self.pos, line: self.line, column: self.col }
    }

    fn indent_pos(&self, indent: usize) -> Position {
        Position {
            offset: self.line_start_pos.offset + indent,
            line: self.line_start_pos.line,
            column: 1 + indent,
        }
    }

    fn remaining(&self) -> &str {
        &self.src[self.pos.min(self.src.len())..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_n(&self, n: usize) -> Option<char> {
        self.remaining().chars().nth(n)
    }

    fn advance(&mut self) {
        let Some(c) = self.peek() else { return };
        self.pos += c.len_utf8();
        if c == '\n' || c == '\r' {
            self.line += 1;
            self.col = 1;
            self.line_start = true;
            self.line_start_pos = Position { offset: self.pos, line: self.line, column: 1 };
        } else {
            self.col += 1;
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn consume_newline(&mut self) {
        if self.pos >= self.src.len() {
            return;
        }
        if self.remaining().starts_with("\r\n") {
            self.pos += 2;
        } else if matches!(self.peek(), Some('\r') | Some('\n')) {
            self.pos += 1;
        }
        self.line += 1;
        self.col = 1;
        self.line_start = true;
        self.line_start_pos = Position { offset: self.pos, line: self.line, column: 1 };
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_bare_key_char(c: char) -> bool {
    c == '-' || c == '_' || c.is_alphanumeric()
}
