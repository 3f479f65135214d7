//! Recursive-descent parser with a Pratt expression core.
//!
//! The parser never panics on malformed input: it records a diagnostic
//! and resynchronizes at the next `NL`/`DEDENT` (line-level errors) or
//! the next top-level keyword, returning a best-effort AST so semantic
//! analysis can still run.

use crate::ast::*;
use crate::diagnostics::Diagnostic;
use crate::lexer::{Lexer, Token, TokenKind};

const PREC_LOWEST: u8 = 0;
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_COMPARE: u8 = 3;
const PREC_ADD: u8 = 4;
const PREC_MUL: u8 = 5;
const PREC_PREFIX: u8 = 6;

/// Parses the provided source into an AST, returning the program plus
/// lexer and parser diagnostics separately.
pub fn parse(path: &str, src: &str) -> (Program, Vec<Diagnostic>, Vec<Diagnostic>) {
    let lx = Lexer::new(path, src);
    let mut parser = Parser::new(lx);
    let program = parser.parse_program();
    let (lex_diags, parse_diags) = parser.into_diags();
    (program, lex_diags, parse_diags)
}

pub struct Parser<'a> {
    lx: Lexer<'a>,
    path: String,
    cur: Token,
    peek: Token,
    diags: Vec<Diagnostic>,
}

impl<'a> Parser<'a> {
    pub fn new(mut lx: Lexer<'a>) -> Self {
        let path = lx.path().to_string();
        let cur = lx.next_token();
        let peek = lx.next_token();
        Parser { lx, path, cur, peek, diags: Vec::new() }
    }

    pub fn into_diags(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        (self.lx.into_diags(), self.diags)
    }

    fn advance(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, self.lx.next_token());
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.cur.kind == kind {
            self.advance();
            return true;
        }
        false
    }

    fn expect(&mut self, kind: TokenKind, msg: &str, hint: &str) -> Token {
        if self.cur.kind != kind {
            self.add_error("E_PARSE_EXPECTED_TOKEN", msg, hint, self.cur.span);
            let tok = self.cur.clone();
            self.advance();
            return Token::new(TokenKind::Illegal, tok.lit, tok.span);
        }
        let tok = self.cur.clone();
        self.advance();
        tok
    }

    fn add_error(&mut self, code: &str, msg: &str, hint: &str, span: Span) {
        self.diags.push(Diagnostic::error(code, msg, &self.path, span, hint));
    }

    pub fn parse_program(&mut self) -> Program {
        let mut stmts: Vec<Stmt> = Vec::new();
        let mut span = Span::default();
        while self.cur.kind != TokenKind::Eof {
            if self.match_kind(TokenKind::Nl) {
                continue;
            }
            match self.parse_top_stmt() {
                Some(stmt) => {
                    span = span.join(stmt.span());
                    stmts.push(stmt);
                }
                None => self.sync_top(),
            }
        }
        Program { stmts, span }
    }

    fn parse_top_stmt(&mut self) -> Option<Stmt> {
        match self.cur.kind {
            TokenKind::Base | TokenKind::Timeout => {
                let stmt = self.parse_setting();
                self.expect(TokenKind::Nl, "expected newline after setting", "add a newline after the setting");
                Some(Stmt::Setting(stmt))
            }
            TokenKind::Import => {
                let stmt = self.parse_import();
                self.expect(TokenKind::Nl, "expected newline after import", "add a newline after the import");
                Some(Stmt::Import(stmt))
            }
            TokenKind::Let => {
                let stmt = self.parse_let();
                self.expect(TokenKind::Nl, "expected newline after let", "add a newline after the let");
                Some(Stmt::Let(stmt))
            }
            TokenKind::Req => Some(Stmt::Req(self.parse_req_decl())),
            TokenKind::Flow => Some(Stmt::Flow(self.parse_flow_decl())),
            _ => {
                self.add_error(
                    "E_PARSE_UNEXPECTED_TOKEN",
                    "unexpected token at top level",
                    "start with a declaration",
                    self.cur.span,
                );
                None
            }
        }
    }

    fn parse_setting(&mut self) -> SettingStmt {
        let start = self.cur.span;
        if self.match_kind(TokenKind::Base) {
            let tok = self.expect(
                TokenKind::Str,
                "expected string literal after base",
                "provide a base URL string",
            );
            let lit = self.string_lit(tok);
            let span = start.join(lit.span);
            return SettingStmt { kind: SettingKind::Base, value: Expr::Str(lit), span };
        }

        self.expect(TokenKind::Timeout, "expected timeout", "use timeout <duration>");
        let tok = self.expect(
            TokenKind::Duration,
            "expected duration literal after timeout",
            "provide a duration like 5s",
        );
        let lit = DurationLit { raw: tok.lit, span: tok.span };
        let span = start.join(lit.span);
        SettingStmt { kind: SettingKind::Timeout, value: Expr::Duration(lit), span }
    }

    fn parse_import(&mut self) -> ImportStmt {
        let start = self.expect(TokenKind::Import, "expected import", "use import \"file.pt\"").span;
        let tok = self.expect(
            TokenKind::Str,
            "expected string literal after import",
            "provide a path string",
        );
        let lit = self.string_lit(tok);
        let span = start.join(lit.span);
        ImportStmt { path: lit, span }
    }

    fn parse_let(&mut self) -> LetStmt {
        let start = self.expect(TokenKind::Let, "expected let", "use let name = expr").span;
        let name = self.expect(
            TokenKind::Ident,
            "expected identifier after let",
            "provide a variable name",
        );
        self.expect(TokenKind::Assign, "expected '=' in let statement", "assign a value to the variable");
        let value = self.parse_expr(PREC_LOWEST);
        let span = start.join(value.span());
        LetStmt { name: name.lit, value, span }
    }

    fn parse_req_decl(&mut self) -> ReqDecl {
        let start = self.expect(TokenKind::Req, "expected req", "use req <name>:").span;
        let name = self.expect(TokenKind::Ident, "expected request name", "provide a request name");
        let mut parent = None;
        if self.match_kind(TokenKind::LParen) {
            let tok = self.expect(
                TokenKind::Ident,
                "expected parent request name",
                "provide a parent request name",
            );
            parent = Some(tok.lit);
            self.expect(TokenKind::RParen, "expected ')' after parent name", "close the parent list");
        }
        self.expect(TokenKind::Colon, "expected ':' after req header", "add ':' to start the request block");
        self.expect(TokenKind::Nl, "expected newline after req header", "add a newline after the header");
        self.expect(TokenKind::Indent, "expected indented req block", "indent request lines");

        let mut lines: Vec<ReqLine> = Vec::new();
        while self.cur.kind != TokenKind::Dedent && self.cur.kind != TokenKind::Eof {
            if self.match_kind(TokenKind::Nl) {
                continue;
            }
            match self.cur.kind {
                kind if kind.is_http_method() => {
                    lines.push(ReqLine::Http(self.parse_http_line()));
                    self.expect(TokenKind::Nl, "expected newline after http line", "add a newline after the HTTP line");
                }
                TokenKind::Json | TokenKind::Header | TokenKind::Query | TokenKind::Auth => {
                    lines.push(self.parse_directive());
                    self.expect(TokenKind::Nl, "expected newline after directive", "add a newline after the directive");
                }
                TokenKind::Pre | TokenKind::Post => {
                    lines.push(ReqLine::Hook(self.parse_hook_block()));
                }
                TokenKind::Question => {
                    lines.push(ReqLine::Assert(self.parse_assert_line()));
                    self.expect(TokenKind::Nl, "expected newline after assertion", "add a newline after the assertion");
                }
                TokenKind::Let => {
                    lines.push(ReqLine::Let(self.parse_let()));
                    self.expect(TokenKind::Nl, "expected newline after let", "add a newline after the let");
                }
                _ => {
                    self.add_error(
                        "E_PARSE_INVALID_LINE",
                        "invalid request line",
                        "use an http line, directive, hook, assertion, or let",
                        self.cur.span,
                    );
                    self.sync_line();
                }
            }
        }
        let end = self.expect(TokenKind::Dedent, "expected end of req block", "dedent to close the req block");
        ReqDecl { name: name.lit, parent, lines, span: start.join(end.span) }
    }

    fn parse_http_line(&mut self) -> HttpLine {
        let start = self.cur.span;
        let method = match self.cur.kind {
            TokenKind::Get => HttpMethod::Get,
            TokenKind::PostMethod => HttpMethod::Post,
            TokenKind::Put => HttpMethod::Put,
            TokenKind::Patch => HttpMethod::Patch,
            TokenKind::Delete => HttpMethod::Delete,
            TokenKind::Head => HttpMethod::Head,
            TokenKind::Options => HttpMethod::Options,
            _ => {
                self.add_error(
                    "E_PARSE_EXPECTED_TOKEN",
                    "expected HTTP method",
                    "start with GET/POST/etc",
                    self.cur.span,
                );
                HttpMethod::Get
            }
        };
        self.advance();
        let path = self.expect(
            TokenKind::Path,
            "expected path or URL after method",
            "provide a path like /orders",
        );
        HttpLine { method, path: path.lit, span: start.join(path.span) }
    }

    fn parse_directive(&mut self) -> ReqLine {
        match self.cur.kind {
            TokenKind::Json => {
                let start = self.cur.span;
                self.advance();
                let obj = self.parse_object_lit();
                let span = start.join(obj.span);
                ReqLine::Json(JsonDirective { value: Expr::Object(obj), span })
            }
            TokenKind::Header => {
                let start = self.cur.span;
                self.advance();
                let key = self.parse_key();
                self.expect(TokenKind::Assign, "expected '=' after header key", "assign a header value");
                let value = self.parse_expr(PREC_LOWEST);
                let span = start.join(value.span());
                ReqLine::Header(KeyDirective { key, value, span })
            }
            TokenKind::Query => {
                let start = self.cur.span;
                self.advance();
                let key = self.parse_key();
                self.expect(TokenKind::Assign, "expected '=' after query key", "assign a query value");
                let value = self.parse_expr(PREC_LOWEST);
                let span = start.join(value.span());
                ReqLine::Query(KeyDirective { key, value, span })
            }
            TokenKind::Auth => {
                let start = self.cur.span;
                self.advance();
                self.expect(TokenKind::Bearer, "expected bearer auth", "use bearer auth");
                let value = self.parse_expr(PREC_LOWEST);
                let span = start.join(value.span());
                ReqLine::Auth(AuthDirective { scheme: AuthScheme::Bearer, value, span })
            }
            _ => {
                self.add_error(
                    "E_PARSE_INVALID_LINE",
                    "invalid directive",
                    "use json/header/query/auth",
                    self.cur.span,
                );
                let span = self.cur.span;
                ReqLine::Json(JsonDirective { value: Expr::Bad(span), span })
            }
        }
    }

    fn parse_hook_block(&mut self) -> HookBlock {
        let start = self.cur.span;
        let kind = if self.match_kind(TokenKind::Pre) {
            HookKind::Pre
        } else if self.match_kind(TokenKind::Post) {
            HookKind::Post
        } else {
            self.add_error(
                "E_PARSE_EXPECTED_TOKEN",
                "expected pre/post hook",
                "use pre hook or post hook",
                self.cur.span,
            );
            HookKind::Pre
        };
        self.expect(TokenKind::Hook, "expected 'hook'", "use pre hook { ... }");
        self.expect(TokenKind::LBrace, "expected '{' to start hook", "open the hook block");

        let mut stmts: Vec<HookStmt> = Vec::new();
        while self.cur.kind != TokenKind::RBrace && self.cur.kind != TokenKind::Eof {
            if self.match_kind(TokenKind::Nl) || self.match_kind(TokenKind::Semicolon) {
                continue;
            }
            stmts.push(self.parse_hook_stmt());
            if self.cur.kind == TokenKind::Nl || self.cur.kind == TokenKind::Semicolon {
                self.advance();
            }
        }
        let end = self.expect(TokenKind::RBrace, "expected '}' to end hook", "close the hook block");
        if self.cur.kind == TokenKind::Nl {
            self.advance();
        }
        HookBlock { kind, stmts, span: start.join(end.span) }
    }

    fn parse_hook_stmt(&mut self) -> HookStmt {
        match self.cur.kind {
            TokenKind::Let => HookStmt::Let(self.parse_let()),
            TokenKind::Print | TokenKind::Println | TokenKind::Printf => {
                HookStmt::Print(self.parse_print_stmt())
            }
            _ => {
                let left = self.parse_expr(PREC_LOWEST);
                if self.cur.kind == TokenKind::Assign {
                    self.advance();
                    let value = self.parse_expr(PREC_LOWEST);
                    match expr_to_lvalue(&left) {
                        Some(target) => {
                            let span = target.span.join(value.span());
                            HookStmt::Assign(AssignStmt { target, value, span })
                        }
                        None => {
                            self.add_error(
                                "E_PARSE_INVALID_LINE",
                                "invalid assignment target",
                                "assign to req, res, $ or an identifier path",
                                left.span(),
                            );
                            let span = value.span();
                            HookStmt::Expr(ExprStmt { expr: value, span })
                        }
                    }
                } else {
                    let span = left.span();
                    HookStmt::Expr(ExprStmt { expr: left, span })
                }
            }
        }
    }

    fn parse_print_stmt(&mut self) -> PrintStmt {
        let start = self.cur.span;
        let kind = match self.cur.kind {
            TokenKind::Print => PrintKind::Print,
            TokenKind::Println => PrintKind::Println,
            _ => PrintKind::Printf,
        };
        self.advance();
        let mut args: Vec<Expr> = Vec::new();
        let mut span = start;
        if !matches!(
            self.cur.kind,
            TokenKind::Nl | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        ) {
            loop {
                let arg = self.parse_expr(PREC_LOWEST);
                span = span.join(arg.span());
                args.push(arg);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        PrintStmt { kind, args, span }
    }

    fn parse_assert_line(&mut self) -> AssertStmt {
        let start = self.expect(TokenKind::Question, "expected '?'", "start assertion with '?'").span;
        let expr = self.parse_expr(PREC_LOWEST);
        let span = start.join(expr.span());
        AssertStmt { expr, span }
    }

    fn parse_flow_decl(&mut self) -> FlowDecl {
        let start = self.expect(TokenKind::Flow, "expected flow", "use flow \"name\":").span;
        let name_tok = self.expect(TokenKind::Str, "expected flow name string", "provide a flow name");
        let name = self.string_lit(name_tok);
        self.expect(TokenKind::Colon, "expected ':' after flow name", "add ':' to start the flow block");
        self.expect(TokenKind::Nl, "expected newline after flow header", "add a newline after the header");
        self.expect(TokenKind::Indent, "expected indented flow block", "indent flow lines");

        let mut prelude: Vec<LetStmt> = Vec::new();
        while self.cur.kind == TokenKind::Let || self.cur.kind == TokenKind::Nl {
            if self.match_kind(TokenKind::Nl) {
                continue;
            }
            prelude.push(self.parse_let());
            self.expect(TokenKind::Nl, "expected newline after let", "add a newline after the let");
        }

        let mut chain: Vec<FlowStep> = Vec::new();
        if self.cur.kind == TokenKind::Ident {
            chain = self.parse_flow_chain_line();
            self.expect(TokenKind::Nl, "expected newline after chain line", "add a newline after the chain line");
        } else {
            self.add_error(
                "E_PARSE_FLOW_SHAPE",
                "flow missing chain line",
                "add a chain line naming at least one request",
                self.cur.span,
            );
            if self.cur.kind != TokenKind::Dedent && self.cur.kind != TokenKind::Eof {
                self.sync_line();
            }
        }

        let mut asserts: Vec<AssertStmt> = Vec::new();
        while self.cur.kind != TokenKind::Dedent && self.cur.kind != TokenKind::Eof {
            if self.match_kind(TokenKind::Nl) {
                continue;
            }
            if self.cur.kind != TokenKind::Question {
                self.add_error(
                    "E_PARSE_FLOW_SHAPE",
                    "only assertions allowed after flow chain",
                    "move non-assert lines before the chain",
                    self.cur.span,
                );
                self.sync_line();
                continue;
            }
            asserts.push(self.parse_assert_line());
            self.expect(TokenKind::Nl, "expected newline after assertion", "add a newline after the assertion");
        }
        let end = self.expect(TokenKind::Dedent, "expected end of flow block", "dedent to close the flow block");

        FlowDecl { name, prelude, chain, asserts, span: start.join(end.span) }
    }

    /// A single-step chain (no `->`) is legal.
    fn parse_flow_chain_line(&mut self) -> Vec<FlowStep> {
        let mut steps = vec![self.parse_flow_step_ref()];
        while self.cur.kind == TokenKind::Arrow {
            self.advance();
            steps.push(self.parse_flow_step_ref());
        }
        steps
    }

    fn parse_flow_step_ref(&mut self) -> FlowStep {
        let name = self.expect(TokenKind::Ident, "expected request name in flow", "provide a request name");
        let mut span = name.span;
        let mut alias = None;
        if self.match_kind(TokenKind::Colon) {
            let alias_tok = self.expect(TokenKind::Ident, "expected alias after ':'", "provide an alias name");
            span = span.join(alias_tok.span);
            alias = Some(alias_tok.lit);
        }
        FlowStep { req_name: name.lit, alias, span }
    }

    fn parse_key(&mut self) -> Key {
        match self.cur.kind {
            TokenKind::Ident | TokenKind::BareKey => {
                let tok = self.cur.clone();
                self.advance();
                Key { name: tok.lit, span: tok.span }
            }
            TokenKind::Str => {
                let tok = self.cur.clone();
                self.advance();
                let lit = self.string_lit(tok);
                Key { name: lit.value, span: lit.span }
            }
            _ => {
                self.add_error(
                    "E_PARSE_EXPECTED_TOKEN",
                    "expected key",
                    "use an identifier or string",
                    self.cur.span,
                );
                let span = self.cur.span;
                self.advance();
                Key { name: String::new(), span }
            }
        }
    }

    fn expect_field_name(&mut self) -> Token {
        match self.cur.kind {
            TokenKind::Ident
            | TokenKind::Req
            | TokenKind::Header
            | TokenKind::Query
            | TokenKind::Json => {
                let tok = self.cur.clone();
                self.advance();
                tok
            }
            _ => {
                self.add_error(
                    "E_PARSE_EXPECTED_TOKEN",
                    "expected field name",
                    "provide a field name",
                    self.cur.span,
                );
                let tok = self.cur.clone();
                self.advance();
                Token::new(TokenKind::Illegal, tok.lit, tok.span)
            }
        }
    }

    fn parse_object_key(&mut self) -> Option<ObjectKey> {
        match self.cur.kind {
            TokenKind::Ident => {
                let tok = self.cur.clone();
                self.advance();
                Some(ObjectKey { name: tok.lit, span: tok.span })
            }
            TokenKind::Str => {
                let tok = self.cur.clone();
                self.advance();
                let lit = self.string_lit(tok);
                Some(ObjectKey { name: lit.value, span: lit.span })
            }
            _ => {
                self.add_error(
                    "E_PARSE_EXPECTED_TOKEN",
                    "expected object key",
                    "use an identifier or string literal",
                    self.cur.span,
                );
                self.advance();
                None
            }
        }
    }

    fn parse_expr(&mut self, min: u8) -> Expr {
        let mut left = self.parse_prefix();
        left = self.parse_postfix(left);

        loop {
            let Some(prec) = infix_prec(self.cur.kind) else { break };
            if prec < min {
                break;
            }
            let op = to_binary_op(self.cur.kind);
            self.advance();
            let right = self.parse_expr(prec + 1);
            let span = left.span().join(right.span());
            left = Expr::Binary(Box::new(BinaryExpr { op, left, right, span }));
            left = self.parse_postfix(left);
        }
        left
    }

    fn parse_postfix(&mut self, mut left: Expr) -> Expr {
        loop {
            match self.cur.kind {
                TokenKind::LParen => left = self.parse_call(left),
                TokenKind::Dot => left = self.parse_field(left),
                TokenKind::LBrack => left = self.parse_index(left),
                _ => return left,
            }
        }
    }

    fn parse_prefix(&mut self) -> Expr {
        match self.cur.kind {
            TokenKind::Not | TokenKind::Plus | TokenKind::Minus => {
                let op = match self.cur.kind {
                    TokenKind::Not => UnaryOp::Not,
                    TokenKind::Minus => UnaryOp::Minus,
                    _ => UnaryOp::Plus,
                };
                let start = self.cur.span;
                self.advance();
                let expr = self.parse_expr(PREC_PREFIX);
                let span = start.join(expr.span());
                Expr::Unary(Box::new(UnaryExpr { op, expr, span }))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Expr {
        match self.cur.kind {
            // context names like `req` lex as keywords but act as
            // identifiers in expression position
            TokenKind::Ident | TokenKind::Req | TokenKind::Header | TokenKind::Query => {
                let tok = self.cur.clone();
                self.advance();
                Expr::Ident(IdentExpr { name: tok.lit, span: tok.span })
            }
            TokenKind::Str => {
                let tok = self.cur.clone();
                self.advance();
                Expr::Str(self.string_lit(tok))
            }
            TokenKind::Number => {
                let tok = self.cur.clone();
                self.advance();
                Expr::Number(NumberLit { raw: tok.lit, span: tok.span })
            }
            TokenKind::True => {
                let span = self.cur.span;
                self.advance();
                Expr::Bool(BoolLit { value: true, span })
            }
            TokenKind::False => {
                let span = self.cur.span;
                self.advance();
                Expr::Bool(BoolLit { value: false, span })
            }
            TokenKind::Null => {
                let span = self.cur.span;
                self.advance();
                Expr::Null(NullLit { span })
            }
            TokenKind::Dollar => {
                let span = self.cur.span;
                self.advance();
                Expr::Dollar(span)
            }
            TokenKind::Hash => {
                let span = self.cur.span;
                self.advance();
                Expr::Hash(span)
            }
            TokenKind::LParen => {
                let start = self.cur.span;
                self.advance();
                let expr = self.parse_expr(PREC_LOWEST);
                let end = self.expect(TokenKind::RParen, "expected ')'", "close the expression");
                let span = start.join(end.span);
                Expr::Paren(Box::new(ParenExpr { expr, span }))
            }
            TokenKind::LBrack => Expr::Array(self.parse_array_lit()),
            TokenKind::LBrace => Expr::Object(self.parse_object_lit()),
            _ => {
                self.add_error(
                    "E_PARSE_INVALID_EXPR",
                    "unexpected token in expression",
                    "provide a valid expression",
                    self.cur.span,
                );
                let span = self.cur.span;
                self.advance();
                Expr::Bad(span)
            }
        }
    }

    fn parse_call(&mut self, callee: Expr) -> Expr {
        let start = callee.span();
        self.expect(TokenKind::LParen, "expected '('", "start argument list");
        let mut args: Vec<Expr> = Vec::new();
        if self.cur.kind != TokenKind::RParen {
            loop {
                args.push(self.parse_expr(PREC_LOWEST));
                if self.match_kind(TokenKind::Comma) {
                    if self.cur.kind == TokenKind::RParen {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        let end = self.expect(TokenKind::RParen, "expected ')' after call", "close the call");
        let span = start.join(end.span);
        Expr::Call(Box::new(CallExpr { callee, args, span }))
    }

    fn parse_field(&mut self, left: Expr) -> Expr {
        self.expect(TokenKind::Dot, "expected '.'", "use .field to access a field");
        let name = self.expect_field_name();
        let span = left.span().join(name.span);
        Expr::Field(Box::new(FieldExpr { expr: left, name: name.lit, span }))
    }

    fn parse_index(&mut self, left: Expr) -> Expr {
        let start = left.span();
        self.expect(TokenKind::LBrack, "expected '['", "start index expression");
        let index = self.parse_expr(PREC_LOWEST);
        let end = self.expect(TokenKind::RBrack, "expected ']'", "close index expression");
        let span = start.join(end.span);
        Expr::Index(Box::new(IndexExpr { expr: left, index, span }))
    }

    fn parse_array_lit(&mut self) -> ArrayLit {
        let start = self.expect(TokenKind::LBrack, "expected '['", "start array literal").span;
        let mut elements: Vec<Expr> = Vec::new();
        if self.cur.kind != TokenKind::RBrack {
            loop {
                elements.push(self.parse_expr(PREC_LOWEST));
                if self.match_kind(TokenKind::Comma) {
                    if self.cur.kind == TokenKind::RBrack {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        let end = self.expect(TokenKind::RBrack, "expected ']'", "close array literal");
        ArrayLit { elements, span: start.join(end.span) }
    }

    fn parse_object_lit(&mut self) -> ObjectLit {
        let start = self.expect(TokenKind::LBrace, "expected '{'", "start object literal").span;
        let mut pairs: Vec<ObjectPair> = Vec::new();
        if self.cur.kind != TokenKind::RBrace {
            loop {
                let key = self.parse_object_key();
                self.expect(TokenKind::Colon, "expected ':' after object key", "separate key and value with ':'");
                let value = self.parse_expr(PREC_LOWEST);
                if let Some(key) = key {
                    let span = key.span.join(value.span());
                    pairs.push(ObjectPair { key, value, span });
                }
                if self.match_kind(TokenKind::Comma) {
                    if self.cur.kind == TokenKind::RBrace {
                        break;
                    }
                    continue;
                }
                break;
            }
        }
        let end = self.expect(TokenKind::RBrace, "expected '}'", "close object literal");
        ObjectLit { pairs, span: start.join(end.span) }
    }

    fn string_lit(&mut self, tok: Token) -> StringLit {
        let value = unquote(&tok.lit).unwrap_or_else(|| tok.lit.clone());
        StringLit { raw: tok.lit, value, span: tok.span }
    }

    fn sync_line(&mut self) {
        while !matches!(self.cur.kind, TokenKind::Nl | TokenKind::Dedent | TokenKind::Eof) {
            self.advance();
        }
        if self.cur.kind == TokenKind::Nl {
            self.advance();
        }
    }

    fn sync_top(&mut self) {
        while !matches!(self.cur.kind, TokenKind::Nl | TokenKind::Eof) {
            self.advance();
        }
        if self.cur.kind == TokenKind::Nl {
            self.advance();
        }
    }
}

fn infix_prec(kind: TokenKind) -> Option<u8> {
    let prec = match kind {
        TokenKind::Or => PREC_OR,
        TokenKind::And => PREC_AND,
        TokenKind::Eq
        | TokenKind::Ne
        | TokenKind::Lt
        | TokenKind::Le
        | TokenKind::Gt
        | TokenKind::Ge
        | TokenKind::In
        | TokenKind::Contains
        | TokenKind::Tilde => PREC_COMPARE,
        TokenKind::Plus | TokenKind::Minus => PREC_ADD,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => PREC_MUL,
        _ => return None,
    };
    Some(prec)
}

fn to_binary_op(kind: TokenKind) -> BinaryOp {
    match kind {
        TokenKind::Or => BinaryOp::Or,
        TokenKind::And => BinaryOp::And,
        TokenKind::Eq => BinaryOp::Eq,
        TokenKind::Ne => BinaryOp::Ne,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::Le => BinaryOp::Le,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::Ge => BinaryOp::Ge,
        TokenKind::In => BinaryOp::In,
        TokenKind::Contains => BinaryOp::Contains,
        TokenKind::Tilde => BinaryOp::Match,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Mod,
        _ => BinaryOp::Add,
    }
}

/// Converts an expression to an assignment target. Valid roots are
/// `req`, `res`, `$` and plain identifiers; valid postfixes are field
/// and index steps.
fn expr_to_lvalue(expr: &Expr) -> Option<LValue> {
    match expr {
        Expr::Ident(e) => {
            let kind = match e.name.as_str() {
                "req" => LValueRootKind::Req,
                "res" => LValueRootKind::Res,
                _ => LValueRootKind::Ident,
            };
            Some(LValue {
                root: LValueRoot { kind, name: e.name.clone(), span: e.span },
                postfix: Vec::new(),
                span: e.span,
            })
        }
        Expr::Dollar(span) => Some(LValue {
            root: LValueRoot { kind: LValueRootKind::Dollar, name: "$".to_string(), span: *span },
            postfix: Vec::new(),
            span: *span,
        }),
        Expr::Field(f) => {
            let mut base = expr_to_lvalue(&f.expr)?;
            let span = Span { start: base.span.end, end: f.span.end };
            base.postfix.push(LValuePostfix::Field { name: f.name.clone(), span });
            base.span = base.span.join(span);
            Some(base)
        }
        Expr::Index(i) => {
            let mut base = expr_to_lvalue(&i.expr)?;
            let span = Span { start: base.span.end, end: i.span.end };
            base.postfix.push(LValuePostfix::Index { index: i.index.clone(), span });
            base.span = base.span.join(span);
            Some(base)
        }
        _ => None,
    }
}

/// Decodes a quoted string literal: `"..."` with `\\ \" \n \t \r
/// \uXXXX` escapes, or a backtick raw string with no escapes.
pub fn unquote(raw: &str) -> Option<String> {
    if raw.len() >= 2 && raw.starts_with('`') && raw.ends_with('`') {
        return Some(raw[1..raw.len() - 1].to_string());
    }
    if raw.len() < 2 || !raw.starts_with('"') || !raw.ends_with('"') {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw[1..raw.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'u' => {
                let hex: String = chars.by_ref().take(4).collect();
                if hex.len() != 4 {
                    return None;
                }
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_clean(src: &str) -> Program {
        let (program, lex_diags, parse_diags) = parse("test.pt", src);
        assert!(lex_diags.is_empty(), "lex diagnostics: {lex_diags:?}");
        assert!(parse_diags.is_empty(), "parse diagnostics: {parse_diags:?}");
        program
    }

    fn parse_codes(src: &str) -> Vec<String> {
        let (_, lex_diags, parse_diags) = parse("test.pt", src);
        lex_diags.into_iter().chain(parse_diags).map(|d| d.code).collect()
    }

    #[test]
    fn parses_settings_imports_and_globals() {
        let program = parse_clean("base \"https://h.test\"\ntimeout 5s\nimport \"lib.pt\"\nlet k = 42\n");
        assert_eq!(program.stmts.len(), 4);
        match &program.stmts[0] {
            Stmt::Setting(s) => {
                assert_eq!(s.kind, SettingKind::Base);
                match &s.value {
                    Expr::Str(lit) => assert_eq!(lit.value, "https://h.test"),
                    other => panic!("unexpected value {other:?}"),
                }
            }
            other => panic!("unexpected stmt {other:?}"),
        }
        match &program.stmts[1] {
            Stmt::Setting(s) => assert_eq!(s.kind, SettingKind::Timeout),
            other => panic!("unexpected stmt {other:?}"),
        }
        match &program.stmts[2] {
            Stmt::Import(i) => assert_eq!(i.path.value, "lib.pt"),
            other => panic!("unexpected stmt {other:?}"),
        }
    }

    #[test]
    fn parses_request_with_all_line_kinds() {
        let src = concat!(
            "req create:\n",
            "\tPOST /orders\n",
            "\theader X-Req = \"abc\"\n",
            "\tquery page = 2\n",
            "\tauth bearer token\n",
            "\tjson { sku: \"a-1\", qty: 2 }\n",
            "\tpre hook {\n",
            "\t\treq.header.XTrace = uuid()\n",
            "\t}\n",
            "\tpost hook {\n",
            "\t\tlet created = #.id\n",
            "\t}\n",
            "\t? status == 201\n",
            "\tlet order = #.id\n",
        );
        let program = parse_clean(src);
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        assert_eq!(req.name, "create");
        assert_eq!(req.lines.len(), 9);
        assert!(matches!(&req.lines[0], ReqLine::Http(h) if h.method == HttpMethod::Post));
        assert!(matches!(&req.lines[1], ReqLine::Header(h) if h.key.name == "X-Req"));
        assert!(matches!(&req.lines[2], ReqLine::Query(q) if q.key.name == "page"));
        assert!(matches!(&req.lines[3], ReqLine::Auth(_)));
        assert!(matches!(&req.lines[4], ReqLine::Json(_)));
        assert!(matches!(&req.lines[5], ReqLine::Hook(h) if h.kind == HookKind::Pre));
        assert!(matches!(&req.lines[6], ReqLine::Hook(h) if h.kind == HookKind::Post));
        assert!(matches!(&req.lines[7], ReqLine::Assert(_)));
        assert!(matches!(&req.lines[8], ReqLine::Let(l) if l.name == "order"));
    }

    #[test]
    fn parses_request_parent() {
        let program = parse_clean("req child(parent):\n\tGET /x\n");
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        assert_eq!(req.parent.as_deref(), Some("parent"));
    }

    #[test]
    fn parses_flow_with_aliases_and_asserts() {
        let src = concat!(
            "flow \"orders\":\n",
            "\tlet who = \"me\"\n",
            "\tlogin -> create : made -> fetch\n",
            "\t? made.status == 201\n",
            "\t? fetch.res.id == made.res.id\n",
        );
        let program = parse_clean(src);
        let Stmt::Flow(flow) = &program.stmts[0] else { panic!("expected flow") };
        assert_eq!(flow.name.value, "orders");
        assert_eq!(flow.prelude.len(), 1);
        assert_eq!(flow.chain.len(), 3);
        assert_eq!(flow.chain[1].binding(), "made");
        assert_eq!(flow.asserts.len(), 2);
    }

    #[test]
    fn single_step_chain_is_accepted() {
        let program = parse_clean("flow \"s\":\n\tping\n");
        let Stmt::Flow(flow) = &program.stmts[0] else { panic!("expected flow") };
        assert_eq!(flow.chain.len(), 1);
    }

    #[test]
    fn flow_without_chain_is_flagged() {
        assert!(parse_codes("flow \"s\":\n\t? 1 == 1\n").contains(&"E_PARSE_FLOW_SHAPE".to_string()));
    }

    #[test]
    fn non_assert_after_chain_is_flagged() {
        let src = "flow \"s\":\n\tping\n\tlet x = 1\n";
        assert!(parse_codes(src).contains(&"E_PARSE_FLOW_SHAPE".to_string()));
    }

    #[test]
    fn precedence_or_and_compare_add_mul() {
        let program = parse_clean("let x = 1 + 2 * 3 == 7 and true or false\n");
        let Stmt::Let(stmt) = &program.stmts[0] else { panic!("expected let") };
        // ((1 + (2 * 3)) == 7 and true) or false
        let Expr::Binary(or) = &stmt.value else { panic!("expected or") };
        assert_eq!(or.op, BinaryOp::Or);
        let Expr::Binary(and) = &or.left else { panic!("expected and") };
        assert_eq!(and.op, BinaryOp::And);
        let Expr::Binary(eq) = &and.left else { panic!("expected eq") };
        assert_eq!(eq.op, BinaryOp::Eq);
        let Expr::Binary(add) = &eq.left else { panic!("expected add") };
        assert_eq!(add.op, BinaryOp::Add);
        let Expr::Binary(mul) = &add.right else { panic!("expected mul") };
        assert_eq!(mul.op, BinaryOp::Mul);
    }

    #[test]
    fn postfix_binds_tighter_than_prefix_and_binary() {
        let program = parse_clean("let x = !flags.on and items[0].id == 1\n");
        let Stmt::Let(stmt) = &program.stmts[0] else { panic!("expected let") };
        let Expr::Binary(and) = &stmt.value else { panic!("expected and") };
        let Expr::Unary(not) = &and.left else { panic!("expected unary") };
        assert_eq!(not.op, UnaryOp::Not);
        assert!(matches!(&not.expr, Expr::Field(_)));
    }

    #[test]
    fn postfix_after_binary_rhs() {
        let program = parse_clean("let x = a + b.c\n");
        let Stmt::Let(stmt) = &program.stmts[0] else { panic!("expected let") };
        let Expr::Binary(add) = &stmt.value else { panic!("expected add") };
        assert!(matches!(&add.right, Expr::Field(_)));
    }

    #[test]
    fn dollar_and_hash_roots_take_postfix() {
        let src = "req r:\n\tGET /x\n\t? #.token == $.url\n";
        let program = parse_clean(src);
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        let ReqLine::Assert(assert) = &req.lines[1] else { panic!("expected assert") };
        let Expr::Binary(eq) = &assert.expr else { panic!("expected eq") };
        let Expr::Field(hash_field) = &eq.left else { panic!("expected field") };
        assert!(matches!(hash_field.expr, Expr::Hash(_)));
        let Expr::Field(dollar_field) = &eq.right else { panic!("expected field") };
        assert!(matches!(dollar_field.expr, Expr::Dollar(_)));
    }

    #[test]
    fn hook_assignment_targets() {
        let src = concat!(
            "req r:\n",
            "\tGET /x\n",
            "\tpost hook {\n",
            "\t\tseen = #.value; req.header.K = \"v\"\n",
            "\t\treq.query[\"page\"] = 2\n",
            "\t}\n",
        );
        let program = parse_clean(src);
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        let ReqLine::Hook(hook) = &req.lines[1] else { panic!("expected hook") };
        assert_eq!(hook.stmts.len(), 3);
        let HookStmt::Assign(first) = &hook.stmts[0] else { panic!("expected assign") };
        assert_eq!(first.target.root.kind, LValueRootKind::Ident);
        let HookStmt::Assign(second) = &hook.stmts[1] else { panic!("expected assign") };
        assert_eq!(second.target.root.kind, LValueRootKind::Req);
        assert_eq!(second.target.postfix.len(), 2);
        let HookStmt::Assign(third) = &hook.stmts[2] else { panic!("expected assign") };
        assert!(matches!(third.target.postfix.last(), Some(LValuePostfix::Index { .. })));
    }

    #[test]
    fn invalid_assignment_target_is_flagged() {
        let src = "req r:\n\tGET /x\n\tpost hook {\n\t\t1 + 2 = 3\n\t}\n";
        assert!(parse_codes(src).contains(&"E_PARSE_INVALID_LINE".to_string()));
    }

    #[test]
    fn print_statements_parse_in_hooks() {
        let src = concat!(
            "req r:\n",
            "\tGET /x\n",
            "\tpost hook {\n",
            "\t\tprint \"status={{status}}\"\n",
            "\t\tprintln \"done\"\n",
            "\t\tprintf \"%d items\", len(#.items)\n",
            "\t}\n",
        );
        let program = parse_clean(src);
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        let ReqLine::Hook(hook) = &req.lines[1] else { panic!("expected hook") };
        let kinds: Vec<_> = hook
            .stmts
            .iter()
            .map(|s| match s {
                HookStmt::Print(p) => p.kind,
                other => panic!("unexpected stmt {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec![PrintKind::Print, PrintKind::Println, PrintKind::Printf]);
        let HookStmt::Print(printf) = &hook.stmts[2] else { unreachable!() };
        assert_eq!(printf.args.len(), 2);
    }

    #[test]
    fn recovers_from_bad_request_line() {
        let src = "req r:\n\tGET /x\n\t-> nonsense\n\t? status == 200\n";
        let (program, _, parse_diags) = parse("test.pt", src);
        assert!(!parse_diags.is_empty());
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        // the assert after the bad line still parses
        assert!(req.lines.iter().any(|l| matches!(l, ReqLine::Assert(_))));
    }

    #[test]
    fn recovers_at_top_level() {
        let src = "42\nreq r:\n\tGET /x\n";
        let (program, _, parse_diags) = parse("test.pt", src);
        assert!(parse_diags.iter().any(|d| d.code == "E_PARSE_UNEXPECTED_TOKEN"));
        assert!(program.stmts.iter().any(|s| matches!(s, Stmt::Req(_))));
    }

    #[test]
    fn unquote_handles_escapes() {
        assert_eq!(unquote("\"a\\nb\""), Some("a\nb".to_string()));
        assert_eq!(unquote("\"a\\\"b\""), Some("a\"b".to_string()));
        assert_eq!(unquote("\"\\u00e9\""), Some("é".to_string()));
        assert_eq!(unquote("`raw \\n`"), Some("raw \\n".to_string()));
        assert_eq!(unquote("\"bad"), None);
    }

    #[test]
    fn every_node_carries_a_span() {
        let src = "req r:\n\tGET /x\n\t? status == 200\n";
        let program = parse_clean(src);
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        assert!(!req.span.is_zero());
        for line in &req.lines {
            assert!(!line.span().is_zero());
        }
    }
}
