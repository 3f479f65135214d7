use serde::Serialize;

/// A specific point in a source file. `line` and `column` are 1-based;
/// `offset` is a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Position {
    pub offset: usize,
    pub line: usize,
    pub column: usize,
}

/// Half-open source range `[start, end)`. The zero value means "no
/// location" and is treated as absorbing by [`Span::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn at(pos: Position) -> Span {
        Span { start: pos, end: pos }
    }

    pub fn is_zero(&self) -> bool {
        *self == Span::default()
    }

    pub fn join(self, other: Span) -> Span {
        if self.is_zero() {
            return other;
        }
        if other.is_zero() {
            return self;
        }
        Span { start: self.start, end: other.end }
    }
}

/// Root AST node: the ordered top-level statements of one module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Setting(SettingStmt),
    Import(ImportStmt),
    Let(LetStmt),
    Req(ReqDecl),
    Flow(FlowDecl),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Setting(s) => s.span,
            Stmt::Import(s) => s.span,
            Stmt::Let(s) => s.span,
            Stmt::Req(s) => s.span,
            Stmt::Flow(s) => s.span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Base,
    Timeout,
}

/// `base "url"` or `timeout 5s`.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingStmt {
    pub kind: SettingKind,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportStmt {
    pub path: StringLit,
    pub span: Span,
}

/// `let name = expr`, legal at top level, in request blocks, in flow
/// preludes and inside hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

/// A reusable request template, optionally inheriting from a parent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReqDecl {
    pub name: String,
    pub parent: Option<String>,
    pub lines: Vec<ReqLine>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowDecl {
    pub name: StringLit,
    pub prelude: Vec<LetStmt>,
    pub chain: Vec<FlowStep>,
    pub asserts: Vec<AssertStmt>,
    pub span: Span,
}

/// One request invocation in a flow chain. The binding name is the
/// alias when present, else the request name.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowStep {
    pub req_name: String,
    pub alias: Option<String>,
    pub span: Span,
}

impl FlowStep {
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.req_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// The HTTP line of a request: method keyword plus raw path text.
/// `:name` segments and `{{var}}` placeholders stay unresolved until
/// evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpLine {
    pub method: HttpMethod,
    pub path: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReqLine {
    Http(HttpLine),
    Json(JsonDirective),
    Header(KeyDirective),
    Query(KeyDirective),
    Auth(AuthDirective),
    Hook(HookBlock),
    Assert(AssertStmt),
    Let(LetStmt),
}

impl ReqLine {
    pub fn span(&self) -> Span {
        match self {
            ReqLine::Http(l) => l.span,
            ReqLine::Json(l) => l.span,
            ReqLine::Header(l) => l.span,
            ReqLine::Query(l) => l.span,
            ReqLine::Auth(l) => l.span,
            ReqLine::Hook(l) => l.span,
            ReqLine::Assert(l) => l.span,
            ReqLine::Let(l) => l.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonDirective {
    pub value: Expr,
    pub span: Span,
}

/// `header Key = expr` / `query Key = expr`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDirective {
    pub key: Key,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthDirective {
    pub scheme: AuthScheme,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
}

/// Brace-scoped statement block running before or after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct HookBlock {
    pub kind: HookKind,
    pub stmts: Vec<HookStmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssertStmt {
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookStmt {
    Let(LetStmt),
    Assign(AssignStmt),
    Expr(ExprStmt),
    Print(PrintStmt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    pub target: LValue,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprStmt {
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintKind {
    Print,
    Println,
    Printf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrintStmt {
    pub kind: PrintKind,
    pub args: Vec<Expr>,
    pub span: Span,
}

/// A header/query key: identifier, bare key or string literal form.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectKey {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPair {
    pub key: ObjectKey,
    pub value: Expr,
    pub span: Span,
}

/// Assignment target inside a hook: a root (`req`, `res`, `$` or a
/// plain identifier) plus field/index postfix steps.
#[derive(Debug, Clone, PartialEq)]
pub struct LValue {
    pub root: LValueRoot,
    pub postfix: Vec<LValuePostfix>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LValueRootKind {
    Ident,
    Req,
    Res,
    Dollar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LValueRoot {
    pub kind: LValueRootKind,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LValuePostfix {
    Field { name: String, span: Span },
    Index { index: Expr, span: Span },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub raw: String,
    pub value: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberLit {
    pub raw: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurationLit {
    pub raw: String,
    pub span: Span,
}

impl DurationLit {
    /// Parses `8s`, `500ms`, `1.5h` style literals. Returns `None` on a
    /// malformed literal, which the lexer should have rejected already.
    pub fn to_duration(&self) -> Option<std::time::Duration> {
        let raw = self.raw.as_str();
        let (digits, unit) = if let Some(stripped) = raw.strip_suffix("ms") {
            (stripped, 0.001)
        } else if let Some(stripped) = raw.strip_suffix('s') {
            (stripped, 1.0)
        } else if let Some(stripped) = raw.strip_suffix('m') {
            (stripped, 60.0)
        } else if let Some(stripped) = raw.strip_suffix('h') {
            (stripped, 3600.0)
        } else if let Some(stripped) = raw.strip_suffix('d') {
            (stripped, 86400.0)
        } else {
            return None;
        };
        let value: f64 = digits.parse().ok()?;
        if value < 0.0 || !value.is_finite() {
            return None;
        }
        Some(std::time::Duration::from_secs_f64(value * unit))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoolLit {
    pub value: bool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NullLit {
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLit {
    pub elements: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectLit {
    pub pairs: Vec<ObjectPair>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentExpr {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Plus,
    Minus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOp,
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    Match,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub left: Expr,
    pub right: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub callee: Expr,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldExpr {
    pub expr: Expr,
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexExpr {
    pub expr: Expr,
    pub index: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParenExpr {
    pub expr: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(StringLit),
    Number(NumberLit),
    Duration(DurationLit),
    Bool(BoolLit),
    Null(NullLit),
    Array(ArrayLit),
    Object(ObjectLit),
    Ident(IdentExpr),
    /// `$`: the current request object.
    Dollar(Span),
    /// `#`: the decoded response value.
    Hash(Span),
    Paren(Box<ParenExpr>),
    Unary(Box<UnaryExpr>),
    Binary(Box<BinaryExpr>),
    Field(Box<FieldExpr>),
    Index(Box<IndexExpr>),
    Call(Box<CallExpr>),
    /// Placeholder emitted by the parser after an expression error.
    Bad(Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Str(e) => e.span,
            Expr::Number(e) => e.span,
            Expr::Duration(e) => e.span,
            Expr::Bool(e) => e.span,
            Expr::Null(e) => e.span,
            Expr::Array(e) => e.span,
            Expr::Object(e) => e.span,
            Expr::Ident(e) => e.span,
            Expr::Dollar(span) | Expr::Hash(span) | Expr::Bad(span) => *span,
            Expr::Paren(e) => e.span,
            Expr::Unary(e) => e.span,
            Expr::Binary(e) => e.span,
            Expr::Field(e) => e.span,
            Expr::Index(e) => e.span,
            Expr::Call(e) => e.span,
        }
    }
}
