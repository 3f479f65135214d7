//! Semantic analysis and execution-plan synthesis.
//!
//! Six ordered passes over the parsed module graph: import graph,
//! symbol table, request-inheritance materialization, request validity,
//! flow structure and bindings, and variable availability. Diagnostics
//! accumulate across all passes; the plan is synthesized only when the
//! aggregate diagnostic count is zero.

mod merge;

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::ast::*;
use crate::diagnostics::{sort_and_dedupe, Diagnostic};
use crate::loader::{clean_path, resolve_import};

static PATH_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static TEMPLATE_VAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap());

pub const BUILTIN_FUNCTIONS: &[&str] =
    &["env", "uuid", "len", "jsonpath", "regex", "now", "urlencode"];
const CONTEXT_NAMES: &[&str] = &["req", "res", "status", "header"];

/// A parsed module bound to its canonical path.
#[derive(Debug, Clone)]
pub struct Module {
    pub path: String,
    pub program: Program,
}

#[derive(Debug, Clone)]
pub struct ReqInfo {
    pub decl: ReqDecl,
    pub file: String,
}

/// The validated, immutable execution plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub entry_path: String,
    pub base: Option<String>,
    pub timeout: Option<std::time::Duration>,
    pub globals: Vec<PlanGlobal>,
    /// Sorted by request name.
    pub requests: Vec<PlanRequest>,
    /// Sorted by flow name; step order within a flow is source order.
    pub flows: Vec<PlanFlow>,
}

#[derive(Debug, Clone)]
pub struct PlanGlobal {
    pub name: String,
    pub value: Expr,
    pub file: String,
    pub span: Span,
}

/// A request with its materialized effective line list and a cached
/// reference to the unique HTTP line.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub name: String,
    pub parent: Option<String>,
    pub lines: Vec<ReqLine>,
    pub http: HttpLine,
    pub file: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct PlanFlow {
    pub name: String,
    pub steps: Vec<PlanStep>,
    pub lets: Vec<String>,
    pub prelude: Vec<LetStmt>,
    pub asserts: Vec<AssertStmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub request: String,
    pub binding: String,
    #[serde(skip)]
    pub span: Span,
}

impl PlanStep {
    /// Display form used in diagnostics and reports: `name` or
    /// `name:alias`.
    pub fn display(&self) -> String {
        if self.binding == self.request {
            self.request.clone()
        } else {
            format!("{}:{}", self.request, self.binding)
        }
    }
}

impl Plan {
    pub fn request(&self, name: &str) -> Option<&PlanRequest> {
        self.requests.iter().find(|r| r.name == name)
    }

    /// Serializable summary: the contract between core and
    /// reporter/CLI.
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            entry_path: self.entry_path.clone(),
            requests: self
                .requests
                .iter()
                .map(|r| RequestSummary { name: r.name.clone(), parent: r.parent.clone() })
                .collect(),
            flows: self
                .flows
                .iter()
                .map(|f| FlowSummary {
                    name: f.name.clone(),
                    steps: f.steps.clone(),
                    lets: f.lets.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub entry_path: String,
    pub requests: Vec<RequestSummary>,
    pub flows: Vec<FlowSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub name: String,
    pub steps: Vec<PlanStep>,
    pub lets: Vec<String>,
}

/// Validates a module graph and returns a deterministic plan, or the
/// sorted and deduplicated diagnostics when any pass fails.
pub fn compile(entry_path: &str, modules: Vec<Module>) -> Result<Plan, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(entry_path, modules);
    compiler.run()
}

struct Compiler {
    entry_path: String,
    modules: HashMap<String, Program>,
    ordered: Vec<String>,
    diags: Vec<Diagnostic>,

    reqs: HashMap<String, ReqInfo>,
    effective: HashMap<String, Vec<ReqLine>>,
    globals: Vec<PlanGlobal>,
    flows: Vec<FlowDecl>,
}

impl Compiler {
    fn new(entry_path: &str, modules: Vec<Module>) -> Self {
        let mut map = HashMap::new();
        for module in modules {
            map.insert(clean_path(&module.path), module.program);
        }
        Compiler {
            entry_path: clean_path(entry_path),
            modules: map,
            ordered: Vec::new(),
            diags: Vec::new(),
            reqs: HashMap::new(),
            effective: HashMap::new(),
            globals: Vec::new(),
            flows: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<Plan, Vec<Diagnostic>> {
        self.pass_imports();
        self.pass_symbols();
        self.pass_materialize();
        self.pass_request_validity();
        self.pass_flows();
        if !self.diags.is_empty() {
            return Err(sort_and_dedupe(std::mem::take(&mut self.diags)));
        }
        Ok(self.build_plan())
    }

    // Pass 0: import graph. DFS from the entry module with three-state
    // visit tracking; the post-order list sorted lexicographically is
    // the canonical module traversal order.
    fn pass_imports(&mut self) {
        if !self.modules.contains_key(&self.entry_path) {
            self.diags.push(Diagnostic::error(
                "E_IMPORT_NOT_FOUND",
                "entry module not found",
                &self.entry_path,
                Span::default(),
                "ensure the entry file is loaded",
            ));
            return;
        }
        let mut visited: HashMap<String, u8> = HashMap::new();
        let mut ordered: Vec<String> = Vec::new();
        let entry = self.entry_path.clone();
        self.dfs_imports(&entry, &mut visited, &mut ordered);
        ordered.sort();
        self.ordered = ordered;
    }

    fn dfs_imports(
        &mut self,
        path: &str,
        visited: &mut HashMap<String, u8>,
        ordered: &mut Vec<String>,
    ) {
        visited.insert(path.to_string(), 1);
        let imports: Vec<(String, Span)> = self.modules[path]
            .stmts
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Import(imp) => Some((resolve_import(path, &imp.path.value), imp.span)),
                _ => None,
            })
            .collect();
        for (target, span) in imports {
            match visited.get(&target) {
                Some(1) => {
                    self.diags.push(Diagnostic::error(
                        "E_IMPORT_CYCLE",
                        format!("import cycle detected: {target}"),
                        path,
                        span,
                        "remove circular imports",
                    ));
                    continue;
                }
                Some(2) => continue,
                _ => {}
            }
            if !self.modules.contains_key(&target) {
                self.diags.push(Diagnostic::error(
                    "E_IMPORT_NOT_FOUND",
                    format!("import not found: {target}"),
                    path,
                    span,
                    "load the imported file",
                ));
                continue;
            }
            self.dfs_imports(&target, visited, ordered);
        }
        visited.insert(path.to_string(), 2);
        ordered.push(path.to_string());
    }

    // Pass 1: symbol table. Requests are global across modules; flows
    // may only appear in the entry module; global lets accumulate in
    // module traversal order.
    fn pass_symbols(&mut self) {
        let mut flow_names: HashMap<String, (String, Span)> = HashMap::new();
        for path in self.ordered.clone() {
            let program = self.modules[&path].clone();
            for stmt in &program.stmts {
                match stmt {
                    Stmt::Flow(flow) => {
                        if path != self.entry_path {
                            self.diags.push(Diagnostic::error(
                                "E_IMPORT_FLOW_IN_IMPORTED_FILE",
                                "flows are not allowed in imported files",
                                &path,
                                flow.span,
                                "move flow declarations to the entry file",
                            ));
                        }
                        if let Some((prev_file, prev_span)) = flow_names.get(&flow.name.value) {
                            let diag = Diagnostic::error(
                                "E_SEM_DUPLICATE_FLOW_NAME",
                                "duplicate flow name",
                                &path,
                                flow.span,
                                "rename one of the flow declarations",
                            )
                            .with_related(prev_file, *prev_span, "first declaration");
                            self.diags.push(diag);
                        } else {
                            flow_names.insert(flow.name.value.clone(), (path.clone(), flow.span));
                        }
                        if path == self.entry_path {
                            self.flows.push(flow.clone());
                        }
                    }
                    Stmt::Req(decl) => {
                        if let Some(prev) = self.reqs.get(&decl.name) {
                            let diag = Diagnostic::error(
                                "E_SEM_DUPLICATE_REQ_NAME",
                                "duplicate request name",
                                &path,
                                decl.span,
                                "rename one of the request declarations",
                            )
                            .with_related(&prev.file, prev.decl.span, "first declaration");
                            self.diags.push(diag);
                        } else {
                            self.reqs.insert(
                                decl.name.clone(),
                                ReqInfo { decl: decl.clone(), file: path.clone() },
                            );
                        }
                    }
                    Stmt::Let(stmt) => {
                        let global = PlanGlobal {
                            name: stmt.name.clone(),
                            value: stmt.value.clone(),
                            file: path.clone(),
                            span: stmt.span,
                        };
                        if let Some(existing) =
                            self.globals.iter_mut().find(|g| g.name == stmt.name)
                        {
                            *existing = global;
                        } else {
                            self.globals.push(global);
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut names: Vec<String> = self.reqs.keys().cloned().collect();
        names.sort();
        for name in names {
            let info = &self.reqs[&name];
            if let Some(parent) = &info.decl.parent {
                if !self.reqs.contains_key(parent) {
                    let (file, span) = (info.file.clone(), info.decl.span);
                    self.diags.push(Diagnostic::error(
                        "E_SEM_UNKNOWN_PARENT_REQ",
                        format!("unknown parent request: {parent}"),
                        &file,
                        span,
                        "reference an existing request as parent",
                    ));
                }
            }
        }
    }

    // Pass 2: inheritance materialization.
    fn pass_materialize(&mut self) {
        self.effective = merge::materialize(&self.reqs, &mut self.diags);
    }

    // Pass 3: request validity over effective lines.
    fn pass_request_validity(&mut self) {
        let mut names: Vec<String> = self.reqs.keys().cloned().collect();
        names.sort();
        for name in names {
            let info = self.reqs[&name].clone();
            let lines = self.effective.get(&name).cloned().unwrap_or_default();

            let http_count = lines.iter().filter(|l| matches!(l, ReqLine::Http(_))).count();
            let json_count = lines.iter().filter(|l| matches!(l, ReqLine::Json(_))).count();
            let pre_count = lines
                .iter()
                .filter(|l| matches!(l, ReqLine::Hook(h) if h.kind == HookKind::Pre))
                .count();
            let post_count = lines
                .iter()
                .filter(|l| matches!(l, ReqLine::Hook(h) if h.kind == HookKind::Post))
                .count();

            if http_count == 0 {
                self.diags.push(Diagnostic::error(
                    "E_SEM_REQ_MISSING_HTTP_LINE",
                    "request must include exactly one HTTP line",
                    &info.file,
                    info.decl.span,
                    "add GET/POST/etc line",
                ));
            }
            if http_count > 1 {
                self.diags.push(Diagnostic::error(
                    "E_SEM_REQ_MULTIPLE_HTTP_LINES",
                    "request has multiple HTTP lines",
                    &info.file,
                    info.decl.span,
                    "keep only one HTTP line",
                ));
            }
            if pre_count > 1 {
                self.diags.push(Diagnostic::error(
                    "E_SEM_DUPLICATE_PRE_HOOK",
                    "request has multiple pre hooks",
                    &info.file,
                    info.decl.span,
                    "keep only one pre hook",
                ));
            }
            if post_count > 1 {
                self.diags.push(Diagnostic::error(
                    "E_SEM_DUPLICATE_POST_HOOK",
                    "request has multiple post hooks",
                    &info.file,
                    info.decl.span,
                    "keep only one post hook",
                ));
            }
            if json_count > 1 {
                self.diags.push(Diagnostic::error(
                    "E_SEM_MULTIPLE_BODIES",
                    "request has multiple body directives",
                    &info.file,
                    info.decl.span,
                    "keep only one json body directive",
                ));
            }

            for line in &lines {
                let ReqLine::Hook(hook) = line else { continue };
                for stmt in &hook.stmts {
                    if let HookStmt::Assign(assign) = stmt {
                        if assign.target.root.kind == LValueRootKind::Res {
                            self.diags.push(Diagnostic::error(
                                "E_SEM_ASSIGN_TO_RES_FORBIDDEN",
                                "assignment to res is forbidden",
                                &info.file,
                                assign.span,
                                "assign to req or a variable instead",
                            ));
                        }
                    }
                }
                if hook.kind != HookKind::Pre {
                    continue;
                }
                if hook_references_response(hook) {
                    self.diags.push(Diagnostic::error(
                        "E_SEM_PRE_HOOK_REFERENCES_RES",
                        "pre hook cannot reference the response",
                        &info.file,
                        hook.span,
                        "use req or flow variables in pre hook",
                    ));
                }
                if hook_templates_reference_response(hook) {
                    self.diags.push(Diagnostic::error(
                        "E_SEM_PRE_HOOK_REFERENCES_RES",
                        "pre hook template references response scope",
                        &info.file,
                        hook.span,
                        "{{status}} and {{res}} are only available after dispatch",
                    ));
                }
            }
        }
    }

    // Passes 4 and 5: flow structure, bindings, and definite
    // assignment over each flow's chain.
    fn pass_flows(&mut self) {
        let entry = self.entry_path.clone();
        let flows = self.flows.clone();
        let defined_globals: HashSet<String> =
            self.globals.iter().map(|g| g.name.clone()).collect();

        for flow in &flows {
            if flow.chain.is_empty() {
                self.diags.push(Diagnostic::error(
                    "E_SEM_FLOW_MISSING_CHAIN",
                    "flow must contain a chain",
                    &entry,
                    flow.span,
                    "add a chain line naming at least one request",
                ));
                continue;
            }
            let mut bindings: HashSet<String> = HashSet::new();
            let mut defined = defined_globals.clone();
            for pre in &flow.prelude {
                defined.insert(pre.name.clone());
            }

            for step in &flow.chain {
                let Some(info) = self.reqs.get(&step.req_name).cloned() else {
                    self.diags.push(Diagnostic::error(
                        "E_SEM_UNKNOWN_REQ_IN_FLOW",
                        format!("unknown request in flow: {}", step.req_name),
                        &entry,
                        step.span,
                        "reference an existing request",
                    ));
                    continue;
                };
                let binding = step.binding().to_string();
                if !bindings.insert(binding) {
                    self.diags.push(Diagnostic::error(
                        "E_SEM_DUPLICATE_FLOW_BINDING",
                        format!("duplicate flow binding: {}", step.binding()),
                        &entry,
                        step.span,
                        "use unique aliases in the chain",
                    ));
                }

                let lines = self.effective.get(&step.req_name).cloned().unwrap_or_default();
                let required = required_vars(&lines);
                let self_defined = step_defined_names(&lines);
                for name in &required.names {
                    if defined.contains(name)
                        || bindings.contains(name)
                        || self_defined.contains(name)
                    {
                        continue;
                    }
                    let code = if required.path_params.contains(name) {
                        "E_SEM_MISSING_PATH_PARAM_VAR"
                    } else {
                        "E_SEM_UNDEFINED_VARIABLE"
                    };
                    self.diags.push(Diagnostic::error(
                        code,
                        format!("undefined variable: {name}"),
                        &info.file,
                        info.decl.span,
                        "define variable globally, in flow prelude, or in prior request lets",
                    ));
                }
                defined.extend(self_defined);
            }

            for assert in &flow.asserts {
                let mut idents = Vec::new();
                let mut seen = HashSet::new();
                collect_expr_idents(&assert.expr, &mut idents, &mut seen);
                for ident in idents {
                    if defined.contains(&ident) || bindings.contains(&ident) {
                        continue;
                    }
                    self.diags.push(Diagnostic::error(
                        "E_SEM_UNKNOWN_FLOW_BINDING",
                        format!("unknown flow binding or variable: {ident}"),
                        &entry,
                        assert.span,
                        "use a binding from the chain or a defined variable",
                    ));
                }
            }
        }
    }

    fn build_plan(&mut self) -> Plan {
        let entry_program = &self.modules[&self.entry_path];
        let mut base = None;
        let mut timeout = None;
        for stmt in &entry_program.stmts {
            let Stmt::Setting(setting) = stmt else { continue };
            match setting.kind {
                SettingKind::Base => {
                    if let Expr::Str(lit) = &setting.value {
                        base = Some(lit.value.clone());
                    }
                }
                SettingKind::Timeout => {
                    if let Expr::Duration(lit) = &setting.value {
                        timeout = lit.to_duration();
                    }
                }
            }
        }

        let mut names: Vec<String> = self.reqs.keys().cloned().collect();
        names.sort();
        let mut requests = Vec::with_capacity(names.len());
        for name in names {
            let info = &self.reqs[&name];
            let lines = self.effective.remove(&name).unwrap_or_default();
            let http = lines
                .iter()
                .find_map(|l| match l {
                    ReqLine::Http(h) => Some(h.clone()),
                    _ => None,
                })
                .expect("validated request has an HTTP line");
            requests.push(PlanRequest {
                name,
                parent: info.decl.parent.clone(),
                lines,
                http,
                file: info.file.clone(),
                span: info.decl.span,
            });
        }

        let mut flows: Vec<PlanFlow> = self
            .flows
            .iter()
            .map(|flow| PlanFlow {
                name: flow.name.value.clone(),
                steps: flow
                    .chain
                    .iter()
                    .map(|step| PlanStep {
                        request: step.req_name.clone(),
                        binding: step.binding().to_string(),
                        span: step.span,
                    })
                    .collect(),
                lets: flow.prelude.iter().map(|l| l.name.clone()).collect(),
                prelude: flow.prelude.clone(),
                asserts: flow.asserts.clone(),
                span: flow.span,
            })
            .collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));

        Plan {
            entry_path: self.entry_path.clone(),
            base,
            timeout,
            globals: std::mem::take(&mut self.globals),
            requests,
            flows,
        }
    }
}

struct RequiredVars {
    names: Vec<String>,
    path_params: HashSet<String>,
}

/// The variables a request needs bound before it can run: free
/// identifiers in any expression context, `:name` path params, and
/// `{{name}}` template placeholders in reachable string literals.
/// Builtins and context names are excluded.
fn required_vars(lines: &[ReqLine]) -> RequiredVars {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    let mut path_params = HashSet::new();

    let mut add_templates_from = |expr: &Expr, names: &mut Vec<String>, seen: &mut HashSet<String>| {
        visit_expr(expr, &mut |e| {
            if let Expr::Str(lit) = e {
                for cap in TEMPLATE_VAR_RE.captures_iter(&lit.value) {
                    let name = cap[1].to_string();
                    if CONTEXT_NAMES.contains(&name.as_str()) {
                        continue;
                    }
                    if seen.insert(name.clone()) {
                        names.push(name);
                    }
                }
            }
        });
    };

    let mut add_expr = |expr: &Expr, names: &mut Vec<String>, seen: &mut HashSet<String>| {
        collect_expr_idents(expr, names, seen);
        add_templates_from(expr, names, seen);
    };

    for line in lines {
        match line {
            ReqLine::Http(http) => {
                for cap in PATH_PARAM_RE.captures_iter(&http.path) {
                    let name = cap[1].to_string();
                    path_params.insert(name.clone());
                    if seen.insert(name.clone()) {
                        names.push(name);
                    }
                }
                for cap in TEMPLATE_VAR_RE.captures_iter(&http.path) {
                    let name = cap[1].to_string();
                    if CONTEXT_NAMES.contains(&name.as_str()) {
                        continue;
                    }
                    if seen.insert(name.clone()) {
                        names.push(name);
                    }
                }
            }
            ReqLine::Header(d) | ReqLine::Query(d) => add_expr(&d.value, &mut names, &mut seen),
            ReqLine::Auth(d) => add_expr(&d.value, &mut names, &mut seen),
            ReqLine::Json(d) => add_expr(&d.value, &mut names, &mut seen),
            ReqLine::Assert(a) => add_expr(&a.expr, &mut names, &mut seen),
            ReqLine::Let(l) => add_expr(&l.value, &mut names, &mut seen),
            ReqLine::Hook(hook) => {
                for stmt in &hook.stmts {
                    match stmt {
                        HookStmt::Assign(assign) => {
                            add_expr(&assign.value, &mut names, &mut seen);
                            for postfix in &assign.target.postfix {
                                if let LValuePostfix::Index { index, .. } = postfix {
                                    add_expr(index, &mut names, &mut seen);
                                }
                            }
                        }
                        HookStmt::Expr(e) => add_expr(&e.expr, &mut names, &mut seen),
                        HookStmt::Let(l) => add_expr(&l.value, &mut names, &mut seen),
                        HookStmt::Print(p) => {
                            for arg in &p.args {
                                add_expr(arg, &mut names, &mut seen);
                            }
                        }
                    }
                }
            }
        }
    }

    names.sort();
    RequiredVars { names, path_params }
}

/// Names a step makes available to later steps: request-level lets,
/// hook lets, and hook assignments whose target is a plain identifier.
fn step_defined_names(lines: &[ReqLine]) -> HashSet<String> {
    let mut out = HashSet::new();
    for line in lines {
        match line {
            ReqLine::Let(l) => {
                out.insert(l.name.clone());
            }
            ReqLine::Hook(hook) => {
                for stmt in &hook.stmts {
                    match stmt {
                        HookStmt::Let(l) => {
                            out.insert(l.name.clone());
                        }
                        HookStmt::Assign(assign)
                            if assign.target.root.kind == LValueRootKind::Ident
                                && assign.target.postfix.is_empty() =>
                        {
                            out.insert(assign.target.root.name.clone());
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn collect_expr_idents(expr: &Expr, out: &mut Vec<String>, seen: &mut HashSet<String>) {
    visit_expr(expr, &mut |e| {
        if let Expr::Ident(ident) = e {
            if BUILTIN_FUNCTIONS.contains(&ident.name.as_str())
                || CONTEXT_NAMES.contains(&ident.name.as_str())
            {
                return;
            }
            if seen.insert(ident.name.clone()) {
                out.push(ident.name.clone());
            }
        }
    });
}

fn hook_references_response(hook: &HookBlock) -> bool {
    let mut found = false;
    visit_hook_exprs(hook, &mut |e| match e {
        Expr::Hash(_) => found = true,
        Expr::Ident(ident) if ident.name == "res" => found = true,
        _ => {}
    });
    found
}

fn hook_templates_reference_response(hook: &HookBlock) -> bool {
    let mut found = false;
    visit_hook_exprs(hook, &mut |e| {
        if let Expr::Str(lit) = e {
            for cap in TEMPLATE_VAR_RE.captures_iter(&lit.value) {
                if &cap[1] == "res" || &cap[1] == "status" {
                    found = true;
                }
            }
        }
    });
    found
}

fn visit_hook_exprs(hook: &HookBlock, f: &mut impl FnMut(&Expr)) {
    for stmt in &hook.stmts {
        match stmt {
            HookStmt::Assign(assign) => {
                visit_expr(&assign.value, f);
                for postfix in &assign.target.postfix {
                    if let LValuePostfix::Index { index, .. } = postfix {
                        visit_expr(index, f);
                    }
                }
            }
            HookStmt::Expr(e) => visit_expr(&e.expr, f),
            HookStmt::Let(l) => visit_expr(&l.value, f),
            HookStmt::Print(p) => {
                for arg in &p.args {
                    visit_expr(arg, f);
                }
            }
        }
    }
}

/// Pre-order traversal over an expression tree.
pub fn visit_expr(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    match expr {
        Expr::Array(a) => {
            for el in &a.elements {
                visit_expr(el, f);
            }
        }
        Expr::Object(o) => {
            for pair in &o.pairs {
                visit_expr(&pair.value, f);
            }
        }
        Expr::Paren(p) => visit_expr(&p.expr, f),
        Expr::Unary(u) => visit_expr(&u.expr, f),
        Expr::Binary(b) => {
            visit_expr(&b.left, f);
            visit_expr(&b.right, f);
        }
        Expr::Field(field) => visit_expr(&field.expr, f),
        Expr::Index(index) => {
            visit_expr(&index.expr, f);
            visit_expr(&index.index, f);
        }
        Expr::Call(call) => {
            visit_expr(&call.callee, f);
            for arg in &call.args {
                visit_expr(arg, f);
            }
        }
        _ => {}
    }
}
