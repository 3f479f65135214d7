//! Request-inheritance materialization.
//!
//! Each request's *effective line list* merges the parent chain with
//! the child declaration. Single-slot groups (HTTP line, auth, json,
//! pre hook, post hook) are replaced wholesale when the child declares
//! any; headers, queries and lets merge by key preserving insertion
//! order; assertions are replaced entirely when the child declares any,
//! otherwise inherited. The flattened output follows a canonical order
//! which is also the evaluation order: http, auth, headers, queries,
//! json, pre hook, post hook, assertions, lets.

use std::collections::HashMap;

use crate::ast::*;
use crate::diagnostics::Diagnostic;

use super::ReqInfo;

/// Accumulated merge state for one inheritance chain. Duplicates within
/// a single declaration are preserved so validity checks can flag them.
#[derive(Default, Clone)]
struct LineSet {
    http: Vec<HttpLine>,
    auth: Vec<AuthDirective>,
    headers: Vec<KeyDirective>,
    queries: Vec<KeyDirective>,
    json: Vec<JsonDirective>,
    pre: Vec<HookBlock>,
    post: Vec<HookBlock>,
    asserts: Vec<AssertStmt>,
    lets: Vec<LetStmt>,
}

impl LineSet {
    /// Applies one declaration's lines (or a parent's flattened
    /// effective lines) on top of the accumulated state.
    fn apply(&mut self, lines: &[ReqLine]) {
        let mut http = Vec::new();
        let mut auth = Vec::new();
        let mut json = Vec::new();
        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut asserts = Vec::new();

        for line in lines {
            match line {
                ReqLine::Http(l) => http.push(l.clone()),
                ReqLine::Auth(l) => auth.push(l.clone()),
                ReqLine::Json(l) => json.push(l.clone()),
                ReqLine::Hook(l) => match l.kind {
                    HookKind::Pre => pre.push(l.clone()),
                    HookKind::Post => post.push(l.clone()),
                },
                ReqLine::Assert(l) => asserts.push(l.clone()),
                ReqLine::Header(l) => upsert_keyed(&mut self.headers, l),
                ReqLine::Query(l) => upsert_keyed(&mut self.queries, l),
                ReqLine::Let(l) => upsert_let(&mut self.lets, l),
            }
        }

        if !http.is_empty() {
            self.http = http;
        }
        if !auth.is_empty() {
            self.auth = auth;
        }
        if !json.is_empty() {
            self.json = json;
        }
        if !pre.is_empty() {
            self.pre = pre;
        }
        if !post.is_empty() {
            self.post = post;
        }
        if !asserts.is_empty() {
            self.asserts = asserts;
        }
    }

    fn into_lines(self) -> Vec<ReqLine> {
        let mut out = Vec::new();
        out.extend(self.http.into_iter().map(ReqLine::Http));
        out.extend(self.auth.into_iter().map(ReqLine::Auth));
        out.extend(self.headers.into_iter().map(ReqLine::Header));
        out.extend(self.queries.into_iter().map(ReqLine::Query));
        out.extend(self.json.into_iter().map(ReqLine::Json));
        out.extend(self.pre.into_iter().map(ReqLine::Hook));
        out.extend(self.post.into_iter().map(ReqLine::Hook));
        out.extend(self.asserts.into_iter().map(ReqLine::Assert));
        out.extend(self.lets.into_iter().map(ReqLine::Let));
        out
    }
}

fn upsert_keyed(entries: &mut Vec<KeyDirective>, directive: &KeyDirective) {
    if let Some(existing) = entries.iter_mut().find(|e| e.key.name == directive.key.name) {
        *existing = directive.clone();
    } else {
        entries.push(directive.clone());
    }
}

fn upsert_let(entries: &mut Vec<LetStmt>, stmt: &LetStmt) {
    if let Some(existing) = entries.iter_mut().find(|e| e.name == stmt.name) {
        *existing = stmt.clone();
    } else {
        entries.push(stmt.clone());
    }
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    InProgress,
    Done,
}

/// Computes effective line lists for every request, detecting
/// inheritance cycles. Requests are visited in sorted-name order so the
/// diagnostic stream is deterministic.
pub(super) fn materialize(
    reqs: &HashMap<String, ReqInfo>,
    diags: &mut Vec<Diagnostic>,
) -> HashMap<String, Vec<ReqLine>> {
    let mut memo: HashMap<String, Vec<ReqLine>> = HashMap::new();
    let mut states: HashMap<String, VisitState> = HashMap::new();

    let mut names: Vec<&String> = reqs.keys().collect();
    names.sort();
    for name in names {
        build(name, reqs, &mut states, &mut memo, diags);
    }
    memo
}

fn build(
    name: &str,
    reqs: &HashMap<String, ReqInfo>,
    states: &mut HashMap<String, VisitState>,
    memo: &mut HashMap<String, Vec<ReqLine>>,
    diags: &mut Vec<Diagnostic>,
) -> Vec<ReqLine> {
    match states.get(name) {
        Some(VisitState::Done) => return memo.get(name).cloned().unwrap_or_default(),
        Some(VisitState::InProgress) => {
            let info = &reqs[name];
            diags.push(Diagnostic::error(
                "E_SEM_INHERITANCE_CYCLE",
                format!("request inheritance cycle involving: {name}"),
                &info.file,
                info.decl.span,
                "remove the circular parent reference",
            ));
            return Vec::new();
        }
        None => {}
    }
    states.insert(name.to_string(), VisitState::InProgress);

    let info = &reqs[name];
    let mut set = LineSet::default();
    if let Some(parent) = &info.decl.parent {
        if reqs.contains_key(parent) {
            let parent_lines = build(parent, reqs, states, memo, diags);
            set.apply(&parent_lines);
        }
    }
    set.apply(&info.decl.lines);

    let lines = set.into_lines();
    states.insert(name.to_string(), VisitState::Done);
    memo.insert(name.to_string(), lines.clone());
    lines
}
