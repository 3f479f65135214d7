use serde::Serialize;

use crate::ast::Span;

/// Secondary source location attached to a diagnostic, e.g. the first
/// declaration in a duplicate-name report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Related {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Canonical diagnostic record shared by every stage of the pipeline.
///
/// The field set is a stable external contract: reporters and CI
/// integrations key off `code`, `file`, `line`, `column` and the
/// optional `flow`/`request` context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: &'static str,
    pub code: String,
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related: Option<Related>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>, file: &str, span: Span, hint: &str) -> Self {
        Diagnostic {
            severity: "error",
            code: code.to_string(),
            message: message.into(),
            file: file.to_string(),
            line: span.start.line,
            column: span.start.column,
            hint: hint.to_string(),
            related: None,
            flow: None,
            request: None,
        }
    }

    pub fn with_related(mut self, file: &str, span: Span, message: &str) -> Self {
        self.related = Some(Related {
            file: file.to_string(),
            line: span.start.line,
            column: span.start.column,
            message: message.to_string(),
        });
        self
    }

    pub fn with_flow(mut self, flow: &str) -> Self {
        self.flow = Some(flow.to_string());
        self
    }

    pub fn with_request(mut self, request: &str) -> Self {
        self.request = Some(request.to_string());
        self
    }
}

type SortKey<'a> = (
    &'a str,
    usize,
    usize,
    &'a str,
    &'a str,
    &'a str,
    usize,
    usize,
);

fn sort_key(d: &Diagnostic) -> SortKey<'_> {
    let (rf, rl, rc) = match &d.related {
        Some(r) => (r.file.as_str(), r.line, r.column),
        None => ("", 0, 0),
    };
    (
        d.file.as_str(),
        d.line,
        d.column,
        d.code.as_str(),
        d.message.as_str(),
        rf,
        rl,
        rc,
    )
}

fn dedupe_key(d: &Diagnostic) -> String {
    let (rf, rl, rc) = match &d.related {
        Some(r) => (r.file.as_str(), r.line, r.column),
        None => ("", 0, 0),
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        d.code,
        d.file,
        d.line,
        d.column,
        d.message,
        rf,
        rl,
        rc,
        d.flow.as_deref().unwrap_or(""),
        d.request.as_deref().unwrap_or("")
    )
}

/// Enforces deterministic output ordering and duplicate removal.
///
/// The sort is stable so equal-keyed diagnostics keep their emission
/// order; duplicates keep the first occurrence.
pub fn sort_and_dedupe(diags: Vec<Diagnostic>) -> Vec<Diagnostic> {
    if diags.is_empty() {
        return diags;
    }
    let mut out = diags;
    out.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    let mut seen = std::collections::HashSet::new();
    out.retain(|d| seen.insert(dedupe_key(d)));
    out
}
