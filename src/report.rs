//! Report model: maps the plan and evaluator results into a
//! suite/testcase summary, plus JSON and JUnit writers for CI
//! consumption.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::compiler::Plan;
use crate::diagnostics::Diagnostic;
use crate::error::{PipeTestError, Result};
use crate::runtime::ExecutionResult;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Model {
    pub suites: Vec<Suite>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Summary {
    pub tests: usize,
    pub failures: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Suite {
    pub name: String,
    pub testcases: Vec<Testcase>,
    pub summary: Summary,
}

#[derive(Debug, Clone, Serialize)]
pub struct Testcase {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub flow: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request: String,
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// One suite per plan flow; one testcase per chain step plus one per
/// flow-level diagnostic. A step with no diagnostic is `passed`;
/// assertion codes map to `failure`, everything else to `error`.
pub fn build(plan: &Plan, result: &ExecutionResult) -> Model {
    let mut model = Model::default();

    for flow in &plan.flows {
        let flow_diags: Vec<&Diagnostic> = result
            .diags
            .iter()
            .filter(|d| d.flow.as_deref() == Some(flow.name.as_str()))
            .collect();

        let mut suite = Suite { name: flow.name.clone(), testcases: Vec::new(), summary: Summary::default() };
        for (index, step) in flow.steps.iter().enumerate() {
            let display = step.display();
            let mut testcase = Testcase {
                name: format!("{} {display}", index + 1),
                flow: flow.name.clone(),
                request: display.clone(),
                status: "passed".to_string(),
                message: String::new(),
            };
            if let Some(diag) =
                flow_diags.iter().find(|d| d.request.as_deref() == Some(display.as_str()))
            {
                testcase.status = status_for_code(&diag.code).to_string();
                testcase.message = diag_message(diag);
            }
            suite.testcases.push(testcase);
        }

        let mut assert_index = 0;
        for diag in flow_diags.iter().filter(|d| d.request.is_none()) {
            assert_index += 1;
            suite.testcases.push(Testcase {
                name: format!("flow :: assert {assert_index}"),
                flow: flow.name.clone(),
                request: String::new(),
                status: status_for_code(&diag.code).to_string(),
                message: diag_message(diag),
            });
        }

        suite.summary = summarize(&suite.testcases);
        model.suites.push(suite);
    }

    model.summary = model.suites.iter().fold(Summary::default(), |mut acc, suite| {
        acc.tests += suite.summary.tests;
        acc.failures += suite.summary.failures;
        acc.errors += suite.summary.errors;
        acc
    });
    model
}

fn status_for_code(code: &str) -> &'static str {
    if code.starts_with("E_ASSERT_") {
        "failure"
    } else {
        "error"
    }
}

fn diag_message(diag: &Diagnostic) -> String {
    format!("{} @ {}:{}:{}", diag.message, diag.file, diag.line, diag.column)
}

fn summarize(testcases: &[Testcase]) -> Summary {
    let mut summary = Summary { tests: testcases.len(), failures: 0, errors: 0 };
    for testcase in testcases {
        match testcase.status.as_str() {
            "failure" => summary.failures += 1,
            "error" => summary.errors += 1,
            _ => {}
        }
    }
    summary
}

pub fn write_json_file(path: &Path, model: &Model) -> Result<()> {
    ensure_parent(path)?;
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, model)?;
    Ok(())
}

/// JUnit-style XML: `<testsuites>` / `<testsuite>` / `<testcase>` with
/// `<failure>`/`<error>` message attributes.
pub fn write_junit_file(path: &Path, model: &Model) -> Result<()> {
    ensure_parent(path)?;
    let mut file = std::fs::File::create(path)?;
    write_junit(&mut file, model)
}

pub fn write_junit(out: &mut dyn Write, model: &Model) -> Result<()> {
    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(out, "<testsuites>")?;
    for suite in &model.suites {
        writeln!(
            out,
            r#"  <testsuite name="{}" tests="{}" failures="{}" errors="{}">"#,
            xml_escape(&suite.name),
            suite.summary.tests,
            suite.summary.failures,
            suite.summary.errors
        )?;
        for testcase in &suite.testcases {
            match testcase.status.as_str() {
                "failure" => {
                    writeln!(out, r#"    <testcase name="{}">"#, xml_escape(&testcase.name))?;
                    writeln!(out, r#"      <failure message="{}"></failure>"#, xml_escape(&testcase.message))?;
                    writeln!(out, "    </testcase>")?;
                }
                "error" => {
                    writeln!(out, r#"    <testcase name="{}">"#, xml_escape(&testcase.name))?;
                    writeln!(out, r#"      <error message="{}"></error>"#, xml_escape(&testcase.message))?;
                    writeln!(out, "    </testcase>")?;
                }
                _ => {
                    writeln!(out, r#"    <testcase name="{}"></testcase>"#, xml_escape(&testcase.name))?;
                }
            }
        }
        writeln!(out, "  </testsuite>")?;
    }
    writeln!(out, "</testsuites>")?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| PipeTestError::ReportError(err.to_string()))?;
        }
    }
    Ok(())
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Position, Span};
    use crate::compiler::{compile, Module};
    use crate::parser::parse;
    use crate::runtime::ExecutionResult;

    fn plan_for(src: &str) -> Plan {
        let (program, _, parse_diags) = parse("main.pt", src);
        assert!(parse_diags.is_empty());
        compile("main.pt", vec![Module { path: "main.pt".to_string(), program }]).expect("plan")
    }

    fn diag(code: &str, flow: &str, request: Option<&str>) -> Diagnostic {
        let span = Span::at(Position { offset: 0, line: 3, column: 2 });
        let mut d = Diagnostic::error(code, "boom", "main.pt", span, "").with_flow(flow);
        if let Some(request) = request {
            d = d.with_request(request);
        }
        d
    }

    #[test]
    fn all_passing_steps_are_passed_testcases() {
        let plan = plan_for("req r:\n\tGET /x\nflow \"f\":\n\tr -> r : again\n");
        let model = build(&plan, &ExecutionResult::default());
        assert_eq!(model.suites.len(), 1);
        let suite = &model.suites[0];
        assert_eq!(suite.testcases.len(), 2);
        assert_eq!(suite.testcases[0].name, "1 r");
        assert_eq!(suite.testcases[1].name, "2 r:again");
        assert!(suite.testcases.iter().all(|t| t.status == "passed"));
        assert_eq!(model.summary.tests, 2);
        assert_eq!(model.summary.failures + model.summary.errors, 0);
    }

    #[test]
    fn assertion_codes_map_to_failure_others_to_error() {
        let plan = plan_for("req r:\n\tGET /x\nflow \"f\":\n\tr\n");
        let result = ExecutionResult {
            flows: Vec::new(),
            diags: vec![diag("E_ASSERT_EXPECTED_TRUE", "f", Some("r"))],
        };
        let model = build(&plan, &result);
        assert_eq!(model.suites[0].testcases[0].status, "failure");
        assert!(model.suites[0].testcases[0].message.contains("main.pt:3:2"));

        let result = ExecutionResult {
            flows: Vec::new(),
            diags: vec![diag("E_RUNTIME_TRANSPORT", "f", Some("r"))],
        };
        let model = build(&plan, &result);
        assert_eq!(model.suites[0].testcases[0].status, "error");
        assert_eq!(model.summary.errors, 1);
    }

    #[test]
    fn flow_level_diags_become_assert_testcases() {
        let plan = plan_for("req r:\n\tGET /x\nflow \"f\":\n\tr\n\t? r.status == 200\n");
        let result = ExecutionResult {
            flows: Vec::new(),
            diags: vec![diag("E_ASSERT_EXPECTED_TRUE", "f", None)],
        };
        let model = build(&plan, &result);
        let suite = &model.suites[0];
        assert_eq!(suite.testcases.len(), 2);
        assert_eq!(suite.testcases[1].name, "flow :: assert 1");
        assert_eq!(suite.testcases[1].status, "failure");
        assert_eq!(suite.summary.failures, 1);
    }

    #[test]
    fn junit_output_escapes_attributes() {
        let model = Model {
            suites: vec![Suite {
                name: "a<b>".to_string(),
                testcases: vec![Testcase {
                    name: "1 r".to_string(),
                    flow: "a<b>".to_string(),
                    request: "r".to_string(),
                    status: "failure".to_string(),
                    message: "\"quoted\" & <tagged>".to_string(),
                }],
                summary: Summary { tests: 1, failures: 1, errors: 0 },
            }],
            summary: Summary { tests: 1, failures: 1, errors: 0 },
        };
        let mut buffer = Vec::new();
        write_junit(&mut buffer, &model).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains(r#"<testsuite name="a&lt;b&gt;""#));
        assert!(text.contains("&quot;quoted&quot; &amp; &lt;tagged&gt;"));
        assert!(!text.contains("<tagged>"));
    }

    #[test]
    fn json_model_round_trips() {
        let plan = plan_for("req r:\n\tGET /x\nflow \"f\":\n\tr\n");
        let model = build(&plan, &ExecutionResult::default());
        let value = serde_json::to_value(&model).unwrap();
        assert_eq!(value["suites"][0]["name"], "f");
        assert_eq!(value["summary"]["tests"], 1);
    }
}
