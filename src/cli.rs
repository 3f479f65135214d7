//! Command-line interface: `eval`, `run` and `request` subcommands.
//!
//! Exit codes: 0 clean, 1 diagnostics or execution failures, 2 usage
//! errors.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::ast::DurationLit;
use crate::compiler::{self, Plan, PlanFlow, PlanStep};
use crate::diagnostics::{sort_and_dedupe, Diagnostic};
use crate::loader::{load_modules, FsModuleLoader};
use crate::report;
use crate::runtime::transport::ReqwestTransport;
use crate::runtime::{execute, Options};

#[derive(Parser, Debug)]
#[command(name = "pipetest")]
#[command(version, about = "PipeTest - API integration test runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Static analysis only
    Eval {
        /// Entry program file
        program: PathBuf,

        #[arg(long, default_value = "pretty", help = "stdout format: pretty|json")]
        format: String,
    },

    /// Compile and execute all flows
    Run {
        /// Entry program file
        program: PathBuf,

        #[arg(long, default_value = "pretty", help = "stdout format: pretty|json")]
        format: String,

        #[arg(long, default_value = "./pipetest-report", help = "directory for report artifacts")]
        report_dir: PathBuf,

        #[arg(long, help = "override timeout setting, e.g. 2s")]
        timeout: Option<String>,

        #[arg(long, help = "override the base URL setting")]
        base: Option<String>,

        #[arg(long, help = "print verbose execution logs")]
        verbose: bool,

        #[arg(long, help = "omit passing assertions from the log")]
        quiet_assertions: bool,
    },

    /// Compile and execute a single request
    Request {
        /// Entry program file
        program: PathBuf,

        /// Request name to execute
        name: String,

        #[arg(long, default_value = "pretty", help = "stdout format: pretty|json")]
        format: String,

        #[arg(long, help = "override timeout setting, e.g. 2s")]
        timeout: Option<String>,

        #[arg(long, help = "override the base URL setting")]
        base: Option<String>,

        #[arg(long, help = "print verbose execution logs")]
        verbose: bool,
    },
}

pub async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Eval { program, format } => eval_command(&program, &format),
        Commands::Run { program, format, report_dir, timeout, base, verbose, quiet_assertions } => {
            run_command(&program, &format, &report_dir, timeout, base, verbose, quiet_assertions)
                .await
        }
        Commands::Request { program, name, format, timeout, base, verbose } => {
            request_command(&program, &name, &format, timeout, base, verbose).await
        }
    }
}

fn eval_command(program: &Path, format: &str) -> i32 {
    if validate_format(format).is_err() {
        eprintln!("unknown --format {format:?} (expected pretty|json)");
        return 2;
    }
    let (_, diags) = compile_program(program);
    print_command_result("eval", format, &diags, None);
    if diags.is_empty() {
        0
    } else {
        1
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    program: &Path,
    format: &str,
    report_dir: &Path,
    timeout: Option<String>,
    base: Option<String>,
    verbose: bool,
    quiet_assertions: bool,
) -> i32 {
    if validate_format(format).is_err() {
        eprintln!("unknown --format {format:?} (expected pretty|json)");
        return 2;
    }
    let timeout = match parse_timeout(timeout.as_deref()) {
        Ok(timeout) => timeout,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    let (plan, diags) = compile_program(program);
    if !diags.is_empty() {
        print_command_result("run", format, &diags, None);
        return 1;
    }
    let plan = plan.expect("plan present when diagnostics are empty");

    let mut opt = Options::new(Arc::new(ReqwestTransport::new()));
    opt.timeout_override = timeout;
    opt.base_override = base;
    opt.verbose = verbose;
    opt.suppress_passing_assertions = quiet_assertions;
    opt.log = Some(Box::new(std::io::stdout()));

    let mut result = execute(&plan, opt).await;
    result.diags = sort_and_dedupe(result.diags);
    let model = report::build(&plan, &result);

    if let Err(err) = write_run_reports(report_dir, &model) {
        eprintln!("failed to write reports: {err}");
        return 1;
    }

    print_command_result("run", format, &result.diags, Some(&model));
    if result.diags.is_empty() {
        0
    } else {
        1
    }
}

async fn request_command(
    program: &Path,
    name: &str,
    format: &str,
    timeout: Option<String>,
    base: Option<String>,
    verbose: bool,
) -> i32 {
    if validate_format(format).is_err() {
        eprintln!("unknown --format {format:?} (expected pretty|json)");
        return 2;
    }
    let timeout = match parse_timeout(timeout.as_deref()) {
        Ok(timeout) => timeout,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    let (plan, diags) = compile_program(program);
    if !diags.is_empty() {
        print_command_result("request", format, &diags, None);
        return 1;
    }
    let mut plan = plan.expect("plan present when diagnostics are empty");

    if plan.request(name).is_none() {
        eprintln!("request {name:?} not found in {}", program.display());
        return 2;
    }
    plan.flows = vec![PlanFlow {
        name: format!("request:{name}"),
        steps: vec![PlanStep {
            request: name.to_string(),
            binding: name.to_string(),
            span: crate::ast::Span::default(),
        }],
        lets: Vec::new(),
        prelude: Vec::new(),
        asserts: Vec::new(),
        span: crate::ast::Span::default(),
    }];

    let mut opt = Options::new(Arc::new(ReqwestTransport::new()));
    opt.timeout_override = timeout;
    opt.base_override = base;
    opt.verbose = verbose;
    opt.log = Some(Box::new(std::io::stdout()));

    let mut result = execute(&plan, opt).await;
    result.diags = sort_and_dedupe(result.diags);
    print_command_result("request", format, &result.diags, None);
    if result.diags.is_empty() {
        0
    } else {
        1
    }
}

fn validate_format(format: &str) -> Result<(), ()> {
    if format == "pretty" || format == "json" {
        Ok(())
    } else {
        Err(())
    }
}

fn parse_timeout(timeout: Option<&str>) -> Result<Option<std::time::Duration>, String> {
    let Some(raw) = timeout else { return Ok(None) };
    let lit = DurationLit { raw: raw.to_string(), span: crate::ast::Span::default() };
    lit.to_duration()
        .map(Some)
        .ok_or_else(|| format!("invalid --timeout value: {raw:?} (expected e.g. 2s, 500ms)"))
}

fn compile_program(entry: &Path) -> (Option<Plan>, Vec<Diagnostic>) {
    let entry = entry.to_string_lossy();
    let (modules, load_diags) = load_modules(&entry, &FsModuleLoader);
    if !load_diags.is_empty() {
        return (None, load_diags);
    }
    match compiler::compile(&entry, modules) {
        Ok(plan) => (Some(plan), Vec::new()),
        Err(diags) => (None, diags),
    }
}

fn write_run_reports(report_dir: &Path, model: &report::Model) -> crate::error::Result<()> {
    report::write_junit_file(&report_dir.join("pipetest-junit.xml"), model)?;
    report::write_junit_file(&report_dir.join("pipetest-report.xml"), model)?;
    report::write_json_file(&report_dir.join("pipetest-report.json"), model)?;
    Ok(())
}

fn print_command_result(
    command: &str,
    format: &str,
    diags: &[Diagnostic],
    model: Option<&report::Model>,
) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        "json" => {
            let mut payload = serde_json::json!({
                "command": command,
                "ok": diags.is_empty(),
                "diagnostics": diags,
                "summary": { "error_count": diags.len() },
            });
            if let Some(model) = model {
                payload["report"] = serde_json::to_value(model).unwrap_or_default();
            }
            let _ = serde_json::to_writer_pretty(&mut out, &payload);
            let _ = writeln!(out);
        }
        _ => {
            for diag in diags {
                let _ = writeln!(
                    out,
                    "ERROR {} {}:{}:{} {}",
                    diag.code, diag.file, diag.line, diag.column, diag.message
                );
                if !diag.hint.is_empty() {
                    let _ = writeln!(out, "  hint: {}", diag.hint);
                }
                if let Some(related) = &diag.related {
                    let _ = writeln!(
                        out,
                        "  related: {}:{}:{} {}",
                        related.file, related.line, related.column, related.message
                    );
                }
            }
            if let Some(model) = model {
                let _ = writeln!(
                    out,
                    "flows={} tests={} failures={} errors={}",
                    model.suites.len(),
                    model.summary.tests,
                    model.summary.failures,
                    model.summary.errors
                );
            }
            if diags.is_empty() && command == "eval" {
                let _ = writeln!(out, "OK");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_parsing_accepts_duration_literals() {
        assert_eq!(parse_timeout(None).unwrap(), None);
        assert_eq!(
            parse_timeout(Some("2s")).unwrap(),
            Some(std::time::Duration::from_secs(2))
        );
        assert_eq!(
            parse_timeout(Some("500ms")).unwrap(),
            Some(std::time::Duration::from_millis(500))
        );
        assert!(parse_timeout(Some("fast")).is_err());
    }

    #[test]
    fn format_validation() {
        assert!(validate_format("pretty").is_ok());
        assert!(validate_format("json").is_ok());
        assert!(validate_format("yaml").is_err());
    }
}
