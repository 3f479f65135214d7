//! Plan evaluation: flows, steps, hooks, directives and assertions.
//!
//! Flows execute sequentially in plan order; steps execute sequentially
//! within a flow. The only suspension point is the transport dispatch.
//! A step-level fault aborts the current flow; remaining flows still
//! run. The plan itself is never mutated.

pub mod builtins;
pub mod eval;
pub mod template;
pub mod transport;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::ast::fmt::format_expr;
use crate::ast::*;
use crate::compiler::{Plan, PlanRequest, PlanStep};
use crate::diagnostics::Diagnostic;

use eval::{as_bool, assign_lvalue, eval_expr, format_value, number, EvalContext, EvalError};
use template::{apply_query, combine_url, interpolate_string, interpolate_value, render_path};
use transport::{CancelToken, HttpTransport, TransportRequest};

pub struct Options {
    pub transport: Arc<dyn HttpTransport>,
    pub cancel: CancelToken,
    pub base_override: Option<String>,
    pub timeout_override: Option<Duration>,
    pub verbose: bool,
    /// Sink for verbose logs and the assertion log; `None` disables
    /// both.
    pub log: Option<Box<dyn Write + Send>>,
    pub suppress_passing_assertions: bool,
}

impl Options {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Options {
            transport,
            cancel: CancelToken::new(),
            base_override: None,
            timeout_override: None,
            verbose: false,
            log: None,
            suppress_passing_assertions: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub flows: Vec<FlowResult>,
    pub diags: Vec<Diagnostic>,
}

#[derive(Debug)]
pub struct FlowResult {
    pub name: String,
    pub steps: Vec<StepResult>,
}

#[derive(Debug)]
pub struct StepResult {
    pub request: String,
    pub binding: String,
    pub status: u16,
}

/// Executes a compiled plan flow by flow.
pub async fn execute(plan: &Plan, mut opt: Options) -> ExecutionResult {
    let mut result = ExecutionResult::default();
    let mut logger = Logger {
        writer: opt.log.take(),
        verbose: opt.verbose,
        suppress_passing: opt.suppress_passing_assertions,
        current_flow: String::new(),
        current_target: String::new(),
    };
    let timeout = opt.timeout_override.or(plan.timeout);
    let base = opt
        .base_override
        .clone()
        .or_else(|| plan.base.clone())
        .unwrap_or_default();

    let mut globals: Map<String, Value> = Map::new();
    for global in &plan.globals {
        let ctx = EvalContext::with_vars(std::mem::take(&mut globals));
        match eval_expr(&global.value, &ctx) {
            Ok(value) => {
                globals = ctx.flow_vars;
                globals.insert(global.name.clone(), value);
            }
            Err(err) => {
                globals = ctx.flow_vars;
                result.diags.push(runtime_diag(
                    "E_RUNTIME_EXPRESSION",
                    format!("failed to evaluate global let {}", global.name),
                    &global.file,
                    global.span,
                    &err.to_string(),
                    None,
                    None,
                ));
            }
        }
    }

    for flow in &plan.flows {
        debug!(flow = %flow.name, "flow start");
        logger.verbose(&format!("flow {:?}: start", flow.name));
        let mut flow_result = FlowResult { name: flow.name.clone(), steps: Vec::new() };
        let mut flow_vars = globals.clone();
        let mut prelude_ok = true;
        for pre in &flow.prelude {
            let ctx = EvalContext::with_vars(std::mem::take(&mut flow_vars));
            match eval_expr(&pre.value, &ctx) {
                Ok(value) => {
                    flow_vars = ctx.flow_vars;
                    flow_vars.insert(pre.name.clone(), value);
                }
                Err(err) => {
                    flow_vars = ctx.flow_vars;
                    result.diags.push(runtime_diag(
                        "E_RUNTIME_EXPRESSION",
                        "failed to evaluate flow prelude let",
                        &plan.entry_path,
                        pre.span,
                        &err.to_string(),
                        Some(&flow.name),
                        None,
                    ));
                    prelude_ok = false;
                }
            }
        }

        let mut bindings: Map<String, Value> = Map::new();
        let mut aborted = !prelude_ok;
        if !aborted {
            for step in &flow.steps {
                debug!(flow = %flow.name, request = %step.request, binding = %step.binding, "step start");
                logger.verbose(&format!(
                    "flow {:?}: request {:?} (binding={:?}) start",
                    flow.name, step.request, step.binding
                ));
                let Some(request) = plan.request(&step.request) else {
                    result.diags.push(runtime_diag(
                        "E_RUNTIME_UNKNOWN_REQUEST",
                        "request not found in runtime plan",
                        &plan.entry_path,
                        flow.span,
                        &step.request,
                        Some(&flow.name),
                        Some(&step.display()),
                    ));
                    aborted = true;
                    break;
                };
                match execute_step(
                    request,
                    step,
                    &flow.name,
                    &mut flow_vars,
                    &bindings,
                    &base,
                    timeout,
                    &opt.transport,
                    &opt.cancel,
                    &mut logger,
                )
                .await
                {
                    Ok(outcome) => {
                        let mut snapshot = Map::new();
                        snapshot.insert("res".to_string(), outcome.res);
                        snapshot.insert("req".to_string(), outcome.req_snapshot);
                        snapshot.insert("status".to_string(), number(f64::from(outcome.status)));
                        snapshot.insert("header".to_string(), outcome.headers);
                        bindings.insert(step.binding.clone(), Value::Object(snapshot));
                        flow_result.steps.push(StepResult {
                            request: step.request.clone(),
                            binding: step.binding.clone(),
                            status: outcome.status,
                        });
                        logger.verbose(&format!(
                            "flow {:?}: request {:?} done (status={})",
                            flow.name, step.binding, outcome.status
                        ));
                    }
                    Err(diag) => {
                        result.diags.push(*diag);
                        aborted = true;
                        break;
                    }
                }
            }
        }

        if !aborted {
            let ctx = EvalContext {
                flow_vars: flow_vars.clone(),
                bindings: bindings.clone(),
                ..Default::default()
            };
            for assert in &flow.asserts {
                match eval_expr(&assert.expr, &ctx) {
                    Err(err) => {
                        logger.assertion(&flow.name, "", &assert.expr, false);
                        result.diags.push(runtime_diag(
                            "E_RUNTIME_EXPRESSION",
                            "failed to evaluate flow assertion",
                            &plan.entry_path,
                            assert.span,
                            &err.to_string(),
                            Some(&flow.name),
                            None,
                        ));
                    }
                    Ok(value) => {
                        let verdict = as_bool(&value);
                        let passed = matches!(verdict, Ok(true));
                        logger.assertion(&flow.name, "", &assert.expr, passed);
                        if !passed {
                            let hint = match verdict {
                                Err(cast) => cast.to_string(),
                                _ => "assertion must evaluate to true".to_string(),
                            };
                            result.diags.push(runtime_diag(
                                "E_ASSERT_EXPECTED_TRUE",
                                "flow assertion failed",
                                &plan.entry_path,
                                assert.span,
                                &hint,
                                Some(&flow.name),
                                None,
                            ));
                        }
                    }
                }
            }
        }

        result.flows.push(flow_result);
        debug!(flow = %flow.name, "flow done");
        logger.verbose(&format!("flow {:?}: done", flow.name));
    }

    result
}

struct StepOutcome {
    status: u16,
    res: Value,
    headers: Value,
    req_snapshot: Value,
}

#[allow(clippy::too_many_arguments)]
async fn execute_step(
    request: &PlanRequest,
    step: &PlanStep,
    flow_name: &str,
    flow_vars: &mut Map<String, Value>,
    bindings: &Map<String, Value>,
    base: &str,
    timeout: Option<Duration>,
    transport: &Arc<dyn HttpTransport>,
    cancel: &CancelToken,
    logger: &mut Logger,
) -> Result<StepOutcome, Box<Diagnostic>> {
    let step_id = step.display();
    let http = &request.http;
    let step_diag = |code: &str, message: &str, span: Span, hint: &str| {
        Box::new(runtime_diag(
            code,
            message,
            &request.file,
            span,
            hint,
            Some(flow_name),
            Some(&step_id),
        ))
    };

    // URL assembly: {{var}} templates first, then :param substitution
    let vars_lookup = |vars: &Map<String, Value>| {
        let vars = vars.clone();
        move |name: &str| vars.get(name).cloned()
    };
    let templated = interpolate_string(&http.path, &vars_lookup(flow_vars)).map_err(|err| {
        step_diag(
            "E_RUNTIME_MISSING_VARIABLE",
            "failed to render request path",
            http.span,
            &err.to_string(),
        )
    })?;
    let path = render_path(&templated, flow_vars).map_err(|name| {
        step_diag(
            "E_RUNTIME_MISSING_PATH_PARAM",
            &format!("missing variable {name} for path param"),
            http.span,
            "define the missing variable in global/flow/request scope",
        )
    })?;
    let url = combine_url(base, &path);

    let mut req_obj = Map::new();
    req_obj.insert("method".to_string(), Value::String(http.method.as_str().to_string()));
    req_obj.insert("url".to_string(), Value::String(url));
    req_obj.insert("header".to_string(), Value::Object(Map::new()));
    req_obj.insert("query".to_string(), Value::Object(Map::new()));
    req_obj.insert("json".to_string(), Value::Null);

    let mut ctx = EvalContext {
        req: Some(Value::Object(req_obj)),
        res: None,
        status: None,
        headers: None,
        flow_vars: std::mem::take(flow_vars),
        bindings: bindings.clone(),
    };

    for line in &request.lines {
        let ReqLine::Hook(hook) = line else { continue };
        if hook.kind != HookKind::Pre {
            continue;
        }
        if let Err(err) = exec_hook(hook, &mut ctx) {
            return Err(match err {
                EvalError::MissingTemplateVar(_) => step_diag(
                    "E_RUNTIME_MISSING_VARIABLE",
                    "failed to render pre hook print statement",
                    hook.span,
                    &err.to_string(),
                ),
                other => step_diag(
                    "E_RUNTIME_HOOK",
                    "pre hook execution failed",
                    hook.span,
                    &other.to_string(),
                ),
            });
        }
    }

    for line in &request.lines {
        match line {
            ReqLine::Header(directive) => {
                let value = eval_directive_value(&directive.value, &ctx, directive.span).map_err(
                    |(code, err)| step_diag(code, "failed to evaluate header directive", directive.span, &err),
                )?;
                set_req_entry(&mut ctx, "header", &directive.key.name, Value::String(format_value(&value)))
                    .map_err(|err| step_diag("E_RUNTIME_HOOK", "failed to apply header directive", directive.span, &err.to_string()))?;
            }
            ReqLine::Query(directive) => {
                let value = eval_directive_value(&directive.value, &ctx, directive.span).map_err(
                    |(code, err)| step_diag(code, "failed to evaluate query directive", directive.span, &err),
                )?;
                set_req_entry(&mut ctx, "query", &directive.key.name, Value::String(format_value(&value)))
                    .map_err(|err| step_diag("E_RUNTIME_HOOK", "failed to apply query directive", directive.span, &err.to_string()))?;
            }
            ReqLine::Auth(directive) => {
                let value = eval_directive_value(&directive.value, &ctx, directive.span).map_err(
                    |(code, err)| step_diag(code, "failed to evaluate auth directive", directive.span, &err),
                )?;
                let bearer = format!("Bearer {}", format_value(&value));
                set_req_entry(&mut ctx, "header", "Authorization", Value::String(bearer))
                    .map_err(|err| step_diag("E_RUNTIME_HOOK", "failed to apply auth directive", directive.span, &err.to_string()))?;
            }
            ReqLine::Json(directive) => {
                let value = eval_directive_value(&directive.value, &ctx, directive.span).map_err(
                    |(code, err)| step_diag(code, "failed to evaluate json directive", directive.span, &err),
                )?;
                if let Some(Value::Object(req)) = ctx.req.as_mut() {
                    req.insert("json".to_string(), value);
                }
            }
            _ => {}
        }
    }

    // finalize URL and body
    let (final_url, header_pairs, body) = {
        let req = ctx
            .req
            .as_mut()
            .and_then(|r| r.as_object_mut())
            .ok_or_else(|| step_diag("E_RUNTIME_HOOK", "request object was replaced with a non-object", request.span, "hooks must keep req an object"))?;
        let url = req.get("url").map(format_value).unwrap_or_default();
        let query = req
            .get("query")
            .and_then(|q| q.as_object())
            .cloned()
            .unwrap_or_default();
        let final_url = apply_query(&url, &query);
        req.insert("url".to_string(), Value::String(final_url.clone()));

        let json_body = req.get("json").cloned().unwrap_or(Value::Null);
        let body = if json_body.is_null() {
            None
        } else {
            let bytes = serde_json::to_vec(&json_body).map_err(|err| {
                step_diag(
                    "E_RUNTIME_EXPRESSION",
                    "failed to serialize json body",
                    request.span,
                    &err.to_string(),
                )
            })?;
            let headers = req
                .entry("header".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = headers {
                map.insert(
                    "Content-Type".to_string(),
                    Value::String("application/json".to_string()),
                );
            }
            Some(bytes)
        };

        let header_pairs: Vec<(String, String)> = req
            .get("header")
            .and_then(|h| h.as_object())
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), format_value(v)))
                    .collect()
            })
            .unwrap_or_default();
        (final_url, header_pairs, body)
    };

    let method = ctx
        .req
        .as_ref()
        .and_then(|r| r.get("method"))
        .map(format_value)
        .unwrap_or_else(|| http.method.as_str().to_string());
    let transport_req = TransportRequest {
        method,
        url: final_url,
        headers: header_pairs,
        body,
        timeout,
    };
    let response = transport.dispatch(transport_req, cancel).await.map_err(|err| {
        step_diag("E_RUNTIME_TRANSPORT", "http request failed", request.span, &err.to_string())
    })?;

    let trimmed: &[u8] = {
        let body = &response.body;
        let start = body.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(body.len());
        &body[start..]
    };
    let res_value = if trimmed.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(trimmed).map_err(|err| {
            step_diag(
                "E_RUNTIME_TRANSPORT",
                "response is not valid json",
                request.span,
                &err.to_string(),
            )
        })?
    };

    let mut headers_value = Map::new();
    for (key, values) in &response.headers {
        let entry = if values.len() == 1 {
            Value::String(values[0].clone())
        } else {
            Value::Array(values.iter().map(|v| Value::String(v.clone())).collect())
        };
        headers_value.insert(key.clone(), entry);
    }

    ctx.res = Some(res_value.clone());
    ctx.status = Some(response.status);
    ctx.headers = Some(Value::Object(headers_value.clone()));

    for line in &request.lines {
        let ReqLine::Hook(hook) = line else { continue };
        if hook.kind != HookKind::Post {
            continue;
        }
        if let Err(err) = exec_hook(hook, &mut ctx) {
            return Err(match err {
                EvalError::MissingTemplateVar(_) => step_diag(
                    "E_RUNTIME_MISSING_VARIABLE",
                    "failed to render post hook print statement",
                    hook.span,
                    &err.to_string(),
                ),
                other => step_diag(
                    "E_RUNTIME_HOOK",
                    "post hook execution failed",
                    hook.span,
                    &other.to_string(),
                ),
            });
        }
    }

    for line in &request.lines {
        match line {
            ReqLine::Assert(assert) => {
                match eval_expr(&assert.expr, &ctx) {
                    Err(err) => {
                        logger.assertion(flow_name, &step_id, &assert.expr, false);
                        return Err(step_diag(
                            "E_RUNTIME_EXPRESSION",
                            "failed to evaluate request assertion",
                            assert.span,
                            &err.to_string(),
                        ));
                    }
                    Ok(value) => {
                        let verdict = as_bool(&value);
                        let passed = matches!(verdict, Ok(true));
                        logger.assertion(flow_name, &step_id, &assert.expr, passed);
                        if !passed {
                            let hint = match verdict {
                                Err(cast) => cast.to_string(),
                                _ => "assertion must evaluate to true".to_string(),
                            };
                            return Err(step_diag(
                                "E_ASSERT_EXPECTED_TRUE",
                                "request assertion failed",
                                assert.span,
                                &hint,
                            ));
                        }
                    }
                }
            }
            ReqLine::Let(stmt) => {
                let value = eval_expr(&stmt.value, &ctx).map_err(|err| {
                    step_diag(
                        "E_RUNTIME_EXPRESSION",
                        "failed to evaluate request let",
                        stmt.span,
                        &err.to_string(),
                    )
                })?;
                ctx.flow_vars.insert(stmt.name.clone(), value);
            }
            _ => {}
        }
    }

    let req_snapshot = ctx.req.take().unwrap_or(Value::Null);
    *flow_vars = std::mem::take(&mut ctx.flow_vars);
    Ok(StepOutcome {
        status: response.status,
        res: res_value,
        headers: Value::Object(headers_value),
        req_snapshot,
    })
}

/// Evaluates a directive expression, then applies the `{{var}}`
/// interpolation pass over the result.
fn eval_directive_value(
    expr: &Expr,
    ctx: &EvalContext,
    _span: Span,
) -> Result<Value, (&'static str, String)> {
    let value = eval_expr(expr, ctx).map_err(|err| ("E_RUNTIME_EXPRESSION", err.to_string()))?;
    let vars = ctx.flow_vars.clone();
    interpolate_value(value, &move |name: &str| vars.get(name).cloned())
        .map_err(|err| ("E_RUNTIME_MISSING_VARIABLE", err.to_string()))
}

fn set_req_entry(
    ctx: &mut EvalContext,
    section: &str,
    key: &str,
    value: Value,
) -> Result<(), EvalError> {
    let req = ctx
        .req
        .as_mut()
        .ok_or_else(|| EvalError::msg("req is not available"))?;
    let obj = req
        .as_object_mut()
        .ok_or_else(|| EvalError::msg("request object is not an object"))?;
    let entry = obj
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    let map = entry
        .as_object_mut()
        .ok_or_else(|| EvalError::msg(format!("request {section} is not an object")))?;
    map.insert(key.to_string(), value);
    Ok(())
}

fn exec_hook(hook: &HookBlock, ctx: &mut EvalContext) -> Result<(), EvalError> {
    for stmt in &hook.stmts {
        match stmt {
            HookStmt::Let(stmt) => {
                let value = eval_expr(&stmt.value, ctx)?;
                ctx.flow_vars.insert(stmt.name.clone(), value);
            }
            HookStmt::Assign(assign) => {
                let value = eval_expr(&assign.value, ctx)?;
                assign_lvalue(&assign.target, value, ctx)?;
            }
            HookStmt::Expr(stmt) => {
                eval_expr(&stmt.expr, ctx)?;
            }
            HookStmt::Print(stmt) => exec_print(stmt, ctx)?,
        }
    }
    Ok(())
}

/// Print interpolation resolves context names before flow variables so
/// `{{req}}` renders in both hook phases.
fn exec_print(stmt: &PrintStmt, ctx: &EvalContext) -> Result<(), EvalError> {
    let lookup = |name: &str| -> Option<Value> {
        match name {
            "req" => ctx.req.clone(),
            "res" => ctx.res.clone(),
            "status" => ctx.status.map(|s| number(f64::from(s))),
            "header" => ctx.headers.clone(),
            _ => ctx.flow_vars.get(name).cloned(),
        }
    };
    let mut args = Vec::with_capacity(stmt.args.len());
    for arg in &stmt.args {
        let value = eval_expr(arg, ctx)?;
        args.push(interpolate_value(value, &lookup)?);
    }
    match stmt.kind {
        PrintKind::Print => {
            let joined: String = args.iter().map(format_value).collect();
            print!("{joined}");
        }
        PrintKind::Println => {
            let joined: String = args.iter().map(format_value).collect();
            println!("{joined}");
        }
        PrintKind::Printf => {
            if args.is_empty() {
                return Err(EvalError::msg("printf expects at least one argument"));
            }
            let format = format_value(&args[0]);
            print!("{}", format_printf(&format, &args[1..])?);
        }
    }
    Ok(())
}

/// Minimal C-style formatter: `%%` plus the verbs `s v d x X o O b c U
/// f q` with optional `-`/`0` flags and width/precision, either literal
/// digits or `*` (consumed from the argument list; a negative `*` width
/// left-aligns). Integer verbs coerce whole-valued doubles to integers;
/// `%O` uses the `0o` octal prefix and `%U` the `U+XXXX` codepoint
/// notation.
fn format_printf(format: &str, args: &[Value]) -> Result<String, EvalError> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut left_align = false;
        let mut zero_pad = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => left_align = true,
                '0' => zero_pad = true,
                '+' | ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        if chars.peek() == Some(&'*') {
            chars.next();
            let arg = args
                .get(next_arg)
                .ok_or_else(|| EvalError::msg("printf has more verbs than arguments"))?;
            next_arg += 1;
            let dynamic = eval::as_number(arg)? as i64;
            if dynamic < 0 {
                left_align = true;
                width = dynamic.unsigned_abs() as usize;
            } else {
                width = dynamic as usize;
            }
        } else {
            while let Some(&digit) = chars.peek() {
                if !digit.is_ascii_digit() {
                    break;
                }
                width = width * 10 + digit.to_digit(10).unwrap() as usize;
                chars.next();
            }
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                let arg = args
                    .get(next_arg)
                    .ok_or_else(|| EvalError::msg("printf has more verbs than arguments"))?;
                next_arg += 1;
                precision = Some(eval::as_number(arg)?.max(0.0) as usize);
            } else {
                let mut p = 0usize;
                while let Some(&digit) = chars.peek() {
                    if !digit.is_ascii_digit() {
                        break;
                    }
                    p = p * 10 + digit.to_digit(10).unwrap() as usize;
                    chars.next();
                }
                precision = Some(p);
            }
        }

        let verb = chars
            .next()
            .ok_or_else(|| EvalError::msg("printf format ends mid-verb"))?;
        let arg = args
            .get(next_arg)
            .ok_or_else(|| EvalError::msg("printf has more verbs than arguments"))?;
        next_arg += 1;

        let rendered = match verb {
            's' | 'v' => {
                let mut text = format_value(arg);
                if let Some(p) = precision {
                    text.truncate(p);
                }
                text
            }
            'q' => format!("{:?}", format_value(arg)),
            'd' => format_integer(arg, 10, false, "")?,
            'x' => format_integer(arg, 16, false, "")?,
            'X' => format_integer(arg, 16, true, "")?,
            'o' => format_integer(arg, 8, false, "")?,
            'O' => format_integer(arg, 8, false, "0o")?,
            'b' => format_integer(arg, 2, false, "")?,
            'U' => {
                let code = eval::as_number(arg)?;
                if code.fract() == 0.0 && code.is_finite() && code >= 0.0 {
                    format!("U+{:04X}", code as i64)
                } else {
                    format_value(arg)
                }
            }
            'c' => {
                let code = eval::as_number(arg)? as u32;
                char::from_u32(code)
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            }
            'f' => {
                let value = eval::as_number(arg)?;
                format!("{:.*}", precision.unwrap_or(6), value)
            }
            other => return Err(EvalError::msg(format!("unsupported printf verb %{other}"))),
        };

        out.push_str(&pad(rendered, width, left_align, zero_pad));
    }
    Ok(out)
}

fn format_integer(
    value: &Value,
    radix: u32,
    upper: bool,
    prefix: &str,
) -> Result<String, EvalError> {
    let number = eval::as_number(value)?;
    if number.fract() != 0.0 || !number.is_finite() {
        return Ok(format_value(value));
    }
    let int = number as i64;
    let magnitude = int.unsigned_abs();
    let digits = match radix {
        16 => format!("{magnitude:x}"),
        8 => format!("{magnitude:o}"),
        2 => format!("{magnitude:b}"),
        _ => format!("{magnitude}"),
    };
    let digits = if upper { digits.to_uppercase() } else { digits };
    let sign = if int < 0 { "-" } else { "" };
    Ok(format!("{sign}{prefix}{digits}"))
}

fn pad(text: String, width: usize, left_align: bool, zero_pad: bool) -> String {
    if text.len() >= width {
        return text;
    }
    let fill = width - text.len();
    if left_align {
        format!("{text}{}", " ".repeat(fill))
    } else if zero_pad {
        format!("{}{text}", "0".repeat(fill))
    } else {
        format!("{}{text}", " ".repeat(fill))
    }
}

struct Logger {
    writer: Option<Box<dyn Write + Send>>,
    verbose: bool,
    suppress_passing: bool,
    current_flow: String,
    current_target: String,
}

impl Logger {
    fn verbose(&mut self, message: &str) {
        if !self.verbose {
            return;
        }
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "[verbose] {message}");
        }
    }

    fn assertion(&mut self, flow: &str, target: &str, expr: &Expr, passed: bool) {
        if self.writer.is_none() || (passed && self.suppress_passing) {
            return;
        }
        let status = if passed { "✅" } else { "❌" };
        if !flow.is_empty() && flow != self.current_flow {
            self.write_line(&format!("- flow {flow}"));
            self.current_flow = flow.to_string();
            self.current_target.clear();
        }
        if target.is_empty() {
            self.current_target.clear();
            self.write_line(&format!("  - assertion {} {status}", format_expr(expr)));
            return;
        }
        if target != self.current_target {
            self.write_line(&format!("  - {target}"));
            self.current_target = target.to_string();
        }
        self.write_line(&format!("    - assertion {} {status}", format_expr(expr)));
    }

    fn write_line(&mut self, line: &str) {
        if let Some(writer) = &mut self.writer {
            let _ = writeln!(writer, "{line}");
        }
    }
}

fn runtime_diag(
    code: &str,
    message: impl Into<String>,
    file: &str,
    span: Span,
    hint: &str,
    flow: Option<&str>,
    request: Option<&str>,
) -> Diagnostic {
    let mut diag = Diagnostic::error(code, message, file, span, hint);
    if let Some(flow) = flow {
        diag = diag.with_flow(flow);
    }
    if let Some(request) = request {
        diag = diag.with_request(request);
    }
    diag
}

#[cfg(test)]
mod tests {
    use super::transport::{TransportError, TransportResponse};
    use super::*;
    use crate::compiler::{compile, Module};
    use crate::parser::parse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted transport keyed by "METHOD url"; records every request
    /// it sees.
    struct StubTransport {
        routes: HashMap<String, (u16, String)>,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl StubTransport {
        fn new(routes: &[(&str, u16, &str)]) -> Self {
            StubTransport {
                routes: routes
                    .iter()
                    .map(|(k, s, b)| (k.to_string(), (*s, b.to_string())))
                    .collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn dispatch(
            &self,
            req: TransportRequest,
            _cancel: &CancelToken,
        ) -> Result<TransportResponse, TransportError> {
            let key = format!("{} {}", req.method, req.url);
            let found = self.routes.get(&key).cloned();
            self.seen.lock().unwrap().push(req);
            match found {
                Some((status, body)) => Ok(TransportResponse {
                    status,
                    headers: vec![("Content-Type".to_string(), vec!["application/json".to_string()])],
                    body: body.into_bytes(),
                }),
                None => Err(TransportError(format!("no stub for {key}"))),
            }
        }
    }

    fn plan_for(src: &str) -> Plan {
        let (program, lex, parse_diags) = parse("main.pt", src);
        assert!(lex.is_empty() && parse_diags.is_empty(), "{lex:?} {parse_diags:?}");
        compile("main.pt", vec![Module { path: "main.pt".to_string(), program }])
            .expect("compiles cleanly")
    }

    async fn run(src: &str, routes: &[(&str, u16, &str)]) -> (ExecutionResult, Arc<StubTransport>) {
        let plan = plan_for(src);
        let transport = Arc::new(StubTransport::new(routes));
        let opt = Options::new(transport.clone());
        (execute(&plan, opt).await, transport)
    }

    #[tokio::test]
    async fn single_step_smoke() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "timeout 5s\n",
            "req ping:\n",
            "\tGET /get\n",
            "\t? status == 200\n",
            "flow \"s\":\n",
            "\tping\n",
            "\t? ping.status == 200\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/get", 200, "{\"ok\":true}")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
        assert_eq!(result.flows.len(), 1);
        assert_eq!(result.flows[0].steps.len(), 1);
        assert_eq!(result.flows[0].steps[0].status, 200);
    }

    #[tokio::test]
    async fn chain_propagates_lets_and_path_params() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req first:\n",
            "\tGET /first\n",
            "\t? status == 200\n",
            "\tlet token = #.token\n",
            "req second:\n",
            "\tGET /second/:token\n",
            "\t? status == 200\n",
            "\t? #.seen == token\n",
            "flow \"f\":\n",
            "\tfirst -> second : alias\n",
            "\t? alias.res.seen == token\n",
        );
        let (result, transport) = run(
            src,
            &[
                ("GET https://h.test/first", 200, "{\"token\":\"abc\"}"),
                ("GET https://h.test/second/abc", 200, "{\"seen\":\"abc\"}"),
            ],
        )
        .await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
        let urls: Vec<String> =
            transport.seen.lock().unwrap().iter().map(|r| r.url.clone()).collect();
        assert_eq!(
            urls,
            vec!["https://h.test/first", "https://h.test/second/abc"]
        );
        assert_eq!(result.flows[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_aborts_flow_with_diag() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req a:\n\tGET /a\n",
            "req b:\n\tGET /b\n",
            "flow \"f\":\n\ta -> b\n",
        );
        let (result, transport) = run(src, &[]).await;
        assert_eq!(result.diags.len(), 1);
        let diag = &result.diags[0];
        assert_eq!(diag.code, "E_RUNTIME_TRANSPORT");
        assert_eq!(diag.flow.as_deref(), Some("f"));
        assert!(result.flows[0].steps.is_empty());
        // flow aborted after the first failing step
        assert_eq!(transport.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_flow_does_not_stop_later_flows() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req bad:\n\tGET /bad\n",
            "req good:\n\tGET /good\n\t? status == 200\n",
            "flow \"a\":\n\tbad\n",
            "flow \"b\":\n\tgood\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/good", 200, "{}")]).await;
        assert_eq!(result.flows.len(), 2);
        assert_eq!(result.flows[1].steps.len(), 1);
        assert!(result.diags.iter().any(|d| d.code == "E_RUNTIME_TRANSPORT"));
    }

    #[tokio::test]
    async fn inheritance_override_reaches_the_wire() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req parent:\n",
            "\tGET /child\n",
            "\theader XReq = \"parent\"\n",
            "\tpost hook {\n\t\tseen = \"parent\"\n\t}\n",
            "req child(parent):\n",
            "\theader XReq = \"child\"\n",
            "\tpost hook {\n\t\tseen = #.value\n\t}\n",
            "flow \"f\":\n",
            "\tchild\n",
            "\t? seen == \"from-response\"\n",
        );
        let (result, transport) =
            run(src, &[("GET https://h.test/child", 200, "{\"value\":\"from-response\"}")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
        let seen = transport.seen.lock().unwrap();
        let header = seen[0]
            .headers
            .iter()
            .find(|(k, _)| k == "XReq")
            .map(|(_, v)| v.clone());
        assert_eq!(header.as_deref(), Some("child"));
    }

    #[tokio::test]
    async fn assertion_failure_has_cause_hint_and_aborts_flow() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n\t? status == 201\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/x", 200, "{}")]).await;
        assert_eq!(result.diags.len(), 1);
        assert_eq!(result.diags[0].code, "E_ASSERT_EXPECTED_TRUE");
        assert_eq!(result.diags[0].request.as_deref(), Some("r"));
        assert!(result.flows[0].steps.is_empty());
    }

    #[tokio::test]
    async fn non_boolean_assertion_is_a_failure_with_cast_hint() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n\t? status\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/x", 200, "{}")]).await;
        assert_eq!(result.diags[0].code, "E_ASSERT_EXPECTED_TRUE");
        assert!(result.diags[0].hint.contains("boolean"));
    }

    #[tokio::test]
    async fn invalid_json_response_is_a_transport_error() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/x", 200, "not-json")]).await;
        assert_eq!(result.diags[0].code, "E_RUNTIME_TRANSPORT");
    }

    #[tokio::test]
    async fn empty_body_decodes_to_null() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n\t? # == null\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/x", 204, "")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
    }

    #[tokio::test]
    async fn directives_shape_the_outgoing_request() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "let who = \"me\"\n",
            "req create:\n",
            "\tPOST /orders\n",
            "\theader X-Who = \"{{who}}\"\n",
            "\tquery page = 2\n",
            "\tauth bearer \"tok\"\n",
            "\tjson { sku: \"a-1\" }\n",
            "flow \"f\":\n",
            "\tcreate\n",
        );
        let (result, transport) =
            run(src, &[("POST https://h.test/orders?page=2", 200, "{}")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
        let seen = transport.seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.method, "POST");
        let header = |name: &str| {
            req.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(header("X-Who").as_deref(), Some("me"));
        assert_eq!(header("Authorization").as_deref(), Some("Bearer tok"));
        assert_eq!(header("Content-Type").as_deref(), Some("application/json"));
        assert_eq!(req.body.as_deref(), Some(&b"{\"sku\":\"a-1\"}"[..]));
    }

    #[tokio::test]
    async fn pre_hook_mutates_outgoing_request() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n",
            "\tGET /x\n",
            "\tpre hook {\n",
            "\t\treq.header.XTrace = \"trace-1\"\n",
            "\t}\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, transport) = run(src, &[("GET https://h.test/x", 200, "{}")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
        let seen = transport.seen.lock().unwrap();
        assert!(seen[0].headers.iter().any(|(k, v)| k == "XTrace" && v == "trace-1"));
    }

    #[tokio::test]
    async fn global_lets_seed_every_flow() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "let site = \"alpha\"\n",
            "req r:\n\tGET /:site\n\t? status == 200\n",
            "flow \"f\":\n\tr\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/alpha", 200, "{}")]).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
    }

    #[tokio::test]
    async fn flow_assert_failure_does_not_abort_other_flows() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n",
            "flow \"a\":\n\tr\n\t? r.status == 999\n",
            "flow \"b\":\n\tr\n\t? r.status == 200\n",
        );
        let (result, _) = run(src, &[("GET https://h.test/x", 200, "{}")]).await;
        let failures: Vec<_> =
            result.diags.iter().filter(|d| d.code == "E_ASSERT_EXPECTED_TRUE").collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].flow.as_deref(), Some("a"));
        assert_eq!(result.flows.len(), 2);
        assert_eq!(result.flows[1].steps.len(), 1);
    }

    #[tokio::test]
    async fn empty_plan_executes_to_empty_result() {
        let plan = plan_for("base \"https://h.test\"\n");
        let transport = Arc::new(StubTransport::new(&[]));
        let result = execute(&plan, Options::new(transport)).await;
        assert!(result.flows.is_empty());
        assert!(result.diags.is_empty());
    }

    #[tokio::test]
    async fn base_override_wins_over_plan_base() {
        let src = concat!(
            "base \"https://wrong.test\"\n",
            "req r:\n\tGET /x\n",
            "flow \"f\":\n\tr\n",
        );
        let plan = plan_for(src);
        let transport = Arc::new(StubTransport::new(&[("GET https://right.test/x", 200, "{}")]));
        let mut opt = Options::new(transport.clone());
        opt.base_override = Some("https://right.test".to_string());
        let result = execute(&plan, opt).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
    }

    #[tokio::test]
    async fn timeout_setting_reaches_the_transport() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "timeout 250ms\n",
            "req r:\n\tGET /x\n",
            "flow \"f\":\n\tr\n",
        );
        let (_, transport) = run(src, &[("GET https://h.test/x", 200, "{}")]).await;
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].timeout, Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn multi_value_response_headers_become_arrays() {
        struct MultiHeader;
        #[async_trait]
        impl HttpTransport for MultiHeader {
            async fn dispatch(
                &self,
                _req: TransportRequest,
                _cancel: &CancelToken,
            ) -> Result<TransportResponse, TransportError> {
                Ok(TransportResponse {
                    status: 200,
                    headers: vec![(
                        "Set-Cookie".to_string(),
                        vec!["a=1".to_string(), "b=2".to_string()],
                    )],
                    body: b"{}".to_vec(),
                })
            }
        }
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n",
            "\tGET /x\n",
            "\t? len(header[\"Set-Cookie\"]) == 2\n",
            "flow \"f\":\n\tr\n",
        );
        let plan = plan_for(src);
        let result = execute(&plan, Options::new(Arc::new(MultiHeader))).await;
        assert!(result.diags.is_empty(), "{:?}", result.diags);
    }

    #[tokio::test]
    async fn assertion_log_is_hierarchical() {
        let src = concat!(
            "base \"https://h.test\"\n",
            "req r:\n\tGET /x\n\t? status == 200\n",
            "flow \"f\":\n\tr\n\t? r.status == 200\n",
        );
        let plan = plan_for(src);
        let transport = Arc::new(StubTransport::new(&[("GET https://h.test/x", 200, "{}")]));
        let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct SharedWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut opt = Options::new(transport);
        opt.log = Some(Box::new(SharedWriter(buffer.clone())));
        let result = execute(&plan, opt).await;
        assert!(result.diags.is_empty());
        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(text.contains("- flow f"));
        assert!(text.contains("  - r"));
        assert!(text.contains("assertion status == 200 ✅"));
        assert!(text.contains("assertion r.status == 200 ✅"));
    }

    #[test]
    fn printf_formatting() {
        assert_eq!(
            format_printf("%d items, %x hex, %05d pad", &[json!(3.0), json!(255.0), json!(7.0)])
                .unwrap(),
            "3 items, ff hex, 00007 pad"
        );
        assert_eq!(format_printf("%s=%v", &[json!("k"), json!({"a": 1})]).unwrap(), "k={\"a\":1}");
        assert_eq!(format_printf("100%%", &[]).unwrap(), "100%");
        assert_eq!(format_printf("%.2f", &[json!(1.23456)]).unwrap(), "1.23");
        assert!(format_printf("%d", &[]).is_err());
    }

    #[test]
    fn printf_prefixed_octal_and_unicode_verbs() {
        assert_eq!(format_printf("%O", &[json!(8.0)]).unwrap(), "0o10");
        assert_eq!(format_printf("%O", &[json!(-15.0)]).unwrap(), "-0o17");
        assert_eq!(format_printf("%o", &[json!(8.0)]).unwrap(), "10");
        assert_eq!(format_printf("%U", &[json!(233.0)]).unwrap(), "U+00E9");
        assert_eq!(format_printf("%U", &[json!(120171.0)]).unwrap(), "U+1D56B");
        // non-whole values fall back to their plain rendering
        assert_eq!(format_printf("%O", &[json!(1.5)]).unwrap(), "1.5");
    }

    #[test]
    fn printf_star_width_and_precision_consume_arguments() {
        assert_eq!(format_printf("%*d", &[json!(5.0), json!(42.0)]).unwrap(), "   42");
        assert_eq!(format_printf("%*d", &[json!(-5.0), json!(42.0)]).unwrap(), "42   ");
        assert_eq!(format_printf("%.*f", &[json!(2.0), json!(1.23456)]).unwrap(), "1.23");
        assert_eq!(
            format_printf("%0*d after", &[json!(4.0), json!(7.0)]).unwrap(),
            "0007 after"
        );
        // the width argument counts toward the argument list
        assert!(format_printf("%*d", &[json!(5.0)]).is_err());
    }
}
