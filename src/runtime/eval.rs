//! Expression evaluation over the dynamic value universe.
//!
//! Values are `serde_json::Value` (with ordered object keys). The
//! tree-walk is synchronous; every fallible operation returns an
//! [`EvalError`] which the evaluator renders into a diagnostic at the
//! step boundary.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::ast::*;
use crate::runtime::builtins;

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("missing variable {0} for template placeholder")]
    MissingTemplateVar(String),
    #[error("{0}")]
    Message(String),
}

impl EvalError {
    pub fn msg(text: impl Into<String>) -> Self {
        EvalError::Message(text.into())
    }
}

/// Evaluation context for one step or flow-level expression. `req`,
/// `res`, `status` and `headers` are absent outside their phase;
/// identifier resolution falls back to flow variables, then binding
/// snapshots.
#[derive(Default)]
pub struct EvalContext {
    pub req: Option<Value>,
    pub res: Option<Value>,
    pub status: Option<u16>,
    pub headers: Option<Value>,
    pub flow_vars: Map<String, Value>,
    pub bindings: Map<String, Value>,
}

impl EvalContext {
    pub fn with_vars(flow_vars: Map<String, Value>) -> Self {
        EvalContext { flow_vars, ..Default::default() }
    }
}

pub fn eval_expr(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Str(lit) => Ok(Value::String(lit.value.clone())),
        Expr::Number(lit) => {
            let parsed: f64 = lit
                .raw
                .parse()
                .map_err(|_| EvalError::msg(format!("invalid number literal: {}", lit.raw)))?;
            Ok(number(parsed))
        }
        Expr::Duration(lit) => {
            let duration = lit
                .to_duration()
                .ok_or_else(|| EvalError::msg(format!("invalid duration literal: {}", lit.raw)))?;
            Ok(number(duration.as_secs_f64()))
        }
        Expr::Bool(lit) => Ok(Value::Bool(lit.value)),
        Expr::Null(_) => Ok(Value::Null),
        Expr::Array(lit) => {
            let mut out = Vec::with_capacity(lit.elements.len());
            for element in &lit.elements {
                out.push(eval_expr(element, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Object(lit) => {
            let mut out = Map::new();
            for pair in &lit.pairs {
                out.insert(pair.key.name.clone(), eval_expr(&pair.value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Expr::Dollar(_) => Ok(ctx.req.clone().unwrap_or(Value::Null)),
        Expr::Hash(_) => Ok(ctx.res.clone().unwrap_or(Value::Null)),
        Expr::Ident(ident) => resolve_ident(&ident.name, ctx),
        Expr::Paren(inner) => eval_expr(&inner.expr, ctx),
        Expr::Unary(unary) => {
            let operand = eval_expr(&unary.expr, ctx)?;
            match unary.op {
                UnaryOp::Not => Ok(Value::Bool(!as_bool(&operand)?)),
                UnaryOp::Minus => Ok(number(-as_number(&operand)?)),
                UnaryOp::Plus => Ok(number(as_number(&operand)?)),
            }
        }
        Expr::Binary(binary) => eval_binary(binary, ctx),
        Expr::Field(field) => {
            let value = eval_expr(&field.expr, ctx)?;
            match value {
                Value::Object(map) => Ok(map.get(&field.name).cloned().unwrap_or(Value::Null)),
                _ => Err(EvalError::msg("field access on non-object")),
            }
        }
        Expr::Index(index) => {
            let value = eval_expr(&index.expr, ctx)?;
            let key = eval_expr(&index.index, ctx)?;
            match value {
                Value::Object(map) => {
                    Ok(map.get(&format_value(&key)).cloned().unwrap_or(Value::Null))
                }
                Value::Array(items) => {
                    let idx = as_number(&key)? as i64;
                    if idx < 0 || idx as usize >= items.len() {
                        return Err(EvalError::msg("index out of range"));
                    }
                    Ok(items[idx as usize].clone())
                }
                _ => Err(EvalError::msg("index access on unsupported type")),
            }
        }
        Expr::Call(call) => {
            let Expr::Ident(callee) = &call.callee else {
                return Err(EvalError::msg("callee must be an identifier"));
            };
            let mut args = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                args.push(eval_expr(arg, ctx)?);
            }
            builtins::call(&callee.name, &args)
        }
        Expr::Bad(_) => Err(EvalError::msg("cannot evaluate malformed expression")),
    }
}

fn resolve_ident(name: &str, ctx: &EvalContext) -> Result<Value, EvalError> {
    match name {
        "status" => return Ok(number(f64::from(ctx.status.unwrap_or(0)))),
        "header" => return Ok(ctx.headers.clone().unwrap_or(Value::Null)),
        "req" => return Ok(ctx.req.clone().unwrap_or(Value::Null)),
        "res" => return Ok(ctx.res.clone().unwrap_or(Value::Null)),
        _ => {}
    }
    if let Some(value) = ctx.flow_vars.get(name) {
        return Ok(value.clone());
    }
    if let Some(value) = ctx.bindings.get(name) {
        return Ok(value.clone());
    }
    Err(EvalError::msg(format!("undefined identifier {name}")))
}

fn eval_binary(binary: &BinaryExpr, ctx: &EvalContext) -> Result<Value, EvalError> {
    let left = eval_expr(&binary.left, ctx)?;
    let right = eval_expr(&binary.right, ctx)?;
    match binary.op {
        BinaryOp::Eq => Ok(Value::Bool(deep_equal(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!deep_equal(&left, &right))),
        BinaryOp::Gt => Ok(Value::Bool(as_number(&left)? > as_number(&right)?)),
        BinaryOp::Ge => Ok(Value::Bool(as_number(&left)? >= as_number(&right)?)),
        BinaryOp::Lt => Ok(Value::Bool(as_number(&left)? < as_number(&right)?)),
        BinaryOp::Le => Ok(Value::Bool(as_number(&left)? <= as_number(&right)?)),
        BinaryOp::And => Ok(Value::Bool(as_bool(&left)? && as_bool(&right)?)),
        BinaryOp::Or => Ok(Value::Bool(as_bool(&left)? || as_bool(&right)?)),
        BinaryOp::Contains => Ok(Value::Bool(contains(&left, &right))),
        BinaryOp::In => {
            let Value::Array(items) = &right else {
                return Err(EvalError::msg("in requires an array on the right side"));
            };
            Ok(Value::Bool(items.iter().any(|item| deep_equal(&left, item))))
        }
        BinaryOp::Match => {
            let pattern = format_value(&right);
            let regex = regex::Regex::new(&pattern)
                .map_err(|err| EvalError::msg(format!("invalid regex: {err}")))?;
            Ok(Value::Bool(regex.is_match(&format_value(&left))))
        }
        BinaryOp::Add => {
            if let Value::String(text) = &left {
                return Ok(Value::String(format!("{text}{}", format_value(&right))));
            }
            if let Value::String(text) = &right {
                return Ok(Value::String(format!("{}{text}", format_value(&left))));
            }
            Ok(number(as_number(&left)? + as_number(&right)?))
        }
        BinaryOp::Sub => Ok(number(as_number(&left)? - as_number(&right)?)),
        BinaryOp::Mul => Ok(number(as_number(&left)? * as_number(&right)?)),
        BinaryOp::Div => {
            let divisor = as_number(&right)?;
            if divisor == 0.0 {
                return Err(EvalError::msg("division by zero"));
            }
            Ok(number(as_number(&left)? / divisor))
        }
        BinaryOp::Mod => {
            let divisor = as_number(&right)?;
            if divisor == 0.0 {
                return Err(EvalError::msg("modulo by zero"));
            }
            Ok(number(as_number(&left)? % divisor))
        }
    }
}

/// Assigns into the context: a bare identifier writes a flow variable;
/// `req`/`$` roots mutate the request object; field steps create
/// intermediate objects on demand.
pub fn assign_lvalue(
    target: &LValue,
    value: Value,
    ctx: &mut EvalContext,
) -> Result<(), EvalError> {
    // index expressions are evaluated before any mutable borrow
    enum StepKey {
        Field(String),
        Key(Value),
    }
    let mut steps = Vec::with_capacity(target.postfix.len());
    for postfix in &target.postfix {
        match postfix {
            LValuePostfix::Field { name, .. } => steps.push(StepKey::Field(name.clone())),
            LValuePostfix::Index { index, .. } => {
                steps.push(StepKey::Key(eval_expr(index, ctx)?))
            }
        }
    }

    if target.root.kind == LValueRootKind::Ident && steps.is_empty() {
        ctx.flow_vars.insert(target.root.name.clone(), value);
        return Ok(());
    }

    let mut current: &mut Value = match target.root.kind {
        LValueRootKind::Req | LValueRootKind::Dollar => ctx
            .req
            .as_mut()
            .ok_or_else(|| EvalError::msg("req is not available in this context"))?,
        LValueRootKind::Ident => ctx
            .flow_vars
            .entry(target.root.name.clone())
            .or_insert(Value::Null),
        LValueRootKind::Res => {
            return Err(EvalError::msg("assignment to res is forbidden"));
        }
    };

    if steps.is_empty() {
        *current = value;
        return Ok(());
    }

    let total = steps.len();
    for (position, step) in steps.into_iter().enumerate() {
        let last = position == total - 1;
        let cur = current;
        match step {
            StepKey::Key(index) if cur.is_array() => {
                let items = cur.as_array_mut().expect("array checked above");
                let idx = as_number(&index)? as i64;
                if idx < 0 || idx as usize >= items.len() {
                    return Err(EvalError::msg("index out of range"));
                }
                if last {
                    items[idx as usize] = value;
                    return Ok(());
                }
                current = &mut items[idx as usize];
            }
            step => {
                let key = match step {
                    StepKey::Field(name) => name,
                    StepKey::Key(index) => format_value(&index),
                };
                if cur.is_null() {
                    *cur = Value::Object(Map::new());
                }
                let map = cur
                    .as_object_mut()
                    .ok_or_else(|| EvalError::msg("field assignment on non-object"))?;
                if last {
                    map.insert(key, value);
                    return Ok(());
                }
                let next = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
                if next.is_null() {
                    *next = Value::Object(Map::new());
                }
                current = next;
            }
        }
    }
    Ok(())
}

pub fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

pub fn as_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError::msg("number is not representable")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| EvalError::msg(format!("expected number, got string {s:?}"))),
        _ => Err(EvalError::msg("expected number")),
    }
}

pub fn as_bool(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(EvalError::msg("expected boolean")),
    }
}

/// Structural deep equality: numbers by value, objects by (key, value)
/// sets, arrays element-wise.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| deep_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| deep_equal(v, w)))
        }
        _ => a == b,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(text) => text.contains(&format_value(right)),
        Value::Array(items) => items.iter().any(|item| deep_equal(item, right)),
        _ => false,
    }
}

/// The user-visible string form of a value: strings render bare,
/// whole-valued numbers render without a fraction, containers render as
/// canonical JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ReqLine, Stmt};
    use crate::parser::parse;
    use serde_json::json;

    fn eval_str(src: &str, ctx: &EvalContext) -> Result<Value, EvalError> {
        let program_src = format!("req r:\n\tGET /x\n\t? {src}\n");
        let (program, lex, parse_diags) = parse("eval.pt", &program_src);
        assert!(lex.is_empty() && parse_diags.is_empty(), "{lex:?} {parse_diags:?}");
        let Stmt::Req(req) = &program.stmts[0] else { panic!("expected req") };
        let ReqLine::Assert(assert) = &req.lines[1] else { panic!("expected assert") };
        eval_expr(&assert.expr, ctx)
    }

    fn ok(src: &str) -> Value {
        eval_str(src, &EvalContext::default()).expect("evaluation succeeds")
    }

    #[test]
    fn literals_and_arithmetic() {
        assert_eq!(ok("1 + 2 * 3"), json!(7.0));
        assert_eq!(ok("10 / 4"), json!(2.5));
        assert_eq!(ok("7 % 3"), json!(1.0));
        assert_eq!(ok("-(2 + 3)"), json!(-5.0));
    }

    #[test]
    fn string_concatenation_with_any_operand() {
        assert_eq!(ok("\"a\" + \"b\""), json!("ab"));
        assert_eq!(ok("\"n=\" + 2"), json!("n=2"));
        assert_eq!(ok("2 + \"x\""), json!("2x"));
    }

    #[test]
    fn division_and_modulo_by_zero_fail() {
        assert!(eval_str("1 / 0", &EvalContext::default()).is_err());
        assert!(eval_str("1 % 0", &EvalContext::default()).is_err());
    }

    #[test]
    fn equality_is_structural_and_order_insensitive_for_objects() {
        assert_eq!(ok("{a: 1, b: 2} == {b: 2, a: 1}"), json!(true));
        assert_eq!(ok("[1, 2] == [1, 2]"), json!(true));
        assert_eq!(ok("[1, 2] == [2, 1]"), json!(false));
        assert_eq!(ok("null == null"), json!(true));
    }

    #[test]
    fn equality_and_negation_are_consistent() {
        assert_eq!(ok("(1 == 1) == !(1 != 1)"), json!(true));
        assert_eq!(ok("(\"a\" == \"b\") == !(\"a\" != \"b\")"), json!(true));
    }

    #[test]
    fn numbers_compare_by_value_across_representations() {
        // a JSON-decoded integer and a literal double must compare equal
        let mut ctx = EvalContext::default();
        ctx.flow_vars.insert("n".into(), json!(2));
        assert_eq!(eval_str("n == 2", &ctx).unwrap(), json!(true));
    }

    #[test]
    fn relational_coerces_numeric_strings() {
        assert_eq!(ok("\"10\" > 9"), json!(true));
        assert!(eval_str("\"abc\" > 1", &EvalContext::default()).is_err());
    }

    #[test]
    fn logical_operators_require_booleans() {
        assert_eq!(ok("true and !false"), json!(true));
        assert_eq!(ok("false or true"), json!(true));
        assert!(eval_str("1 and true", &EvalContext::default()).is_err());
    }

    #[test]
    fn membership_and_contains() {
        assert_eq!(ok("\"a\" in [\"a\", \"b\", \"c\"]"), json!(true));
        assert_eq!(ok("\"z\" in [\"a\"]"), json!(false));
        assert_eq!(ok("\"abc\" contains \"b\""), json!(true));
        assert_eq!(ok("[1, 2] contains 2"), json!(true));
        assert!(eval_str("1 in 2", &EvalContext::default()).is_err());
    }

    #[test]
    fn match_operator_applies_regex() {
        assert_eq!(ok("\"order-15\" ~ \"^order-[0-9]+$\""), json!(true));
        assert_eq!(ok("\"nope\" ~ \"^order-\""), json!(false));
        assert!(eval_str("\"x\" ~ \"(\"", &EvalContext::default()).is_err());
    }

    #[test]
    fn field_access_missing_yields_null() {
        let mut ctx = EvalContext::default();
        ctx.flow_vars.insert("obj".into(), json!({"a": 1}));
        assert_eq!(eval_str("obj.a", &ctx).unwrap(), json!(1));
        assert_eq!(eval_str("obj.missing", &ctx).unwrap(), Value::Null);
        assert!(eval_str("obj.a.b", &ctx).is_err());
    }

    #[test]
    fn index_access_bounds_checked_on_arrays() {
        let mut ctx = EvalContext::default();
        ctx.flow_vars.insert("xs".into(), json!([10, 20]));
        ctx.flow_vars.insert("obj".into(), json!({"k": "v"}));
        assert_eq!(eval_str("xs[1]", &ctx).unwrap(), json!(20));
        assert!(eval_str("xs[2]", &ctx).is_err());
        assert!(eval_str("xs[0 - 1]", &ctx).is_err());
        assert_eq!(eval_str("obj[\"k\"]", &ctx).unwrap(), json!("v"));
    }

    #[test]
    fn context_identifiers_resolve_in_order() {
        let mut ctx = EvalContext::default();
        ctx.status = Some(201);
        ctx.res = Some(json!({"ok": true}));
        ctx.req = Some(json!({"url": "/x"}));
        ctx.headers = Some(json!({"X": "1"}));
        assert_eq!(eval_str("status", &ctx).unwrap(), json!(201.0));
        assert_eq!(eval_str("res.ok", &ctx).unwrap(), json!(true));
        assert_eq!(eval_str("#.ok", &ctx).unwrap(), json!(true));
        assert_eq!(eval_str("$.url", &ctx).unwrap(), json!("/x"));
        assert_eq!(eval_str("req.url", &ctx).unwrap(), json!("/x"));
        assert_eq!(eval_str("header.X", &ctx).unwrap(), json!("1"));
    }

    #[test]
    fn bindings_resolve_after_flow_vars() {
        let mut ctx = EvalContext::default();
        ctx.bindings.insert("first".into(), json!({"status": 200}));
        assert_eq!(eval_str("first.status", &ctx).unwrap(), json!(200));
        // flow var with the same name wins
        ctx.flow_vars.insert("first".into(), json!("shadowed"));
        assert_eq!(eval_str("first", &ctx).unwrap(), json!("shadowed"));
    }

    #[test]
    fn unknown_identifier_fails() {
        assert!(eval_str("ghost", &EvalContext::default()).is_err());
    }

    #[test]
    fn assign_to_flow_var_and_req_path() {
        let program_src = "req r:\n\tGET /x\n\tpost hook {\n\t\tseen = 1\n\t\treq.header.K = \"v\"\n\t\treq.query[\"page\"] = 2\n\t}\n";
        let (program, _, parse_diags) = parse("assign.pt", program_src);
        assert!(parse_diags.is_empty());
        let Stmt::Req(req) = &program.stmts[0] else { panic!() };
        let ReqLine::Hook(hook) = &req.lines[1] else { panic!() };

        let mut ctx = EvalContext::default();
        ctx.req = Some(json!({"header": {}, "query": {}}));
        for stmt in &hook.stmts {
            let crate::ast::HookStmt::Assign(assign) = stmt else { panic!() };
            let value = eval_expr(&assign.value, &ctx).unwrap();
            assign_lvalue(&assign.target, value, &mut ctx).unwrap();
        }
        assert_eq!(ctx.flow_vars.get("seen"), Some(&json!(1.0)));
        let req_obj = ctx.req.unwrap();
        assert_eq!(req_obj["header"]["K"], json!("v"));
        assert_eq!(req_obj["query"]["page"], json!(2.0));
    }

    #[test]
    fn format_value_renders_whole_numbers_without_fraction() {
        assert_eq!(format_value(&json!(2.0)), "2");
        assert_eq!(format_value(&json!(2.5)), "2.5");
        assert_eq!(format_value(&json!("s")), "s");
        assert_eq!(format_value(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(format_value(&Value::Null), "null");
    }
}
