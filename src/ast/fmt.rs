//! Source-shaped rendering of expressions, used by the assertion log
//! and diagnostic hints.

use super::types::*;

pub fn format_expr(expr: &Expr) -> String {
    match expr {
        Expr::Str(s) => format!("{:?}", s.value),
        Expr::Number(n) => n.raw.clone(),
        Expr::Duration(d) => d.raw.clone(),
        Expr::Bool(b) => {
            if b.value {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        Expr::Null(_) => "null".to_string(),
        Expr::Array(a) => {
            let parts: Vec<String> = a.elements.iter().map(format_expr).collect();
            format!("[{}]", parts.join(", "))
        }
        Expr::Object(o) => {
            let parts: Vec<String> = o
                .pairs
                .iter()
                .map(|p| format!("{}: {}", p.key.name, format_expr(&p.value)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        Expr::Ident(i) => i.name.clone(),
        Expr::Dollar(_) => "$".to_string(),
        Expr::Hash(_) => "#".to_string(),
        Expr::Paren(p) => format!("({})", format_expr(&p.expr)),
        Expr::Unary(u) => format!("{}{}", unary_op_str(u.op), format_expr(&u.expr)),
        Expr::Binary(b) => format!(
            "{} {} {}",
            format_expr(&b.left),
            binary_op_str(b.op),
            format_expr(&b.right)
        ),
        Expr::Field(f) => format!("{}.{}", format_expr(&f.expr), f.name),
        Expr::Index(i) => format!("{}[{}]", format_expr(&i.expr), format_expr(&i.index)),
        Expr::Call(c) => {
            let parts: Vec<String> = c.args.iter().map(format_expr).collect();
            format!("{}({})", format_expr(&c.callee), parts.join(", "))
        }
        Expr::Bad(_) => "<expr>".to_string(),
    }
}

fn unary_op_str(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Not => "!",
        UnaryOp::Plus => "+",
        UnaryOp::Minus => "-",
    }
}

fn binary_op_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Or => "or",
        BinaryOp::And => "and",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::In => "in",
        BinaryOp::Contains => "contains",
        BinaryOp::Match => "~",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
    }
}
