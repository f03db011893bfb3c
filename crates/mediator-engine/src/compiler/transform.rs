//! Normalize, bind and wrap stages.

use swc_common::Spanned;
use swc_ecma_ast::{CallExpr, Callee, Expr, Stmt};

use super::ParsedSource;

/// Expression split into leading statements and one pipeline call.
pub(crate) struct NormalizedSource {
    pub prelude: Vec<String>,
    pub entry_call: String,
}

/// Fold bare top-level calls into a single call to `entry_point`.
///
/// Calls joined by commas (`a(), b();`) fold in order like separate
/// statements. Other statements are kept, in order, ahead of the pipeline
/// call. A source that already consists of exactly one `entry_point(...)`
/// call is left as it is.
pub(crate) fn normalize(parsed: &ParsedSource<'_>, entry_point: &str) -> NormalizedSource {
    let mut prelude = Vec::new();
    let mut calls: Vec<(&str, bool)> = Vec::new();

    for stmt in &parsed.script().body {
        match stmt {
            Stmt::Empty(_) => {}
            Stmt::Expr(expr_stmt) => match pipeline_calls(&expr_stmt.expr) {
                Some(found) => {
                    for call in found {
                        let is_entry = callee_name(call) == Some(entry_point);
                        calls.push((parsed.snippet(call.span()), is_entry));
                    }
                }
                None => prelude.push(parsed.snippet(stmt.span()).to_string()),
            },
            other => prelude.push(parsed.snippet(other.span()).to_string()),
        }
    }

    let entry_call = match calls.as_slice() {
        [(text, true)] => (*text).to_string(),
        [] => format!("{entry_point}()"),
        calls => {
            let args: Vec<&str> = calls.iter().map(|(text, _)| *text).collect();
            format!("{entry_point}(\n  {}\n)", args.join(",\n  "))
        }
    };

    NormalizedSource {
        prelude,
        entry_call,
    }
}

/// Apply the pipeline function to the runtime state.
pub(crate) fn bind(normalized: &NormalizedSource, state_ident: &str) -> String {
    format!("{}({state_ident})", normalized.entry_call)
}

/// Enclose prelude and bound call in an immediately invoked function.
pub(crate) fn wrap(normalized: &NormalizedSource, bound: &str) -> String {
    let mut text = String::from("(function () {\n");
    for stmt in &normalized.prelude {
        text.push_str(stmt);
        text.push('\n');
    }
    text.push_str("return ");
    text.push_str(bound);
    text.push_str(";\n})()");
    text
}

/// The calls a top-level expression statement contributes to the pipeline:
/// a single call, or a comma sequence made only of calls.
pub(crate) fn pipeline_calls(expr: &Expr) -> Option<Vec<&CallExpr>> {
    match unwrap_parens(expr) {
        Expr::Call(call) => Some(vec![call]),
        Expr::Seq(seq) => seq
            .exprs
            .iter()
            .map(|item| match unwrap_parens(item) {
                Expr::Call(call) => Some(call),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Identifier being called, if the callee is a plain name.
pub(crate) fn callee_name(call: &CallExpr) -> Option<&str> {
    match &call.callee {
        Callee::Expr(callee) => match unwrap_parens(callee) {
            Expr::Ident(ident) => Some(&*ident.sym),
            _ => None,
        },
        _ => None,
    }
}

pub(crate) fn unwrap_parens(expr: &Expr) -> &Expr {
    match expr {
        Expr::Paren(paren) => unwrap_parens(&paren.expr),
        other => other,
    }
}
