//! Allow-list verification of call sites.

use std::collections::HashSet;

use swc_ecma_ast::{
    BindingIdent, CallExpr, Callee, ClassDecl, Expr, ExprStmt, FnDecl, FnExpr, Ident, NewExpr,
    Stmt, TaggedTpl,
};
use swc_ecma_visit::{Visit, VisitWith};

use super::transform::{callee_name, pipeline_calls, unwrap_parens};
use super::{CompileError, ParsedSource};
use crate::adaptor::AllowList;

/// Check every identifier in call position against the allow-list.
///
/// Names the expression declares itself (functions, variables, parameters)
/// may also be called. Nothing is executed.
pub(crate) fn verify(parsed: &ParsedSource<'_>, allow_list: &AllowList) -> Vec<CompileError> {
    let mut declarations = Declarations::default();
    parsed.script().visit_with(&mut declarations);

    let mut verifier = CallVerifier {
        parsed,
        allow_list,
        declared: &declarations.names,
        errors: Vec::new(),
    };
    parsed.script().visit_with(&mut verifier);

    let mut discarded = DiscardedOperations {
        parsed,
        allow_list,
        declared: &declarations.names,
        errors: Vec::new(),
    };
    for stmt in &parsed.script().body {
        match stmt {
            // Folded into the pipeline; only what is nested inside can be lost.
            Stmt::Expr(expr_stmt) if pipeline_calls(&expr_stmt.expr).is_some() => {
                (*expr_stmt.expr).visit_with(&mut discarded)
            }
            other => other.visit_with(&mut discarded),
        }
    }

    let mut errors = verifier.errors;
    errors.extend(discarded.errors);
    errors
}

#[derive(Default)]
struct Declarations {
    names: HashSet<String>,
}

impl Visit for Declarations {
    fn visit_binding_ident(&mut self, node: &BindingIdent) {
        self.names.insert(node.id.sym.to_string());
    }

    fn visit_fn_decl(&mut self, node: &FnDecl) {
        self.names.insert(node.ident.sym.to_string());
        node.visit_children_with(self);
    }

    fn visit_fn_expr(&mut self, node: &FnExpr) {
        if let Some(ident) = &node.ident {
            self.names.insert(ident.sym.to_string());
        }
        node.visit_children_with(self);
    }

    fn visit_class_decl(&mut self, node: &ClassDecl) {
        self.names.insert(node.ident.sym.to_string());
        node.visit_children_with(self);
    }
}

struct CallVerifier<'a, 'src> {
    parsed: &'a ParsedSource<'src>,
    allow_list: &'a AllowList,
    declared: &'a HashSet<String>,
    errors: Vec<CompileError>,
}

impl CallVerifier<'_, '_> {
    fn check_callee(&mut self, callee: &Expr) {
        if let Expr::Ident(ident) = unwrap_parens(callee) {
            self.check(ident);
        }
    }

    fn check(&mut self, ident: &Ident) {
        let name = &*ident.sym;
        if self.allow_list.contains(name) || self.declared.contains(name) {
            return;
        }
        self.errors.push(self.parsed.error_at(
            ident.span,
            format!("Function `{name}` is not available to expressions"),
        ));
    }
}

impl Visit for CallVerifier<'_, '_> {
    fn visit_call_expr(&mut self, node: &CallExpr) {
        match &node.callee {
            Callee::Expr(callee) => self.check_callee(callee),
            Callee::Import(import) => self
                .errors
                .push(self.parsed.error_at(import.span, "Dynamic import is not allowed")),
            Callee::Super(_) => {}
        }
        node.visit_children_with(self);
    }

    fn visit_new_expr(&mut self, node: &NewExpr) {
        self.check_callee(&node.callee);
        node.visit_children_with(self);
    }

    fn visit_tagged_tpl(&mut self, node: &TaggedTpl) {
        self.check_callee(&node.tag);
        node.visit_children_with(self);
    }
}

/// Builder calls used as statements outside the pipeline. Builders only
/// describe an operation, so such a call never reaches the collaborator.
struct DiscardedOperations<'a, 'src> {
    parsed: &'a ParsedSource<'src>,
    allow_list: &'a AllowList,
    declared: &'a HashSet<String>,
    errors: Vec<CompileError>,
}

impl Visit for DiscardedOperations<'_, '_> {
    fn visit_expr_stmt(&mut self, node: &ExprStmt) {
        let calls: Vec<&CallExpr> = match unwrap_parens(&node.expr) {
            Expr::Seq(seq) => seq
                .exprs
                .iter()
                .filter_map(|item| match unwrap_parens(item) {
                    Expr::Call(call) => Some(call),
                    _ => None,
                })
                .collect(),
            Expr::Call(call) => vec![call],
            _ => Vec::new(),
        };
        for call in calls {
            let Some(name) = callee_name(call) else { continue };
            if self.allow_list.is_builder(name) && !self.declared.contains(name) {
                self.errors.push(self.parsed.error_at(
                    call.span,
                    format!("`{name}(...)` is never run here; pass it to `execute(...)`"),
                ));
            }
        }
        node.visit_children_with(self);
    }
}
