//! Expression compiler.
//!
//! Turns expression source into a unit the sandbox can evaluate. Stages run
//! in a fixed order:
//!
//! 1. **verify**: every identifier called must be allow-listed (or declared
//!    by the expression itself); violations are collected with positions.
//! 2. **normalize**: bare top-level calls `a(); b();` become `execute(a(), b())`.
//! 3. **bind**: the pipeline is applied to the runtime `state`.
//! 4. **wrap**: everything is enclosed in an immediately invoked function.
//!
//! Parsing uses SWC; rewriting splices the original source text by span, so
//! user code is carried through byte for byte.

mod transform;
mod verify;

use std::fmt;

use serde::Serialize;
use swc_common::{BytePos, FileName, SourceMap, Span, Spanned, sync::Lrc};
use swc_ecma_ast::{EsVersion, Script};
use swc_ecma_parser::{EsSyntax, Parser, StringInput, Syntax, lexer::Lexer};

use crate::adaptor::AllowList;
use crate::error::{EngineError, EngineResult};

/// Compiler settings.
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Pipeline entry point bare calls are folded into.
    pub entry_point: String,
    /// Identifier the pipeline is applied to.
    pub state_ident: String,
    /// File name used in diagnostics.
    pub filename: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            entry_point: "execute".to_string(),
            state_ident: "state".to_string(),
            filename: "expression.js".to_string(),
        }
    }
}

/// A positioned compilation problem. Line and column are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub source_line: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {}", self.line, self.column, self.message)?;
        if !self.source_line.is_empty() {
            let caret = " ".repeat(self.column.saturating_sub(1));
            write!(f, "\n  {}\n  {}^", self.source_line, caret)?;
        }
        Ok(())
    }
}

/// Output of [`Compiler::compile`]. Only a unit without errors may run.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    text: String,
    errors: Vec<CompileError>,
}

impl CompiledUnit {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fail with `CompileRejected` if any error was recorded.
    pub fn ensure_runnable(&self) -> EngineResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::CompileRejected {
                errors: self.errors.clone(),
            })
        }
    }
}

pub struct Compiler {
    allow_list: AllowList,
    options: CompilerOptions,
}

impl Compiler {
    pub fn new(allow_list: AllowList) -> Self {
        Self::with_options(allow_list, CompilerOptions::default())
    }

    pub fn with_options(allow_list: AllowList, options: CompilerOptions) -> Self {
        Self {
            allow_list,
            options,
        }
    }

    pub fn compile(&self, source: &str) -> CompiledUnit {
        let parsed = match ParsedSource::parse(source, &self.options.filename) {
            Ok(parsed) => parsed,
            Err(errors) => return rejected(source, errors),
        };

        let errors = verify::verify(&parsed, &self.allow_list);
        if !errors.is_empty() {
            return rejected(source, errors);
        }

        let normalized = transform::normalize(&parsed, &self.options.entry_point);
        let bound = transform::bind(&normalized, &self.options.state_ident);
        CompiledUnit {
            text: transform::wrap(&normalized, &bound),
            errors: Vec::new(),
        }
    }
}

fn rejected(source: &str, errors: Vec<CompileError>) -> CompiledUnit {
    CompiledUnit {
        text: source.to_string(),
        errors,
    }
}

/// Parsed expression plus what is needed to map spans back onto the text.
pub(crate) struct ParsedSource<'a> {
    source: &'a str,
    base: u32,
    script: Script,
}

impl<'a> ParsedSource<'a> {
    fn parse(source: &'a str, filename: &str) -> Result<Self, Vec<CompileError>> {
        let cm: Lrc<SourceMap> = Default::default();
        let fm = cm.new_source_file(
            Lrc::new(FileName::Custom(filename.to_string())),
            source.to_string(),
        );
        let base = fm.start_pos.0;

        let lexer = Lexer::new(
            Syntax::Es(EsSyntax::default()),
            EsVersion::Es2020,
            StringInput::from(&*fm),
            None,
        );
        let mut parser = Parser::new_from(lexer);
        let script = parser.parse_script();

        let locate = |span: Span, message: String| {
            let (line, column, source_line) = position(source, offset(base, source, span.lo));
            CompileError {
                message,
                line,
                column,
                source_line,
            }
        };

        let mut errors: Vec<CompileError> = parser
            .take_errors()
            .into_iter()
            .map(|e| locate(e.span(), e.kind().msg().to_string()))
            .collect();

        match script {
            Ok(script) if errors.is_empty() => Ok(Self {
                source,
                base,
                script,
            }),
            Ok(_) => Err(errors),
            Err(e) => {
                errors.push(locate(e.span(), e.kind().msg().to_string()));
                Err(errors)
            }
        }
    }

    pub(crate) fn script(&self) -> &Script {
        &self.script
    }

    /// Original text covered by `span`.
    pub(crate) fn snippet(&self, span: Span) -> &'a str {
        let lo = offset(self.base, self.source, span.lo);
        let hi = offset(self.base, self.source, span.hi);
        self.source.get(lo..hi).unwrap_or_default()
    }

    pub(crate) fn error_at(&self, span: Span, message: impl Into<String>) -> CompileError {
        let (line, column, source_line) = position(self.source, offset(self.base, self.source, span.lo));
        CompileError {
            message: message.into(),
            line,
            column,
            source_line,
        }
    }
}

fn offset(base: u32, source: &str, pos: BytePos) -> usize {
    (pos.0.saturating_sub(base) as usize).min(source.len())
}

/// 1-based line and column of a byte offset, plus that line's text.
fn position(source: &str, offset: usize) -> (usize, usize, String) {
    let before = source.get(..offset).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = source
        .get(line_start..offset)
        .map(|s| s.chars().count())
        .unwrap_or(0)
        + 1;
    let source_line = source[line_start..]
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    (line, column, source_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> Compiler {
        Compiler::new(AllowList::from_names(["createTEI", "event", "dataElement"]))
    }

    #[test]
    fn test_bare_calls_are_folded_into_execute() {
        let unit = compiler().compile("createTEI({ a: 1 });\nevent(dataValue('x'));");
        assert!(unit.is_ok(), "{:?}", unit.errors());
        assert_eq!(
            unit.text(),
            "(function () {\nreturn execute(\n  createTEI({ a: 1 }),\n  event(dataValue('x'))\n)(state);\n})()"
        );
    }

    #[test]
    fn test_existing_execute_is_kept() {
        let unit = compiler().compile("execute(createTEI({}), event({}))");
        assert!(unit.is_ok());
        assert_eq!(
            unit.text(),
            "(function () {\nreturn execute(createTEI({}), event({}))(state);\n})()"
        );
    }

    #[test]
    fn test_empty_expression_compiles_to_empty_pipeline() {
        let unit = compiler().compile("  \n");
        assert!(unit.is_ok());
        assert_eq!(unit.text(), "(function () {\nreturn execute()(state);\n})()");
    }

    #[test]
    fn test_comma_joined_calls_fold_in_order() {
        let unit = compiler().compile("createTEI({ a: 1 }), event({});");
        assert!(unit.is_ok(), "{:?}", unit.errors());
        assert_eq!(
            unit.text(),
            "(function () {\nreturn execute(\n  createTEI({ a: 1 }),\n  event({})\n)(state);\n})()"
        );
    }

    #[test]
    fn test_builder_statement_outside_the_pipeline_is_rejected() {
        for source in [
            "if (state.data.ok) createTEI({});",
            "fn(state => { event({}); return state; })",
            "let n = 0;\nn++, createTEI({});",
        ] {
            let unit = compiler().compile(source);
            assert!(!unit.is_ok(), "{source}");
            assert!(
                unit.errors().iter().any(|e| e.message.contains("execute(...)")),
                "{source}: {:?}",
                unit.errors()
            );
        }
    }

    #[test]
    fn test_builder_values_kept_for_later_are_accepted() {
        let unit = compiler().compile("const first = createTEI({});\nexecute(first, event({}));");
        assert!(unit.is_ok(), "{:?}", unit.errors());
    }

    #[test]
    fn test_statements_are_kept_ahead_of_the_pipeline() {
        let unit = compiler().compile("const program = 'abc';\ncreateTEI({ program });");
        assert!(unit.is_ok());
        assert!(unit.text().starts_with("(function () {\nconst program = 'abc';\nreturn execute("));
    }

    #[test]
    fn test_disallowed_call_is_rejected_with_position() {
        let unit = compiler().compile("createTEI({});\n  require('fs');");
        assert!(!unit.is_ok());
        let error = &unit.errors()[0];
        assert_eq!((error.line, error.column), (2, 3));
        assert!(error.message.contains("require"));
        assert_eq!(error.source_line, "  require('fs');");
        assert!(unit.ensure_runnable().is_err());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let unit = compiler().compile("a(); createTEI(b(c()));");
        let names: Vec<_> = unit.errors().iter().map(|e| e.message.clone()).collect();
        assert_eq!(names.len(), 3, "{names:?}");
    }

    #[test]
    fn test_locally_declared_functions_are_callable() {
        let unit = compiler().compile(
            "function pick(s) { return s.data.x; }\nconst twice = v => v * 2;\ncreateTEI({ v: state => twice(pick(state)) });",
        );
        assert!(unit.is_ok(), "{:?}", unit.errors());
    }

    #[test]
    fn test_member_calls_and_builtins_are_allowed() {
        let unit = compiler().compile(
            "fn(state => ({ ...state, n: parseInt(state.data.n.trim(), 10), d: new Date().toISOString() }))",
        );
        assert!(unit.is_ok(), "{:?}", unit.errors());
    }

    #[test]
    fn test_dynamic_import_is_rejected() {
        let unit = compiler().compile("import('fs')");
        assert!(!unit.is_ok());
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let unit = compiler().compile("createTEI({ a: });");
        assert!(!unit.is_ok());
        assert_eq!(unit.errors()[0].line, 1);
    }

    #[test]
    fn test_error_display_points_at_column() {
        let error = CompileError {
            message: "bad".into(),
            line: 1,
            column: 3,
            source_line: "a.b()".into(),
        };
        assert_eq!(error.to_string(), "1:3 bad\n  a.b()\n    ^");
    }
}
