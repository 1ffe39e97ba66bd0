pub mod ansi;
pub mod json;
pub mod registry;

use std::fmt;

use crate::ast::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable registry code such as `FLOW-G001`.
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches a primary label. Unknown spans are skipped.
    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        if span != Span::UNKNOWN {
            self.labels.push(Label { span, message: label.into(), is_primary: true });
        }
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        if span != Span::UNKNOWN {
            self.labels.push(Label { span, message: label.into(), is_primary: false });
        }
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One-line form: `[FLOW-G001] unknown symbol 'x'`.
impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)
    }
}

// ---- From impls for error types ----

impl From<&crate::ir::IrError> for Diagnostic {
    fn from(e: &crate::ir::IrError) -> Self {
        Diagnostic::error(e.to_string()).with_code("FLOW-G011")
    }
}

impl From<&crate::ir::verify::VerifyError> for Diagnostic {
    fn from(e: &crate::ir::verify::VerifyError) -> Self {
        Diagnostic::error(&e.message)
            .with_code("FLOW-G012")
            .with_note(format!("in handler '{}'", e.handler))
    }
}

impl From<&crate::vm::EncodeError> for Diagnostic {
    fn from(e: &crate::vm::EncodeError) -> Self {
        Diagnostic::error(e.to_string()).with_code(e.code())
    }
}

impl From<&crate::vm::LoadError> for Diagnostic {
    fn from(e: &crate::vm::LoadError) -> Self {
        let code = match e {
            crate::vm::LoadError::Encode(inner) => inner.code(),
            crate::vm::LoadError::InvalidJumpTarget { .. }
            | crate::vm::LoadError::InvalidHandlerCall { .. }
            | crate::vm::LoadError::InvalidMatchTarget { .. } => "FLOW-L003",
            _ => "FLOW-L002",
        };
        Diagnostic::error(e.to_string()).with_code(code)
    }
}

impl From<&crate::vm::LinkError> for Diagnostic {
    fn from(e: &crate::vm::LinkError) -> Self {
        let mut d = Diagnostic::error(e.to_string()).with_code("FLOW-L001");
        for sig in &e.unresolved {
            d = d.with_note(format!("unresolved: {sig}"));
        }
        d
    }
}

impl From<&crate::vm::RunError> for Diagnostic {
    fn from(e: &crate::vm::RunError) -> Self {
        Diagnostic::error(e.to_string()).with_code(e.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("unknown symbol").with_span(Span { start: 5, end: 8 }, "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!(d.labels[0].span.start, 5);
        assert_eq!(d.labels[0].span.end, 8);
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn unknown_span_adds_no_label() {
        let d = Diagnostic::error("unknown symbol").with_span(Span::UNKNOWN, "here");
        assert!(d.labels.is_empty());
    }

    #[test]
    fn display_prefixes_code() {
        let d = Diagnostic::error("unknown symbol 'x'").with_code("FLOW-G001");
        assert_eq!(d.to_string(), "[FLOW-G001] unknown symbol 'x'");
        assert_eq!(Diagnostic::error("plain").to_string(), "plain");
    }

    #[test]
    fn from_link_error_lists_signatures() {
        let e = crate::vm::LinkError { unresolved: vec!["log(S)V".into(), "req.path()S".into()] };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("FLOW-L001"));
        assert_eq!(d.notes.len(), 2);
        assert!(d.notes[1].contains("req.path()S"));
    }

    #[test]
    fn from_run_error_carries_code() {
        let d = Diagnostic::from(&crate::vm::RunError::DivisionByZero { pc: 3 });
        assert_eq!(d.code, Some("FLOW-R003"));
        assert!(d.message.contains("division by zero"));
    }
}
