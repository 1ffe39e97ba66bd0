use std::fmt::Write;

use crate::ast::SourceMap;

use super::{Diagnostic, Label, Severity};

/// Terminal renderer: header, source snippet under the primary label, then
/// secondary labels, notes and the suggestion.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, style: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{style}m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let severity = match d.severity {
            Severity::Error => self.paint("1;31", "error"),
            Severity::Warning => self.paint("1;33", "warning"),
        };
        let code = d.code.map(|c| format!("[{c}]")).unwrap_or_default();
        let _ = writeln!(out, "{severity}{code}: {}", self.paint("1", &d.message));

        let map = d.source.as_deref().map(|s| (s, SourceMap::new(s)));
        if let (Some(label), Some((source, map))) = (d.labels.iter().find(|l| l.is_primary), &map) {
            self.snippet(&mut out, source, map, label);
        }

        for label in d.labels.iter().filter(|l| !l.is_primary && !l.message.is_empty()) {
            let at = match &map {
                Some((_, map)) => {
                    let (line, col) = map.lookup(label.span.start);
                    format!(" ({line}:{col})")
                }
                None => String::new(),
            };
            let _ = writeln!(out, "  {} {}{at}", self.paint("2", "="), label.message);
        }
        for note in &d.notes {
            let _ = writeln!(out, "  {} note: {note}", self.paint("2", "="));
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {} suggestion: {suggestion}", self.paint("2", "="));
        }
        out
    }

    fn snippet(&self, out: &mut String, source: &str, map: &SourceMap, label: &Label) {
        let (line, col) = map.lookup(label.span.start);
        let text = map.line_text(source, line);
        let gutter = line.to_string().len();
        let pad = " ".repeat(gutter);
        let pipe = self.paint("36", "|");

        let _ = writeln!(out, "  {} {line}:{col}", self.paint("36", "-->"));
        let _ = writeln!(out, "{pad} {pipe}");
        let _ = writeln!(out, "{} {pipe} {text}", self.paint("36", &format!("{line:>gutter$}")));

        // carets stay on the first line of a multi-line span
        let room = text.len().saturating_sub(col - 1).max(1);
        let width = label.span.end.saturating_sub(label.span.start).clamp(1, room);
        let carets = self.paint("1;31", &"^".repeat(width));
        let indent = " ".repeat(col - 1);
        if label.message.is_empty() {
            let _ = writeln!(out, "{pad} {pipe} {indent}{carets}");
        } else {
            let _ = writeln!(out, "{pad} {pipe} {indent}{carets} {}", self.paint("1;31", &label.message));
        }
        let _ = writeln!(out, "{pad} {pipe}");
    }

    /// Renders a batch followed by an `N error(s), M warning(s)` summary line.
    pub fn render_all(&self, diagnostics: &[Diagnostic]) -> String {
        let mut out = String::new();
        for d in diagnostics {
            out.push_str(&self.render(d));
            out.push('\n');
        }
        let errors = diagnostics.iter().filter(|d| d.severity == Severity::Error).count();
        let warnings = diagnostics.len() - errors;
        let _ = writeln!(out, "{errors} error(s), {warnings} warning(s)");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    const SOURCE: &str = "handler main {\n  if req.path =^ 42 then return;\n}\n";

    // span of `42` on line 2
    fn mismatch() -> Diagnostic {
        Diagnostic::error("type mismatch: string =^ int")
            .with_code("FLOW-G003")
            .with_span(Span { start: 32, end: 34 }, "expected a string")
            .with_source(SOURCE)
            .with_note("in handler 'main'")
            .with_suggestion("quote the label: \"42\"")
    }

    fn plain(d: &Diagnostic) -> String {
        AnsiRenderer { use_color: false }.render(d)
    }

    #[test]
    fn header_carries_severity_and_code() {
        let out = plain(&mismatch());
        assert!(out.starts_with("error[FLOW-G003]: type mismatch"), "got:\n{out}");
    }

    #[test]
    fn snippet_points_at_the_span() {
        let out = plain(&mismatch());
        assert!(out.contains("--> 2:18"), "got:\n{out}");
        assert!(out.contains("2 |   if req.path =^ 42 then return;"), "got:\n{out}");
        assert!(out.contains("^^ expected a string"), "got:\n{out}");
    }

    #[test]
    fn notes_and_suggestion_follow() {
        let out = plain(&mismatch());
        assert!(out.contains("= note: in handler 'main'"));
        assert!(out.contains("= suggestion: quote the label"));
    }

    #[test]
    fn secondary_label_gets_a_position() {
        let d = mismatch().with_secondary_span(Span { start: 0, end: 7 }, "declared here");
        let out = plain(&d);
        assert!(out.contains("= declared here (1:1)"), "got:\n{out}");
    }

    #[test]
    fn no_source_means_no_snippet() {
        let out = plain(&Diagnostic::warning("unused variable 'x'"));
        assert_eq!(out, "warning: unused variable 'x'\n");
    }

    #[test]
    fn color_only_when_asked() {
        let colored = AnsiRenderer { use_color: true }.render(&mismatch());
        assert!(colored.contains("\x1b[1;31m"));
        assert!(!plain(&mismatch()).contains("\x1b["));
    }

    #[test]
    fn multi_line_span_is_clamped_to_its_first_line() {
        let d = Diagnostic::error("bad").with_span(Span { start: 0, end: SOURCE.len() }, "").with_source(SOURCE);
        let out = plain(&d);
        assert!(out.contains(&format!("1 | {}", "handler main {")));
        assert!(out.contains(&"^".repeat("handler main {".len())));
        assert!(!out.contains(&"^".repeat("handler main {".len() + 1)));
    }

    #[test]
    fn summary_counts_severities() {
        let out = AnsiRenderer { use_color: false }.render_all(&[mismatch(), Diagnostic::warning("w")]);
        assert!(out.ends_with("1 error(s), 1 warning(s)\n"), "got:\n{out}");
    }
}
