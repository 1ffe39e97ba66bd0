use serde_json::{Value, json};

use crate::ast::SourceMap;

use super::{Diagnostic, Severity};

/// One diagnostic as a JSON object. `line`/`col` appear on labels only when
/// the diagnostic carries its source text; `explanation` is the short
/// registry text for the code.
pub fn to_value(d: &Diagnostic) -> Value {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };
    let source_map = d.source.as_deref().map(SourceMap::new);

    let labels: Vec<Value> = d
        .labels
        .iter()
        .map(|l| {
            let mut obj = json!({
                "start": l.span.start,
                "end": l.span.end,
                "message": l.message,
                "primary": l.is_primary,
            });
            if let Some(map) = &source_map {
                let (line, col) = map.lookup(l.span.start);
                obj["line"] = Value::from(line);
                obj["col"] = Value::from(col);
            }
            obj
        })
        .collect();

    let mut obj = json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });
    if let Some(code) = d.code {
        obj["code"] = Value::from(code);
        if let Some(entry) = super::registry::lookup(code) {
            obj["explanation"] = Value::from(entry.short);
        }
    }
    if let Some(s) = &d.suggestion {
        obj["suggestion"] = Value::from(s.as_str());
    }
    obj
}

pub fn render(d: &Diagnostic) -> String {
    to_value(d).to_string()
}

/// A batch as `{"diagnostics": [...], "errors": n, "warnings": m}`.
pub fn render_all(diagnostics: &[Diagnostic]) -> String {
    let errors = diagnostics.iter().filter(|d| d.severity == Severity::Error).count();
    json!({
        "diagnostics": diagnostics.iter().map(to_value).collect::<Vec<_>>(),
        "errors": errors,
        "warnings": diagnostics.len() - errors,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse(s: &str) -> Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn plain_error() {
        let v = parse(&render(&Diagnostic::error("unknown symbol #9")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "unknown symbol #9");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn code_brings_its_explanation() {
        let d = Diagnostic::error("call to 'log' expects 2 arguments").with_code("FLOW-G002");
        let v = parse(&render(&d));
        assert_eq!(v["code"], "FLOW-G002");
        assert_eq!(v["explanation"], "wrong number of arguments");
    }

    #[test]
    fn labels_get_positions_from_source() {
        let d = Diagnostic::error("bad label")
            .with_span(Span { start: 20, end: 24 }, "here")
            .with_source("match req.path {\n  on 1234 { }\n}");
        let v = parse(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 20);
        assert_eq!(label["primary"], true);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 4);
    }

    #[test]
    fn labels_without_source_have_no_position() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse(&render(&d));
        assert!(v["labels"][0].get("line").is_none());
    }

    #[test]
    fn notes_and_suggestion() {
        let d = Diagnostic::warning("duplicate label \"/a\"")
            .with_note("first used in case 1")
            .with_suggestion("remove the repeated label");
        let v = parse(&render(&d));
        assert_eq!(v["severity"], "warning");
        assert_eq!(v["notes"][0], "first used in case 1");
        assert_eq!(v["suggestion"], "remove the repeated label");
    }

    #[test]
    fn batch_counts() {
        let v = parse(&render_all(&[Diagnostic::error("a"), Diagnostic::warning("b"), Diagnostic::error("c")]));
        assert_eq!(v["errors"], 2);
        assert_eq!(v["warnings"], 1);
        assert_eq!(v["diagnostics"].as_array().unwrap().len(), 3);
    }
}
