use super::Span;

/// Byte offset to line/column translation for one source text. Flow source
/// is never parsed here; hosts pass it along only so diagnostics can quote it.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.bytes().enumerate().filter(|(_, b)| *b == b'\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { line_starts }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// 1-based (line, col) of `offset`. Offsets past the end land on the last line.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        (line + 1, offset.saturating_sub(self.line_starts[line]) + 1)
    }

    /// Start and end positions of `span`.
    pub fn locate(&self, span: Span) -> ((usize, usize), (usize, usize)) {
        (self.lookup(span.start), self.lookup(span.end))
    }

    /// Text of the 1-based `line` without its line terminator.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        let Some(&start) = line.checked_sub(1).and_then(|i| self.line_starts.get(i)) else {
            return "";
        };
        let end = self.line_starts.get(line).copied().unwrap_or(source.len());
        source.get(start..end).unwrap_or("").trim_end_matches('\n').trim_end_matches('\r')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOW: &str = "import path\n\nhandler main {\n  if req.path =^ \"/api\" then api;\r\n}";

    #[test]
    fn offsets_on_the_first_line() {
        let sm = SourceMap::new("handler main { }");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(8), (1, 9));
        assert_eq!(sm.line_count(), 1);
    }

    #[test]
    fn blank_lines_count() {
        let sm = SourceMap::new(FLOW);
        assert_eq!(sm.line_count(), 5);
        assert_eq!(sm.lookup(11), (1, 12)); // the first '\n'
        assert_eq!(sm.lookup(12), (2, 1));
        assert_eq!(sm.lookup(13), (3, 1));
    }

    #[test]
    fn line_text_strips_terminators() {
        let sm = SourceMap::new(FLOW);
        assert_eq!(sm.line_text(FLOW, 1), "import path");
        assert_eq!(sm.line_text(FLOW, 2), "");
        assert_eq!(sm.line_text(FLOW, 4), "  if req.path =^ \"/api\" then api;");
        assert_eq!(sm.line_text(FLOW, 5), "}");
    }

    #[test]
    fn line_text_out_of_range() {
        let sm = SourceMap::new(FLOW);
        assert_eq!(sm.line_text(FLOW, 0), "");
        assert_eq!(sm.line_text(FLOW, 6), "");
    }

    #[test]
    fn empty_source_has_one_line() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.line_text("", 1), "");
    }

    #[test]
    fn locate_spans_across_lines() {
        let sm = SourceMap::new(FLOW);
        let start = FLOW.find("handler").unwrap();
        let span = Span { start, end: FLOW.len() };
        assert_eq!(sm.locate(span), ((3, 1), (5, 2)));
    }
}
