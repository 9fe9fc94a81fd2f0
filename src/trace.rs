//! Traceability references (`path:line`, `path:start-end`) and the
//! validator that requires them on knowledge capture.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A path ending in a file extension, a colon, a line and an optional end line.
static TRACE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9_./\-]*[A-Za-z0-9_\-]\.[A-Za-z][A-Za-z0-9]*:(\d+)(?:-(\d+))?")
        .expect("trace reference pattern is valid")
});

/// A citation of a source location found in narrative text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRef {
    pub path: String,
    pub start_line: u32,
    pub end_line: Option<u32>,

    /// The citation exactly as written
    pub raw: String,

    /// Byte range of the citation in the text it was extracted from
    #[serde(skip)]
    pub span: Range<usize>,
}

impl TraceRef {
    /// True when both cite the same file and their line ranges overlap
    pub fn overlaps(&self, other: &TraceRef) -> bool {
        let end = self.end_line.unwrap_or(self.start_line);
        let other_end = other.end_line.unwrap_or(other.start_line);
        self.path == other.path && self.start_line <= other_end && other.start_line <= end
    }
}

impl std::fmt::Display for TraceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Extract every traceability reference from `text`, in order of appearance.
///
/// URLs (`//host.tld:port`), zero line numbers and inverted ranges are not references.
pub fn extract_refs(text: &str) -> Vec<TraceRef> {
    TRACE_REF
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let start_match = caps.get(1)?;
            let path = &text[whole.start()..start_match.start() - 1];
            if path.starts_with("//") {
                return None;
            }

            let start_line: u32 = start_match.as_str().parse().ok()?;
            let end_line = match caps.get(2) {
                Some(m) => Some(m.as_str().parse::<u32>().ok()?),
                None => None,
            };
            if start_line == 0 || end_line.is_some_and(|end| end < start_line) {
                return None;
            }

            Some(TraceRef {
                path: path.to_string(),
                start_line,
                end_line,
                raw: whole.as_str().to_string(),
                span: whole.range(),
            })
        })
        .collect()
}

/// Require at least one reference in a "what was built" narrative.
pub fn validate(narrative: &str) -> Result<Vec<TraceRef>, ValidationError> {
    let refs = extract_refs(narrative);
    if refs.is_empty() {
        return Err(ValidationError::MissingTraceability {
            len: narrative.chars().count(),
        });
    }
    Ok(refs)
}

/// Verbatim references, duplicates removed, first occurrence order kept
pub fn unique_strings(refs: &[TraceRef]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(refs.len());
    for r in refs {
        if !out.contains(&r.raw) {
            out.push(r.raw.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_reference_shapes() {
        let cases: &[(&str, &[&str])] = &[
            ("Files: test/storage.py:1-50", &["test/storage.py:1-50"]),
            ("see src/lib.rs:42 for details", &["src/lib.rs:42"]),
            (
                "auth/jwt.py:89-145 and config/app.yaml:3",
                &["auth/jwt.py:89-145", "config/app.yaml:3"],
            ),
            ("(./scripts/run-tests.sh:7).", &["./scripts/run-tests.sh:7"]),
            ("Cargo.toml:12-14,", &["Cargo.toml:12-14"]),
            ("Content without file references", &[]),
            ("meeting at 10:30 in room 4", &[]),
            ("Qdrant at http://localhost:6333", &[]),
            ("see https://docs.rs:443/regex", &[]),
            ("src/lib.rs:0 is not a line", &[]),
            ("src/lib.rs:50-10 is inverted", &[]),
            ("src/lib.rs: no line", &[]),
        ];

        for (text, expected) in cases {
            let got: Vec<String> = extract_refs(text).iter().map(|r| r.to_string()).collect();
            assert_eq!(&got, expected, "input: {text}");
        }
    }

    #[test]
    fn parses_structure_and_span() {
        let text = "Built src/memory/store.rs:10-20 today";
        let refs = extract_refs(text);
        assert_eq!(refs.len(), 1);

        let r = &refs[0];
        assert_eq!(r.path, "src/memory/store.rs");
        assert_eq!(r.start_line, 10);
        assert_eq!(r.end_line, Some(20));
        assert_eq!(&text[r.span.clone()], "src/memory/store.rs:10-20");
    }

    #[test]
    fn single_line_has_no_end() {
        let refs = extract_refs("main.go:7");
        assert_eq!(refs[0].end_line, None);
        assert_eq!(refs[0].to_string(), "main.go:7");
    }

    #[test]
    fn validate_requires_a_reference() {
        let err = validate("Content without file references").unwrap_err();
        assert_eq!(err, ValidationError::MissingTraceability { len: 31 });

        let refs = validate("Test storage implementation. Files: test/storage.py:1-50").unwrap();
        assert_eq!(refs[0].to_string(), "test/storage.py:1-50");
    }

    #[test]
    fn overlap_is_per_file() {
        let a = &extract_refs("a.rs:10-20")[0];
        let b = &extract_refs("a.rs:15")[0];
        let c = &extract_refs("a.rs:21-30")[0];
        let d = &extract_refs("b.rs:10-20")[0];
        assert!(a.overlaps(b));
        assert!(b.overlaps(a));
        assert!(!a.overlaps(c));
        assert!(!a.overlaps(d));
    }

    #[test]
    fn unique_strings_keeps_first_occurrence() {
        let refs = extract_refs("x.rs:1 y.rs:2 x.rs:1");
        assert_eq!(unique_strings(&refs), vec!["x.rs:1", "y.rs:2"]);
    }

    #[test]
    fn references_keep_their_written_form() {
        let text = "moved src/a.rs:007-010 out";
        let refs = extract_refs(text);
        assert_eq!(refs[0].start_line, 7);
        assert_eq!(refs[0].end_line, Some(10));
        assert_eq!(refs[0].to_string(), "src/a.rs:007-010");
        assert_eq!(unique_strings(&refs), vec!["src/a.rs:007-010"]);
        assert!(text.contains(&unique_strings(&refs)[0]));
    }
}
