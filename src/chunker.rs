//! Splits narrative text into bounded shards.
//!
//! Split points are only taken at whitespace, so a traceability reference
//! (which never contains whitespace) is never cut. Inside each window the
//! chunker prefers, in order: a paragraph break in the back half, a sentence
//! end in the back half, then the last whitespace of any kind. A window
//! without whitespace is cut at the budget, moved off any reference it would
//! land in.

use tracing::debug;

use crate::shard::{Collection, ShardDraft, ShardMetadata};
use crate::trace::{self, TraceRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BoundaryKind {
    Word,
    Sentence,
    Paragraph,
}

/// Start of a whitespace run, where a unit may end
#[derive(Debug, Clone, Copy)]
struct Boundary {
    pos: usize,
    kind: BoundaryKind,
}

fn boundaries(text: &str) -> Vec<Boundary> {
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut newlines = 0;
    let mut prev: Option<char> = None;
    let mut before_run: Option<char> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if run_start.is_none() {
                run_start = Some(i);
                before_run = prev;
                newlines = 0;
            }
            if c == '\n' {
                newlines += 1;
            }
        } else if let Some(pos) = run_start.take() {
            let kind = if newlines >= 2 {
                BoundaryKind::Paragraph
            } else if matches!(before_run, Some('.' | '!' | '?')) {
                BoundaryKind::Sentence
            } else {
                BoundaryKind::Word
            };
            if pos > 0 {
                out.push(Boundary { pos, kind });
            }
        }
        prev = Some(c);
    }

    out
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// Byte offset `chars` characters after `from`, or `None` past the end
fn advance_chars(text: &str, from: usize, chars: usize) -> Option<usize> {
    text[from..].char_indices().nth(chars).map(|(i, _)| from + i)
}

fn choose_split(
    text: &str,
    bounds: &[Boundary],
    refs: &[TraceRef],
    start: usize,
    limit: usize,
    max_chars: usize,
) -> usize {
    let mid = advance_chars(text, start, max_chars / 2).unwrap_or(limit);
    let window: Vec<&Boundary> = bounds
        .iter()
        .filter(|b| b.pos > start && b.pos <= limit)
        .collect();

    let last_of = |kind: BoundaryKind| {
        window
            .iter()
            .rev()
            .find(|b| b.kind == kind && b.pos >= mid)
            .map(|b| b.pos)
    };

    if let Some(pos) = last_of(BoundaryKind::Paragraph)
        .or_else(|| last_of(BoundaryKind::Sentence))
        .or_else(|| window.last().map(|b| b.pos))
    {
        return pos;
    }

    // No whitespace in the window: cut at the budget unless that lands in a reference.
    match refs.iter().find(|r| r.span.start < limit && limit < r.span.end) {
        Some(r) if r.span.start > start => r.span.start,
        Some(r) => r.span.end,
        None => limit,
    }
}

/// Split `text` into ordered units of at most `max_chars` characters.
///
/// Whitespace at split points is dropped; everything else is kept in order.
/// A single reference longer than `max_chars` becomes its own oversized unit.
pub fn split_text(text: &str, refs: &[TraceRef], max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let bounds = boundaries(text);
    let mut units = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let Some(limit) = advance_chars(text, start, max_chars) else {
            units.push(text[start..].trim_end().to_string());
            break;
        };

        let split = choose_split(text, &bounds, refs, start, limit, max_chars);
        let unit = text[start..split].trim_end();
        if !unit.is_empty() {
            units.push(unit.to_string());
        }
        start = skip_whitespace(text, split);
    }

    units
}

/// Turns narratives into shard drafts
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
}

impl Chunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Split a narrative into drafts for `collection`.
    ///
    /// Every draft carries `metadata` plus its `shard_index`, the sibling count,
    /// every reference of the whole narrative, and `unique_id` suffixed with the
    /// index. Pure: the same input always yields the same drafts. Blank input
    /// yields no drafts.
    pub fn split(
        &self,
        narrative: &str,
        collection: Collection,
        metadata: &ShardMetadata,
    ) -> Vec<ShardDraft> {
        let refs = trace::extract_refs(narrative);
        let units = split_text(narrative, &refs, self.max_chars);
        let count = units.len() as u32;

        debug!(
            collection = %collection,
            chars = narrative.chars().count(),
            shards = count,
            "Chunked narrative"
        );

        let mut trace_refs = metadata.trace_refs.clone();
        for r in trace::unique_strings(&refs) {
            if !trace_refs.contains(&r) {
                trace_refs.push(r);
            }
        }

        units
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let mut meta = metadata.clone();
                meta.shard_index = index as u32;
                meta.shard_count = count;
                meta.unique_id = format!("{}-{}", metadata.unique_id, index);
                meta.trace_refs = trace_refs.clone();
                ShardDraft {
                    collection,
                    text,
                    metadata: meta,
                }
            })
            .collect()
    }
}
