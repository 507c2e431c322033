//! Citation resolver — matches an extracted value back to the raw parse
//! blocks of its document.
//!
//! Resolution order:
//! 1. Bounding-box hint from the extraction step, when one was supplied
//! 2. Content match — the value's text found inside a block, verbatim first,
//!    then under normalization (case, whitespace, currency punctuation)
//! 3. No citation — a valid result, never a fabricated location

use crate::models::{Citation, DocumentBlock, FieldValue, SourceHint};

/// Resolve a citation for an extracted value against its document's blocks.
///
/// Never fails for "not found": `None` is the explicit no-citation result.
/// `context_window` is the number of characters captured on each side of
/// the matched span.
pub fn resolve_citation(
    value: &FieldValue,
    hint: Option<&SourceHint>,
    blocks: &[DocumentBlock],
    context_window: usize,
) -> Option<Citation> {
    let needle = value.display_text();

    if let Some(hint) = hint {
        if let Some(citation) = resolve_by_bbox(&needle, hint, blocks, context_window) {
            return Some(citation);
        }
    }

    resolve_by_content(&needle, blocks, context_window)
}

/// (1) The extraction step told us where the value lives. Trust the box if a
/// block actually sits there; fall through to content matching otherwise.
fn resolve_by_bbox(
    needle: &str,
    hint: &SourceHint,
    blocks: &[DocumentBlock],
    context_window: usize,
) -> Option<Citation> {
    let block = blocks.iter().find(|b| {
        b.page == hint.page && b.bbox.map(|bb| bb.approx_eq(&hint.bbox)).unwrap_or(false)
    })?;

    // Prefer the precise span inside the block when the value is findable;
    // otherwise the whole block text is the source.
    if let Some(span) = find_span(&block.text_content, needle) {
        return Some(citation_for_span(block, &span, context_window, true));
    }

    Some(Citation {
        source_page: block.page,
        source_bbox: block.bbox,
        source_text: block.text_content.clone(),
        context_before: String::new(),
        context_after: String::new(),
        is_exact_match: true,
    })
}

/// (2) Scan blocks in order; a verbatim hit anywhere beats a normalized hit.
fn resolve_by_content(
    needle: &str,
    blocks: &[DocumentBlock],
    context_window: usize,
) -> Option<Citation> {
    if needle.trim().is_empty() {
        return None;
    }

    let mut normalized_hit: Option<Citation> = None;

    for block in blocks {
        if let Some(span) = find_span(&block.text_content, needle) {
            if span.exact {
                return Some(citation_for_span(block, &span, context_window, true));
            }
            if normalized_hit.is_none() {
                normalized_hit = Some(citation_for_span(block, &span, context_window, false));
            }
        }
    }

    normalized_hit
}

struct MatchSpan {
    start: usize,
    end: usize,
    exact: bool,
}

/// Locate `needle` inside `text`: byte-exact first, then under
/// normalization with the span mapped back to original bytes.
fn find_span(text: &str, needle: &str) -> Option<MatchSpan> {
    if needle.is_empty() {
        return None;
    }

    if let Some(start) = text.find(needle) {
        return Some(MatchSpan { start, end: start + needle.len(), exact: true });
    }

    let (norm_text, spans) = normalize_with_spans(text);
    let (norm_needle, _) = normalize_with_spans(needle);
    let norm_needle = norm_needle.trim();
    if norm_needle.is_empty() {
        return None;
    }

    let hit = norm_text.find(norm_needle)?;
    let char_start = norm_text[..hit].chars().count();
    let char_len = norm_needle.chars().count();

    let first = spans.get(char_start)?;
    let last = spans.get(char_start + char_len - 1)?;
    Some(MatchSpan { start: first.0, end: last.1, exact: false })
}

/// Lowercase, collapse whitespace runs, and drop currency symbols and
/// thousands separators. Returns the normalized string plus, per normalized
/// char, the original byte range it came from.
fn normalize_with_spans(text: &str) -> (String, Vec<(usize, usize)>) {
    let mut normalized = String::with_capacity(text.len());
    let mut spans: Vec<(usize, usize)> = Vec::with_capacity(text.len());
    let mut last_was_space = true;

    for (offset, ch) in text.char_indices() {
        let range = (offset, offset + ch.len_utf8());

        if ch.is_whitespace() {
            if !last_was_space {
                normalized.push(' ');
                spans.push(range);
                last_was_space = true;
            }
            continue;
        }
        if matches!(ch, '$' | '€' | '£' | ',') {
            continue;
        }

        last_was_space = false;
        for lower in ch.to_lowercase() {
            normalized.push(lower);
            spans.push(range);
        }
    }

    // Trailing collapsed space would map a span past the last real char
    if normalized.ends_with(' ') {
        normalized.pop();
        spans.pop();
    }

    (normalized, spans)
}

fn citation_for_span(
    block: &DocumentBlock,
    span: &MatchSpan,
    context_window: usize,
    is_exact_match: bool,
) -> Citation {
    let text = &block.text_content;

    let before: String = {
        let chars: Vec<char> = text[..span.start].chars().collect();
        let skip = chars.len().saturating_sub(context_window);
        chars[skip..].iter().collect()
    };
    let after: String = text[span.end..].chars().take(context_window).collect();

    Citation {
        source_page: block.page,
        source_bbox: block.bbox,
        source_text: text[span.start..span.end].to_string(),
        context_before: before,
        context_after: after,
        is_exact_match,
    }
}
