//! Character-based pagination over cached text.

use serde::Serialize;

/// One slice of a cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub content: String,
    /// Character offset this page starts at.
    pub offset: usize,
    /// Where the next page starts, or `None` on the last page.
    pub next_offset: Option<usize>,
    pub total_chars: usize,
}

/// Slice `text` by characters so a page never splits a code point.
pub fn paginate(text: &str, offset: usize, limit: usize) -> Page {
    let total_chars = text.chars().count();
    let offset = offset.min(total_chars);
    let limit = limit.max(1);
    let content: String = text.chars().skip(offset).take(limit).collect();
    let end = offset + content.chars().count();
    Page {
        content,
        offset,
        next_offset: (end < total_chars).then_some(end),
        total_chars,
    }
}
