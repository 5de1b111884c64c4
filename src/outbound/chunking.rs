//! Markdown-aware text chunking
//!
//! Channels cap message length; long assistant replies are split at
//! paragraph boundaries, then sentences, then hard offsets, while fenced
//! code blocks stay intact.

/// Fallback limit when a channel reports 0
const DEFAULT_LIMIT: usize = 4000;

/// Split `text` into non-empty chunks of at most `limit` bytes.
///
/// Paragraphs (`\n\n`) are the preferred boundary; an oversized paragraph
/// falls back to sentence splits, then to hard splits on the last newline
/// or char boundary before the limit.
#[must_use]
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    let limit = if limit == 0 { DEFAULT_LIMIT } else { limit };
    if text.trim().is_empty() {
        return Vec::new();
    }
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    pack_segments(&split_paragraphs(text), limit)
}

/// Paragraph segments with fenced code blocks kept atomic
fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        if let Some(fence_start) = rest.find("```") {
            // Plain text before the fence
            let before = &rest[..fence_start];
            segments.extend(before.split("\n\n").filter(|s| !s.trim().is_empty()));

            // The fence itself, through its closing marker
            let after_open = &rest[fence_start + 3..];
            let fence_end = after_open
                .find("```")
                .map_or(rest.len(), |i| fence_start + 3 + i + 3);
            let fence_end = fence_end.min(rest.len());
            segments.push(&rest[fence_start..fence_end]);
            rest = &rest[fence_end..];
        } else {
            segments.extend(rest.split("\n\n").filter(|s| !s.trim().is_empty()));
            break;
        }
    }

    segments
}

/// Greedily pack segments into chunks, splitting oversized ones
fn pack_segments(segments: &[&str], limit: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for segment in segments {
        let trimmed = segment.trim();
        if trimmed.is_empty() {
            continue;
        }

        let joined_len = if current.is_empty() {
            trimmed.len()
        } else {
            current.len() + 2 + trimmed.len()
        };

        if joined_len <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(trimmed);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if trimmed.len() <= limit {
            current.push_str(trimmed);
        } else {
            chunks.extend(split_oversized(trimmed, limit));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Sentence-first split for a single oversized segment
fn split_oversized(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if current.len() + sentence.len() <= limit {
            current.push_str(sentence);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current).trim().to_string());
        }
        if sentence.len() <= limit {
            current.push_str(sentence);
        } else {
            chunks.extend(hard_split(sentence, limit));
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Split on sentence-ending punctuation, punctuation stays attached
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1] == b' ' {
            segments.push(&text[start..=i + 1]);
            start = i + 2;
            i = start;
        } else {
            i += 1;
        }
    }
    if start < text.len() {
        segments.push(&text[start..]);
    }
    segments
}

/// Last-resort split at the limit, preferring the last newline and always
/// landing on a char boundary
fn hard_split(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > limit {
        let window = &rest[..floor_char_boundary(rest, limit)];
        let cut = window.rfind('\n').map_or(window.len(), |p| p + 1);
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    let tail = rest.trim();
    if !tail.is_empty() {
        chunks.push(tail.to_string());
    }
    chunks
}

/// Largest index ≤ `at` that is a char boundary
fn floor_char_boundary(text: &str, at: usize) -> usize {
    let mut idx = at.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
