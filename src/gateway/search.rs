//! Per-page text matching
//!
//! Positions are character offsets. Case-insensitive matching folds each
//! character to the first character of its lowercase mapping, which keeps
//! folded and original offsets aligned.

fn fold(c: char, case_sensitive: bool) -> char {
    if case_sensitive {
        c
    } else {
        c.to_lowercase().next().unwrap_or(c)
    }
}

/// Non-overlapping matches of `query` in `text`, as (position, context)
///
/// At most `limit` matches are returned. Context spans `context_chars`
/// characters on each side with line breaks flattened to spaces.
pub(crate) fn find_matches(
    text: &str,
    query: &str,
    case_sensitive: bool,
    context_chars: usize,
    limit: usize,
) -> Vec<(usize, String)> {
    let needle: Vec<char> = query.chars().map(|c| fold(c, case_sensitive)).collect();
    if needle.is_empty() || limit == 0 {
        return Vec::new();
    }

    let original: Vec<char> = text.chars().collect();
    let haystack: Vec<char> = original.iter().map(|&c| fold(c, case_sensitive)).collect();

    let mut matches = Vec::new();
    let mut pos = 0;
    while pos + needle.len() <= haystack.len() && matches.len() < limit {
        if haystack[pos..pos + needle.len()] == needle[..] {
            let start = pos.saturating_sub(context_chars);
            let end = (pos + needle.len() + context_chars).min(original.len());
            let context: String = original[start..end]
                .iter()
                .map(|&c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect();
            matches.push((pos, context.trim().to_string()));
            pos += needle.len();
        } else {
            pos += 1;
        }
    }
    matches
}
