//! Quote- and parenthesis-aware scanning over raw SQL text.
//!
//! Clause extraction never tokenizes the statement fully. Instead every byte
//! is tagged with the parenthesis depth it sits at, or `-1` when it belongs
//! to a quoted literal or a comment. Keyword and comma searches then only
//! look at depth-0 code bytes.

/// Depth tag for bytes inside literals and comments.
pub(crate) const NOT_CODE: i32 = -1;

/// Tag every byte of `sql` with its parenthesis depth (or [`NOT_CODE`]).
pub(crate) fn depth_map(sql: &str) -> Vec<i32> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut map = vec![NOT_CODE; len];
    let mut depth: i32 = 0;
    let mut i = 0;

    while i < len {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < len && bytes[i] != quote {
                    i += 1;
                }
                // closing quote; a doubled quote simply reopens on the next pass
                i += 1;
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < len && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            b'(' => {
                map[i] = depth;
                depth += 1;
            }
            b')' => {
                depth = (depth - 1).max(0);
                map[i] = depth;
            }
            _ => map[i] = depth,
        }
        i += 1;
    }

    map
}

pub(crate) fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Try to match a (possibly multi-word) keyword at `pos`. Words must be
/// separated by whitespace and bounded by non-identifier bytes. Returns the
/// byte offset just past the keyword.
fn match_keyword_at(bytes: &[u8], map: &[i32], pos: usize, words: &[&str]) -> Option<usize> {
    let mut j = pos;
    for (idx, word) in words.iter().enumerate() {
        let end = j + word.len();
        if end > bytes.len() || !bytes[j..end].eq_ignore_ascii_case(word.as_bytes()) {
            return None;
        }
        if map[j..end].iter().any(|d| *d != 0) {
            return None;
        }
        j = end;
        if idx + 1 < words.len() {
            let ws_start = j;
            while j < bytes.len() && map[j] == 0 && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j == ws_start {
                return None;
            }
        }
    }
    if j < bytes.len() && is_ident_byte(bytes[j]) {
        return None;
    }
    Some(j)
}

/// Find the first depth-0 occurrence of `keyword` in `sql[from..to]`.
/// Returns `(start, end)` byte offsets of the keyword itself.
pub(crate) fn find_keyword(
    sql: &str,
    map: &[i32],
    keyword: &str,
    from: usize,
    to: usize,
) -> Option<(usize, usize)> {
    let bytes = sql.as_bytes();
    let words: Vec<&str> = keyword.split_whitespace().collect();
    let to = to.min(bytes.len());
    let mut i = from;

    while i < to {
        if map[i] == 0
            && bytes[i].is_ascii_alphabetic()
            && (i == 0 || !is_ident_byte(bytes[i - 1]))
        {
            if let Some(end) = match_keyword_at(bytes, map, i, &words) {
                if end <= to {
                    return Some((i, end));
                }
            }
        }
        i += 1;
    }
    None
}

/// Earliest depth-0 start offset among `keywords` in `sql[from..to]`.
pub(crate) fn find_first_of(
    sql: &str,
    map: &[i32],
    keywords: &[&str],
    from: usize,
    to: usize,
) -> Option<usize> {
    keywords
        .iter()
        .filter_map(|kw| find_keyword(sql, map, kw, from, to).map(|(start, _)| start))
        .min()
}

/// Split `text` on depth-0 commas. Entries are trimmed; empty entries dropped.
pub(crate) fn split_top_level(text: &str) -> Vec<String> {
    let map = depth_map(text);
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;

    for (i, b) in bytes.iter().enumerate() {
        if *b == b',' && map[i] == 0 {
            parts.push(text[start..i].trim().to_string());
            start = i + 1;
        }
    }
    parts.push(text[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// If `expr` is a single call `name(...)` spanning the whole text, return the
/// lower-cased function name and the text between the outer parentheses.
pub(crate) fn unwrap_call(expr: &str) -> Option<(String, &str)> {
    let expr = expr.trim();
    let bytes = expr.as_bytes();
    let name_end = bytes.iter().position(|b| !is_ident_byte(*b))?;
    if name_end == 0 || !bytes[0].is_ascii_alphabetic() {
        return None;
    }
    let mut open = name_end;
    while open < bytes.len() && bytes[open].is_ascii_whitespace() {
        open += 1;
    }
    if bytes.get(open) != Some(&b'(') {
        return None;
    }

    let map = depth_map(expr);
    let close = (open + 1..bytes.len()).find(|&i| bytes[i] == b')' && map[i] == 0)?;
    if close != bytes.len() - 1 {
        return None;
    }
    Some((expr[..name_end].to_ascii_lowercase(), &expr[open + 1..close]))
}
