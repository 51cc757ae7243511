//! Canonical field names for SELECT / GROUP BY expressions.

use regex::Regex;
use std::sync::OnceLock;

use super::scan::{depth_map, is_ident_byte, unwrap_call};

/// Words that can end an expression but are never an implicit alias.
const NON_ALIAS_WORDS: &[&str] = &[
    "end", "asc", "desc", "null", "true", "false", "distinct", "all", "and", "or", "not", "else",
    "then", "when", "is", "in", "like", "between", "case", "from",
];

fn qualified_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(?:[A-Za-z_][\w$]*|"[^"]+")(?:\s*\.\s*(?:[A-Za-z_][\w$]*|"[^"]+"))+$"#)
            .expect("valid qualified identifier regex")
    })
}

fn inner_qualifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-z_][a-z0-9_]*\.").expect("valid qualifier regex"))
}

fn trailing_cast_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)::\s*[a-z_][a-z0-9_ ]*(?:\(\s*\d+(?:\s*,\s*\d+)?\s*\))?\s*$")
            .expect("valid cast regex")
    })
}

fn extract_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)^\s*(\w+)\s+from\s+(.+)$").expect("valid extract regex"))
}

fn date_trunc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*'(\w+)'\s*,\s*(.+)$").expect("valid date_trunc regex")
    })
}

/// Split a SELECT item into its expression and alias (explicit `AS alias`
/// or a trailing bare identifier).
pub fn split_alias(item: &str) -> (&str, Option<String>) {
    let item = item.trim();
    let bytes = item.as_bytes();
    let map = depth_map(item);

    // Explicit alias: last depth-0 " AS ".
    let mut i = bytes.len();
    while i >= 2 {
        i -= 1;
        if map[i] == 0
            && bytes[i - 1].eq_ignore_ascii_case(&b'a')
            && bytes[i].eq_ignore_ascii_case(&b's')
            && map[i - 1] == 0
            && (i + 1 == bytes.len() || bytes[i + 1].is_ascii_whitespace())
            && (i < 2 || bytes[i - 2].is_ascii_whitespace() || bytes[i - 2] == b')')
        {
            let expr = item[..i - 1].trim_end();
            let alias = item[i + 1..].trim();
            if !expr.is_empty() && is_alias_token(alias) {
                return (expr, Some(unquote(alias).to_lowercase()));
            }
        }
    }

    // Implicit alias: `expr alias` where the last token is a plain identifier.
    if let Some(ws) = (0..bytes.len())
        .rev()
        .find(|&j| map[j] == 0 && bytes[j].is_ascii_whitespace())
    {
        let expr = item[..ws].trim_end();
        let alias = item[ws + 1..].trim();
        let last = expr.as_bytes().last().copied();
        let expr_ends_cleanly =
            matches!(last, Some(b) if is_ident_byte(b) || b == b')' || b == b'"' || b == b'\'');
        let prev_word = expr
            .rsplit(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if expr_ends_cleanly
            && is_alias_token(alias)
            && !NON_ALIAS_WORDS.contains(&alias.to_ascii_lowercase().as_str())
            && !NON_ALIAS_WORDS.contains(&prev_word.as_str())
            && !expr.to_ascii_lowercase().starts_with("case")
        {
            return (expr, Some(unquote(alias).to_lowercase()));
        }
    }

    (item, None)
}

fn is_alias_token(token: &str) -> bool {
    let unquoted = unquote(token);
    if unquoted.len() != token.len() {
        return !unquoted.is_empty();
    }
    let bytes = token.as_bytes();
    !bytes.is_empty()
        && (bytes[0].is_ascii_alphabetic() || bytes[0] == b'_' || bytes[0] >= 0x80)
        && bytes.iter().all(|b| is_ident_byte(*b))
}

fn unquote(token: &str) -> &str {
    let t = token.trim();
    let b = t.as_bytes();
    if b.len() >= 2
        && ((b[0] == b'"' && b[b.len() - 1] == b'"')
            || (b[0] == b'`' && b[b.len() - 1] == b'`')
            || (b[0] == b'[' && b[b.len() - 1] == b']'))
    {
        return &t[1..t.len() - 1];
    }
    t
}

/// Canonical name for a SELECT or GROUP BY entry: the alias when present,
/// otherwise the normalised expression.
pub fn normalize_field_name(expr: &str) -> String {
    match split_alias(expr) {
        (_, Some(alias)) => alias,
        (inner, None) => normalize_expression(inner),
    }
}

/// Normalise an expression without alias resolution.
pub fn normalize_expression(expr: &str) -> String {
    let mut expr = expr.trim();

    // trailing `::type` casts
    while let Some(m) = trailing_cast_re().find(expr) {
        expr = expr[..m.start()].trim_end();
    }

    if let Some((name, inner)) = unwrap_call(expr) {
        match name.as_str() {
            "extract" | "date_part" => {
                if let Some(part) = extract_part(&name, inner) {
                    return part;
                }
            }
            "date_trunc" => {
                if let Some(caps) = date_trunc_re().captures(inner) {
                    return match caps[1].to_ascii_lowercase().as_str() {
                        "month" => "mes".to_string(),
                        "year" => "anio".to_string(),
                        "day" => "fecha".to_string(),
                        _ => normalize_expression(&caps[2]),
                    };
                }
            }
            "date" | "to_char" | "to_date" | "to_timestamp" | "trunc" | "cast" | "try_cast" => {
                if let Some(first) = first_argument(&name, inner) {
                    return normalize_expression(first);
                }
            }
            _ => {}
        }
    }

    if qualified_ident_re().is_match(expr) {
        if let Some(last) = expr.rsplit('.').next() {
            return unquote(last.trim()).to_lowercase();
        }
    }
    let unquoted = unquote(expr);
    if unquoted.len() != expr.len() {
        return unquoted.to_lowercase();
    }

    let collapsed = expr.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    inner_qualifier_re().replace_all(&collapsed, "").into_owned()
}

fn extract_part(name: &str, inner: &str) -> Option<String> {
    let part = if name == "extract" {
        extract_re().captures(inner)?.get(1)?.as_str().to_ascii_lowercase()
    } else {
        date_trunc_re().captures(inner)?.get(1)?.as_str().to_ascii_lowercase()
    };
    Some(
        match part.as_str() {
            "year" => "anio",
            "month" => "mes",
            "day" => "dia",
            other => other,
        }
        .to_string(),
    )
}

fn first_argument<'a>(name: &str, inner: &'a str) -> Option<&'a str> {
    let map = depth_map(inner);
    let bytes = inner.as_bytes();
    if name == "cast" || name == "try_cast" {
        // CAST(x AS type)
        let lower = inner.to_ascii_lowercase();
        let mut search = 0;
        while let Some(rel) = lower[search..].find(" as ") {
            let pos = search + rel;
            if map[pos + 1] == 0 {
                return Some(inner[..pos].trim());
            }
            search = pos + 1;
        }
        return None;
    }
    let end = (0..bytes.len())
        .find(|&i| bytes[i] == b',' && map[i] == 0)
        .unwrap_or(bytes.len());
    let first = inner[..end].trim();
    (!first.is_empty()).then_some(first)
}
