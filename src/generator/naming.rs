use std::collections::BTreeMap;

use super::ConnectorRole;

/// `<pipeline>-<role>-<schema>`, lower-cased, anything outside `[a-z0-9._-]` mapped to `-`.
pub fn connector_name(pipeline: &str, role: ConnectorRole, schema: &str) -> String {
    let pipeline = pipeline.trim();
    if pipeline.is_empty() {
        return String::new();
    }
    let schema = schema.trim();
    let raw = if schema.is_empty() {
        format!("{}-{}", pipeline, role)
    } else {
        format!("{}-{}-{}", pipeline, role, schema)
    };
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '-',
        })
        .collect()
}

/// Table part of a `<prefix>.<schema>.<table>` topic: the last dot segment.
pub fn table_of(topic: &str) -> &str {
    topic.rsplit('.').next().unwrap_or(topic)
}

/// `(schema, table)` of a topic; topics with fewer than three segments fall back to `default_schema`.
pub(crate) fn schema_table_of<'a>(topic: &'a str, default_schema: &'a str) -> (&'a str, &'a str) {
    let parts: Vec<&str> = topic.split('.').collect();
    match parts.len() {
        n if n >= 3 => (parts[n - 2], parts[n - 1]),
        _ => (default_schema, table_of(topic)),
    }
}

/// Explicit mapping wins, otherwise the naming convention.
pub(crate) fn resolve_table<'a>(topic: &'a str, map: &'a BTreeMap<String, String>) -> &'a str {
    map.get(topic)
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| table_of(topic))
}

/// Escape a literal for use inside a Java regex.
pub(crate) fn regex_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    for c in raw.chars() {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Lower-case identifier restricted to `[a-z0-9_]`, at most `max_len` chars.
pub(crate) fn identifier(raw: &str, max_len: usize) -> String {
    raw.trim()
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .take(max_len)
        .collect()
}

/// Join non-empty entries with `,`, dropping duplicates but keeping first-seen order.
pub(crate) fn join_unique<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    for item in items {
        if !item.is_empty() && !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen.join(",")
}
