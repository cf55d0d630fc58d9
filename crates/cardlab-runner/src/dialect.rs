//! Text normalization applied to every parsed query.
//!
//! The corpora are generated with SQL Server flavoured templates; the engine
//! speaks DuckDB. This is a fixed set of textual rewrites, not a SQL parser.

use std::sync::OnceLock;

use regex::Regex;

struct Rewrite {
    pattern: Regex,
    replacement: &'static str,
}

fn rewrites() -> &'static [Rewrite] {
    static REWRITES: OnceLock<Vec<Rewrite>> = OnceLock::new();
    REWRITES.get_or_init(|| {
        [
            (r"(?i)\bselect\s+top\s+\d+\s+", "select "),
            (r"(?im)\blimit\s+\d+\s*;?\s*$", ""),
            (r"(?i)\+\s*(\d+)\s+days\b", "+ INTERVAL '${1} days'"),
            (r"(?i)-\s*(\d+)\s+days\b", "- INTERVAL '${1} days'"),
            (r"(?i)\+\s*(\d+)\s+day\b", "+ INTERVAL '${1} day'"),
            (r"(?i)-\s*(\d+)\s+day\b", "- INTERVAL '${1} day'"),
            // Reserved words used as bare column aliases.
            (r"\) at,", ") \"at\","),
            (r"\) returns\b", ") \"returns\""),
            (r" as returns\b", " as \"returns\""),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| {
            Regex::new(pattern)
                .ok()
                .map(|pattern| Rewrite { pattern, replacement })
        })
        .collect()
    })
}

/// Rewrites `sql` into the engine's dialect. Text with nothing to rewrite is
/// returned unchanged.
pub fn normalize(sql: &str) -> String {
    let mut out = sql.to_string();
    for rewrite in rewrites() {
        if rewrite.pattern.is_match(&out) {
            out = rewrite
                .pattern
                .replace_all(&out, rewrite.replacement)
                .into_owned();
        }
    }
    out
}
