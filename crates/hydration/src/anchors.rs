//! Structural anchor extraction from the user's query.
//!
//! Anchors are deterministic and have no tuning knobs: filepath mentions at
//! priority 100, symbol mentions at 90, previously hydrated entities at 80.

use std::sync::OnceLock;

use regex::Regex;

pub const PRIORITY_FILEPATH: u8 = 100;
pub const PRIORITY_SYMBOL: u8 = 90;
pub const PRIORITY_SESSION: u8 = 80;

/// Common words that look like identifiers but never name code the user is
/// asking about. Filtering these keeps prose from anchoring entities.
const SYMBOL_STOPLIST: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "have", "will",
    "can", "you", "please", "function", "method", "class", "type", "file",
    "code", "write", "make", "add", "new", "now", "use", "fix", "update",
    "change", "return", "value", "test", "tests", "error", "into", "then",
    "when", "what", "how", "why", "should", "would", "could", "like",
];

fn filepath_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_\-./]+\.(?:go|rs|py|pyi|js|jsx|mjs|cjs|ts|tsx|mts)\b")
            .unwrap_or_else(|_| Regex::new(r"$a").unwrap())
    })
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]{2,}\b")
            .unwrap_or_else(|_| Regex::new(r"$a").unwrap())
    })
}

/// Extension-aware filepath mentions, in query order, deduplicated.
pub fn filepath_mentions(query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in filepath_regex().find_iter(query) {
        let mention = m.as_str().to_string();
        if !out.contains(&mention) {
            out.push(mention);
        }
    }
    out
}

/// Identifier-shaped mentions minus the stoplist, in query order.
pub fn symbol_mentions(query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in identifier_regex().find_iter(query) {
        let mention = m.as_str();
        if SYMBOL_STOPLIST.contains(&mention.to_lowercase().as_str()) {
            continue;
        }
        if !out.iter().any(|existing| existing == mention) {
            out.push(mention.to_string());
        }
    }
    out
}

/// Whether a state-map filepath matches a query mention. Mentions are often
/// suffixes (`add.go` for `/home/user/proj/add.go`).
pub fn filepath_matches(row_filepath: &str, mention: &str) -> bool {
    row_filepath == mention
        || row_filepath.ends_with(&format!("/{mention}"))
        || mention.ends_with(&format!("/{row_filepath}"))
}
