//! Regex fallback table.
//!
//! Patterns live in `patterns.toml`: data, not code. The compiled-in copy
//! is the default; deployments can override it with a file on disk.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::language::Language;

const DEFAULT_PATTERNS: &str = include_str!("../patterns.toml");

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(flatten)]
    languages: HashMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    patterns: Vec<String>,
}

#[derive(Debug)]
pub struct PatternTable {
    by_language: HashMap<Language, Vec<Regex>>,
}

impl PatternTable {
    pub fn load_default() -> Result<Self> {
        Self::from_toml(DEFAULT_PATTERNS).context("compiled-in patterns.toml")
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading pattern table {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("pattern table {}", path.display()))
    }

    fn from_toml(raw: &str) -> Result<Self> {
        let table: RawTable = toml::from_str(raw)?;
        let mut by_language = HashMap::new();
        for (slug, entry) in table.languages {
            let language = match slug.as_str() {
                "go" => Language::Go,
                "rust" => Language::Rust,
                "python" => Language::Python,
                "javascript" => Language::JavaScript,
                "typescript" => Language::TypeScript,
                other => anyhow::bail!("unknown language section {other:?}"),
            };
            let mut compiled = Vec::with_capacity(entry.patterns.len());
            for pattern in &entry.patterns {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("pattern {pattern:?} for {slug}"))?;
                anyhow::ensure!(
                    regex.capture_names().any(|name| name == Some("symbol")),
                    "pattern {pattern:?} for {slug} lacks a `symbol` capture group"
                );
                compiled.push(regex);
            }
            by_language.insert(language, compiled);
        }
        Ok(Self { by_language })
    }

    /// All symbols matched in `content` for `language`, in match order,
    /// deduplicated.
    pub fn symbols(&self, language: Language, content: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let Some(patterns) = self.by_language.get(&language) else {
            return out;
        };
        for regex in patterns {
            for captures in regex.captures_iter(content) {
                if let Some(symbol) = captures.name("symbol") {
                    let symbol = symbol.as_str().to_string();
                    if !out.contains(&symbol) {
                        out.push(symbol);
                    }
                }
            }
        }
        out
    }

    /// Symbols across every language table, used when no language could be
    /// selected for the candidate.
    pub fn symbols_any_language(&self, content: &str) -> Vec<String> {
        let mut out = Vec::new();
        for language in Language::ALL {
            for symbol in self.symbols(language, content) {
                if !out.contains(&symbol) {
                    out.push(symbol);
                }
            }
        }
        out
    }
}
