//! Language selection for the AST path: file extension first, content
//! heuristics when no filepath is known.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Go,
    Rust,
    Python,
    JavaScript,
    TypeScript,
}

impl Language {
    pub fn slug(self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
        }
    }

    pub const ALL: [Language; 5] = [
        Language::Go,
        Language::Rust,
        Language::Python,
        Language::TypeScript,
        Language::JavaScript,
    ];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "go" => Some(Language::Go),
            "rs" => Some(Language::Rust),
            "py" | "pyi" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "ts" | "tsx" | "mts" => Some(Language::TypeScript),
            _ => None,
        }
    }

    /// Cheap content sniffing, consulted only when no extension is known.
    /// Ordered from most to least distinctive marker.
    pub fn from_content(content: &str) -> Option<Self> {
        if content.contains("package ") && content.contains("func ") {
            return Some(Language::Go);
        }
        if content.contains("func ") && content.contains("{") && !content.contains("function ") {
            return Some(Language::Go);
        }
        if content.contains("fn ") && (content.contains("->") || content.contains("let ") || content.contains("impl ")) {
            return Some(Language::Rust);
        }
        if content.contains("def ") && content.contains(":") {
            return Some(Language::Python);
        }
        if content.contains("interface ") || content.contains(": string") || content.contains(": number") {
            return Some(Language::TypeScript);
        }
        if content.contains("function ") || content.contains("=>") || content.contains("const ") {
            return Some(Language::JavaScript);
        }
        None
    }

    pub fn detect(filepath: Option<&str>, content: &str) -> Option<Self> {
        if let Some(path) = filepath {
            if let Some(ext) = path.rsplit('.').next().filter(|ext| *ext != path) {
                if let Some(language) = Self::from_extension(ext) {
                    return Some(language);
                }
            }
        }
        Self::from_content(content)
    }
}
