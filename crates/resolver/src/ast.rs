//! Syntax-tree outline extraction: top-level named declarations plus a node
//! count, per grammar.

use tree_sitter::{Node, Parser};

use crate::language::Language;

/// Outline of an artifact's top-level structure.
#[derive(Debug, Clone)]
pub struct AstOutline {
    /// All top-level named declarations, in document order.
    pub symbols: Vec<String>,
    /// The primary symbol: first function-like declaration, else the first
    /// declaration of any kind.
    pub primary: Option<String>,
    /// Named-node count across the whole tree.
    pub node_count: u64,
    pub has_errors: bool,
}

fn grammar(language: Language) -> tree_sitter::Language {
    match language {
        Language::Go => tree_sitter_go::LANGUAGE.into(),
        Language::Rust => tree_sitter_rust::LANGUAGE.into(),
        Language::Python => tree_sitter_python::LANGUAGE.into(),
        Language::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    }
}

/// Parse `content` and collect its top-level declarations.
///
/// Returns `None` when the grammar fails to load or produce a tree at all;
/// a tree with error nodes still returns an outline (with `has_errors` set)
/// so the caller can decide to fall through to the regex path.
pub fn outline(language: Language, content: &str) -> Option<AstOutline> {
    let mut parser = Parser::new();
    parser.set_language(&grammar(language)).ok()?;
    let tree = parser.parse(content, None)?;
    let root = tree.root_node();

    let mut symbols = Vec::new();
    let mut primary = None;
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        collect_declaration(language, child, content, &mut symbols, &mut primary);
    }

    if primary.is_none() {
        primary = symbols.first().cloned();
    }

    Some(AstOutline {
        symbols,
        primary,
        node_count: count_named_nodes(root),
        has_errors: root.has_error(),
    })
}

fn collect_declaration(
    language: Language,
    node: Node<'_>,
    source: &str,
    symbols: &mut Vec<String>,
    primary: &mut Option<String>,
) {
    let kind = node.kind();
    match language {
        Language::Go => match kind {
            "function_declaration" | "method_declaration" => {
                push_named(node, source, symbols, primary, true);
            }
            "type_declaration" => {
                let mut cursor = node.walk();
                for spec in node.named_children(&mut cursor) {
                    if spec.kind() == "type_spec" {
                        push_named(spec, source, symbols, primary, false);
                    }
                }
            }
            _ => {}
        },
        Language::Rust => match kind {
            "function_item" => push_named(node, source, symbols, primary, true),
            "struct_item" | "enum_item" | "trait_item" | "type_item" | "union_item" => {
                push_named(node, source, symbols, primary, false);
            }
            _ => {}
        },
        Language::Python => match kind {
            "function_definition" => push_named(node, source, symbols, primary, true),
            "class_definition" => push_named(node, source, symbols, primary, false),
            "decorated_definition" => {
                if let Some(inner) = node.child_by_field_name("definition") {
                    collect_declaration(language, inner, source, symbols, primary);
                }
            }
            _ => {}
        },
        Language::JavaScript | Language::TypeScript => match kind {
            "function_declaration" | "generator_function_declaration" => {
                push_named(node, source, symbols, primary, true);
            }
            "class_declaration" | "abstract_class_declaration" => {
                push_named(node, source, symbols, primary, false);
            }
            "interface_declaration" | "type_alias_declaration" | "enum_declaration" => {
                push_named(node, source, symbols, primary, false);
            }
            "lexical_declaration" | "variable_declaration" => {
                let mut cursor = node.walk();
                for declarator in node.named_children(&mut cursor) {
                    if declarator.kind() != "variable_declarator" {
                        continue;
                    }
                    let is_function = declarator
                        .child_by_field_name("value")
                        .map(|value| {
                            matches!(
                                value.kind(),
                                "arrow_function" | "function_expression" | "function"
                            )
                        })
                        .unwrap_or(false);
                    if is_function {
                        push_named(declarator, source, symbols, primary, true);
                    }
                }
            }
            "export_statement" => {
                if let Some(inner) = node.child_by_field_name("declaration") {
                    collect_declaration(language, inner, source, symbols, primary);
                }
            }
            _ => {}
        },
    }
}

fn push_named(
    node: Node<'_>,
    source: &str,
    symbols: &mut Vec<String>,
    primary: &mut Option<String>,
    function_like: bool,
) {
    let Some(name) = node.child_by_field_name("name") else {
        return;
    };
    let Ok(text) = name.utf8_text(source.as_bytes()) else {
        return;
    };
    let symbol = text.to_string();
    if function_like && primary.is_none() {
        *primary = Some(symbol.clone());
    }
    if !symbols.contains(&symbol) {
        symbols.push(symbol);
    }
}

fn count_named_nodes(node: Node<'_>) -> u64 {
    let mut count = if node.is_named() { 1 } else { 0 };
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        count += count_named_nodes(child);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn go_function_outline() {
        let outline = outline(
            Language::Go,
            "func Add(a, b int) int { return a + b }",
        )
        .unwrap();
        assert_eq!(outline.primary.as_deref(), Some("Add"));
        assert_eq!(outline.symbols, vec!["Add"]);
        assert!(!outline.has_errors);
        assert!(outline.node_count >= 8, "node_count = {}", outline.node_count);
    }

    #[test]
    fn go_multi_declaration_keeps_document_order() {
        let source = "package math\n\ntype Calc struct{}\n\nfunc Add(a, b int) int { return a + b }\n\nfunc Sub(a, b int) int { return a - b }\n";
        let outline = outline(Language::Go, source).unwrap();
        assert_eq!(outline.symbols, vec!["Calc", "Add", "Sub"]);
        // Primary prefers the first function-like declaration over the type.
        assert_eq!(outline.primary.as_deref(), Some("Add"));
    }

    #[test]
    fn rust_items_are_collected() {
        let source = "pub struct Ledger;\n\npub fn append(entry: &str) -> usize { entry.len() }\n";
        let outline = outline(Language::Rust, source).unwrap();
        assert_eq!(outline.symbols, vec!["Ledger", "append"]);
        assert_eq!(outline.primary.as_deref(), Some("append"));
    }

    #[test]
    fn python_decorated_function_resolves_to_inner_name() {
        let source = "@lru_cache\ndef add(a, b):\n    return a + b\n";
        let outline = outline(Language::Python, source).unwrap();
        assert_eq!(outline.primary.as_deref(), Some("add"));
    }

    #[test]
    fn typescript_interface_and_arrow_function() {
        let source = "export interface Budget { maxTokens: number }\n\nexport const estimate = (chars: number) => Math.ceil(chars / 4)\n";
        let outline = outline(Language::TypeScript, source).unwrap();
        assert_eq!(outline.symbols, vec!["Budget", "estimate"]);
        assert_eq!(outline.primary.as_deref(), Some("estimate"));
    }

    #[test]
    fn truncated_source_reports_errors() {
        let outline = outline(Language::Go, "func Add(a, b int").unwrap();
        assert!(outline.has_errors);
    }

    #[test]
    fn type_only_artifact_primary_falls_back_to_first_symbol() {
        let outline = outline(Language::Go, "package m\n\ntype Vault struct{ n int }\n").unwrap();
        assert_eq!(outline.primary.as_deref(), Some("Vault"));
    }
}
