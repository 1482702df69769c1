use crate::models::features::{extension_of, SymbolSummary};
use tree_sitter::{Language, Node, Parser};

/// Languages whose added lines get symbol counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptLanguage {
    JavaScript,
    TypeScript,
    Tsx,
    Python,
}

impl ScriptLanguage {
    fn grammar(self) -> Language {
        match self {
            ScriptLanguage::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
            ScriptLanguage::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            ScriptLanguage::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            ScriptLanguage::Python => tree_sitter_python::LANGUAGE.into(),
        }
    }
}

pub fn script_language(path: &str) -> Option<ScriptLanguage> {
    match extension_of(path).as_deref() {
        Some("js") | Some("jsx") | Some("mjs") | Some("cjs") => Some(ScriptLanguage::JavaScript),
        Some("ts") | Some("mts") | Some("cts") => Some(ScriptLanguage::TypeScript),
        Some("tsx") => Some(ScriptLanguage::Tsx),
        Some("py") => Some(ScriptLanguage::Python),
        _ => None,
    }
}

/// Count functions, classes and exports among the added lines of one file.
///
/// Starts from a line heuristic and replaces it with a tree-sitter count when
/// the concatenated lines parse cleanly. Fragments that do not parse keep the
/// heuristic result.
pub fn count_added_symbols(added: &[String], language: ScriptLanguage) -> SymbolSummary {
    let heuristic = heuristic_counts(added, language);
    if added.is_empty() {
        return heuristic;
    }

    let source = added.join("\n");
    structural_counts(&source, language).unwrap_or(heuristic)
}

fn heuristic_counts(added: &[String], language: ScriptLanguage) -> SymbolSummary {
    let mut counts = SymbolSummary::default();

    for line in added {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if is_function_declaration(trimmed, language) {
            counts.functions += 1;
        }
        if is_class_declaration(trimmed, language) {
            counts.classes += 1;
        }
        if is_export(trimmed, language) {
            counts.exports += 1;
        }
    }

    counts
}

fn is_function_declaration(line: &str, language: ScriptLanguage) -> bool {
    match language {
        ScriptLanguage::Python => line.starts_with("def ") || line.starts_with("async def "),
        _ => {
            let body = line
                .trim_start_matches("export ")
                .trim_start_matches("default ")
                .trim_start_matches("async ");
            body.starts_with("function ")
                || body.starts_with("function*")
                || ((body.starts_with("const ") || body.starts_with("let "))
                    && line.contains("=>"))
        }
    }
}

fn is_class_declaration(line: &str, language: ScriptLanguage) -> bool {
    match language {
        ScriptLanguage::Python => line.starts_with("class "),
        _ => {
            let body = line
                .trim_start_matches("export ")
                .trim_start_matches("default ")
                .trim_start_matches("abstract ");
            body.starts_with("class ")
        }
    }
}

fn is_export(line: &str, language: ScriptLanguage) -> bool {
    match language {
        ScriptLanguage::Python => line.starts_with("__all__"),
        _ => {
            line.starts_with("export ")
                || line.starts_with("module.exports")
                || line.starts_with("exports.")
        }
    }
}

fn structural_counts(source: &str, language: ScriptLanguage) -> Option<SymbolSummary> {
    let mut parser = Parser::new();
    parser.set_language(&language.grammar()).ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut counts = SymbolSummary::default();
    visit(root, &mut counts);
    Some(counts)
}

fn visit(node: Node<'_>, counts: &mut SymbolSummary) {
    match node.kind() {
        "function_declaration"
        | "generator_function_declaration"
        | "function_expression"
        | "arrow_function"
        | "method_definition"
        | "function_definition" => counts.functions += 1,
        "class_declaration" | "abstract_class_declaration" | "class_definition" => {
            counts.classes += 1
        }
        "export_statement" => counts.exports += 1,
        _ => {}
    }

    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        visit(child, counts);
    }
}
