use crate::models::features::{extension_of, DiffFeatureSummary, FileCategory, SymbolSummary};
use std::collections::BTreeSet;

const CODE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "rs", "java", "kt", "swift", "c", "h",
    "cc", "cpp", "hpp", "cs", "rb", "php", "scala", "vue", "svelte", "sh", "sql",
];

const DOC_EXTENSIONS: &[&str] = &["md", "mdx", "rst", "txt", "adoc"];

const CONFIG_EXTENSIONS: &[&str] = &[
    "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "env", "properties", "xml", "lock",
];

const CONFIG_FILE_NAMES: &[&str] = &[
    "dockerfile", "makefile", ".gitignore", ".editorconfig", ".npmrc", ".nvmrc",
];

const SECURITY_KEYWORDS: &[&str] = &[
    "auth", "security", "crypto", "password", "passwd", "secret", "token", "credential",
    "permission", "oauth", "jwt", "session", "ssl", "tls", "cert", ".pem", "private_key",
];

const DEPENDENCY_MANIFESTS: &[&str] = &[
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "requirements*.txt",
    "Pipfile",
    "Pipfile.lock",
    "pyproject.toml",
    "poetry.lock",
    "go.mod",
    "go.sum",
    "Gemfile",
    "Gemfile.lock",
    "composer.json",
    "composer.lock",
    "pom.xml",
    "build.gradle*",
];

/// Per-file state while scanning one file section of the diff.
struct FileSection {
    path: String,
    added: Vec<String>,
}

/// Parse unified-diff text into a feature summary.
///
/// Never fails: malformed or truncated input yields whatever counts could be
/// recovered. Only empty input produces an empty summary.
pub fn extract_features(diff: &str) -> DiffFeatureSummary {
    let mut summary = DiffFeatureSummary::default();
    let mut current: Option<FileSection> = None;
    let mut symbols = SymbolSummary::default();
    let mut saw_script = false;
    let mut code_extensions = BTreeSet::new();
    // Between a file header and its first hunk, `---`/`+++` lines are markers.
    let mut in_header = false;
    // Old-side path of a plain `---`/`+++` pair, used when the new side is /dev/null.
    let mut old_path: Option<String> = None;
    let mut lines = diff.lines().peekable();

    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish_section(current.take(), &mut symbols, &mut saw_script);
            let path = parse_git_header_path(rest);
            current = Some(start_section(&mut summary, &mut code_extensions, path));
            in_header = true;
            continue;
        }

        if line.starts_with("@@") {
            summary.hunks += 1;
            in_header = false;
            continue;
        }

        if line.starts_with("rename from ") || line.starts_with("copy from ") {
            summary.renames += 1;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            if in_header {
                continue;
            }
            if lines.peek().is_some_and(|next| next.starts_with("+++ ")) {
                // Plain unified diffs have no `diff --git` line; each marker pair opens a section.
                finish_section(current.take(), &mut symbols, &mut saw_script);
                old_path = strip_diff_prefix(rest.trim());
                in_header = true;
                continue;
            }
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            if in_header {
                if current.is_none() {
                    let path = strip_diff_prefix(rest.trim()).or_else(|| old_path.take());
                    if let Some(path) = path {
                        current = Some(start_section(&mut summary, &mut code_extensions, path));
                    }
                }
                old_path = None;
                continue;
            }
        }

        if in_header {
            continue;
        }

        if let Some(added) = line.strip_prefix('+') {
            summary.additions += 1;
            if let Some(section) = current.as_mut() {
                section.added.push(added.to_string());
            }
        } else if line.starts_with('-') {
            summary.deletions += 1;
        }
    }

    finish_section(current.take(), &mut symbols, &mut saw_script);

    summary.languages = code_extensions.len();
    if saw_script {
        summary.symbols = Some(symbols);
    }

    summary
}

fn start_section(
    summary: &mut DiffFeatureSummary,
    code_extensions: &mut BTreeSet<String>,
    path: String,
) -> FileSection {
    summary.total_files += 1;

    match classify_path(&path) {
        Some(FileCategory::Code) => {
            summary.code_files += 1;
            if let Some(ext) = extension_of(&path) {
                code_extensions.insert(ext);
            }
        }
        Some(FileCategory::Doc) => summary.doc_files += 1,
        Some(FileCategory::Test) => summary.test_files += 1,
        Some(FileCategory::Config) => summary.config_files += 1,
        None => {}
    }

    if let Some(ext) = extension_of(&path) {
        *summary.extensions.entry(ext).or_insert(0) += 1;
    }
    if is_dependency_manifest(&path) {
        summary.dependency_changes = true;
    }
    if is_security_sensitive(&path) {
        summary.security_sensitive = true;
    }

    summary.paths.push(path.clone());
    FileSection {
        path,
        added: Vec::new(),
    }
}

fn finish_section(section: Option<FileSection>, symbols: &mut SymbolSummary, saw_script: &mut bool) {
    let Some(section) = section else {
        return;
    };
    let Some(language) = super::symbols::script_language(&section.path) else {
        return;
    };

    *saw_script = true;
    let counted = super::symbols::count_added_symbols(&section.added, language);
    symbols.add(&counted);
}

/// `diff --git a/x b/y` → `y`. Falls back to the last token for odd headers.
fn parse_git_header_path(rest: &str) -> String {
    if let Some(idx) = rest.find(" b/") {
        return rest[idx + 3..].trim().to_string();
    }
    rest.split_whitespace()
        .last()
        .map(|token| strip_diff_prefix(token).unwrap_or_else(|| token.to_string()))
        .unwrap_or_default()
}

fn strip_diff_prefix(path: &str) -> Option<String> {
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    let stripped = path
        .strip_prefix("b/")
        .or_else(|| path.strip_prefix("a/"))
        .unwrap_or(path);
    Some(stripped.to_string())
}

/// Classify a path into at most one category. Tests win over everything else,
/// then docs, then config, then code.
pub fn classify_path(path: &str) -> Option<FileCategory> {
    let lower = path.to_ascii_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    let ext = extension_of(&lower);

    if is_test_path(&lower, file_name) {
        return Some(FileCategory::Test);
    }

    if lower.starts_with("docs/")
        || lower.contains("/docs/")
        || ext.as_deref().is_some_and(|e| DOC_EXTENSIONS.contains(&e))
        || file_name == "readme"
        || file_name == "changelog"
    {
        return Some(FileCategory::Doc);
    }

    if lower.starts_with(".github/")
        || CONFIG_FILE_NAMES.contains(&file_name)
        || ext.as_deref().is_some_and(|e| CONFIG_EXTENSIONS.contains(&e))
    {
        return Some(FileCategory::Config);
    }

    if ext.as_deref().is_some_and(|e| CODE_EXTENSIONS.contains(&e)) {
        return Some(FileCategory::Code);
    }

    None
}

fn is_test_path(lower: &str, file_name: &str) -> bool {
    lower.starts_with("test/")
        || lower.starts_with("tests/")
        || lower.contains("/test/")
        || lower.contains("/tests/")
        || lower.contains("__tests__/")
        || file_name.starts_with("test_")
        || file_name.contains("_test.")
        || file_name.contains(".test.")
        || file_name.contains(".spec.")
}

pub fn is_dependency_manifest(path: &str) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    DEPENDENCY_MANIFESTS.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(file_name))
            .unwrap_or(false)
    })
}

pub fn is_security_sensitive(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    SECURITY_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}
