//! Element extraction — turn scanned source files into typed code elements.
//!
//! A line-oriented scanner detects classes (with method lists and bases) and
//! functions (with signatures and owning classes) across the supported
//! languages. It is deliberately approximate: files it cannot carve up still
//! produce their file-level element, which always exists.

use crate::config::IndexingConfig;
use crate::scan::ScannedFile;
use crate::types::{CodeElement, ElementType};

// ---------------------------------------------------------------------------
// Language map (fixed, bidirectional)
// ---------------------------------------------------------------------------

const LANGUAGE_MAP: &[(&str, &str)] = &[
    ("py", "python"),
    ("pyi", "python"),
    ("rs", "rust"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("mjs", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("scala", "scala"),
    ("md", "markdown"),
    ("toml", "toml"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("json", "json"),
];

/// Language name for a file extension, or `None` for unindexed extensions.
pub fn language_for_extension(ext: &str) -> Option<&'static str> {
    LANGUAGE_MAP.iter().find(|(e, _)| *e == ext).map(|(_, l)| *l)
}

/// All extensions mapped to a language (the reverse direction of the map).
pub fn extensions_for_language(language: &str) -> Vec<&'static str> {
    LANGUAGE_MAP.iter().filter(|(_, l)| *l == language).map(|(e, _)| *e).collect()
}

// ---------------------------------------------------------------------------
// Scanner output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RawSymbol {
    kind: ElementType,
    name: String,
    signature: String,
    docstring: Option<String>,
    start_line: usize,
    end_line: usize,
    class_name: Option<String>,
    bases: Vec<String>,
    methods: Vec<String>,
}

// ---------------------------------------------------------------------------
// Public entry
// ---------------------------------------------------------------------------

/// Extract all elements for one file: the file element first, then classes
/// and functions. Functions longer than `max_function_lines` are dropped
/// silently; the file element always survives.
pub fn extract_elements(
    file: &ScannedFile,
    content: &str,
    repo_name: &str,
    cfg: &IndexingConfig,
) -> Vec<CodeElement> {
    let total_lines = content.lines().count().max(1);
    let mut elements = Vec::new();

    elements.push(make_element(
        repo_name,
        &file.rel_path,
        &file.language,
        ElementType::File,
        "",
        None,
        None,
        1,
        total_lines,
        content,
        cfg.max_code_chars,
        serde_json::Map::new(),
    ));

    let symbols = match file.language.as_str() {
        "python" => scan_python(content),
        "rust" | "javascript" | "typescript" | "go" | "java" | "kotlin" | "c" | "cpp"
        | "csharp" | "swift" | "scala" => scan_brace_language(content),
        _ => Vec::new(),
    };

    let lines: Vec<&str> = content.lines().collect();
    for sym in symbols {
        if sym.kind == ElementType::Function {
            let span = sym.end_line.saturating_sub(sym.start_line) + 1;
            if span > cfg.max_function_lines {
                tracing::debug!(
                    "skipping overlong function {} in {} ({span} lines)",
                    sym.name,
                    file.rel_path
                );
                continue;
            }
        }

        let body = lines
            .get(sym.start_line - 1..sym.end_line.min(lines.len()))
            .map(|s| s.join("\n"))
            .unwrap_or_default();

        let mut metadata = serde_json::Map::new();
        match sym.kind {
            ElementType::Function => {
                metadata.insert("is_method".into(), sym.class_name.is_some().into());
                if let Some(class_name) = &sym.class_name {
                    metadata.insert("class_name".into(), class_name.clone().into());
                }
            }
            ElementType::Class => {
                metadata.insert(
                    "methods".into(),
                    serde_json::Value::Array(
                        sym.methods.iter().map(|m| m.clone().into()).collect(),
                    ),
                );
                metadata.insert(
                    "bases".into(),
                    serde_json::Value::Array(sym.bases.iter().map(|b| b.clone().into()).collect()),
                );
            }
            _ => {}
        }

        elements.push(make_element(
            repo_name,
            &file.rel_path,
            &file.language,
            sym.kind,
            &sym.name,
            Some(sym.signature),
            sym.docstring,
            sym.start_line,
            sym.end_line,
            &body,
            cfg.max_code_chars,
            metadata,
        ));
    }

    elements
}

#[allow(clippy::too_many_arguments)]
fn make_element(
    repo_name: &str,
    rel_path: &str,
    language: &str,
    kind: ElementType,
    name: &str,
    signature: Option<String>,
    docstring: Option<String>,
    start_line: usize,
    end_line: usize,
    code: &str,
    max_code_chars: usize,
    metadata: serde_json::Map<String, serde_json::Value>,
) -> CodeElement {
    let code = truncate_chars(code, max_code_chars);
    CodeElement {
        id: CodeElement::make_id(repo_name, rel_path, kind, name, start_line),
        element_type: kind,
        repo_name: repo_name.to_string(),
        relative_path: rel_path.to_string(),
        language: language.to_string(),
        name: name.to_string(),
        signature: signature.filter(|s| !s.is_empty()),
        docstring,
        summary: None,
        start_line,
        end_line,
        code,
        metadata,
        embedding: None,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// ---------------------------------------------------------------------------
// Python scanner (indentation-based ranges)
// ---------------------------------------------------------------------------

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// End line of an indented block starting at `start` (0-based index into
/// `lines`): the last non-blank line deeper than the declaration's indent.
fn python_block_end(lines: &[&str], start: usize, base_indent: usize) -> usize {
    let mut end = start;
    for (i, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base_indent {
            break;
        }
        end = i;
    }
    end
}

fn python_docstring(lines: &[&str], decl_idx: usize, block_end: usize) -> Option<String> {
    let first = lines
        .iter()
        .enumerate()
        .skip(decl_idx + 1)
        .take(block_end.saturating_sub(decl_idx))
        .find(|(_, l)| !l.trim().is_empty())?;
    let trimmed = first.1.trim();
    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = trimmed.strip_prefix(quote) {
            if let Some(inner) = rest.strip_suffix(quote) {
                if !inner.is_empty() {
                    return Some(inner.trim().to_string());
                }
            }
            // Multi-line docstring: take the first content line
            for line in lines.iter().skip(first.0 + 1).take(10) {
                let t = line.trim();
                if t.is_empty() {
                    continue;
                }
                return Some(t.trim_end_matches(quote).trim().to_string());
            }
        }
    }
    None
}

fn scan_python(content: &str) -> Vec<RawSymbol> {
    let lines: Vec<&str> = content.lines().collect();
    let mut symbols = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();
        let indent = indent_of(line);

        if let Some(rest) = trimmed.strip_prefix("class ") {
            let name = ident_prefix(rest);
            if !name.is_empty() {
                let bases = rest
                    .split_once('(')
                    .and_then(|(_, tail)| tail.split_once(')'))
                    .map(|(inner, _)| {
                        inner
                            .split(',')
                            .map(|b| b.trim().to_string())
                            .filter(|b| !b.is_empty() && b != "object")
                            .collect()
                    })
                    .unwrap_or_default();

                let end = python_block_end(&lines, i, indent);
                let docstring = python_docstring(&lines, i, end);

                // Methods: defs one level deeper inside the class body
                let mut methods = Vec::new();
                let mut j = i + 1;
                while j <= end {
                    let mline = lines[j];
                    let mtrim = mline.trim_start();
                    let mindent = indent_of(mline);
                    if mindent > indent
                        && (mtrim.starts_with("def ") || mtrim.starts_with("async def "))
                    {
                        let mname = ident_prefix(
                            mtrim.trim_start_matches("async ").trim_start_matches("def "),
                        );
                        if !mname.is_empty() {
                            let mend = python_block_end(&lines, j, mindent);
                            let mdoc = python_docstring(&lines, j, mend);
                            methods.push(mname.clone());
                            symbols.push(RawSymbol {
                                kind: ElementType::Function,
                                name: mname,
                                signature: mtrim.trim_end_matches(':').to_string(),
                                docstring: mdoc,
                                start_line: j + 1,
                                end_line: mend + 1,
                                class_name: Some(name.clone()),
                                bases: Vec::new(),
                                methods: Vec::new(),
                            });
                            j = mend + 1;
                            continue;
                        }
                    }
                    j += 1;
                }

                symbols.push(RawSymbol {
                    kind: ElementType::Class,
                    name,
                    signature: trimmed.trim_end_matches(':').to_string(),
                    docstring,
                    start_line: i + 1,
                    end_line: end + 1,
                    class_name: None,
                    bases,
                    methods,
                });
                i = end + 1;
                continue;
            }
        }

        if indent == 0 && (trimmed.starts_with("def ") || trimmed.starts_with("async def ")) {
            let name =
                ident_prefix(trimmed.trim_start_matches("async ").trim_start_matches("def "));
            if !name.is_empty() {
                let end = python_block_end(&lines, i, indent);
                let docstring = python_docstring(&lines, i, end);
                symbols.push(RawSymbol {
                    kind: ElementType::Function,
                    name,
                    signature: trimmed.trim_end_matches(':').to_string(),
                    docstring,
                    start_line: i + 1,
                    end_line: end + 1,
                    class_name: None,
                    bases: Vec::new(),
                    methods: Vec::new(),
                });
                i = end + 1;
                continue;
            }
        }

        i += 1;
    }

    symbols
}

// ---------------------------------------------------------------------------
// Brace-language scanner (ranges by brace matching)
// ---------------------------------------------------------------------------

fn ident_prefix(s: &str) -> String {
    s.chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Index of the line carrying the brace that closes the block opened on
/// `start`. Falls back to `start` for single-line declarations.
fn brace_block_end(lines: &[&str], start: usize) -> usize {
    let mut depth: i32 = 0;
    let mut opened = false;
    for (i, line) in lines.iter().enumerate().skip(start) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return i;
        }
        // Declaration never opened a body within a few lines (trait fn, etc.)
        if !opened && i > start + 3 {
            return start;
        }
    }
    if opened {
        lines.len().saturating_sub(1)
    } else {
        start
    }
}

struct BracePattern {
    keyword: &'static str,
    kind: ElementType,
}

const BRACE_PATTERNS: &[BracePattern] = &[
    BracePattern { keyword: "fn ", kind: ElementType::Function },
    BracePattern { keyword: "function ", kind: ElementType::Function },
    BracePattern { keyword: "func ", kind: ElementType::Function },
    BracePattern { keyword: "class ", kind: ElementType::Class },
    BracePattern { keyword: "struct ", kind: ElementType::Class },
    BracePattern { keyword: "interface ", kind: ElementType::Class },
    BracePattern { keyword: "trait ", kind: ElementType::Class },
    BracePattern { keyword: "enum ", kind: ElementType::Class },
];

fn scan_brace_language(content: &str) -> Vec<RawSymbol> {
    let lines: Vec<&str> = content.lines().collect();
    let mut symbols: Vec<RawSymbol> = Vec::new();
    // `impl Name { ... }` / `class Name { ... }` scopes, as (name, end_line)
    let mut scope_stack: Vec<(String, usize)> = Vec::new();

    for (i, raw) in lines.iter().enumerate() {
        let trimmed = raw.trim_start();
        if trimmed.starts_with("//") || trimmed.starts_with('*') || trimmed.starts_with('#') {
            continue;
        }

        while let Some((_, end)) = scope_stack.last() {
            if i > *end {
                scope_stack.pop();
            } else {
                break;
            }
        }

        if let Some(rest) = strip_decl_keyword(trimmed, "impl ") {
            // `impl Trait for Type` attributes methods to the type
            let target = match rest.split(" for ").nth(1) {
                Some(t) => ident_prefix(t.trim_start()),
                None => ident_prefix(rest.trim_start_matches(|c: char| c == '<')),
            };
            if !target.is_empty() {
                let end = brace_block_end(&lines, i);
                scope_stack.push((target, end));
                continue;
            }
        }

        for pat in BRACE_PATTERNS {
            let Some(rest) = strip_decl_keyword(trimmed, pat.keyword) else {
                continue;
            };
            let name = ident_prefix(rest.trim_start_matches(|c: char| c.is_whitespace()));
            if name.is_empty() {
                continue;
            }
            let end = brace_block_end(&lines, i);
            let signature = trimmed
                .split('{')
                .next()
                .unwrap_or(trimmed)
                .trim_end()
                .to_string();

            match pat.kind {
                ElementType::Class => {
                    let bases = extract_brace_bases(trimmed);
                    symbols.push(RawSymbol {
                        kind: ElementType::Class,
                        name: name.clone(),
                        signature,
                        docstring: None,
                        start_line: i + 1,
                        end_line: end + 1,
                        class_name: None,
                        bases,
                        methods: Vec::new(),
                    });
                    scope_stack.push((name, end));
                }
                _ => {
                    let owner = scope_stack.last().map(|(n, _)| n.clone());
                    if let Some(owner_name) = &owner {
                        if let Some(class_sym) = symbols
                            .iter_mut()
                            .rev()
                            .find(|s| s.kind == ElementType::Class && &s.name == owner_name)
                        {
                            class_sym.methods.push(name.clone());
                        }
                    }
                    symbols.push(RawSymbol {
                        kind: ElementType::Function,
                        name,
                        signature,
                        docstring: None,
                        start_line: i + 1,
                        end_line: end + 1,
                        class_name: owner,
                        bases: Vec::new(),
                        methods: Vec::new(),
                    });
                }
            }
            break;
        }
    }

    symbols
}

/// Match a declaration keyword at the start of the trimmed line, skipping
/// common visibility/async prefixes.
fn strip_decl_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let mut rest = line;
    loop {
        rest = rest.trim_start();
        let mut advanced = false;
        for prefix in
            ["pub(crate) ", "pub ", "export ", "default ", "async ", "static ", "abstract "]
        {
            if let Some(r) = rest.strip_prefix(prefix) {
                rest = r;
                advanced = true;
            }
        }
        if !advanced {
            break;
        }
    }
    rest.strip_prefix(keyword)
}

/// `class X extends A implements B`, `struct X : A` style base lists.
fn extract_brace_bases(line: &str) -> Vec<String> {
    let mut bases = Vec::new();
    for marker in ["extends ", "implements ", ": "] {
        if let Some(idx) = line.find(marker) {
            let tail = &line[idx + marker.len()..];
            let tail = tail.split('{').next().unwrap_or(tail);
            for b in tail.split(',') {
                let name = ident_prefix(b.trim());
                if !name.is_empty() && name != "public" {
                    bases.push(name);
                }
            }
        }
    }
    bases.dedup();
    bases
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
