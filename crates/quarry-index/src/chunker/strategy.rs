//! Per-language boundary detection: pure functions from source text to
//! top-level declaration spans, driven by keyword cues plus brace or
//! indentation tracking. No parser; close enough for retrieval chunking and
//! replaceable per language behind one trait.

use crate::languages::Lang;

/// A top-level declaration span, 1-based inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub symbol: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
}

/// Boundary detection for one language family. Implementations must be pure:
/// identical source always yields identical declarations.
pub trait ChunkStrategy: Send + Sync {
    fn declarations(&self, source: &str) -> Vec<Declaration>;

    /// The file's import/include lines, newline-joined.
    fn imports(&self, source: &str) -> String;
}

/// Strategy for brace-delimited languages: a declaration opens at depth zero
/// on a keyword cue and closes when its braces balance out.
pub struct BraceStrategy {
    decl_keywords: &'static [&'static str],
    modifiers: &'static [&'static str],
    attr_prefixes: &'static [&'static str],
    import_prefixes: &'static [&'static str],
    /// Treat any depth-zero line that opens a brace as a declaration, for
    /// C-style functions that carry no introducing keyword.
    brace_line_starts_decl: bool,
}

/// Strategy for indentation-delimited languages: a declaration opens at
/// column zero on a keyword cue and runs until the next column-zero line.
pub struct IndentStrategy {
    decl_keywords: &'static [&'static str],
    modifiers: &'static [&'static str],
    import_prefixes: &'static [&'static str],
    /// Terminator keyword closing a block at column zero (Ruby's `end`).
    block_end: Option<&'static str>,
}

static RUST: BraceStrategy = BraceStrategy {
    decl_keywords: &[
        "fn",
        "struct",
        "enum",
        "trait",
        "impl",
        "mod",
        "const",
        "static",
        "type",
        "union",
        "macro_rules!",
    ],
    modifiers: &["pub", "pub(crate)", "pub(super)", "async", "unsafe", "extern", "\"C\""],
    attr_prefixes: &["#[", "#!["],
    import_prefixes: &["use ", "extern crate "],
    brace_line_starts_decl: false,
};

static JAVASCRIPT: BraceStrategy = BraceStrategy {
    decl_keywords: &[
        "function",
        "class",
        "interface",
        "enum",
        "namespace",
        "type",
        "const",
        "let",
        "var",
    ],
    modifiers: &["export", "default", "async", "declare", "abstract"],
    attr_prefixes: &["@"],
    import_prefixes: &["import ", "export * from", "export {"],
    brace_line_starts_decl: false,
};

static GO: BraceStrategy = BraceStrategy {
    decl_keywords: &["func", "type", "const", "var"],
    modifiers: &[],
    attr_prefixes: &[],
    import_prefixes: &["import "],
    brace_line_starts_decl: false,
};

static JAVA: BraceStrategy = BraceStrategy {
    decl_keywords: &["class", "interface", "enum", "record", "@interface"],
    modifiers: &[
        "public", "private", "protected", "static", "final", "abstract", "sealed", "strictfp",
    ],
    attr_prefixes: &["@"],
    import_prefixes: &["import ", "package "],
    brace_line_starts_decl: false,
};

static C_FAMILY: BraceStrategy = BraceStrategy {
    decl_keywords: &["struct", "enum", "union", "class", "namespace", "typedef"],
    modifiers: &["static", "extern", "inline", "const", "constexpr"],
    attr_prefixes: &[],
    import_prefixes: &["#include", "#define", "using namespace"],
    brace_line_starts_decl: true,
};

static CSHARP: BraceStrategy = BraceStrategy {
    decl_keywords: &[
        "class",
        "interface",
        "enum",
        "struct",
        "record",
        "namespace",
        "delegate",
    ],
    modifiers: &[
        "public", "internal", "private", "static", "sealed", "partial", "abstract", "readonly",
    ],
    attr_prefixes: &["["],
    import_prefixes: &["using "],
    brace_line_starts_decl: false,
};

static PHP: BraceStrategy = BraceStrategy {
    decl_keywords: &["function", "class", "interface", "trait", "enum"],
    modifiers: &["abstract", "final", "static"],
    attr_prefixes: &["#["],
    import_prefixes: &["use ", "require", "include", "namespace "],
    brace_line_starts_decl: false,
};

static PYTHON: IndentStrategy = IndentStrategy {
    decl_keywords: &["def", "class"],
    modifiers: &["async"],
    import_prefixes: &["import ", "from "],
    block_end: None,
};

static RUBY: IndentStrategy = IndentStrategy {
    decl_keywords: &["def", "class", "module"],
    modifiers: &[],
    import_prefixes: &["require ", "require_relative "],
    block_end: Some("end"),
};

/// Resolve the boundary strategy for a language.
#[must_use]
pub fn strategy_for(lang: Lang) -> &'static dyn ChunkStrategy {
    match lang {
        Lang::Rust => &RUST,
        Lang::JavaScript | Lang::TypeScript => &JAVASCRIPT,
        Lang::Go => &GO,
        Lang::Java => &JAVA,
        Lang::C | Lang::Cpp => &C_FAMILY,
        Lang::CSharp => &CSHARP,
        Lang::Php => &PHP,
        Lang::Python => &PYTHON,
        Lang::Ruby => &RUBY,
    }
}

/// Net brace depth change for a line, skipping braces inside double-quoted
/// strings, short single-quoted literals, and line comments.
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_str = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if in_str => {
                i += 2;
                continue;
            }
            '"' => in_str = !in_str,
            '\'' if !in_str => {
                // Consume a short char literal ('x' or '\n'); a lone quote
                // (Rust lifetime) is left alone.
                let close = chars[i + 1..].iter().take(3).position(|&ch| ch == '\'');
                if let Some(off) = close {
                    i += off + 2;
                    continue;
                }
            }
            '/' if !in_str && chars.get(i + 1) == Some(&'/') => break,
            '{' if !in_str => delta += 1,
            '}' if !in_str => delta -= 1,
            _ => {}
        }
        i += 1;
    }
    delta
}

fn clean_identifier(token: &str) -> Option<String> {
    let token = token.trim_start_matches(['(', '*', '&', '!']);
    let end = token
        .char_indices()
        .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
        .map_or(token.len(), |(i, _)| i);
    let ident = &token[..end];
    let starts_ok = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_');
    starts_ok.then(|| ident.to_owned())
}

/// The last identifier before the first `(`, for keyword-less C functions.
fn identifier_before_paren(line: &str) -> Option<String> {
    let head = line.split('(').next()?;
    head.split_whitespace().next_back().and_then(clean_identifier)
}

impl BraceStrategy {
    fn is_attr_line(&self, trimmed: &str) -> bool {
        self.attr_prefixes.iter().any(|p| trimmed.starts_with(p))
    }

    /// Whether a depth-zero line begins a declaration; `Some(symbol)` if so.
    fn decl_start(&self, trimmed: &str, delta: i32) -> Option<Option<String>> {
        if trimmed.is_empty() || self.is_attr_line(trimmed) {
            return None;
        }
        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if let Some(kw) = self.keyword_index(&tokens) {
            return Some(self.extract_symbol(&tokens, kw));
        }
        if self.brace_line_starts_decl
            && delta > 0
            && !trimmed.starts_with('{')
            && !trimmed.starts_with("//")
        {
            return Some(identifier_before_paren(trimmed));
        }
        None
    }

    /// Index of the declaration keyword token, skipping leading modifiers.
    fn keyword_index(&self, tokens: &[&str]) -> Option<usize> {
        let mut i = 0;
        while i < tokens.len() && self.modifiers.contains(&tokens[i]) {
            i += 1;
        }
        tokens
            .get(i)
            .filter(|t| self.decl_keywords.contains(*t))
            .map(|_| i)
    }

    fn extract_symbol(&self, tokens: &[&str], keyword_idx: usize) -> Option<String> {
        let keyword = tokens[keyword_idx];
        // `impl Trait for Type` names the type, not the trait.
        if keyword == "impl"
            && let Some(for_idx) = tokens.iter().position(|t| *t == "for")
        {
            return tokens.get(for_idx + 1).and_then(|t| clean_identifier(t));
        }
        tokens
            .iter()
            .skip(keyword_idx + 1)
            // Skip Go-style receivers like `(s *Server)`.
            .filter(|t| !t.starts_with('(') && !t.starts_with('*'))
            .find_map(|t| clean_identifier(t))
    }
}

impl ChunkStrategy for BraceStrategy {
    fn declarations(&self, source: &str) -> Vec<Declaration> {
        let lines: Vec<&str> = source.lines().collect();
        let mut decls = Vec::new();
        let mut depth: i32 = 0;
        // (start index, symbol, braces seen)
        let mut open: Option<(usize, Option<String>, bool)> = None;

        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            let delta = brace_delta(line);
            let starts = if depth == 0 {
                self.decl_start(trimmed, delta)
            } else {
                None
            };

            // A new keyword at depth zero closes a still-bodyless
            // declaration (a brace-less line that never got its `;`).
            if starts.is_some()
                && matches!(open, Some((_, _, false)))
                && let Some((start, symbol, _)) = open.take()
            {
                decls.push(Declaration {
                    symbol,
                    start_line: start + 1,
                    end_line: i,
                });
            }

            if open.is_none()
                && let Some(symbol) = starts
            {
                // Pull contiguous attribute lines into the span.
                let mut start = i;
                while start > 0 && self.is_attr_line(lines[start - 1].trim()) {
                    start -= 1;
                }
                open = Some((start, symbol, false));
            }

            depth += delta;
            if depth < 0 {
                depth = 0;
            }

            if let Some((start, symbol, saw_brace)) = open.take() {
                let saw_brace = saw_brace || line.contains('{');
                let closed_braces = saw_brace && depth == 0;
                let closed_semicolon = !saw_brace && depth == 0 && trimmed.ends_with(';');
                if closed_braces || closed_semicolon {
                    decls.push(Declaration {
                        symbol,
                        start_line: start + 1,
                        end_line: i + 1,
                    });
                } else {
                    open = Some((start, symbol, saw_brace));
                }
            }
        }

        // Unterminated declaration runs to end of file.
        if let Some((start, symbol, _)) = open {
            decls.push(Declaration {
                symbol,
                start_line: start + 1,
                end_line: lines.len(),
            });
        }

        decls
    }

    fn imports(&self, source: &str) -> String {
        collect_import_lines(source, self.import_prefixes)
    }
}

impl IndentStrategy {
    fn is_decl_start(&self, line: &str) -> Option<Option<String>> {
        if line.starts_with(char::is_whitespace) {
            return None;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut i = 0;
        while i < tokens.len() && self.modifiers.contains(&tokens[i]) {
            i += 1;
        }
        if tokens.get(i).is_some_and(|t| self.decl_keywords.contains(t)) {
            Some(tokens.get(i + 1).and_then(|t| clean_identifier(t)))
        } else {
            None
        }
    }
}

impl ChunkStrategy for IndentStrategy {
    fn declarations(&self, source: &str) -> Vec<Declaration> {
        let lines: Vec<&str> = source.lines().collect();
        let mut decls = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let Some(symbol) = self.is_decl_start(lines[i]) else {
                i += 1;
                continue;
            };

            // Attach contiguous preceding decorator lines.
            let mut start = i;
            while start > 0 && lines[start - 1].trim_start().starts_with('@') {
                start -= 1;
            }

            let mut end = i;
            let mut j = i + 1;
            while j < lines.len() {
                let line = lines[j];
                let at_column_zero = !line.is_empty() && !line.starts_with(char::is_whitespace);
                if at_column_zero {
                    if self.block_end == Some(line.trim_end()) {
                        end = j;
                    }
                    break;
                }
                if !line.trim().is_empty() {
                    end = j;
                }
                j += 1;
            }

            decls.push(Declaration {
                symbol,
                start_line: start + 1,
                end_line: end + 1,
            });
            i = end.max(i) + 1;
        }

        decls
    }

    fn imports(&self, source: &str) -> String {
        collect_import_lines(source, self.import_prefixes)
    }
}

fn collect_import_lines(source: &str, prefixes: &[&str]) -> String {
    let mut imports = String::new();
    for line in source.lines() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        if prefixes.iter().any(|p| line.starts_with(p)) {
            imports.push_str(line.trim_end());
            imports.push('\n');
        }
    }
    imports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rust() -> &'static dyn ChunkStrategy {
        strategy_for(Lang::Rust)
    }

    #[test]
    fn brace_delta_plain() {
        assert_eq!(brace_delta("fn a() {"), 1);
        assert_eq!(brace_delta("}"), -1);
        assert_eq!(brace_delta("fn a() { body() }"), 0);
    }

    #[test]
    fn brace_delta_skips_strings_and_comments() {
        assert_eq!(brace_delta(r#"let s = "{{{";"#), 0);
        assert_eq!(brace_delta("foo(); // comment with {"), 0);
        assert_eq!(brace_delta("let c = '{';"), 0);
    }

    #[test]
    fn brace_delta_tolerates_lifetimes() {
        assert_eq!(brace_delta("fn get<'a>(x: &'a str) -> &'a str {"), 1);
    }

    #[test]
    fn rust_single_function() {
        let source = "fn hello() {\n    println!(\"hi\");\n}\n";
        let decls = rust().declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].symbol.as_deref(), Some("hello"));
        assert_eq!((decls[0].start_line, decls[0].end_line), (1, 3));
    }

    #[test]
    fn rust_multiple_declarations() {
        let source = "\
struct Foo;

impl Foo {
    fn bar(&self) -> i32 {
        42
    }
}

pub async fn run() {
    Foo.bar();
}
";
        let decls = rust().declarations(source);
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].symbol.as_deref(), Some("Foo"));
        assert_eq!(decls[1].symbol.as_deref(), Some("Foo"));
        assert_eq!(decls[2].symbol.as_deref(), Some("run"));
        assert_eq!((decls[2].start_line, decls[2].end_line), (9, 11));
    }

    #[test]
    fn rust_impl_trait_for_names_the_type() {
        let source = "impl Display for Widget {\n    fn fmt(&self) {}\n}\n";
        let decls = rust().declarations(source);
        assert_eq!(decls[0].symbol.as_deref(), Some("Widget"));
    }

    #[test]
    fn rust_semicolon_terminated_items() {
        let source = "pub type Alias = Vec<u8>;\n\nconst LIMIT: usize = 10;\n";
        let decls = rust().declarations(source);
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].symbol.as_deref(), Some("Alias"));
        assert_eq!(decls[1].symbol.as_deref(), Some("LIMIT"));
    }

    #[test]
    fn rust_attributes_attach_to_declaration() {
        let source = "#[derive(Debug)]\n#[serde(rename_all = \"lowercase\")]\nstruct Config {\n    a: i32,\n}\n";
        let decls = rust().declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].start_line, 1);
        assert_eq!(decls[0].end_line, 5);
    }

    #[test]
    fn rust_one_liner_closes_same_line() {
        let source = "fn tiny() { 1 }\nfn other() { 2 }\n";
        let decls = rust().declarations(source);
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn rust_imports_collected() {
        let source = "use std::io;\nuse std::fmt::Write;\n\nfn main() {}\n";
        let imports = rust().imports(source);
        assert!(imports.contains("use std::io;"));
        assert!(imports.contains("use std::fmt::Write;"));
        assert!(!imports.contains("fn main"));
    }

    #[test]
    fn javascript_arrow_and_class() {
        let strategy = strategy_for(Lang::JavaScript);
        let source = "\
export const handler = async (req) => {
  return req.body;
};

class Service {
  run() {}
}
";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].symbol.as_deref(), Some("handler"));
        assert_eq!(decls[1].symbol.as_deref(), Some("Service"));
    }

    #[test]
    fn go_receiver_method_symbol() {
        let strategy = strategy_for(Lang::Go);
        let source = "func (s *Server) Handle(w http.ResponseWriter) {\n\treturn\n}\n";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].symbol.as_deref(), Some("Handle"));
    }

    #[test]
    fn c_function_without_keyword() {
        let strategy = strategy_for(Lang::C);
        let source = "static int parse_args(int argc, char **argv) {\n    return 0;\n}\n";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].symbol.as_deref(), Some("parse_args"));
    }

    #[test]
    fn python_functions_and_class() {
        let strategy = strategy_for(Lang::Python);
        let source = "\
import os

def first():
    return 1


class Greeter:
    def hello(self):
        print(\"hi\")


def second():
    return 2
";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].symbol.as_deref(), Some("first"));
        assert_eq!(decls[1].symbol.as_deref(), Some("Greeter"));
        assert_eq!(decls[2].symbol.as_deref(), Some("second"));
        // Nested method belongs to the class span.
        assert_eq!((decls[1].start_line, decls[1].end_line), (7, 9));
    }

    #[test]
    fn python_decorator_attaches() {
        let strategy = strategy_for(Lang::Python);
        let source = "@app.route(\"/\")\ndef index():\n    return \"ok\"\n";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].start_line, 1);
    }

    #[test]
    fn python_async_def() {
        let strategy = strategy_for(Lang::Python);
        let source = "async def fetch():\n    pass\n";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].symbol.as_deref(), Some("fetch"));
    }

    #[test]
    fn ruby_block_ends_at_end_keyword() {
        let strategy = strategy_for(Lang::Ruby);
        let source = "class Widget\n  def run\n    1\n  end\nend\n\ndef helper\n  2\nend\n";
        let decls = strategy.declarations(source);
        assert_eq!(decls.len(), 2);
        assert_eq!((decls[0].start_line, decls[0].end_line), (1, 5));
        assert_eq!(decls[1].symbol.as_deref(), Some("helper"));
    }

    #[test]
    fn python_imports_collected() {
        let strategy = strategy_for(Lang::Python);
        let source = "import os\nfrom typing import Any\n\ndef f():\n    import json\n";
        let imports = strategy.imports(source);
        assert!(imports.contains("import os"));
        assert!(imports.contains("from typing import Any"));
        // Indented imports are not file-level context.
        assert!(!imports.contains("import json"));
    }

    #[test]
    fn declarations_deterministic() {
        let source = "fn a() {}\n\nfn b() {\n    a();\n}\n";
        assert_eq!(rust().declarations(source), rust().declarations(source));
    }

    #[test]
    fn no_declarations_in_prose() {
        let source = "just some text\nwithout any code keywords\n";
        assert!(rust().declarations(source).is_empty());
    }
}
