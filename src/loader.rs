//! Module loading: the `ModuleLoader` capability, the filesystem
//! implementation, and lexical path cleaning shared with the compiler.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{Span, Stmt};
use crate::compiler::Module;
use crate::diagnostics::Diagnostic;
use crate::parser;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
}

/// Capability that turns a canonical module path into source text.
pub trait ModuleLoader {
    fn load(&self, canonical_path: &str) -> Result<String, LoadError>;
}

/// Reads modules from the filesystem.
pub struct FsModuleLoader;

impl ModuleLoader for FsModuleLoader {
    fn load(&self, canonical_path: &str) -> Result<String, LoadError> {
        match std::fs::read_to_string(canonical_path) {
            Ok(src) => Ok(src),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LoadError::NotFound(canonical_path.to_string()))
            }
            Err(err) => Err(LoadError::Read {
                path: canonical_path.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// In-memory loader keyed by cleaned path. Used by tests and embedders.
#[derive(Default)]
pub struct MemoryLoader {
    files: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, src: &str) -> &mut Self {
        self.files.insert(clean_path(path), src.to_string());
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&self, canonical_path: &str) -> Result<String, LoadError> {
        self.files
            .get(canonical_path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(canonical_path.to_string()))
    }
}

/// Lexical path cleaning: slash normalization, collapsing `.` and `..`
/// segments. No filesystem access.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/') || path.starts_with('\\');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                match parts.last() {
                    Some(&"..") | None => {
                        if !rooted {
                            parts.push("..");
                        }
                    }
                    Some(_) => {
                        parts.pop();
                    }
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Directory portion of a cleaned path, without the trailing slash.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// Resolves an import target relative to the importing module.
pub fn resolve_import(importer: &str, rel: &str) -> String {
    clean_path(&format!("{}/{}", parent_dir(importer), rel))
}

/// Loads and parses the entry module and, transitively, every import
/// target. Parse and lex diagnostics are accumulated per module; a
/// module that fails to parse is kept (best-effort AST) but its imports
/// are not followed.
pub fn load_modules(entry_path: &str, loader: &dyn ModuleLoader) -> (Vec<Module>, Vec<Diagnostic>) {
    let mut loaded: HashMap<String, Module> = HashMap::new();
    let mut diags: Vec<Diagnostic> = Vec::new();
    let mut stack = vec![clean_path(entry_path)];

    while let Some(path) = stack.pop() {
        if loaded.contains_key(&path) {
            continue;
        }
        let src = match loader.load(&path) {
            Ok(src) => src,
            Err(LoadError::NotFound(_)) => {
                diags.push(
                    Diagnostic::error(
                        "E_IMPORT_NOT_FOUND",
                        format!("import not found: {path}"),
                        &path,
                        first_line_span(),
                        "load the imported file",
                    ),
                );
                continue;
            }
            Err(LoadError::Read { message, .. }) => {
                diags.push(Diagnostic::error(
                    "E_IMPORT_READ",
                    message,
                    &path,
                    first_line_span(),
                    "check file permissions and path",
                ));
                continue;
            }
        };

        let (program, lex_diags, parse_diags) = parser::parse(&path, &src);
        let parse_failed = !lex_diags.is_empty() || !parse_diags.is_empty();
        diags.extend(lex_diags);
        diags.extend(parse_diags);

        if !parse_failed {
            for stmt in &program.stmts {
                if let Stmt::Import(imp) = stmt {
                    stack.push(resolve_import(&path, &imp.path.value));
                }
            }
        }
        loaded.insert(path.clone(), Module { path, program });
    }

    let mut modules: Vec<Module> = loaded.into_values().collect();
    modules.sort_by(|a, b| a.path.cmp(&b.path));
    (modules, crate::diagnostics::sort_and_dedupe(diags))
}

fn first_line_span() -> Span {
    use crate::ast::Position;
    Span::at(Position { offset: 0, line: 1, column: 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_collapses_dots() {
        assert_eq!(clean_path("a/b/../c.pt"), "a/c.pt");
        assert_eq!(clean_path("./a.pt"), "a.pt");
        assert_eq!(clean_path("a//b.pt"), "a/b.pt");
        assert_eq!(clean_path("../a.pt"), "../a.pt");
        assert_eq!(clean_path("/x/./y/../z.pt"), "/x/z.pt");
        assert_eq!(clean_path(""), ".");
    }

    #[test]
    fn resolve_import_is_relative_to_importer_dir() {
        assert_eq!(resolve_import("suite/main.pt", "lib/auth.pt"), "suite/lib/auth.pt");
        assert_eq!(resolve_import("suite/main.pt", "../shared.pt"), "shared.pt");
        assert_eq!(resolve_import("main.pt", "lib.pt"), "lib.pt");
    }

    #[test]
    fn loads_transitive_imports() {
        let mut loader = MemoryLoader::new();
        loader.insert("main.pt", "import \"lib/a.pt\"\nreq top:\n\tGET /top\n");
        loader.insert("lib/a.pt", "import \"b.pt\"\nreq a:\n\tGET /a\n");
        loader.insert("lib/b.pt", "req b:\n\tGET /b\n");
        let (modules, diags) = load_modules("main.pt", &loader);
        assert!(diags.is_empty(), "{diags:?}");
        let paths: Vec<_> = modules.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/a.pt", "lib/b.pt", "main.pt"]);
    }

    #[test]
    fn missing_import_is_a_diagnostic() {
        let mut loader = MemoryLoader::new();
        loader.insert("main.pt", "import \"missing.pt\"\n");
        let (modules, diags) = load_modules("main.pt", &loader);
        assert_eq!(modules.len(), 1);
        assert!(diags.iter().any(|d| d.code == "E_IMPORT_NOT_FOUND"));
    }

    #[test]
    fn cyclic_imports_load_each_module_once() {
        let mut loader = MemoryLoader::new();
        loader.insert("a.pt", "import \"b.pt\"\nreq a:\n\tGET /a\n");
        loader.insert("b.pt", "import \"a.pt\"\nreq b:\n\tGET /b\n");
        let (modules, diags) = load_modules("a.pt", &loader);
        assert!(diags.is_empty());
        assert_eq!(modules.len(), 2);
    }

    #[test]
    fn parse_errors_do_not_follow_imports() {
        let mut loader = MemoryLoader::new();
        loader.insert("main.pt", "req broken\nimport \"other.pt\"\n");
        let (modules, diags) = load_modules("main.pt", &loader);
        assert_eq!(modules.len(), 1);
        assert!(!diags.is_empty());
    }
}
