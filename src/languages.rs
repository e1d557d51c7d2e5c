use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use itertools::Itertools;
use lazy_static::lazy_static;
use serde::Serialize;
use walkdir::WalkDir;

use crate::core::normalize_path;

/// Each programming language supported by ripplemap.
///
/// The list is closed: one arm per language, with a capability table
/// ([`LangConfig`]) behind it. Dispatch is by file extension; detection is
/// by manifest marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    TypeScript,
    JavaScript,
    Python,
    Rust,
    Go,
    C,
    Cpp,
}

impl Lang {
    /// Get the language responsible for a file, by extension.
    pub fn of<P: AsRef<Path>>(path: P) -> Option<Self> {
        LANG_TABLE.get_lang(path)
    }

    /// All languages whose project marker is present at `root`.
    pub fn detect<P: AsRef<Path>>(root: P) -> Vec<Self> {
        ALL_LANGS.iter().copied().filter(|l| l.detects_project(root.as_ref())).collect()
    }

    fn config(&self) -> &'static LangConfig {
        match self {
            Lang::TypeScript => &TS,
            Lang::JavaScript => &JS,
            Lang::Python => &PY,
            Lang::Rust => &RS,
            Lang::Go => &GO,
            Lang::C => &C_LANG,
            Lang::Cpp => &CPP,
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        self.config().extensions
    }

    /// True when one of this language's manifest markers exists at `root`.
    pub fn detects_project(&self, root: &Path) -> bool {
        self.config().markers.iter().any(|m| root.join(m).exists())
    }

    /// Ordered source roots for this language under `root`.
    ///
    /// The first returned directory is the canonical one used for
    /// relative-path display.
    pub fn source_dirs(&self, root: &Path) -> Vec<PathBuf> {
        let mut dirs = Vec::new();

        for rel in self.config().source_dirs {
            let dir = root.join(rel);
            if dir.is_dir() {
                dirs.push(normalize_path(dir));
            }
        }

        if dirs.is_empty() {
            dirs.push(normalize_path(root));
        }

        dirs
    }

    /// Best-effort package name, read from the language's manifest.
    pub fn package_name(&self, root: &Path) -> Option<String> {
        match self {
            Lang::TypeScript | Lang::JavaScript => json_package_name(&root.join("package.json")),
            Lang::Rust => toml_package_name(&root.join("Cargo.toml")),
            Lang::Go => go_module_name(&root.join("go.mod")),
            Lang::Python => python_package_name(root),
            Lang::C | Lang::Cpp => None,
        }
    }

    /// Enumerate the source files of this language under `dir`.
    pub fn discover(&self, dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();

        for entry in WalkDir::new(dir).follow_links(true).into_iter().filter_entry(not_skipped) {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if path.is_file() && Lang::of(path) == Some(*self) && is_source_file(path) {
                        files.push(normalize_path(path));
                    }
                }
                Err(err) => {
                    log::warn!("Failed to read directory entry: {}. Skipping...", err);
                }
            }
        }

        files.sort();
        files
    }
}

/// Enumerate the source files of all `langs` under each of `dirs`, deduped.
pub fn discover_all(langs: &[Lang], dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter().flat_map(|d| langs.iter().flat_map(|l| l.discover(d))).unique().collect()
}

/// A coarse architectural tag, used only for visualisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[derive(strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Test,
    Ui,
    Service,
    Model,
    Util,
}

/// Classify a relative path into a [`Layer`], if any segment gives it away.
pub fn classify_layer(rel_path: &str) -> Option<Layer> {
    let lowered = rel_path.to_lowercase();
    let segment = |s: &str| lowered.split('/').any(|p| p.contains(s));

    if segment("test") || segment("spec") || lowered.ends_with("_test.go") {
        Some(Layer::Test)
    } else if segment("component") || segment("view") || segment("page") || segment("ui") {
        Some(Layer::Ui)
    } else if segment("service") || segment("controller") || segment("handler") {
        Some(Layer::Service)
    } else if segment("model") || segment("schema") || segment("entit") {
        Some(Layer::Model)
    } else if segment("util") || segment("helper") || segment("common") {
        Some(Layer::Util)
    } else {
        None
    }
}

/// Baseline directory skip set. Plugins share it; VCS internals, package
/// mirrors and build output never count as internal source.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    "coverage",
    ".next",
    ".cache",
    ".idea",
    ".vscode",
];

pub fn is_skipped_dir_name(name: &str) -> bool {
    SKIP_DIRS.contains(&name)
}

fn not_skipped(entry: &walkdir::DirEntry) -> bool {
    !(entry.file_type().is_dir()
        && entry.file_name().to_str().map(is_skipped_dir_name).unwrap_or(false))
}

/// Generated, minified and declaration-only files are never internal source.
pub fn is_source_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.to_lowercase(),
        None => return false,
    };

    !(name.ends_with(".d.ts")
        || name.ends_with(".min.js")
        || name.ends_with(".min.css")
        || name.contains(".generated.")
        || name.ends_with(".pb.go"))
}

struct LangConfig {
    extensions: &'static [&'static str],
    markers: &'static [&'static str],
    source_dirs: &'static [&'static str],
}

#[derive(Debug, Default)]
struct LangLookupTable {
    extensions: HashMap<String, Lang>,
}

impl LangLookupTable {
    fn new() -> Self {
        Self::default()
    }

    fn get_lang<P: AsRef<Path>>(&self, path: P) -> Option<Lang> {
        path.as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|e| self.extensions.get(&e.to_lowercase()))
            .copied()
    }

    fn insert(&mut self, lang: Lang) {
        for ext in lang.extensions() {
            self.extensions.insert(ext.to_string(), lang);
        }
    }
}

const ALL_LANGS: &[Lang] =
    &[Lang::TypeScript, Lang::JavaScript, Lang::Python, Lang::Rust, Lang::Go, Lang::C, Lang::Cpp];

lazy_static! {
    static ref LANG_TABLE: LangLookupTable = {
        let mut table = LangLookupTable::new();
        for lang in ALL_LANGS {
            table.insert(*lang);
        }
        table
    };
    static ref TS: LangConfig = LangConfig {
        extensions: &["ts", "tsx", "mts", "cts"],
        markers: &["tsconfig.json"],
        source_dirs: &["src", "lib"],
    };
    static ref JS: LangConfig = LangConfig {
        extensions: &["js", "jsx", "mjs", "cjs"],
        markers: &["package.json"],
        source_dirs: &["src", "lib"],
    };
    static ref PY: LangConfig = LangConfig {
        extensions: &["py"],
        markers: &["pyproject.toml", "setup.py", "requirements.txt"],
        source_dirs: &["src"],
    };
    static ref RS: LangConfig =
        LangConfig { extensions: &["rs"], markers: &["Cargo.toml"], source_dirs: &["src"] };
    static ref GO: LangConfig =
        LangConfig { extensions: &["go"], markers: &["go.mod"], source_dirs: &[] };
    static ref C_LANG: LangConfig = LangConfig {
        extensions: &["c"],
        markers: &["Makefile", "CMakeLists.txt", "compile_commands.json"],
        source_dirs: &["src", "include"],
    };
    static ref CPP: LangConfig = LangConfig {
        extensions: &["cpp", "cc", "cxx", "c++", "h", "hpp", "hh", "hxx", "h++"],
        markers: &["Makefile", "CMakeLists.txt", "compile_commands.json"],
        source_dirs: &["src", "include"],
    };
}

fn json_package_name(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;

    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => value.get("name").and_then(|n| n.as_str()).map(|n| n.to_string()),
        Err(err) => {
            log::debug!("Could not parse {}: {}", path.display(), err);
            None
        }
    }
}

// Cargo.toml is read with a line scan rather than a full TOML parser; only
// the `name` key of the `[package]` table is needed.
fn toml_package_name(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let mut in_package = false;

    for line in text.lines() {
        let line = line.trim();

        if line.starts_with('[') {
            in_package = line == "[package]";
        } else if in_package {
            if let Some(rest) = line.strip_prefix("name") {
                let rest = rest.trim_start();
                if let Some(value) = rest.strip_prefix('=') {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
    }

    None
}

fn go_module_name(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;

    text.lines()
        .map(|l| l.trim())
        .find_map(|l| l.strip_prefix("module "))
        .map(|m| m.trim().to_string())
}

// A python "package" here is the first top-level directory carrying an
// __init__.py; good enough to recognise absolute imports of project code.
fn python_package_name(root: &Path) -> Option<String> {
    let entries = fs::read_dir(root).ok()?;

    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter(|e| e.path().join("__init__.py").is_file())
        .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
        .sorted()
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_by_extension() {
        assert_eq!(Lang::of("a/b/main.ts"), Some(Lang::TypeScript));
        assert_eq!(Lang::of("a/b/main.TSX"), Some(Lang::TypeScript));
        assert_eq!(Lang::of("x.py"), Some(Lang::Python));
        assert_eq!(Lang::of("x.hpp"), Some(Lang::Cpp));
        assert_eq!(Lang::of("x.txt"), None);
        assert_eq!(Lang::of("Makefile"), None);
    }

    #[test]
    fn non_source_files_are_rejected() {
        assert!(!is_source_file(Path::new("lib/types.d.ts")));
        assert!(!is_source_file(Path::new("dist/app.min.js")));
        assert!(!is_source_file(Path::new("api.generated.ts")));
        assert!(is_source_file(Path::new("src/app.ts")));
    }

    #[test]
    fn layer_classification() {
        assert_eq!(classify_layer("src/components/button.tsx"), Some(Layer::Ui));
        assert_eq!(classify_layer("src/services/auth.ts"), Some(Layer::Service));
        assert_eq!(classify_layer("tests/test_auth.py"), Some(Layer::Test));
        assert_eq!(classify_layer("src/main.ts"), None);
    }

    #[test]
    fn detect_by_manifest_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example.com/app\n").unwrap();

        let langs = Lang::detect(dir.path());
        assert!(langs.contains(&Lang::TypeScript));
        assert!(langs.contains(&Lang::Go));
        assert!(!langs.contains(&Lang::Rust));
    }

    #[test]
    fn go_module_name_from_mod_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("go.mod");
        std::fs::write(&path, "module example.com/app\n\ngo 1.21\n").unwrap();
        assert_eq!(go_module_name(&path), Some("example.com/app".to_string()));
    }

    #[test]
    fn cargo_package_name_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cargo.toml");
        std::fs::write(&path, "[package]\nname = \"demo\"\nversion = \"0.1.0\"\n").unwrap();
        assert_eq!(toml_package_name(&path), Some("demo".to_string()));
    }
}
