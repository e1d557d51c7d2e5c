use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

use crate::core::normalize_path;
use crate::error::RippleError;
use crate::languages::is_skipped_dir_name;
use crate::languages::is_source_file;
use crate::languages::Lang;

/// Turn one file into the list of internal files it imports.
///
/// Scanning is line-regex based and resolution probes candidate paths in a
/// language-defined order; names that fall through every candidate (the
/// standard library, third-party packages) are dropped. Never fails: an
/// unreadable file yields an empty list.
pub fn parse_imports(
    lang: Lang,
    file: &Path,
    content: Option<&str>,
    project_root: &Path,
    source_dirs: &[PathBuf],
    configs: &ConfigCache,
) -> Vec<PathBuf> {
    let owned;
    let content = match content {
        Some(content) => content,
        None => match fs::read_to_string(file) {
            Ok(text) => {
                owned = text;
                &owned
            }
            Err(source) => {
                let err = RippleError::UnreadableFile { path: file.to_path_buf(), source };
                log::debug!("Treating imports as empty: {}", err);
                return Vec::new();
            }
        },
    };

    let dir = match file.parent() {
        Some(dir) => dir.to_path_buf(),
        None => return Vec::new(),
    };

    let ctx = Ctx { lang, file, dir, project_root, source_dirs, configs };

    let resolved = match lang {
        Lang::TypeScript | Lang::JavaScript => scan_ecmascript(content, &ctx),
        Lang::Python => scan_python(content, &ctx),
        Lang::Rust => scan_rust(content, &ctx),
        Lang::Go => scan_go(content, &ctx),
        Lang::C | Lang::Cpp => scan_c_family(content, &ctx),
    };

    resolved
        .into_iter()
        .map(normalize_path)
        .filter(|p| p.starts_with(project_root) && p.is_file())
        .unique()
        .collect()
}

struct Ctx<'a> {
    lang: Lang,
    file: &'a Path,
    dir: PathBuf,
    project_root: &'a Path,
    source_dirs: &'a [PathBuf],
    configs: &'a ConfigCache,
}

impl<'a> Ctx<'a> {
    fn package_name(&self) -> Option<String> {
        self.configs.package_name(self.project_root, self.lang)
    }

    fn aliases(&self) -> Arc<AliasMap> {
        self.configs.aliases(self.project_root)
    }
}

// ---------------------------------------------------------------------------
// TypeScript / JavaScript
// ---------------------------------------------------------------------------

lazy_static! {
    static ref ES_IMPORT_RE: Regex =
        Regex::new(r#"^\s*import\s+(?:type\s+)?(?:[\w*$\s{},]+\s+from\s+)?["']([^"']+)["']"#)
            .unwrap();
    static ref ES_EXPORT_RE: Regex =
        Regex::new(r#"^\s*export\s+(?:type\s+)?[\w*$\s{},]+\s+from\s+["']([^"']+)["']"#).unwrap();
    static ref ES_REQUIRE_RE: Regex =
        Regex::new(r#"(?:require|import)\s*\(\s*["']([^"']+)["']\s*\)"#).unwrap();
}

const TS_EXTS: &[&str] = &["ts", "tsx", "mts", "cts", "js", "jsx"];
const JS_EXTS: &[&str] = &["js", "jsx", "mjs", "cjs", "ts", "tsx"];

fn scan_ecmascript(content: &str, ctx: &Ctx<'_>) -> Vec<PathBuf> {
    let exts = if ctx.lang == Lang::TypeScript { TS_EXTS } else { JS_EXTS };
    let mut out = Vec::new();

    for line in content.lines() {
        for re in [&*ES_IMPORT_RE, &*ES_EXPORT_RE, &*ES_REQUIRE_RE] {
            for caps in re.captures_iter(line) {
                if let Some(hit) = resolve_ecmascript(&caps[1], ctx, exts) {
                    out.push(hit);
                }
            }
        }
    }

    out
}

fn resolve_ecmascript(spec: &str, ctx: &Ctx<'_>, exts: &[&str]) -> Option<PathBuf> {
    if spec.starts_with('.') {
        return probe_module(&ctx.dir.join(spec), exts);
    }

    let aliases = ctx.aliases();
    if let Some(mapped) = aliases.map(spec) {
        if let Some(hit) = probe_module(&mapped, exts) {
            return Some(hit);
        }
    }

    // A source tree that prefixes imports with its own package name
    // resolves against the source roots.
    if let Some(package) = ctx.package_name() {
        if let Some(rest) = spec.strip_prefix(&format!("{}/", package)) {
            for dir in ctx.source_dirs {
                if let Some(hit) = probe_module(&dir.join(rest), exts) {
                    return Some(hit);
                }
            }
        }
    }

    None
}

/// Probe `base` as a module: the path itself, extension variants, then an
/// index file in a directory of that name. First hit wins.
fn probe_module(base: &Path, exts: &[&str]) -> Option<PathBuf> {
    if base.is_file() && Lang::of(base).is_some() {
        return Some(base.to_path_buf());
    }

    for ext in exts {
        let candidate = append_ext(base, ext);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    for ext in exts {
        let candidate = base.join(format!("index.{}", ext));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

// `set_extension` would clobber dotted module names like `user.service`.
fn append_ext(base: &Path, ext: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

lazy_static! {
    static ref PY_FROM_RE: Regex = Regex::new(r"^\s*from\s+([\w.]+)\s+import\s+(.+)").unwrap();
    static ref PY_IMPORT_RE: Regex = Regex::new(r"^\s*import\s+([\w., ]+)").unwrap();
}

fn scan_python(content: &str, ctx: &Ctx<'_>) -> Vec<PathBuf> {
    let mut out = Vec::new();

    for line in content.lines() {
        if let Some(caps) = PY_FROM_RE.captures(line) {
            let module = &caps[1];

            if module.chars().all(|c| c == '.') {
                // `from . import a, b` names sibling modules directly.
                let base = climb(&ctx.dir, module.len() - 1);
                for name in caps[2].split(',') {
                    let name = name.trim().split_whitespace().next().unwrap_or("");
                    out.extend(base.as_ref().and_then(|b| probe_python(&b.join(name))));
                }
            } else {
                out.extend(resolve_python(module, ctx));
            }
        } else if let Some(caps) = PY_IMPORT_RE.captures(line) {
            for module in caps[1].split(',') {
                let module = module.trim().split_whitespace().next().unwrap_or("");
                out.extend(resolve_python(module, ctx));
            }
        }
    }

    out
}

fn resolve_python(module: &str, ctx: &Ctx<'_>) -> Option<PathBuf> {
    if module.is_empty() {
        return None;
    }

    if let Some(stripped) = module.strip_prefix('.') {
        let ups = stripped.chars().take_while(|&c| c == '.').count();
        let rest = &stripped[ups..];
        let base = climb(&ctx.dir, ups)?;
        return probe_python_dotted(&base, rest);
    }

    let package = ctx.package_name();
    let first = module.split('.').next().unwrap_or("");
    let project_root = ctx.project_root.to_path_buf();

    for root in ctx.source_dirs.iter().chain(std::iter::once(&project_root)) {
        let anchored = package.as_deref() == Some(first) || root.join(first).is_dir();
        if anchored {
            if let Some(hit) = probe_python_dotted(root, module) {
                return Some(hit);
            }
        }
    }

    None
}

/// Resolve a dotted module path under `base`, falling back to the parent
/// module when the last segment is a symbol rather than a file.
fn probe_python_dotted(base: &Path, dotted: &str) -> Option<PathBuf> {
    let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();

    if segments.is_empty() {
        return probe_python(&base.join("__init__"));
    }

    let full: PathBuf = base.join(segments.iter().join("/"));
    if let Some(hit) = probe_python(&full) {
        return Some(hit);
    }

    if segments.len() > 1 {
        let parent: PathBuf = base.join(segments[..segments.len() - 1].iter().join("/"));
        return probe_python(&parent);
    }

    None
}

fn probe_python(base: &Path) -> Option<PathBuf> {
    let as_file = append_ext(base, "py");
    if as_file.is_file() {
        return Some(as_file);
    }

    let as_package = base.join("__init__.py");
    if as_package.is_file() {
        return Some(as_package);
    }

    None
}

fn climb(dir: &Path, ups: usize) -> Option<PathBuf> {
    let mut out = dir.to_path_buf();
    for _ in 0..ups {
        out = out.parent()?.to_path_buf();
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Rust
// ---------------------------------------------------------------------------

lazy_static! {
    static ref RS_MOD_RE: Regex =
        Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+([A-Za-z_]\w*)\s*;").unwrap();
    static ref RS_USE_RE: Regex =
        Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?use\s+(crate|super|self)::([\w:]+)").unwrap();
}

fn scan_rust(content: &str, ctx: &Ctx<'_>) -> Vec<PathBuf> {
    let mut out = Vec::new();

    for line in content.lines() {
        if let Some(caps) = RS_MOD_RE.captures(line) {
            out.extend(probe_rust(&rust_module_dir(ctx.file), &[&caps[1]]));
        } else if let Some(caps) = RS_USE_RE.captures(line) {
            let segments: Vec<&str> =
                caps[2].split("::").take_while(|s| !s.is_empty() && !s.contains('{')).collect();

            let base = match &caps[1] {
                "crate" => ctx.source_dirs.first().cloned(),
                "super" => ctx.dir.parent().map(|p| p.to_path_buf()),
                _ => Some(rust_module_dir(ctx.file)),
            };

            if let Some(base) = base {
                // The tail of a use path is usually an item, not a module;
                // probe progressively shorter prefixes.
                for end in (1..=segments.len()).rev() {
                    if let Some(hit) = probe_rust(&base, &segments[..end]) {
                        out.push(hit);
                        break;
                    }
                }
            }
        }
    }

    out
}

/// The directory a file's child modules live in.
fn rust_module_dir(file: &Path) -> PathBuf {
    let dir = file.parent().unwrap_or(Path::new("")).to_path_buf();
    let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("");

    match stem {
        "mod" | "lib" | "main" => dir,
        _ => dir.join(stem),
    }
}

fn probe_rust(base: &Path, segments: &[&str]) -> Option<PathBuf> {
    if segments.is_empty() {
        return None;
    }

    let joined: PathBuf = base.join(segments.iter().join("/"));

    let as_file = append_ext(&joined, "rs");
    if as_file.is_file() {
        return Some(as_file);
    }

    let as_mod = joined.join("mod.rs");
    if as_mod.is_file() {
        return Some(as_mod);
    }

    None
}

// ---------------------------------------------------------------------------
// Go
// ---------------------------------------------------------------------------

lazy_static! {
    static ref GO_SINGLE_RE: Regex = Regex::new(r#"^\s*import\s+(?:\w+\s+)?"([^"]+)""#).unwrap();
    static ref GO_BLOCK_OPEN_RE: Regex = Regex::new(r"^\s*import\s*\(").unwrap();
    static ref GO_BLOCK_LINE_RE: Regex = Regex::new(r#"^\s*(?:[\w.]+\s+)?"([^"]+)""#).unwrap();
}

fn scan_go(content: &str, ctx: &Ctx<'_>) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut in_block = false;

    for line in content.lines() {
        if in_block {
            if line.trim_start().starts_with(')') {
                in_block = false;
            } else if let Some(caps) = GO_BLOCK_LINE_RE.captures(line) {
                out.extend(resolve_go(&caps[1], ctx));
            }
        } else if GO_BLOCK_OPEN_RE.is_match(line) {
            in_block = true;
        } else if let Some(caps) = GO_SINGLE_RE.captures(line) {
            out.extend(resolve_go(&caps[1], ctx));
        }
    }

    out.into_iter().flatten().collect()
}

/// Go imports name a package directory; the dependency lands on every file
/// in it.
fn resolve_go(spec: &str, ctx: &Ctx<'_>) -> Option<Vec<PathBuf>> {
    let dir = if spec.starts_with('.') {
        ctx.dir.join(spec)
    } else {
        let package = ctx.package_name()?;
        let rest = spec.strip_prefix(&package)?.trim_start_matches('/');
        ctx.project_root.join(rest)
    };

    if !dir.is_dir() {
        return None;
    }

    let files = fs::read_dir(&dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && Lang::of(p) == Some(Lang::Go) && is_source_file(p))
        .sorted()
        .collect_vec();

    Some(files)
}

// ---------------------------------------------------------------------------
// C / C++
// ---------------------------------------------------------------------------

lazy_static! {
    static ref INCLUDE_RE: Regex = Regex::new(r#"^\s*#\s*include\s*"([^"]+)""#).unwrap();
}

fn scan_c_family(content: &str, ctx: &Ctx<'_>) -> Vec<PathBuf> {
    let mut out = Vec::new();

    for line in content.lines() {
        if let Some(caps) = INCLUDE_RE.captures(line) {
            out.extend(resolve_include(&caps[1], ctx));
        }
    }

    out
}

/// Quoted includes probe the file's directory, then the source roots, then
/// the project root's immediate subdirectories.
fn resolve_include(spec: &str, ctx: &Ctx<'_>) -> Option<PathBuf> {
    let local = ctx.dir.join(spec);
    if local.is_file() {
        return Some(local);
    }

    for dir in ctx.source_dirs {
        let candidate = dir.join(spec);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    let entries = fs::read_dir(ctx.project_root).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name();

        if path.is_dir() && !is_skipped_dir_name(&name.to_string_lossy()) {
            let candidate = path.join(spec);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Project-level configuration
// ---------------------------------------------------------------------------

/// Parsed project configuration, cached per project root until the graph is
/// rebuilt.
#[derive(Default)]
pub struct ConfigCache {
    aliases: Mutex<HashMap<PathBuf, Arc<AliasMap>>>,
    packages: Mutex<HashMap<(PathBuf, Lang), Option<String>>>,
}

impl ConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        self.aliases.lock().unwrap().clear();
        self.packages.lock().unwrap().clear();
    }

    fn aliases(&self, root: &Path) -> Arc<AliasMap> {
        let mut cached = self.aliases.lock().unwrap();

        if let Some(map) = cached.get(root) {
            return map.clone();
        }

        let map = Arc::new(AliasMap::load(root));
        cached.insert(root.to_path_buf(), map.clone());
        map
    }

    fn package_name(&self, root: &Path, lang: Lang) -> Option<String> {
        let mut cached = self.packages.lock().unwrap();

        cached
            .entry((root.to_path_buf(), lang))
            .or_insert_with(|| lang.package_name(root))
            .clone()
    }
}

/// The path-alias table of a tsconfig/jsconfig `compilerOptions.paths` map.
pub struct AliasMap {
    base: PathBuf,
    entries: Vec<(String, String)>,
}

impl AliasMap {
    fn empty(root: &Path) -> Self {
        Self { base: root.to_path_buf(), entries: Vec::new() }
    }

    fn load(root: &Path) -> Self {
        for name in ["tsconfig.json", "jsconfig.json"] {
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }

            match Self::parse(root, &path) {
                Ok(map) => return map,
                Err(err) => {
                    log::warn!("Ignoring path aliases: {}", err);
                    return Self::empty(root);
                }
            }
        }

        Self::empty(root)
    }

    fn parse(root: &Path, path: &Path) -> crate::error::Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| RippleError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })?;

        // tsconfig files routinely carry line comments.
        let stripped =
            text.lines().filter(|l| !l.trim_start().starts_with("//")).join("\n");

        let value: serde_json::Value =
            serde_json::from_str(&stripped).map_err(|e| RippleError::MalformedConfig {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let options = value.get("compilerOptions");
        let base_url =
            options.and_then(|o| o.get("baseUrl")).and_then(|b| b.as_str()).unwrap_or(".");
        let base = normalize_path(root.join(base_url));

        let mut entries = Vec::new();

        if let Some(paths) = options.and_then(|o| o.get("paths")).and_then(|p| p.as_object()) {
            for (pattern, targets) in paths {
                let target = targets.as_array().and_then(|a| a.first()).and_then(|t| t.as_str());
                if let Some(target) = target {
                    entries.push((
                        pattern.trim_end_matches('*').to_string(),
                        target.trim_end_matches('*').to_string(),
                    ));
                }
            }
        }

        // Longest prefix first so `@app/core/` beats `@app/`.
        entries.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
        Ok(Self { base, entries })
    }

    fn map(&self, spec: &str) -> Option<PathBuf> {
        for (prefix, target) in &self.entries {
            if let Some(rest) = spec.strip_prefix(prefix.as_str()) {
                return Some(self.base.join(format!("{}{}", target, rest)));
            }
        }

        None
    }
}
