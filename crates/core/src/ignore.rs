use crate::error::{DevError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Paths never uploaded or built, whatever the project says.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".hg",
    ".git",
    ".gitmodules",
    ".svn",
    ".cache",
    ".next",
    ".now",
    ".vercel",
    ".npmignore",
    ".dockerignore",
    ".gitignore",
    ".*.swp",
    ".DS_Store",
    ".wafpickle-*",
    ".lock-wscript",
    ".env",
    ".env.build",
    ".venv",
    "npm-debug.log",
    "config.gypi",
    "node_modules",
    "__pycache__",
    "venv",
    "CVS",
];

/// Directory holding the tool's own config and cache.
pub const TOOL_DIR: &str = ".devhost";
/// Project-level ignore file read next to `.gitignore`.
pub const IGNORE_FILE: &str = ".devhostignore";

/// Ordered gitignore-style rules for one project root. Paths are always
/// given relative to that root.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    builder: GitignoreBuilder,
    matcher: Gitignore,
    patterns: Vec<String>,
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self {
            builder: GitignoreBuilder::new(""),
            matcher: Gitignore::empty(),
            patterns: Vec::new(),
        }
    }
}

impl IgnoreSet {
    /// Builds a set from gitignore-style lines.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::default();
        set.extend(lines);
        set
    }

    pub fn extend<'a>(&mut self, lines: impl IntoIterator<Item = &'a str>) {
        self.add_lines(None, lines);
    }

    fn add_lines<'a>(&mut self, from: Option<PathBuf>, lines: impl IntoIterator<Item = &'a str>) {
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.builder.add_line(from.clone(), line) {
                Ok(_) => self.patterns.push(line.to_string()),
                Err(err) => debug!("skipping unusable ignore pattern {line:?}: {err}"),
            }
        }
        self.matcher = match self.builder.build() {
            Ok(matcher) => matcher,
            Err(err) => {
                debug!("ignore rules failed to compile: {err}");
                Gitignore::empty()
            }
        };
    }

    /// Patterns in evaluation order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Last matching rule decides; `!` rules re-include. A path below an
    /// ignored directory is ignored.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let relative_path = relative_path.trim_start_matches('/');
        if relative_path.is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative_path, is_dir)
            .is_ignore()
    }
}

/// Computes the effective ignore rules for `root`.
pub fn resolve_ignores(root: &Path) -> Result<IgnoreSet> {
    let mut set = IgnoreSet::from_lines(DEFAULT_IGNORES.iter().copied());
    set.extend([TOOL_DIR, IGNORE_FILE]);

    for name in [".gitignore", IGNORE_FILE] {
        let path = root.join(name);
        match fs::read_to_string(&path) {
            Ok(content) => {
                debug!("loaded ignore rules from {}", path.display());
                set.add_lines(Some(path), content.lines());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(DevError::fs(path, err)),
        }
    }

    Ok(set)
}
