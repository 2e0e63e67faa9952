//! Glob matching for build sources and `includeFiles`.

use globset::{GlobBuilder, GlobMatcher};

/// A compiled glob matched against `/`-separated relative paths.
///
/// `*` and `?` never cross a `/`; `**` spans directories.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    matcher: GlobMatcher,
}

impl GlobPattern {
    /// Compiles a glob. A leading `/` is dropped so patterns stay relative to
    /// the project root.
    ///
    /// # Examples
    ///
    /// ```
    /// use devhost_core::pattern::GlobPattern;
    ///
    /// let glob = GlobPattern::new("api/**/*.{js,ts}").unwrap();
    /// assert!(glob.is_match("api/users/list.ts"));
    /// assert!(glob.is_match("api/index.js"));
    /// assert!(!glob.is_match("public/index.js"));
    /// ```
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        let source = pattern.trim_start_matches('/').to_string();
        let matcher = GlobBuilder::new(&source)
            .literal_separator(true)
            .backslash_escape(true)
            .build()?
            .compile_matcher();
        Ok(Self { source, matcher })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, relative_path: &str) -> bool {
        self.matcher.is_match(relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str) -> GlobPattern {
        GlobPattern::new(p).expect("valid glob")
    }

    #[test]
    fn single_star_stays_in_one_segment() {
        let g = glob("api/*.js");
        assert!(g.is_match("api/hello.js"));
        assert!(!g.is_match("api/nested/hello.js"));
    }

    #[test]
    fn double_star_spans_directories() {
        assert!(glob("**").is_match("a/b/c.txt"));
        assert!(glob("**/*.md").is_match("README.md"));
        assert!(glob("**/*.md").is_match("docs/guide/intro.md"));
        assert!(glob("docs/**").is_match("docs/a/b"));
    }

    #[test]
    fn leading_slash_is_relative_to_root() {
        let g = glob("/index.html");
        assert_eq!(g.as_str(), "index.html");
        assert!(g.is_match("index.html"));
    }

    #[test]
    fn classes_and_literals() {
        assert!(glob("file[0-9].txt").is_match("file3.txt"));
        assert!(!glob("file[!0-9].txt").is_match("file3.txt"));
        assert!(glob("a+b.txt").is_match("a+b.txt"));
        assert!(!glob("a.txt").is_match("abtxt"));
    }

    #[test]
    fn unbalanced_groups_are_rejected() {
        assert!(GlobPattern::new("api/{a,b").is_err());
    }
}
