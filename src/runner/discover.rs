use glob::{MatchOptions, Pattern};

/// Default test-file globs.
pub const DEFAULT_TEST_PATTERNS: &[&str] = &[
    "*.test.js",
    "*.spec.js",
    "test_*.py",
    "*_test.py",
    "tests/**",
    "__tests__/**",
];

pub fn default_test_patterns() -> Vec<String> {
    DEFAULT_TEST_PATTERNS.iter().map(|p| p.to_string()).collect()
}

/// Workspace paths matching any of `patterns`, in input order.
///
/// Patterns without a `/` match the file name anywhere in the tree. Invalid
/// patterns are skipped with a warning.
pub fn find_test_files<'a, I>(paths: I, patterns: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let compiled: Vec<(Pattern, bool)> = patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some((pattern, p.contains('/'))),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "ignoring invalid test pattern");
                None
            }
        })
        .collect();

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    paths
        .into_iter()
        .filter(|path| {
            let path: &str = path;
            let name = path.rsplit('/').next().unwrap_or(path);
            compiled.iter().any(|(pattern, anchored)| {
                if *anchored {
                    pattern.matches_with(path, options) || matches_any_suffix(pattern, path, options)
                } else {
                    pattern.matches_with(name, options)
                }
            })
        })
        .map(str::to_string)
        .collect()
}

/// `tests/**` should also match `pkg/tests/a.js`.
fn matches_any_suffix(pattern: &Pattern, path: &str, options: MatchOptions) -> bool {
    path.match_indices('/')
        .any(|(i, _)| pattern.matches_with(&path[i + 1..], options))
}
