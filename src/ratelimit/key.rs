//! Window key generation and pattern matching.

use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use super::rules::RateLimitConfig;

/// A key that uniquely identifies one identifier's quota within one limit.
///
/// The logical form is `key_prefix + identifier`. Distributed storage adds a
/// limiter-wide namespace in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey(String);

impl WindowKey {
    /// Derive the key for an identifier under a limit.
    pub fn new(config: &RateLimitConfig, identifier: &str) -> Self {
        let mut key = String::with_capacity(config.key_prefix().len() + identifier.len());
        key.push_str(config.key_prefix());
        key.push_str(identifier);
        Self(key)
    }

    /// The logical key, without any storage namespace.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key as stored under `namespace`.
    pub fn storage_key(&self, namespace: &str) -> String {
        format!("{}{}", namespace, self.0)
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A compiled Redis-style glob, as accepted by `SCAN ... MATCH`.
///
/// Supports `*`, `?`, `[abc]`, `[a-z]`, `[^a]` and `\` escapes, so local and
/// distributed resets select the same keys. A malformed pattern matches
/// nothing, which is also what Redis does.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    pattern: String,
    matcher: Option<GlobMatcher>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Self {
        let matcher = GlobBuilder::new(&to_globset_syntax(pattern))
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map(|glob| glob.compile_matcher());

        let matcher = match matcher {
            Ok(matcher) => Some(matcher),
            Err(err) => {
                debug!(pattern = %pattern, error = %err, "Key pattern matches nothing");
                None
            }
        };

        Self {
            pattern: pattern.to_string(),
            matcher,
        }
    }

    /// The pattern as given.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher
            .as_ref()
            .is_some_and(|matcher| matcher.is_match(key))
    }
}

/// Match `text` against a Redis-style glob `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    KeyPattern::new(pattern).matches(text)
}

/// Rewrite Redis glob syntax into the dialect `globset` parses.
///
/// Redis negates classes with `[^`, treats braces literally and lets `**`
/// mean the same as `*`.
fn to_globset_syntax(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        if in_class {
            match c {
                ']' => {
                    in_class = false;
                    out.push(c);
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                _ => out.push(c),
            }
            continue;
        }

        match c {
            '\\' => {
                out.push('\\');
                out.push(chars.next().unwrap_or('\\'));
            }
            '*' => {
                out.push('*');
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
            }
            '{' | '}' => {
                out.push('\\');
                out.push(c);
            }
            '[' => {
                in_class = true;
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            _ => out.push(c),
        }
    }
    out
}
