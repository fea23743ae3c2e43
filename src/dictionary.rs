//! Language/parameter dictionary loader (`spec.md` §6).
//!
//! Line-oriented UTF-8: `# ...` line comments, `KEY value text` entries
//! where the key matches `[A-Za-z_][A-Za-z0-9_.]*` and the value runs to
//! end of line with `\`-continuation across lines. Later duplicate keys
//! override earlier ones. Hand-rolled scanning (no parser-generator crate)
//! mirrors the teacher's own `read_until`/`consume_colon`-style manual
//! scanners for its bespoke template syntax — this is an equally bespoke
//! text format.

use std::collections::HashMap;

/// A parsed key → value text mapping, in last-write-wins order.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    entries: HashMap<String, String>,
}

fn is_key_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of all entries, for callers (e.g. [`crate::config::Configuration`])
    /// that need to partition known vs. unrecognized keys.
    pub fn entries_snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Parse dictionary text, collecting non-fatal malformed-line
    /// diagnostics into `warnings` rather than failing the whole parse.
    pub fn parse(text: &str, warnings: &mut Vec<String>) -> Dictionary {
        let mut dict = Dictionary::new();
        let mut lines = text.lines().peekable();
        let mut lineno = 0usize;

        while let Some(raw_line) = lines.next() {
            lineno += 1;
            let mut line = raw_line.to_string();

            // Follow `\`-continuations: a trailing backslash pulls the next
            // physical line into this logical line.
            while line.ends_with('\\') {
                line.pop();
                match lines.next() {
                    Some(next) => {
                        lineno += 1;
                        line.push('\n');
                        line.push_str(next);
                    }
                    None => break,
                }
            }

            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut chars = trimmed.char_indices();
            let Some((_, first)) = chars.next() else { continue };
            if !is_key_start(first) {
                warnings.push(format!("line {lineno}: invalid key start, line ignored"));
                continue;
            }
            let mut key_end = first.len_utf8();
            for (idx, c) in chars {
                if is_key_char(c) {
                    key_end = idx + c.len_utf8();
                } else {
                    break;
                }
            }
            let key = &trimmed[..key_end];
            let rest = trimmed[key_end..].trim_start();
            if rest.is_empty() && trimmed.len() == key_end {
                warnings.push(format!("line {lineno}: key '{key}' has no value, line ignored"));
                continue;
            }
            dict.insert(key.to_string(), rest.to_string());
        }

        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_entries() {
        let mut warnings = Vec::new();
        let dict = Dictionary::parse("greeting Hello, world!\n# comment\nname Teng\n", &mut warnings);
        assert!(warnings.is_empty());
        assert_eq!(dict.lookup("greeting"), Some("Hello, world!"));
        assert_eq!(dict.lookup("name"), Some("Teng"));
    }

    #[test]
    fn later_duplicate_overrides() {
        let mut warnings = Vec::new();
        let dict = Dictionary::parse("key first\nkey second\n", &mut warnings);
        assert_eq!(dict.lookup("key"), Some("second"));
    }

    #[test]
    fn backslash_continuation_joins_lines() {
        let mut warnings = Vec::new();
        let dict = Dictionary::parse("msg line one \\\nline two\n", &mut warnings);
        assert_eq!(dict.lookup("msg"), Some("line one \nline two"));
    }

    #[test]
    fn invalid_key_is_warned_and_skipped() {
        let mut warnings = Vec::new();
        let dict = Dictionary::parse("1bad value\nok fine\n", &mut warnings);
        assert_eq!(warnings.len(), 1);
        assert_eq!(dict.lookup("ok"), Some("fine"));
    }
}
