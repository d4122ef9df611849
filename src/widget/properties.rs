/// Widget property text format
///
/// Newline separated `key=value` lines. A later duplicate key overrides the
/// earlier value in place, so the first occurrence keeps its position. Line
/// breaks inside values are stored escaped (`\n`) and handed to editors raw.

use serde::{Deserialize, Serialize};

/// Ordered key -> value properties of a widget instance or category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse stored properties text
    pub fn parse(text: &str) -> Self {
        let mut properties = Self::new();

        for line in text.lines() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                tracing::debug!("⏭️ Skipping property line without '=': {}", line);
                continue;
            };

            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            properties.insert(key, unescape(value.trim_end_matches('\r')));
        }

        properties
    }

    /// Insert or override a value, keeping the key's original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Base entries first, then overrides applied on top
    pub fn merge(base: &Properties, overrides: &Properties) -> Properties {
        let mut merged = base.clone();
        for (key, value) in overrides.iter() {
            merged.insert(key, value);
        }
        merged
    }

    /// Serialize for storage: line breaks and backslashes escaped
    pub fn to_storage_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, escape(v)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Serialize for an editor: values written raw
    pub fn to_editing_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('r') => unescaped.push('\r'),
            Some('\\') => unescaped.push('\\'),
            // Unknown escapes are kept verbatim
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_duplicates_override_in_place() {
        let props = Properties::parse("A=1\nB=2\nA=3");
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("A"), Some("3"));
        let keys: Vec<&str> = props.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[test]
    fn skips_blank_comment_and_malformed_lines() {
        let props = Properties::parse("\n# comment\nnot a property\n  KEY = value with = sign\r\n=orphan");
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("KEY"), Some(" value with = sign"));
    }

    #[test]
    fn encoded_line_breaks_are_decoded_and_re_escaped_for_storage() {
        let props = Properties::parse("QUERY=select *\\nfrom builds\\n\nPATH=C:\\\\temp");
        assert_eq!(props.get("QUERY"), Some("select *\nfrom builds\n"));
        assert_eq!(props.get("PATH"), Some("C:\\temp"));

        let stored = props.to_storage_text();
        assert_eq!(stored, "QUERY=select *\\nfrom builds\\n\nPATH=C:\\\\temp");
        assert_eq!(Properties::parse(&stored), props);
    }

    #[test]
    fn editing_text_keeps_values_raw() {
        let mut props = Properties::new();
        props.insert("MESSAGE", "line one\nline two");
        assert_eq!(props.to_editing_text(), "MESSAGE=line one\nline two");
    }

    #[test]
    fn merge_applies_overrides_after_base() {
        let category = Properties::parse("HOST=ci.example.org\nUSER=bot");
        let instance = Properties::parse("USER=alice\nJOB=nightly");
        let merged = Properties::merge(&category, &instance);

        assert_eq!(merged.get("HOST"), Some("ci.example.org"));
        assert_eq!(merged.get("USER"), Some("alice"));
        assert_eq!(merged.get("JOB"), Some("nightly"));
        assert!(!merged.contains_key("MISSING"));
    }
}
