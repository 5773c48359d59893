//! Quirks registry
//!
//! Per-model overrides loaded at startup from `*.conf` files in the quirks
//! directory. Section names are glob patterns matched against the device
//! model string; for every key the value from the most specific matching
//! section wins. Specificity is the number of non-wildcard characters in
//! the pattern; ties go to the section loaded first.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::err::Result;
use crate::inifile;

/// One `[glob]` section from a quirks file.
#[derive(Debug, Clone)]
struct QuirksSection {
    pattern: String,
    /// Count of non-wildcard characters in `pattern`.
    literal_len: usize,
    load_order: usize,
    items: Vec<(String, String)>,
}

/// All quirks sections, in load order.
#[derive(Debug, Default)]
pub struct QuirksDb {
    sections: Vec<QuirksSection>,
}

impl QuirksDb {
    /// Load every `*.conf` under `dir`, alphabetically. A missing
    /// directory simply yields an empty registry.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut db = QuirksDb::default();

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(dir = %dir.display(), "no quirks directory");
                return Ok(db);
            }
        };

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .collect();
        files.sort();

        for file in files {
            let text = fs::read_to_string(&file)?;
            db.add_text(&text, &file.display().to_string())?;
        }

        debug!(sections = db.sections.len(), "quirks loaded");
        Ok(db)
    }

    /// Parse quirks sections out of one file's text.
    pub fn add_text(&mut self, text: &str, origin: &str) -> Result<()> {
        for section in inifile::parse(text, origin)? {
            self.sections.push(QuirksSection {
                literal_len: literal_len(&section.name),
                pattern: section.name,
                load_order: self.sections.len(),
                items: section
                    .items
                    .into_iter()
                    .map(|item| (item.key, item.value))
                    .collect(),
            });
        }
        Ok(())
    }

    /// Merged key/value view for one device model.
    pub fn lookup(&self, model: &str) -> Quirks {
        let mut matching: Vec<&QuirksSection> = self
            .sections
            .iter()
            .filter(|s| glob_match(&s.pattern, model))
            .collect();
        matching.sort_by(|a, b| {
            b.literal_len
                .cmp(&a.literal_len)
                .then(a.load_order.cmp(&b.load_order))
        });

        let mut items: Vec<(String, String)> = Vec::new();
        for section in matching {
            for (key, value) in &section.items {
                if !items.iter().any(|(k, _)| k == key) {
                    items.push((key.clone(), value.clone()));
                }
            }
        }

        Quirks { items }
    }
}

/// The merged overrides that apply to one device.
#[derive(Debug, Clone, Default)]
pub struct Quirks {
    items: Vec<(String, String)>,
}

impl Quirks {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_blacklisted(&self) -> bool {
        self.get("blacklist") == Some("true")
    }

    /// `http-<HeaderName>` overrides: (header name, replacement value).
    /// An empty value means the header is deleted from every forwarded
    /// request.
    pub fn http_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|(k, v)| {
            k.strip_prefix("http-")
                .filter(|name| !name.is_empty())
                .map(|name| (name, v.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Non-wildcard characters of a glob pattern; `\x` counts as one.
fn literal_len(pattern: &str) -> usize {
    let mut count = 0;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' | '?' => {}
            '\\' => {
                if chars.next().is_some() {
                    count += 1;
                }
            }
            _ => count += 1,
        }
    }
    count
}

/// Glob match: `*` any run, `?` exactly one character, `\` escapes.
/// Model strings come from device descriptors, so matching is
/// case-insensitive.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            for skip in 0..=text.len() {
                if glob_match_at(&pattern[1..], &text[skip..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => !text.is_empty() && glob_match_at(&pattern[1..], &text[1..]),
        Some('\\') if pattern.len() > 1 => {
            text.first().is_some_and(|&t| chars_eq(pattern[1], t))
                && glob_match_at(&pattern[2..], &text[1..])
        }
        Some(&c) => {
            text.first().is_some_and(|&t| chars_eq(c, t)) && glob_match_at(&pattern[1..], &text[1..])
        }
    }
}

fn chars_eq(a: char, b: char) -> bool {
    a.eq_ignore_ascii_case(&b)
}
