//! A small, dependency-free INI-style key file reader/writer.
//!
//! No `ini`/`configparser` crate appears anywhere in the retrieved
//! reference corpus, so this follows the teacher's own habit of hand
//! rolling a line-oriented parser (see `fstab::FsEntry::parse_entries`)
//! rather than reaching for an unrepresented dependency.
//!
//! Format: `[section]` headers, `key=value` pairs, `#`/`;` comment lines,
//! blank lines ignored. Sections and keys preserve insertion order so
//! round-tripping a file (read, maybe modify, write) doesn't reshuffle it.

use std::fmt::Write as _;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    // Section name -> ordered key/value pairs. An empty string key is the
    // preamble before any `[section]` header (unused by this crate's
    // formats, but kept for completeness).
    sections: Vec<(String, Vec<(String, String)>)>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
        let mut current: Option<usize> = None;

        for (lineno, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                let Some(end) = line.find(']') else {
                    return Err(Error::Other(format!(
                        "malformed section header on line {}: {}",
                        lineno + 1,
                        raw_line
                    )));
                };
                let name = line[1..end].to_string();
                if let Some(idx) = sections.iter().position(|(n, _)| n == &name) {
                    current = Some(idx);
                } else {
                    sections.push((name, Vec::new()));
                    current = Some(sections.len() - 1);
                }
                continue;
            }
            let Some(eq) = line.find('=') else {
                return Err(Error::Other(format!(
                    "malformed key/value on line {}: {}",
                    lineno + 1,
                    raw_line
                )));
            };
            let key = line[..eq].trim().to_string();
            let value = line[eq + 1..].trim().to_string();
            let Some(idx) = current else {
                return Err(Error::Other(format!(
                    "key/value pair outside of any section on line {}",
                    lineno + 1
                )));
            };
            sections[idx].1.push((key, value));
        }

        Ok(KeyFile { sections })
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|(n, _)| n.as_str())
    }

    pub fn keys(&self, group: &str) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .find(|(n, _)| n == group)
            .into_iter()
            .flat_map(|(_, kvs)| kvs.iter().map(|(k, _)| k.as_str()))
    }

    /// Consumes (looks up, does not remove) a string value.
    pub fn get_string(&self, group: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(n, _)| n == group)
            .and_then(|(_, kvs)| kvs.iter().find(|(k, _)| k == key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_bool(&self, group: &str, key: &str) -> Result<Option<bool>> {
        match self.get_string(group, key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::Other(format!(
                "invalid boolean value '{}' for key '{}' in [{}]",
                other, key, group
            ))),
        }
    }

    pub fn get_u64(&self, group: &str, key: &str) -> Result<Option<u64>> {
        match self.get_string(group, key) {
            None => Ok(None),
            Some(s) => s
                .parse::<u64>()
                .map(Some)
                .map_err(|e| Error::Other(format!("invalid integer for key '{}': {}", key, e))),
        }
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: impl Into<String>) {
        let idx = match self.sections.iter().position(|(n, _)| n == group) {
            Some(idx) => idx,
            None => {
                self.sections.push((group.to_string(), Vec::new()));
                self.sections.len() - 1
            }
        };
        let kvs = &mut self.sections[idx].1;
        if let Some(existing) = kvs.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.into();
        } else {
            kvs.push((key.to_string(), value.into()));
        }
    }

    pub fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set_string(group, key, if value { "true" } else { "false" });
    }

    pub fn to_string_pretty(&self) -> String {
        let mut out = String::new();
        for (section, kvs) in &self.sections {
            let _ = writeln!(out, "[{}]", section);
            for (k, v) in kvs {
                let _ = writeln!(out, "{}={}", k, v);
            }
        }
        out
    }

    /// All groups matching a `prefix.` dotted-name pattern, split on the
    /// remaining dots, in file declaration order (not sorted: slot
    /// graph construction relies on first-declared-first iteration).
    pub fn dotted_groups(&self, prefix: &str) -> Vec<(String, Vec<String>)> {
        let mut out = Vec::new();
        let needle = format!("{}.", prefix);
        for group in self.groups() {
            if let Some(rest) = group.strip_prefix(&needle) {
                out.push((
                    group.to_string(),
                    rest.split('.').map(|s| s.to_string()).collect(),
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sections_and_keys() {
        let raw = "[system]\ncompatible=my-device\nbootname=\n\n[slot.rootfs.0]\ndevice=/dev/sda1\n";
        let kf = KeyFile::parse(raw).unwrap();
        assert_eq!(kf.get_string("system", "compatible"), Some("my-device"));
        assert_eq!(kf.get_string("slot.rootfs.0", "device"), Some("/dev/sda1"));
    }

    #[test]
    fn rejects_key_without_section() {
        let raw = "compatible=x\n";
        assert!(KeyFile::parse(raw).is_err());
    }

    #[test]
    fn write_then_parse_preserves_values() {
        let mut kf = KeyFile::new();
        kf.set_string("system", "boot-id", "abc-123");
        kf.set_bool("slot.rootfs.0", "readonly", true);
        let text = kf.to_string_pretty();
        let reparsed = KeyFile::parse(&text).unwrap();
        assert_eq!(reparsed.get_string("system", "boot-id"), Some("abc-123"));
        assert_eq!(reparsed.get_bool("slot.rootfs.0", "readonly").unwrap(), Some(true));
    }
}
