//! INI configuration document bundled next to the tensor stream.
//!
//! ```text
//! [llama]
//! hidden_size = 4096
//! ...
//!
//! [model]
//! type = llama
//! model_file = model.bin
//! ```
//!
//! Sections and keys keep insertion order so the rendered text is stable.

use std::fmt;

use crate::error::{ExportError, Result};

/// Check that `key = value` renders as exactly one INI entry and parses back
/// to the same key and value.
pub fn validate_entry(key: &str, value: &str) -> Result<()> {
    let bad_key = key.is_empty()
        || key.trim() != key
        || key.starts_with(['[', ';', '#'])
        || key.contains(['\n', '\r', '=']);
    if bad_key {
        return Err(ExportError::UnsupportedConfiguration(format!(
            "invalid config key {key:?}"
        )));
    }
    if value.contains(['\n', '\r']) || value.trim() != value {
        return Err(ExportError::UnsupportedConfiguration(format!(
            "invalid value {value:?} for config key '{key}'"
        )));
    }
    Ok(())
}

/// One `[name]` section with ordered `key = value` entries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl ConfigSection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set `key`, replacing an existing value in place or appending a new entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered collection of sections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDocument {
    sections: Vec<ConfigSection>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sections(&self) -> &[ConfigSection] {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Mutable access to `name`, creating an empty section at the end if missing.
    pub fn section_mut(&mut self, name: &str) -> &mut ConfigSection {
        let position = match self.sections.iter().position(|s| s.name == name) {
            Some(position) => position,
            None => {
                self.sections.push(ConfigSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[position]
    }

    /// Insert `section`, replacing a section of the same name in place.
    pub fn insert_section(&mut self, section: ConfigSection) {
        match self.sections.iter_mut().find(|s| s.name == section.name) {
            Some(existing) => *existing = section,
            None => self.sections.push(section),
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Parse INI text. `;` and `#` start comment lines.
    pub fn parse(text: &str) -> Result<Self> {
        let mut doc = Self::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    ExportError::InvalidStream(format!(
                        "config line {}: unterminated section header",
                        lineno + 1
                    ))
                })?;
                doc.section_mut(name.trim());
                current = Some(name.trim().to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ExportError::InvalidStream(format!(
                    "config line {}: expected 'key = value'",
                    lineno + 1
                )));
            };
            let Some(section) = current.as_deref() else {
                return Err(ExportError::InvalidStream(format!(
                    "config line {}: entry outside of a section",
                    lineno + 1
                )));
            };
            doc.section_mut(section).set(key.trim(), value.trim());
        }

        Ok(doc)
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{key} = {value}")?;
            }
        }
        Ok(())
    }
}
