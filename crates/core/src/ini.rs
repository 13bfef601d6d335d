//! INI document loading on top of the `config` crate.
//!
//! Both the settings file and the parameter-mapping file are INI. This
//! module flattens a layered [`config::Config`] into a simple
//! section → key → value map with lowercase names, trimmed values, and
//! inline `;` comments removed.
//!
//! Backslashes are literal, so Windows paths such as `D:\images\out`
//! survive unchanged.

use std::collections::BTreeMap;
use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File, FileFormat, Source, ValueKind};

use crate::error::CoreError;

/// Name used for keys that appear before any `[section]` header.
pub const ROOT_SECTION: &str = "";

/// A parsed INI document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

/// Builder for layering INI files and environment overrides.
///
/// Later layers win over earlier ones.
pub struct IniLoader {
    builder: ConfigBuilder<config::builder::DefaultState>,
    /// First file that could not be read; reported by [`IniLoader::load`].
    read_error: Option<CoreError>,
}

impl IniLoader {
    pub fn new() -> Self {
        Self {
            builder: Config::builder(),
            read_error: None,
        }
    }

    /// Add an INI file. Missing files are an error only when `required`.
    pub fn file(mut self, path: &Path, required: bool) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => self.text(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => self,
            Err(e) => {
                self.read_error.get_or_insert(CoreError::io(path, e));
                self
            }
        }
    }

    /// Add INI text held in memory.
    pub fn text(mut self, text: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(&escape_backslashes(text), FileFormat::Ini));
        self
    }

    /// Add environment overrides of the form `PREFIX__SECTION__KEY`.
    pub fn env(mut self, prefix: &str) -> Self {
        self.builder = self
            .builder
            .add_source(Environment::with_prefix(prefix).separator("__"));
        self
    }

    pub fn load(self) -> Result<IniDocument, CoreError> {
        if let Some(e) = self.read_error {
            return Err(e);
        }
        let config = self.builder.build()?;
        let root = config.collect()?;

        let mut doc = IniDocument::default();
        for (name, value) in root {
            match value.kind {
                ValueKind::Table(table) => {
                    let section = doc.sections.entry(name.to_lowercase()).or_default();
                    for (key, value) in table {
                        section.insert(key.to_lowercase(), clean_value(&value.into_string()?));
                    }
                }
                _ => {
                    doc.sections
                        .entry(ROOT_SECTION.to_string())
                        .or_default()
                        .insert(name.to_lowercase(), clean_value(&value.into_string()?));
                }
            }
        }
        Ok(doc)
    }
}

impl Default for IniLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl IniDocument {
    /// Parse a required INI file.
    pub fn from_path(path: &Path) -> Result<Self, CoreError> {
        if !path.is_file() {
            return Err(CoreError::NotFound {
                entity: "INI file",
                id: path.display().to_string(),
            });
        }
        IniLoader::new().file(path, true).load()
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        IniLoader::new().text(text).load()
    }

    /// Look up a value. Section and key are matched case-insensitively.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(&section.to_lowercase())
            .and_then(|s| s.get(&key.to_lowercase()))
            .map(String::as_str)
    }

    /// Look up a non-empty value, trying each `(section, key)` in turn.
    pub fn first_of(&self, candidates: &[(&str, &str)]) -> Option<&str> {
        candidates
            .iter()
            .filter_map(|(section, key)| self.get(section, key))
            .find(|v| !v.is_empty())
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(&name.to_lowercase())
    }

    /// Parse a value with [`str::parse`], falling back to `default` when
    /// the key is absent or empty.
    pub fn parse_or<T>(&self, section: &str, key: &str, default: T) -> Result<T, CoreError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(section, key).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| {
                CoreError::Config(format!("[{section}] {key} = '{raw}' is invalid: {e}"))
            }),
        }
    }

    /// Parse a boolean flag (`true/false`, `yes/no`, `on/off`, `1/0`).
    pub fn flag_or(&self, section: &str, key: &str, default: bool) -> Result<bool, CoreError> {
        match self.get(section, key).filter(|v| !v.is_empty()) {
            None => Ok(default),
            Some(raw) => parse_flag(raw).ok_or_else(|| {
                CoreError::Config(format!("[{section}] {key} = '{raw}' is not a boolean"))
            }),
        }
    }
}

/// Parse the boolean spellings accepted in INI files.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// The INI parser behind `config` decodes `\\`-escapes; doubling every
/// backslash makes each one come back out as written.
fn escape_backslashes(text: &str) -> String {
    text.replace('\\', "\\\\")
}

/// Strip an inline `;` comment and surrounding whitespace.
fn clean_value(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_string()
}
