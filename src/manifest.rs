//! Jar manifest parsing.
//!
//! Only what package definition and sealing need: the main section, the
//! per-entry sections keyed by `Name:`, and continuation lines.

use std::collections::BTreeMap;

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

pub const SPECIFICATION_TITLE: &str = "Specification-Title";
pub const SPECIFICATION_VERSION: &str = "Specification-Version";
pub const SPECIFICATION_VENDOR: &str = "Specification-Vendor";
pub const IMPLEMENTATION_TITLE: &str = "Implementation-Title";
pub const IMPLEMENTATION_VERSION: &str = "Implementation-Version";
pub const IMPLEMENTATION_VENDOR: &str = "Implementation-Vendor";
pub const SEALED: &str = "Sealed";

/// Attribute names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    values: BTreeMap<String, String>,
}

impl Attributes {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    main: Attributes,
    entries: BTreeMap<String, Attributes>,
}

impl Manifest {
    pub fn parse(raw: &str) -> Self {
        let mut manifest = Manifest::default();
        let mut section: Option<String> = None;
        let mut current = Attributes::default();
        let mut last: Option<(String, String)> = None;

        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix(' ') {
                if let Some((_, value)) = last.as_mut() {
                    value.push_str(rest);
                }
                continue;
            }

            if let Some((name, value)) = last.take() {
                apply(&mut section, &mut current, name, value);
            }

            if line.trim().is_empty() {
                manifest.close_section(section.take(), std::mem::take(&mut current));
                continue;
            }

            if let Some((name, value)) = line.split_once(':') {
                last = Some((name.trim().to_string(), value.trim_start().to_string()));
            }
        }

        if let Some((name, value)) = last.take() {
            apply(&mut section, &mut current, name, value);
        }
        manifest.close_section(section, current);
        manifest
    }

    fn close_section(&mut self, section: Option<String>, attrs: Attributes) {
        match section {
            Some(name) => {
                self.entries.entry(name).or_default().values.extend(attrs.values);
            }
            None if !attrs.is_empty() => self.main.values.extend(attrs.values),
            None => {}
        }
    }

    pub fn main_attributes(&self) -> &Attributes {
        &self.main
    }

    pub fn attributes(&self, entry: &str) -> Option<&Attributes> {
        self.entries.get(entry)
    }

    /// Looks `name` up in the entry section first, then the main section.
    pub fn lookup(&self, entry: &str, name: &str) -> Option<&str> {
        self.attributes(entry)
            .and_then(|a| a.get(name))
            .or_else(|| self.main.get(name))
    }

    pub fn is_sealed(&self, package: &str) -> bool {
        self.lookup(&package_entry(package), SEALED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

fn apply(section: &mut Option<String>, attrs: &mut Attributes, name: String, value: String) {
    // `Name:` only opens a section as the first line after a blank line.
    if name.eq_ignore_ascii_case("Name") && section.is_none() && attrs.is_empty() {
        *section = Some(value);
        return;
    }
    attrs.insert(&name, value);
}

/// `org.example` -> `org/example/`
pub fn package_entry(package: &str) -> String {
    format!("{}/", package.replace('.', "/"))
}
