/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! A small ini-style configuration reader.
//!
//! The format is the one used by `.tcfconfig` files:
//!
//! ```ini
//! [allocation]
//! keepalive_period_ms = 5000   # trailing comments are allowed
//! ; full-line comments use `#` or `;`
//! ```
//!
//! Values are kept as raw strings and only converted when a typed config
//! asks for them via [`TcfConfig::parse`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use allocative::Allocative;
use anyhow::Context;
use itertools::Itertools;

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("Expected line of the form `key = value` but key was empty. Line was `{0}`")]
    EmptyKey(String),
    #[error("Improperly formatted section. Expected something of the form `[section]`, got {0}")]
    SectionMissingTrailingBracket(String),
    #[error(
        "Couldn't parse line {line} of `{path}`. Expected section (`[some_section]`) or key assignment (`some_key = some_value`). Got `{text}`"
    )]
    InvalidLine {
        path: String,
        line: usize,
        text: String,
    },
    #[error("Key/value `{0}` appears before any `[section]` marker")]
    NoSection(String),
    #[error("Expected override of the form `section.key=value`, got `{0}`")]
    InvalidOverride(String),
    #[error("Failed to parse `{section}.{key}` value `{value}`: {message}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        message: String,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Allocative)]
pub struct TcfConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl TcfConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Reading config file `{}`", path.display()))?;
        Self::parse_str(&text, &path.display().to_string())
    }

    /// Parses config text. `path` is only used in error messages.
    pub fn parse_str(text: &str, path: &str) -> anyhow::Result<Self> {
        let mut config = Self::default();
        let mut current: Option<String> = None;

        let lines = text
            .lines()
            .map(|line| line.trim().to_owned())
            .enumerate()
            // Coalesce escaped newlines.
            .coalesce(|(i, mut prev), (j, next)| {
                if prev.ends_with('\\') {
                    prev.truncate(prev.len() - 1);
                    prev.push_str(&next);
                    Ok((i, prev))
                } else {
                    Err(((i, prev), (j, next)))
                }
            })
            .filter(|(_, l)| !l.is_empty() && !l.starts_with('#') && !l.starts_with(';'));

        for (i, line) in lines {
            if let Some(section) = parse_section_marker(&line)? {
                config.sections.entry(section.to_owned()).or_default();
                current = Some(section.to_owned());
            } else if let Some((key, val)) = line.split_once('=') {
                let key = key.trim();
                let val = strip_line_comment(val).trim();
                if key.is_empty() {
                    return Err(ConfigError::EmptyKey(line.clone()).into());
                }
                let section = current
                    .as_ref()
                    .ok_or_else(|| ConfigError::NoSection(line.clone()))?;
                config.set(section, key, val);
            } else {
                return Err(ConfigError::InvalidLine {
                    path: path.to_owned(),
                    line: i + 1,
                    text: line,
                }
                .into());
            }
        }
        Ok(config)
    }

    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    /// Applies a command-line style override, `section.key=value`.
    pub fn apply_override(&mut self, arg: &str) -> anyhow::Result<()> {
        let (section_and_key, value) = arg
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidOverride(arg.to_owned()))?;
        let (section, key) = section_and_key
            .trim()
            .split_once('.')
            .ok_or_else(|| ConfigError::InvalidOverride(arg.to_owned()))?;
        if section.is_empty() || key.is_empty() {
            return Err(ConfigError::InvalidOverride(arg.to_owned()).into());
        }
        self.set(section, key, value);
        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(|v| v.as_str())
    }

    /// Returns `Ok(None)` when the key is absent, an error when present but
    /// not convertible to `T`.
    pub fn parse<T>(&self, section: &str, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(section, key) {
            None => Ok(None),
            Some(value) => match value.parse() {
                Ok(v) => Ok(Some(v)),
                Err(e) => Err(ConfigError::InvalidValue {
                    section: section.to_owned(),
                    key: key.to_owned(),
                    value: value.to_owned(),
                    message: e.to_string(),
                }
                .into()),
            },
        }
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(|s| s.as_str())
    }
}

fn strip_line_comment(line: &str) -> &str {
    match line.split_once(" #") {
        Some((before, _)) => before,
        None => line,
    }
}

fn parse_section_marker(line: &str) -> anyhow::Result<Option<&str>> {
    match line.strip_prefix('[') {
        Some(remaining) => match strip_line_comment(remaining).trim_end().strip_suffix(']') {
            None => Err(ConfigError::SectionMissingTrailingBracket(line.to_owned()).into()),
            Some(section) => Ok(Some(section.trim())),
        },
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections_and_comments() -> anyhow::Result<()> {
        let config = TcfConfig::parse_str(
            r#"
            # leading comment
            [pairing]
            spin_max = 10 # trailing
            hash_length=12

            ; other style
            [allocation]
            reason = nightly \
              run
            "#,
            "test.tcfconfig",
        )?;
        assert_eq!(Some(10), config.parse::<u64>("pairing", "spin_max")?);
        assert_eq!(Some(12), config.parse::<usize>("pairing", "hash_length")?);
        assert_eq!(Some("nightly run"), config.get("allocation", "reason"));
        assert_eq!(None, config.parse::<u64>("pairing", "missing")?);
        Ok(())
    }

    #[test]
    fn test_bad_value() -> anyhow::Result<()> {
        let config = TcfConfig::parse_str("[pairing]\nspin_max = lots\n", "x")?;
        let err = config.parse::<u64>("pairing", "spin_max").unwrap_err();
        assert!(err.to_string().contains("pairing.spin_max"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_malformed() {
        assert!(TcfConfig::parse_str("[pairing\n", "x").is_err());
        assert!(TcfConfig::parse_str("spin_max = 1\n", "x").is_err());
        assert!(TcfConfig::parse_str("[a]\n= 1\n", "x").is_err());
        assert!(TcfConfig::parse_str("[a]\njunk\n", "x").is_err());
    }

    #[test]
    fn test_override() -> anyhow::Result<()> {
        let mut config = TcfConfig::empty();
        config.apply_override("run.overallocation_factor=3")?;
        assert_eq!(Some(3), config.parse::<u32>("run", "overallocation_factor")?);
        assert!(config.apply_override("nodot=3").is_err());
        assert!(config.apply_override("run.x").is_err());
        Ok(())
    }
}
