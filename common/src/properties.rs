// Copyright 2024 Oxide Computer Company
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Flat `key = value` configuration file, one entry per line.
///
/// Lines starting with `#` and blank lines are skipped. Values keep their
/// interior whitespace; keys and values are trimmed at the edges. Later
/// entries override earlier ones.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read {:?}", path))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected 'key = value', got {:?}", lineno + 1, raw);
            };
            let key = key.trim();
            if key.is_empty() {
                bail!("line {}: empty key", lineno + 1);
            }
            entries.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Properties { entries })
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn get_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.entries.get(key).map(|s| s.as_str()).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.entries
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.entries
            .get(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// Booleans follow the original convention: any nonzero integer is true,
    /// and the words `true` / `false` are also accepted.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.entries.get(key).map(|s| s.as_str()) {
            None => default,
            Some("true") => true,
            Some("false") => false,
            Some(s) => s.parse::<i64>().map(|v| v != 0).unwrap_or(default),
        }
    }
}
