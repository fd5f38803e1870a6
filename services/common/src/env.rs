//! Dotenv-style environment file reader.
//!
//! Configuration for every stage comes from a single `KEY=VALUE` file rather
//! than the process environment, so one file can describe a whole pipeline
//! deployment and be handed to all three binaries.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading an environment file
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to read environment file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parsed `KEY=VALUE` mapping from a dotenv-style file.
///
/// Grammar: one pair per line; a `#` at the first non-whitespace position
/// marks a comment; blank lines and lines without `=` are skipped; whitespace
/// around keys and values is trimmed; later keys override earlier ones.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    values: HashMap<String, String>,
}

impl EnvFile {
    /// Read and parse an environment file from disk.
    pub fn from_path(path: &Path) -> Result<Self, EnvError> {
        let contents = std::fs::read_to_string(path).map_err(|source| EnvError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&contents))
    }

    /// Parse environment pairs from an in-memory buffer.
    pub fn parse(contents: &str) -> Self {
        let mut values = HashMap::new();

        for line in contents.lines() {
            if is_comment_or_blank(line) {
                continue;
            }
            let Some(pos) = line.find('=') else {
                continue;
            };
            let key = line[..pos].trim();
            let value = line[pos + 1..].trim();
            if !key.is_empty() {
                values.insert(key.to_string(), value.to_string());
            }
        }

        Self { values }
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a value by key, falling back to a default.
    pub fn get_or(&self, key: &str, fallback: &str) -> String {
        self.get(key).unwrap_or(fallback).to_string()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn is_comment_or_blank(line: &str) -> bool {
    match line.trim_start().chars().next() {
        None => true,
        Some('#') => true,
        Some(_) => false,
    }
}
