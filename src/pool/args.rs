//! Connection arguments handed to a connector on every connect
//!
//! `ConnArgs` is an ordered bag of named options. The pool never looks inside
//! it; connectors pick out the keys they understand (`host`/`port` for TCP,
//! `path` for Unix sockets) and ignore the rest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;

/// A single connection argument value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(v) => write!(f, "{}", v),
            ArgValue::Int(v) => write!(f, "{}", v),
            ArgValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<u16> for ArgValue {
    fn from(v: u16) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(i64::from(v))
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

/// Named options passed verbatim to a connector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnArgs(BTreeMap<String, ArgValue>);

impl ConnArgs {
    /// Create an empty argument set
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace an argument, returning the previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy every entry of `other` that is not already set here
    pub fn merge_defaults(&mut self, other: &ConnArgs) {
        for (key, value) in &other.0 {
            self.0.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Get a string argument, failing if it has another type
    pub fn get_str(&self, key: &str) -> io::Result<Option<&str>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ArgValue::Str(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(type_mismatch(key, "string", other)),
        }
    }

    /// Get an integer argument, failing if it has another type
    pub fn get_int(&self, key: &str) -> io::Result<Option<i64>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ArgValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(type_mismatch(key, "integer", other)),
        }
    }

    /// Get a boolean argument, failing if it has another type
    pub fn get_bool(&self, key: &str) -> io::Result<Option<bool>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(ArgValue::Bool(v)) => Ok(Some(*v)),
            Some(other) => Err(type_mismatch(key, "boolean", other)),
        }
    }

    pub fn require_str(&self, key: &str) -> io::Result<&str> {
        self.get_str(key)?.ok_or_else(|| missing(key))
    }

    pub fn require_int(&self, key: &str) -> io::Result<i64> {
        self.get_int(key)?.ok_or_else(|| missing(key))
    }
}

fn missing(key: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("missing connection argument `{}`", key),
    )
}

fn type_mismatch(key: &str, expected: &str, found: &ArgValue) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("connection argument `{}` must be a {}, got `{}`", key, expected, found),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let args = ConnArgs::new()
            .with("host", "127.0.0.1")
            .with("port", 11211u16)
            .with("nodelay", false);

        assert_eq!(args.get_str("host").unwrap(), Some("127.0.0.1"));
        assert_eq!(args.require_int("port").unwrap(), 11211);
        assert_eq!(args.get_bool("nodelay").unwrap(), Some(false));
        assert_eq!(args.get_bool("keepalive").unwrap(), None);
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_missing_and_mismatched() {
        let args = ConnArgs::new().with("port", "not-a-number");

        let err = args.require_str("host").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("host"));

        let err = args.require_int("port").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("integer"));
    }

    #[test]
    fn test_merge_defaults_keeps_existing() {
        let mut args = ConnArgs::new().with("host", "a.example.com");
        let defaults = ConnArgs::new()
            .with("host", "b.example.com")
            .with("port", 6379u16);

        args.merge_defaults(&defaults);

        assert_eq!(args.require_str("host").unwrap(), "a.example.com");
        assert_eq!(args.require_int("port").unwrap(), 6379);
    }

    #[test]
    fn test_yaml_values() {
        let yaml = r#"
nodelay: true
connect_timeout_ms: 250
path: /tmp/backend.sock
"#;
        let args: ConnArgs = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(args.get("nodelay"), Some(&ArgValue::Bool(true)));
        assert_eq!(args.get("connect_timeout_ms"), Some(&ArgValue::Int(250)));
        assert_eq!(args.require_str("path").unwrap(), "/tmp/backend.sock");
    }
}
