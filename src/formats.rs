//! Named string formats for the `format` keyword

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::error::Result;

/// Predicate over string data
pub type FormatFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Format {
    Regex(Regex),
    Func(FormatFn),
}

impl Format {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Func(Arc::new(f))
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(value),
            Self::Func(f) => f(value),
        }
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regex(re) => write!(f, "Regex({})", re.as_str()),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// Format name -> predicate
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Format>,
}

const DATE: &str = r"^\d\d\d\d-[0-1]\d-[0-3]\d$";
const TIME: &str = r"^(?i)[0-2]\d:[0-5]\d:[0-5]\d(?:\.\d+)?(?:z|[+-]\d\d(?::?\d\d)?)?$";
const DATE_TIME: &str =
    r"^(?i)\d\d\d\d-[0-1]\d-[0-3]\d[t\s][0-2]\d:[0-5]\d:[0-5]\d(?:\.\d+)?(?:z|[+-]\d\d(?::?\d\d)?)$";
const EMAIL: &str = r"^(?i)[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*$";
const HOSTNAME: &str = r"^(?i)[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[-0-9a-z]{0,61}[0-9a-z])?)*$";
const URI_REFERENCE: &str = r"^[^\s]*$";
const JSON_POINTER: &str = r"^(?:/(?:[^~/]|~0|~1)*)*$";
const RELATIVE_JSON_POINTER: &str = r"^(?:0|[1-9][0-9]*)(?:#|(?:/(?:[^~/]|~0|~1)*)*)$";
const UUID: &str = r"^(?i)(?:urn:uuid:)?[0-9a-f]{8}-(?:[0-9a-f]{4}-){3}[0-9a-f]{12}$";

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the draft-07 formats
    pub fn draft07() -> Result<Self> {
        let mut registry = Self::new();
        registry.add("date", Format::Regex(Regex::new(DATE)?));
        registry.add("time", Format::Regex(Regex::new(TIME)?));
        registry.add("date-time", Format::Regex(Regex::new(DATE_TIME)?));
        registry.add("email", Format::Regex(Regex::new(EMAIL)?));
        registry.add("hostname", Format::Regex(Regex::new(HOSTNAME)?));
        registry.add("ipv4", Format::func(|s| s.parse::<Ipv4Addr>().is_ok()));
        registry.add("ipv6", Format::func(|s| s.parse::<Ipv6Addr>().is_ok()));
        registry.add("uri", Format::func(|s| url::Url::parse(s).is_ok()));
        registry.add("uri-reference", Format::Regex(Regex::new(URI_REFERENCE)?));
        registry.add("json-pointer", Format::Regex(Regex::new(JSON_POINTER)?));
        registry.add(
            "relative-json-pointer",
            Format::Regex(Regex::new(RELATIVE_JSON_POINTER)?),
        );
        registry.add("regex", Format::func(|s| Regex::new(s).is_ok()));
        registry.add("uuid", Format::Regex(Regex::new(UUID)?));
        Ok(registry)
    }

    /// Add or replace a format
    pub fn add(&mut self, name: impl Into<String>, format: Format) {
        self.formats.insert(name.into(), format);
    }

    pub fn get(&self, name: &str) -> Option<&Format> {
        self.formats.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formats.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, value: &str) -> bool {
        FormatRegistry::draft07().unwrap().get(name).unwrap().is_match(value)
    }

    #[test]
    fn test_dates_and_times() {
        assert!(check("date", "2024-02-29"));
        assert!(!check("date", "2024-2-29"));
        assert!(check("time", "10:20:30Z"));
        assert!(check("date-time", "2024-02-29T10:20:30.5+01:00"));
        assert!(!check("date-time", "2024-02-29"));
    }

    #[test]
    fn test_network_formats() {
        assert!(check("ipv4", "192.168.0.1"));
        assert!(!check("ipv4", "256.1.1.1"));
        assert!(check("ipv6", "::1"));
        assert!(check("hostname", "schemas.familiar.dev"));
        assert!(!check("hostname", "-bad.example"));
        assert!(check("email", "ops@familiar.dev"));
        assert!(!check("email", "ops.familiar.dev"));
    }

    #[test]
    fn test_reference_formats() {
        assert!(check("uri", "https://familiar.dev/schemas/a.json"));
        assert!(!check("uri", "a.json"));
        assert!(check("uri-reference", "a.json#/definitions/x"));
        assert!(check("json-pointer", "/a/b~1c"));
        assert!(!check("json-pointer", "a/b"));
        assert!(check("relative-json-pointer", "1/a"));
        assert!(check("relative-json-pointer", "0#"));
    }

    #[test]
    fn test_misc_formats() {
        assert!(check("regex", "^a+$"));
        assert!(!check("regex", "(unclosed"));
        assert!(check("uuid", "123e4567-e89b-12d3-a456-426614174000"));
        assert!(!check("uuid", "123e4567"));
    }

    #[test]
    fn test_custom_format() {
        let mut registry = FormatRegistry::new();
        registry.add("even-length", Format::func(|s| s.len() % 2 == 0));
        assert!(registry.get("even-length").unwrap().is_match("ab"));
        assert!(!registry.contains("date"));
    }
}
