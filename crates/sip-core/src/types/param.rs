//! # SIP Parameters
//!
//! Parameters attach extra information to URIs (`sip:proxy.example.com;lr`)
//! and to header values (`<sip:bob@example.com>;tag=1928301774`). Both
//! contexts share the same `;name[=value]` grammar, so one ordered list type
//! serves them all.
//!
//! ## Examples
//!
//! ```rust
//! use sipflow_sip_core::prelude::*;
//!
//! let mut params = Params::default();
//! params.set("branch", Some("z9hG4bK776asdhds"));
//! params.set("lr", None::<String>);
//!
//! assert_eq!(params.get("branch"), Some(Some("z9hG4bK776asdhds")));
//! assert!(params.contains("LR"));
//! assert_eq!(params.to_string(), ";branch=z9hG4bK776asdhds;lr");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single `name[=value]` parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name; compared case-insensitively
    pub name: String,
    /// Value, or `None` for flag parameters such as `lr`
    pub value: Option<String>,
}

impl Param {
    /// Creates a parameter with a value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a flag parameter
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

/// Ordered list of parameters, serialized with a leading `;` per entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Params(Vec<Param>);

impl Params {
    /// Looks up a parameter by name.
    ///
    /// Returns `Some(None)` for a flag parameter and `None` when absent.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_deref())
    }

    /// Value of a parameter that carries one
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces an existing parameter in place or appends a new one
    pub fn set(&mut self, name: impl Into<String>, value: Option<impl Into<String>>) {
        let name = name.into();
        let value = value.map(Into::into);
        match self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(&name)) {
            Some(existing) => existing.value = value,
            None => self.0.push(Param { name, value }),
        }
    }

    pub fn push(&mut self, param: Param) {
        self.0.push(param);
    }

    pub fn remove(&mut self, name: &str) -> Option<Param> {
        let index = self.0.iter().position(|p| p.name.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Param>> for Params {
    fn from(params: Vec<Param>) -> Self {
        Params(params)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.0 {
            write!(f, ";{}", param)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_existing_value() {
        let mut params = Params::default();
        params.set("tag", Some("a"));
        params.set("TAG", Some("b"));
        assert_eq!(params.value("tag"), Some("b"));
        assert_eq!(params.iter().count(), 1);
    }

    #[test]
    fn test_remove_returns_param() {
        let mut params = Params::from(vec![Param::flag("lr"), Param::new("transport", "udp")]);
        assert_eq!(params.remove("lr"), Some(Param::flag("lr")));
        assert_eq!(params.to_string(), ";transport=udp");
        assert!(params.remove("lr").is_none());
    }
}
