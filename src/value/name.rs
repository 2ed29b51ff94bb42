//! Dotted names (`a.b.c`) and their resolution against a scope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::exception::ErrorCode;
use super::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Name(Vec<String>);

impl Name {
    pub fn new<S: Into<String>>(components: impl IntoIterator<Item = S>) -> Self {
        Name(components.into_iter().map(Into::into).collect())
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Everything but the last component.
    pub fn parent(&self) -> Name {
        Name(self.0[..self.0.len().saturating_sub(1)].to_vec())
    }

    /// Resolve against `scope`, component by component.
    ///
    /// Returns an `ErrorName` exception when a component is missing.
    pub fn resolve(&self, scope: &Value) -> Value {
        let mut current = scope.clone();
        for component in &self.0 {
            match current.resolve(component) {
                Some(v) if v.is_exception() => return v,
                Some(v) => current = v,
                None => {
                    return Value::exception(
                        ErrorCode::Name,
                        format!("Could not resolve '{}' in '{}'", self, scope),
                    );
                }
            }
        }
        current
    }

    /// Assign the last component on the object the parent path resolves to.
    pub fn assign(&self, scope: &Value, value: Value) -> Value {
        let Some(last) = self.last() else {
            return Value::exception(ErrorCode::Name, "Cannot assign to an empty name");
        };
        let target = if self.len() == 1 {
            scope.clone()
        } else {
            let parent = self.parent().resolve(scope);
            if parent.is_exception() {
                return parent;
            }
            parent
        };
        target.set(last, value)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for Name {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Name::default());
        }
        let components: Vec<String> = s.split('.').map(str::to_string).collect();
        if components.iter().any(String::is_empty) {
            return Err(format!("invalid name '{}'", s));
        }
        Ok(Name(components))
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name(s.split('.').filter(|c| !c.is_empty()).map(str::to_string).collect())
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.to_string()
    }
}

impl TryFrom<String> for Name {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
