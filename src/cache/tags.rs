//! Tag labels attached to cache entries.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Label that groups cache entries for bulk invalidation.
///
/// Three shapes are used:
/// - class-wide: `Card`
/// - instance-scoped: `Overview:c1`
/// - principal-scoped: `u1:Progress:c1` (or `u1:Library` for a whole class)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn class(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn instance(class: &str, id: &str) -> Self {
        Self(format!("{class}:{id}"))
    }

    pub fn principal(principal: &str, class: &str, id: &str) -> Self {
        Self(format!("{principal}:{class}:{id}"))
    }

    pub fn principal_class(principal: &str, class: &str) -> Self {
        Self(format!("{principal}:{class}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_shapes() {
        assert_eq!(Tag::class("Card").as_str(), "Card");
        assert_eq!(Tag::instance("Overview", "c1").as_str(), "Overview:c1");
        assert_eq!(
            Tag::principal("u1", "Progress", "c1").as_str(),
            "u1:Progress:c1"
        );
        assert_eq!(Tag::principal_class("u1", "Library").as_str(), "u1:Library");
    }

    #[test]
    fn serializes_as_plain_string() {
        let tags = vec![Tag::class("Card"), Tag::instance("Quiz", "c1")];
        let json = serde_json::to_string(&tags).expect("serialize tags");
        assert_eq!(json, r#"["Card","Quiz:c1"]"#);
    }
}
