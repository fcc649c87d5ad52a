//! Structural cache keys.
//!
//! A [`CacheKey`] is an ordered sequence of primitive tokens. Two keys are
//! equal when their token sequences are equal, and keys form a prefix
//! hierarchy: `["posts"]` covers `["posts", "byId", 42]`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One primitive segment of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyToken {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyToken::Bool(b) => write!(f, "{}", b),
            KeyToken::Int(i) => write!(f, "{}", i),
            KeyToken::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for KeyToken {
    fn from(value: &str) -> Self {
        KeyToken::Str(value.to_string())
    }
}

impl From<String> for KeyToken {
    fn from(value: String) -> Self {
        KeyToken::Str(value)
    }
}

impl From<&String> for KeyToken {
    fn from(value: &String) -> Self {
        KeyToken::Str(value.clone())
    }
}

impl From<bool> for KeyToken {
    fn from(value: bool) -> Self {
        KeyToken::Bool(value)
    }
}

impl From<i64> for KeyToken {
    fn from(value: i64) -> Self {
        KeyToken::Int(value)
    }
}

impl From<i32> for KeyToken {
    fn from(value: i32) -> Self {
        KeyToken::Int(i64::from(value))
    }
}

impl From<u32> for KeyToken {
    fn from(value: u32) -> Self {
        KeyToken::Int(i64::from(value))
    }
}

impl From<usize> for KeyToken {
    fn from(value: usize) -> Self {
        // Page indices and counters never approach i64::MAX.
        KeyToken::Int(value as i64)
    }
}

/// Identifier of a cached value.
///
/// Ordering is lexicographic over tokens; the mutation pipeline relies on it
/// to acquire per-key locks in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeyToken>);

impl CacheKey {
    /// The empty key. It is a prefix of every key.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a key from a token sequence.
    pub fn from_tokens(tokens: Vec<KeyToken>) -> Self {
        Self(tokens)
    }

    /// Return a new key with `token` appended.
    pub fn child(&self, token: impl Into<KeyToken>) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(token.into());
        Self(tokens)
    }

    /// Append a token in place.
    pub fn push(&mut self, token: impl Into<KeyToken>) {
        self.0.push(token.into());
    }

    pub fn tokens(&self) -> &[KeyToken] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` matches the leading tokens of this key.
    ///
    /// Every key starts with itself and with the root key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// The key with its last token removed, or `None` for the root.
    pub fn parent(&self) -> Option<CacheKey> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for token in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            write!(f, "{}", token)?;
            first = false;
        }
        Ok(())
    }
}

impl From<Vec<KeyToken>> for CacheKey {
    fn from(tokens: Vec<KeyToken>) -> Self {
        Self(tokens)
    }
}

/// Build a [`CacheKey`] from a list of token expressions.
///
/// ```
/// use ripple_core::cache_key;
/// let key = cache_key!["posts", "byId", 42];
/// assert_eq!(key.to_string(), "posts/byId/42");
/// ```
#[macro_export]
macro_rules! cache_key {
    () => {
        $crate::key::CacheKey::root()
    };
    ($($token:expr),+ $(,)?) => {
        $crate::key::CacheKey::from_tokens(vec![$($crate::key::KeyToken::from($token)),+])
    };
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_structural_equality() {
        let a = cache_key!["posts", "byId", 42];
        let b = CacheKey::from_tokens(vec!["posts".into(), "byId".into(), 42i64.into()]);
        assert_eq!(a, b);
        assert_ne!(a, cache_key!["posts", "byId", "42"]);
    }

    #[test]
    fn test_prefix_hierarchy() {
        let posts = cache_key!["posts"];
        let detail = cache_key!["posts", "byId", 42];
        assert!(detail.starts_with(&posts));
        assert!(detail.starts_with(&detail));
        assert!(detail.starts_with(&CacheKey::root()));
        assert!(!posts.starts_with(&detail));
        assert!(!cache_key!["postsX"].starts_with(&posts));
    }

    #[test]
    fn test_child_and_parent() {
        let list = cache_key!["todos"].child("list");
        assert_eq!(list, cache_key!["todos", "list"]);
        assert_eq!(list.parent(), Some(cache_key!["todos"]));
        assert_eq!(CacheKey::root().parent(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(cache_key!["todos", "detail", "7"].to_string(), "todos/detail/7");
        assert_eq!(cache_key!["flag", true].to_string(), "flag/true");
        assert_eq!(CacheKey::root().to_string(), "");
    }

    #[test]
    fn test_serde_is_a_plain_array() {
        let key = cache_key!["posts", "byId", 42];
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["posts","byId",42]"#);
        let back: CacheKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    fn arb_token() -> impl Strategy<Value = KeyToken> {
        prop_oneof![
            any::<bool>().prop_map(KeyToken::Bool),
            any::<i64>().prop_map(KeyToken::Int),
            "[a-z]{1,6}".prop_map(KeyToken::Str),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any key extended with more tokens still starts with the original.
        #[test]
        fn prop_extension_keeps_prefix(
            base in prop::collection::vec(arb_token(), 0..4),
            extra in prop::collection::vec(arb_token(), 0..4),
        ) {
            let prefix = CacheKey::from_tokens(base.clone());
            let mut tokens = base;
            tokens.extend(extra);
            let key = CacheKey::from_tokens(tokens);
            prop_assert!(key.starts_with(&prefix));
        }

        /// A longer key is never a prefix of a shorter one.
        #[test]
        fn prop_longer_key_is_not_prefix(
            tokens in prop::collection::vec(arb_token(), 0..4),
            extra in arb_token(),
        ) {
            let short = CacheKey::from_tokens(tokens);
            let long = short.child(extra);
            prop_assert!(!short.starts_with(&long));
        }
    }
}
