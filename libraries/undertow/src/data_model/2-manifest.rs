//! # ReducerManifest
//! Clients sharing a stream name must be running the same reducer, or their folds diverge and the
//! stream stops being a single value. The manifest records a content hash of the reducer's
//! definition string plus its initial value, written once when the stream name is first used.
//! Every later client checks its own definition against the stored hash; a client that differs is
//! refused and must bump the stream version instead.

use xxhash_rust::xxh3::xxh3_64;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ReducerManifest {
    /// xxh3-64 of the reducer's definition string, hex encoded.
    pub definition_hash: String,
    /// The initial value registered with the stream. Informational: a
    /// divergent initial value under a matching hash only warrants a warning,
    /// because the registered one won.
    pub initial: serde_json::Value,
}

impl ReducerManifest {
    pub fn new(definition: &str, initial: serde_json::Value) -> Self {
        Self {
            definition_hash: hash_definition(definition),
            initial,
        }
    }

    pub fn matches(&self, definition: &str) -> bool {
        self.definition_hash == hash_definition(definition)
    }
}

pub fn hash_definition(definition: &str) -> String {
    format!("{:016x}", xxh3_64(definition.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_sensitive_to_the_definition() {
        let a = hash_definition("users: SIGN_UP and UPDATE");
        let b = hash_definition("users: SIGN_UP and UPDATE");
        let c = hash_definition("users: SIGN_UP, UPDATE and DELETE");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn manifest_matches_its_own_definition() {
        let manifest = ReducerManifest::new("counter v1", serde_json::json!(0));

        assert!(manifest.matches("counter v1"));
        assert!(!manifest.matches("counter v2"));
    }
}
