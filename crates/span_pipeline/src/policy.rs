//! Sanitization policy and its shared, atomically swapped handle.
//!
//! The policy is read on every attribute write and changed rarely, so the
//! handle keeps an `Arc<SanitizationPolicy>` behind a `RwLock`. Readers clone
//! the `Arc` and never observe a half-applied update; writers build the next
//! policy on a copy, validate it, and swap it in under the write lock.

use crate::config::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Size bound and excluded key-paths applied to every attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizationPolicy {
    max_attribute_size: usize,
    excluded_keys: BTreeSet<String>,
}

impl SanitizationPolicy {
    pub const DEFAULT_MAX_ATTRIBUTE_SIZE: usize = 5 * 1024;

    /// Creates a policy with no excluded keys.
    pub fn new(max_attribute_size: usize) -> Result<Self, ConfigError> {
        validate_max_size(max_attribute_size)?;
        Ok(Self {
            max_attribute_size,
            excluded_keys: BTreeSet::new(),
        })
    }

    pub fn with_excluded_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn max_attribute_size(&self) -> usize {
        self.max_attribute_size
    }

    pub fn excluded_keys(&self) -> &BTreeSet<String> {
        &self.excluded_keys
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_keys.contains(path)
    }

    /// Returns true if any excluded path lies strictly below `prefix`.
    pub fn has_exclusions_under(&self, prefix: &str) -> bool {
        let lower = format!("{prefix}.");
        self.excluded_keys
            .range(lower.clone()..)
            .next()
            .is_some_and(|key| key.starts_with(&lower))
    }

    /// Adds an excluded key-path. Returns false if it was already present.
    pub fn add_excluded_key(&mut self, key: impl Into<String>) -> bool {
        self.excluded_keys.insert(key.into())
    }

    /// Removes an excluded key-path. Returns false if it was not present.
    pub fn remove_excluded_key(&mut self, key: &str) -> bool {
        self.excluded_keys.remove(key)
    }

    pub fn set_max_attribute_size(&mut self, size: usize) -> Result<(), ConfigError> {
        validate_max_size(size)?;
        self.max_attribute_size = size;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_size(self.max_attribute_size)?;
        if self.excluded_keys.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid("excluded key must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for SanitizationPolicy {
    fn default() -> Self {
        Self {
            max_attribute_size: Self::DEFAULT_MAX_ATTRIBUTE_SIZE,
            excluded_keys: BTreeSet::new(),
        }
    }
}

fn validate_max_size(size: usize) -> Result<(), ConfigError> {
    if size == 0 {
        return Err(ConfigError::Invalid(
            "max_attribute_size must be greater than zero".into(),
        ));
    }
    Ok(())
}

/// Shared handle to the current policy. Cloning shares the same slot.
#[derive(Debug, Clone, Default)]
pub struct PolicyHandle {
    current: Arc<RwLock<Arc<SanitizationPolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: SanitizationPolicy) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// Snapshot of the current policy.
    pub fn load(&self) -> Arc<SanitizationPolicy> {
        Arc::clone(&self.current.read())
    }

    /// Applies `f` to a copy of the current policy and swaps it in if the
    /// result validates. On error the current policy is left untouched.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut SanitizationPolicy) -> Result<(), ConfigError>,
    {
        let mut slot = self.current.write();
        let mut next = SanitizationPolicy::clone(&slot);
        f(&mut next)?;
        next.validate()?;
        *slot = Arc::new(next);
        tracing::debug!(
            max_attribute_size = slot.max_attribute_size,
            excluded_keys = slot.excluded_keys.len(),
            "sanitization policy updated"
        );
        Ok(())
    }

    pub fn add_excluded_key(&self, key: impl Into<String>) -> Result<(), ConfigError> {
        let key = key.into();
        self.update(|policy| {
            policy.add_excluded_key(key);
            Ok(())
        })
    }

    pub fn remove_excluded_key(&self, key: &str) -> Result<(), ConfigError> {
        self.update(|policy| {
            policy.remove_excluded_key(key);
            Ok(())
        })
    }

    pub fn set_max_attribute_size(&self, size: usize) -> Result<(), ConfigError> {
        self.update(|policy| policy.set_max_attribute_size(size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_rejected() {
        assert!(SanitizationPolicy::new(0).is_err());
        let mut policy = SanitizationPolicy::default();
        assert!(policy.set_max_attribute_size(0).is_err());
        assert_eq!(
            policy.max_attribute_size(),
            SanitizationPolicy::DEFAULT_MAX_ATTRIBUTE_SIZE
        );
    }

    #[test]
    fn test_excluded_keys_idempotent() {
        let mut policy = SanitizationPolicy::default();
        assert!(policy.add_excluded_key("a.b"));
        assert!(!policy.add_excluded_key("a.b"));
        assert_eq!(policy.excluded_keys().len(), 1);
        assert!(policy.remove_excluded_key("a.b"));
        assert!(!policy.remove_excluded_key("a.b"));
        assert!(policy.excluded_keys().is_empty());
    }

    #[test]
    fn test_has_exclusions_under() {
        let policy = SanitizationPolicy::default()
            .with_excluded_keys(["nested.mapping.partially.excluded", "nestedx"]);
        assert!(policy.has_exclusions_under("nested.mapping"));
        assert!(policy.has_exclusions_under("nested"));
        assert!(!policy.has_exclusions_under("nested.mapping.partially.excluded"));
        assert!(!policy.has_exclusions_under("other"));
    }

    #[test]
    fn test_handle_swap_is_visible_to_clones() {
        let handle = PolicyHandle::new(SanitizationPolicy::default());
        let reader = handle.clone();
        let before = reader.load();

        handle.add_excluded_key("token").unwrap();

        assert!(!before.is_excluded("token"));
        assert!(reader.load().is_excluded("token"));
    }

    #[test]
    fn test_failed_update_leaves_policy_untouched() {
        let handle = PolicyHandle::new(SanitizationPolicy::new(10).unwrap());
        let result = handle.update(|policy| {
            policy.add_excluded_key("x");
            policy.set_max_attribute_size(0)
        });
        assert!(result.is_err());
        let current = handle.load();
        assert_eq!(current.max_attribute_size(), 10);
        assert!(!current.is_excluded("x"));
    }

    #[test]
    fn test_empty_excluded_key_rejected() {
        let handle = PolicyHandle::default();
        assert!(handle.add_excluded_key("").is_err());
        assert!(handle.load().excluded_keys().is_empty());
    }
}
