//! Caller-owned registry of named filter instances.
//!
//! Lets independent pipeline stages refer to "the same" running filter by
//! name. The registry is plain owned data, not process-wide state: whoever
//! owns it decides its lifetime and serializes concurrent access.

use std::collections::HashMap;

use lds_core::{Error, Result};

use crate::kalman::KalmanFilter;

/// Name-to-filter map with exclusive registration and explicit removal.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: HashMap<String, KalmanFilter>,
}

impl FilterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter under `name`. Duplicate names are rejected.
    pub fn register(&mut self, name: impl Into<String>, filter: KalmanFilter) -> Result<()> {
        let name = name.into();
        if self.filters.contains_key(&name) {
            return Err(Error::Validation(format!(
                "a filter named {name} is already registered"
            )));
        }
        self.filters.insert(name, filter);
        Ok(())
    }

    /// Borrow the filter registered under `name`.
    pub fn get(&self, name: &str) -> Option<&KalmanFilter> {
        self.filters.get(name)
    }

    /// Mutably borrow the filter registered under `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut KalmanFilter> {
        self.filters.get_mut(name)
    }

    /// Remove and return the filter registered under `name`.
    pub fn remove(&mut self, name: &str) -> Option<KalmanFilter> {
        self.filters.remove(name)
    }

    /// Whether a filter is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Number of registered filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Iterate over the registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::KalmanParams;

    fn demo_filter() -> KalmanFilter {
        KalmanFilter::new(KalmanParams::isotropic(1, 1, 0.1, 0.1).unwrap())
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut registry = FilterRegistry::new();
        registry.register("tracker", demo_filter()).unwrap();
        assert!(registry.register("tracker", demo_filter()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_allows_reregistration() {
        let mut registry = FilterRegistry::new();
        registry.register("tracker", demo_filter()).unwrap();
        assert!(registry.remove("tracker").is_some());
        assert!(registry.remove("tracker").is_none());
        registry.register("tracker", demo_filter()).unwrap();
        assert!(registry.contains("tracker"));
    }

    #[test]
    fn test_get_mut_advances_the_shared_instance() {
        let mut registry = FilterRegistry::new();
        registry.register("tracker", demo_filter()).unwrap();

        let observations = nalgebra::DMatrix::from_column_slice(2, 1, &[0.9, 1.1]);
        let before = registry.get("tracker").unwrap().belief().clone();
        registry
            .get_mut("tracker")
            .unwrap()
            .filter(&observations)
            .unwrap();
        let after = registry.get("tracker").unwrap().belief();
        assert_ne!(&before, after);
    }
}
