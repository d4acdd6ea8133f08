use crate::endpoint::{generate_id, EndpointHandle};
use crate::error::{DapperError, Result};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Active endpoints by id, bounded by a fixed capacity
#[derive(Debug)]
pub struct EndpointRegistry {
    capacity: usize,
    endpoints: RwLock<HashMap<String, EndpointHandle>>,
}

impl EndpointRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            endpoints: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve a slot under a fresh id and register the handle `build` creates for it.
    ///
    /// The capacity check and the insert happen under one lock, so concurrent accepts
    /// can never overshoot.
    pub fn register_with<T, F>(&self, build: F) -> Result<(EndpointHandle, T)>
    where
        F: FnOnce(String) -> (EndpointHandle, T),
    {
        let mut endpoints = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if endpoints.len() >= self.capacity {
            return Err(DapperError::RegistryFull {
                capacity: self.capacity,
            });
        }

        let id = loop {
            let id = generate_id();
            if !endpoints.contains_key(&id) {
                break id;
            }
        };

        let (handle, extra) = build(id.clone());
        endpoints.insert(id, handle.clone());
        Ok((handle, extra))
    }

    pub fn remove(&self, id: &str) -> Option<EndpointHandle> {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<EndpointHandle> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Snapshot of every registered handle
    pub fn handles(&self) -> Vec<EndpointHandle> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint;

    #[test]
    fn test_capacity_is_enforced() {
        let registry = EndpointRegistry::new(3);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (handle, _inbox) = registry.register_with(endpoint::channel).unwrap();
            ids.push(handle.id().to_string());
        }
        assert_eq!(registry.len(), 3);

        let err = registry.register_with(endpoint::channel).unwrap_err();
        assert!(matches!(err, DapperError::RegistryFull { capacity: 3 }));

        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_slot_is_reusable_after_remove() {
        let registry = EndpointRegistry::new(1);
        let (handle, _inbox) = registry.register_with(endpoint::channel).unwrap();
        assert!(registry.register_with(endpoint::channel).is_err());

        assert!(registry.remove(handle.id()).is_some());
        assert!(registry.get(handle.id()).is_none());
        assert!(registry.register_with(endpoint::channel).is_ok());
    }

    #[test]
    fn test_lookup_by_id() {
        let registry = EndpointRegistry::new(2);
        let (handle, _inbox) = registry.register_with(endpoint::channel).unwrap();
        assert_eq!(registry.get(handle.id()).unwrap().id(), handle.id());
        assert!(registry.get("NOSUCHIDXX").is_none());
        assert_eq!(registry.handles().len(), 1);
    }
}
