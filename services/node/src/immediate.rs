//! Immediate-service registry.
//!
//! Methods listed here bypass a body's serial inbox and run as soon as they
//! are delivered. A key with `params: None` matches every overload of the
//! name; a key with parameter types matches only that exact signature.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::message::{MethodSignature, TypeTag};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub params: Option<Vec<TypeTag>>,
}

impl ServiceKey {
    pub fn any_overload(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    pub fn exact(name: impl Into<String>, params: Vec<TypeTag>) -> Self {
        Self {
            name: name.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Default)]
pub struct ImmediateServices {
    keys: RwLock<HashSet<ServiceKey>>,
}

impl ImmediateServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every overload of `name` becomes immediate.
    pub fn set(&self, name: &str) {
        self.insert(ServiceKey::any_overload(name));
    }

    pub fn set_with_params(&self, name: &str, params: Vec<TypeTag>) {
        self.insert(ServiceKey::exact(name, params));
    }

    /// Removes `name` entirely, including overload-specific registrations.
    pub fn remove(&self, name: &str) -> bool {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let before = keys.len();
        keys.retain(|key| key.name != name);
        before != keys.len()
    }

    /// Removes one overload registration. A name-wide registration stays.
    pub fn remove_with_params(&self, name: &str, params: Vec<TypeTag>) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ServiceKey::exact(name, params))
    }

    pub fn is_immediate(&self, method: &MethodSignature) -> bool {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        if keys.is_empty() {
            return false;
        }
        keys.contains(&ServiceKey::any_overload(method.name.as_str()))
            || keys.contains(&ServiceKey::exact(
                method.name.as_str(),
                method.param_types.clone(),
            ))
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: ServiceKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(names: &[&str]) -> Vec<TypeTag> {
        names.iter().map(|n| TypeTag::from(*n)).collect()
    }

    #[test]
    fn test_name_matches_every_overload() {
        let services = ImmediateServices::new();
        services.set("status");

        assert!(services.is_immediate(&MethodSignature::new("status")));
        assert!(services.is_immediate(&MethodSignature::with_params("status", ["bool"])));
        assert!(!services.is_immediate(&MethodSignature::new("put")));
    }

    #[test]
    fn test_typed_registration_matches_exact_overload() {
        let services = ImmediateServices::new();
        services.set_with_params("get", tags(&["i64"]));

        assert!(services.is_immediate(&MethodSignature::with_params("get", ["i64"])));
        assert!(!services.is_immediate(&MethodSignature::with_params("get", ["String"])));
        assert!(!services.is_immediate(&MethodSignature::new("get")));
    }

    #[test]
    fn test_remove_with_params_keeps_name_wide_registration() {
        let services = ImmediateServices::new();
        services.set("get");
        services.set_with_params("get", tags(&["i64"]));

        assert!(services.remove_with_params("get", tags(&["i64"])));
        assert!(services.is_immediate(&MethodSignature::with_params("get", ["i64"])));
    }

    #[test]
    fn test_remove_clears_all_overloads() {
        let services = ImmediateServices::new();
        services.set("get");
        services.set_with_params("get", tags(&["i64"]));
        services.set("status");

        assert!(services.remove("get"));
        assert!(!services.is_immediate(&MethodSignature::with_params("get", ["i64"])));
        assert_eq!(services.len(), 1);
        assert!(!services.remove("get"));
    }
}
