//! Endpoint registry for tracking registered devices and their subscriptions
//!
//! The registry is the only owner of endpoint state. Every operation takes
//! the single internal lock for its whole duration and never awaits, so
//! callers on any task see each operation as atomic.

pub mod types;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use types::{Endpoint, EndpointRegistration, EndpointStatus, Resource, ResourceDescriptor};

use crate::{Error, Result};

/// Registry of known endpoints keyed by endpoint name
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl EndpointRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new endpoint or merge a registration into an existing one
    ///
    /// The resource list is replaced by the announced one (duplicate URIs
    /// collapse to their first occurrence). Subscription flags survive for
    /// every resource that is still announced; new resources start
    /// unsubscribed. Returns a snapshot of the stored endpoint.
    pub fn register_or_update(
        &self,
        registration: &EndpointRegistration,
        status: EndpointStatus,
    ) -> Endpoint {
        let mut endpoints = self.lock();
        let previous = endpoints.get(&registration.name);

        let mut resources: Vec<Resource> = Vec::with_capacity(registration.resources.len());
        for descriptor in &registration.resources {
            if resources.iter().any(|r| r.uri == descriptor.uri) {
                continue;
            }
            let subscribed = previous
                .and_then(|ep| ep.resource(&descriptor.uri))
                .is_some_and(|r| r.subscribed);
            resources.push(Resource {
                uri: descriptor.uri.clone(),
                content_type: descriptor.content_type.clone(),
                resource_type: descriptor.resource_type.clone(),
                observable: descriptor.observable,
                subscribed,
            });
        }

        let endpoint = Endpoint {
            name: registration.name.clone(),
            endpoint_type: registration
                .endpoint_type
                .clone()
                .or_else(|| previous.and_then(|ep| ep.endpoint_type.clone())),
            status,
            queue_mode: registration.queue_mode,
            resources,
            registered_at: previous.map_or_else(chrono::Utc::now, |ep| ep.registered_at),
        };

        endpoints.insert(endpoint.name.clone(), endpoint.clone());
        endpoint
    }

    /// Remove an endpoint with all of its resources and subscriptions
    ///
    /// The returned snapshot carries `DeregisterPending` status. Pending
    /// async operations targeting the endpoint are not touched.
    pub fn remove(&self, name: &str) -> Option<Endpoint> {
        self.lock().remove(name).map(|mut ep| {
            ep.status = EndpointStatus::DeregisterPending;
            ep
        })
    }

    /// Remove every named endpoint that is present, tagging them `Expired`
    pub fn mark_expired(&self, names: &[String]) -> Vec<Endpoint> {
        let mut endpoints = self.lock();
        names
            .iter()
            .filter_map(|name| endpoints.remove(name))
            .map(|mut ep| {
                ep.status = EndpointStatus::Expired;
                ep
            })
            .collect()
    }

    /// Get a snapshot of an endpoint by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.lock().get(name).cloned()
    }

    /// Whether the endpoint is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Whether the endpoint is registered and exposes the resource
    #[must_use]
    pub fn has_resource(&self, name: &str, uri: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|ep| ep.resource(uri).is_some())
    }

    /// Mark a resource subscribed
    ///
    /// Returns whether the flag changed; re-subscribing is a successful no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint or resource is unknown
    pub fn subscribe(&self, name: &str, uri: &str) -> Result<bool> {
        self.set_subscribed(name, uri, true)
    }

    /// Mark a resource unsubscribed
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint or resource is unknown
    pub fn unsubscribe(&self, name: &str, uri: &str) -> Result<bool> {
        self.set_subscribed(name, uri, false)
    }

    /// Set the subscription flag of a resource, returning whether it changed
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint or resource is unknown
    pub fn set_subscribed(&self, name: &str, uri: &str, subscribed: bool) -> Result<bool> {
        let mut endpoints = self.lock();
        let endpoint = endpoints
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("endpoint '{name}'")))?;
        let resource = endpoint
            .resources
            .iter_mut()
            .find(|r| r.uri == uri)
            .ok_or_else(|| Error::NotFound(format!("resource '{uri}' on endpoint '{name}'")))?;

        let changed = resource.subscribed != subscribed;
        resource.subscribed = subscribed;
        Ok(changed)
    }

    /// Current subscription flag of a resource
    #[must_use]
    pub fn is_subscribed(&self, name: &str, uri: &str) -> Option<bool> {
        self.lock()
            .get(name)
            .and_then(|ep| ep.resource(uri))
            .map(|r| r.subscribed)
    }

    /// List the subscribed resource URIs of an endpoint
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the endpoint is unknown
    pub fn list_subscriptions(&self, name: &str) -> Result<Vec<String>> {
        self.lock()
            .get(name)
            .map(Endpoint::subscriptions)
            .ok_or_else(|| Error::NotFound(format!("endpoint '{name}'")))
    }

    /// Names of all endpoints exposing the given resource URI, sorted
    #[must_use]
    pub fn endpoints_exposing(&self, uri: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .values()
            .filter(|ep| ep.resource(uri).is_some())
            .map(|ep| ep.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of all endpoints, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<Endpoint> {
        let mut all: Vec<Endpoint> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of registered endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registration() -> EndpointRegistration {
        EndpointRegistration {
            name: "dev1".to_string(),
            endpoint_type: Some("light".to_string()),
            queue_mode: false,
            resources: vec![
                ResourceDescriptor::new("/3311/0/5850").observable(),
                ResourceDescriptor::new("/3/0/0"),
            ],
        }
    }

    #[test]
    fn register_and_get() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);

        let ep = registry.get("dev1").unwrap();
        assert_eq!(ep.endpoint_type.as_deref(), Some("light"));
        assert_eq!(ep.status, EndpointStatus::Registered);
        assert_eq!(ep.resources.len(), 2);
        assert!(ep.subscriptions().is_empty());
    }

    #[test]
    fn duplicate_resources_collapse() {
        let registry = EndpointRegistry::new();
        let mut reg = sample_registration();
        reg.resources.push(ResourceDescriptor::new("/3/0/0"));

        let ep = registry.register_or_update(&reg, EndpointStatus::Registered);
        assert_eq!(ep.resources.len(), 2);
    }

    #[test]
    fn reregistration_preserves_subscriptions() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);
        registry.subscribe("dev1", "/3311/0/5850").unwrap();

        let mut update = sample_registration();
        update.resources.push(ResourceDescriptor::new("/3311/0/5851"));
        let ep = registry.register_or_update(&update, EndpointStatus::ReRegistered);

        assert_eq!(ep.status, EndpointStatus::ReRegistered);
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5850"), Some(true));
        assert_eq!(registry.is_subscribed("dev1", "/3311/0/5851"), Some(false));
    }

    #[test]
    fn reregistration_drops_vanished_resources() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);
        registry.subscribe("dev1", "/3/0/0").unwrap();

        let update = EndpointRegistration::new("dev1", vec![ResourceDescriptor::new("/3311/0/5850")]);
        registry.register_or_update(&update, EndpointStatus::ReRegistered);

        assert_eq!(registry.is_subscribed("dev1", "/3/0/0"), None);
        assert!(registry.list_subscriptions("dev1").unwrap().is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);

        assert!(registry.subscribe("dev1", "/3311/0/5850").unwrap());
        assert!(!registry.subscribe("dev1", "/3311/0/5850").unwrap());
        assert_eq!(
            registry.list_subscriptions("dev1").unwrap(),
            vec!["/3311/0/5850".to_string()]
        );

        assert!(registry.unsubscribe("dev1", "/3311/0/5850").unwrap());
        assert!(!registry.unsubscribe("dev1", "/3311/0/5850").unwrap());
    }

    #[test]
    fn subscribe_unknown_targets() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);

        assert!(matches!(
            registry.subscribe("nope", "/3/0/0"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            registry.subscribe("dev1", "/9/9/9"),
            Err(Error::NotFound(_))
        ));
        assert!(registry.list_subscriptions("nope").is_err());
    }

    #[test]
    fn remove_cascades() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);
        registry.subscribe("dev1", "/3311/0/5850").unwrap();

        let removed = registry.remove("dev1").unwrap();
        assert_eq!(removed.status, EndpointStatus::DeregisterPending);
        assert!(registry.is_empty());
        assert!(registry.subscribe("dev1", "/3311/0/5850").is_err());
        assert!(registry.remove("dev1").is_none());
    }

    #[test]
    fn mark_expired_skips_unknown() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);

        let expired = registry.mark_expired(&["dev1".to_string(), "ghost".to_string()]);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, EndpointStatus::Expired);
        assert!(!registry.contains("dev1"));
    }

    #[test]
    fn endpoints_exposing_uri() {
        let registry = EndpointRegistry::new();
        registry.register_or_update(&sample_registration(), EndpointStatus::Registered);
        let mut other = sample_registration();
        other.name = "dev0".to_string();
        registry.register_or_update(&other, EndpointStatus::Registered);

        assert_eq!(
            registry.endpoints_exposing("/3/0/0"),
            vec!["dev0".to_string(), "dev1".to_string()]
        );
        assert!(registry.endpoints_exposing("/5/0/0").is_empty());
    }
}
