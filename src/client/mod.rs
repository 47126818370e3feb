//! Generic client for schema-less lookups
//!
//! [`Client`] fetches any kind as a `DynamicObject`, resolving the REST path
//! through a shared [`RestMapper`] and translating API responses into the
//! crate's error taxonomy. The kind is resolved before the key is looked at:
//!
//! - unknown kind  -> `Error::NoKindMatch`
//! - malformed key -> `Error::InvalidObjectKey` (no GET is issued)
//! - missing object -> `Error::NotFound`

pub mod rest_mapper;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, GroupVersionKind};
#[cfg(test)]
use mockall::automock;
use tracing::trace;

pub use rest_mapper::{RestMapper, RestMapping};

use crate::Error;

/// Name (and namespace) of an object to look up
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace, None for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Check the key can be placed in a request path
    ///
    /// Name and namespace (when set) must both be valid path segments.
    /// Anything else, such as an upper-case namespace, is left for the API
    /// server to judge.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(msg) = path_segment_violation(&self.name) {
            return Err(Error::invalid_object_key(self.to_string(), format!("name {}", msg)));
        }
        if let Some(ns) = &self.namespace {
            if let Some(msg) = path_segment_violation(ns) {
                return Err(Error::invalid_object_key(
                    self.to_string(),
                    format!("namespace {}", msg),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn path_segment_violation(segment: &str) -> Option<&'static str> {
    if segment.is_empty() {
        return Some("must not be empty");
    }
    if segment == "." || segment == ".." {
        return Some("may not be '.' or '..'");
    }
    if segment.contains('/') {
        return Some("may not contain '/'");
    }
    if segment.contains('%') {
        return Some("may not contain '%'");
    }
    None
}

/// Read access to arbitrary kinds
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GenericClient: Send + Sync {
    /// Fetch the object of kind `gvk` identified by `key`
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, Error>;
}

/// Discovery-backed generic client
#[derive(Clone)]
pub struct Client {
    kube: kube::Client,
    mapper: Arc<RestMapper>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("mapper", &self.mapper)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Wrap a kube client with a fresh REST mapper
    pub fn new(kube: kube::Client) -> Self {
        let mapper = Arc::new(RestMapper::new(kube.clone()));
        Self { kube, mapper }
    }

    /// Wrap a kube client sharing an existing REST mapper
    pub fn with_mapper(kube: kube::Client, mapper: Arc<RestMapper>) -> Self {
        Self { kube, mapper }
    }

    /// The REST mapper behind this client
    pub fn rest_mapper(&self) -> &Arc<RestMapper> {
        &self.mapper
    }
}

#[async_trait]
impl GenericClient for Client {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, Error> {
        let mapping = self.mapper.mapping(gvk).await?;

        // Cluster-scoped kinds ignore the namespace
        let key = if mapping.namespaced {
            key.clone()
        } else {
            ObjectKey::cluster_scoped(&key.name)
        };
        key.validate()?;

        let api: Api<DynamicObject> = match key.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.kube.clone(), ns, &mapping.resource),
            None if mapping.namespaced => {
                return Err(Error::invalid_object_key(
                    key.to_string(),
                    format!("{} is namespaced but no namespace was given", gvk.kind),
                ))
            }
            None => Api::all_with(self.kube.clone(), &mapping.resource),
        };

        trace!(kind = %gvk.kind, key = %key, "get");
        match api.get(&key.name).await {
            Ok(obj) => Ok(obj),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(Error::not_found(&gvk.kind, &key.name, key.namespace.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
