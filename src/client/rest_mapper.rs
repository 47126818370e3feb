//! Lazy GVK -> REST resource mapping
//!
//! Discovery runs one group-version at a time, the first time a kind from
//! that group-version is requested, and the result is cached for the life of
//! the mapper.

use std::collections::HashMap;

use kube::api::GroupVersionKind;
use kube::core::GroupVersion;
use kube::discovery::{self, ApiResource, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

use crate::kube_utils::api_version_of;
use crate::Error;

/// How to reach a kind over REST
#[derive(Debug, Clone)]
pub struct RestMapping {
    /// Resource descriptor (group, version, kind, plural)
    pub resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

/// Caching REST mapper backed by API discovery
pub struct RestMapper {
    client: Client,
    /// apiVersion -> every top-level resource served under it
    cache: RwLock<HashMap<String, Vec<RestMapping>>>,
}

impl std::fmt::Debug for RestMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestMapper").finish_non_exhaustive()
    }
}

impl RestMapper {
    /// Create a mapper with an empty cache
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `gvk` to its REST mapping
    ///
    /// Returns `Error::NoKindMatch` when the group-version is not served or
    /// does not contain the kind.
    pub async fn mapping(&self, gvk: &GroupVersionKind) -> Result<RestMapping, Error> {
        let api_version = api_version_of(gvk);

        let cached = {
            let cache = self.cache.read().await;
            cache
                .get(&api_version)
                .map(|resources| find_kind(resources, &gvk.kind))
        };
        let found = match cached {
            Some(found) => found,
            None => {
                let resources = self.discover(gvk).await?;
                let found = find_kind(&resources, &gvk.kind);
                self.cache.write().await.insert(api_version, resources);
                found
            }
        };

        found.ok_or_else(|| Error::no_kind_match(&gvk.group, &gvk.version, &gvk.kind))
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> Result<Vec<RestMapping>, Error> {
        let gv = GroupVersion::gv(&gvk.group, &gvk.version);
        debug!(api_version = %api_version_of(gvk), "discovering group-version");

        let group = match discovery::pinned_group(&self.client, &gv).await {
            Ok(group) => group,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(Error::no_kind_match(&gvk.group, &gvk.version, &gvk.kind));
            }
            Err(kube::Error::Discovery(e)) => {
                debug!(error = %e, "discovery rejected group-version");
                return Err(Error::no_kind_match(&gvk.group, &gvk.version, &gvk.kind));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(group
            .versioned_resources(&gvk.version)
            .into_iter()
            .map(|(resource, caps)| RestMapping {
                resource,
                namespaced: matches!(caps.scope, Scope::Namespaced),
            })
            .collect())
    }

    /// Drop every cached group-version
    pub async fn reset(&self) {
        self.cache.write().await.clear();
    }

    /// Number of cached group-versions
    pub async fn cached_group_versions(&self) -> usize {
        self.cache.read().await.len()
    }
}

fn find_kind(resources: &[RestMapping], kind: &str) -> Option<RestMapping> {
    resources.iter().find(|m| m.resource.kind == kind).cloned()
}
