//! Lookup classification and reporting
//!
//! A lookup error is classified in a fixed order: a missing object first,
//! then an unknown kind, then everything else. A successful lookup produces
//! no log line.

use std::fmt;
use std::time::Duration;

use kube::api::{DynamicObject, GroupVersionKind};
use tracing::{error, info};

use crate::client::{GenericClient, ObjectKey};
use crate::kube_utils::{api_version_of, gvk};
use crate::Error;

/// One kind + key to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTarget {
    /// Kind to fetch
    pub gvk: GroupVersionKind,
    /// Object to fetch
    pub key: ObjectKey,
}

impl LookupTarget {
    /// Target for `kind` in `api_version` (e.g. "apps/v1", "v1")
    pub fn new(api_version: &str, kind: &str, key: ObjectKey) -> Self {
        Self {
            gvk: gvk(api_version, kind),
            key,
        }
    }
}

impl fmt::Display for LookupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", api_version_of(&self.gvk), self.gvk.kind, self.key)
    }
}

/// How a lookup ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The object exists
    Found,
    /// The kind is served but the object does not exist
    NotFound,
    /// The API server has no schema for the kind
    NoKindMatch,
    /// Any other failure, with its message
    Unexpected(String),
}

impl LookupOutcome {
    /// Whether the lookup failed
    pub fn is_error(&self) -> bool {
        !matches!(self, LookupOutcome::Found)
    }
}

impl fmt::Display for LookupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupOutcome::Found => write!(f, "found"),
            LookupOutcome::NotFound => write!(f, "not found"),
            LookupOutcome::NoKindMatch => write!(f, "no matching kind"),
            LookupOutcome::Unexpected(msg) => write!(f, "unexpected: {}", msg),
        }
    }
}

/// Classify the result of a lookup
pub fn classify(result: &Result<DynamicObject, Error>) -> LookupOutcome {
    match result {
        Ok(_) => LookupOutcome::Found,
        Err(e) if e.is_not_found() => LookupOutcome::NotFound,
        Err(e) if e.is_no_kind_match() => LookupOutcome::NoKindMatch,
        Err(e) => LookupOutcome::Unexpected(e.to_string()),
    }
}

/// Fetch `target` within `timeout`, log its classification and return it
///
/// Never retries. Exceeding the deadline counts as an unexpected error.
pub async fn report<C>(client: &C, target: &LookupTarget, timeout: Duration) -> LookupOutcome
where
    C: GenericClient + ?Sized,
{
    let result = match tokio::time::timeout(timeout, client.get(&target.gvk, &target.key)).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("get {}", target), timeout)),
    };

    let outcome = classify(&result);
    let kind = target.gvk.kind.as_str();
    match (&outcome, &result) {
        (LookupOutcome::NotFound, _) => {
            info!(kind = %kind, "Kind is present but object was not found")
        }
        (LookupOutcome::NoKindMatch, _) => info!(kind = %kind, "Kind does not exist"),
        (LookupOutcome::Unexpected(_), Err(e)) => error!(error = %e, "Unexpected error"),
        _ => {}
    }
    outcome
}
