//! retval-demo - how Kubernetes lookups report their failures
//!
//! Starts a throwaway control plane (etcd + kube-apiserver), runs a small
//! manager against it and issues lookups through a generic client whose
//! errors are classified as "not found", "no matching kind" or unexpected.
//!
//! # Modules
//!
//! - [`envtest`] - Ephemeral control plane with CRD installation
//! - [`manager`] - Manager runtime owning the generic client
//! - [`client`] - Generic client and lazy REST mapper
//! - [`lookup`] - Lookup classification and reporting
//! - [`demo`] - The three-lookup scenario end to end
//! - [`kube_utils`] - Shared Kubernetes helpers
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types and classification predicates

#![deny(missing_docs)]

pub mod client;
pub mod demo;
pub mod envtest;
pub mod error;
pub mod kube_utils;
pub mod lookup;
pub mod manager;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Deadline for a single lookup
pub const DEFAULT_LOOKUP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "retval-demo";

/// Install the process-wide rustls crypto provider
///
/// Must run before the first kube client is built. Installing twice is
/// harmless, so tests call it freely.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
