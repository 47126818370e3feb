//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::GroupVersionKind;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients (plenty for a local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use retval_demo::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build a GroupVersionKind from an apiVersion string and a kind
pub fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = parse_api_version(api_version);
    GroupVersionKind::gvk(&group, &version, kind)
}

/// Render a GroupVersionKind's apiVersion (`group/version`, or `version` for core)
pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Poll until a condition is met or timeout is reached
///
/// Repeatedly calls `check_fn` until it returns `Ok(true)` or `timeout` is
/// exceeded. Errors from the check are treated as "not yet" and polled again.
///
/// # Returns
/// `Ok(())` if the condition was met, or `Error::Timeout` naming `operation`
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    operation: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();
    let operation = operation.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation = %operation, "condition not yet met"),
            Err(e) => trace!(operation = %operation, error = %e, "poll check failed, polling again"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(operation, timeout));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Load a kube Config from a kubeconfig file with custom timeouts
pub async fn config_from_kubeconfig(
    path: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::environment_with_context(
            "kubeconfig",
            format!("failed to read kubeconfig {}: {}", path.display(), e),
        )
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::environment_with_context(
                "kubeconfig",
                format!("failed to load kubeconfig {}: {}", path.display(), e),
            )
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(config)
}

/// Create a kube client from a kubeconfig file with custom timeouts
pub async fn client_from_kubeconfig(
    path: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let config = config_from_kubeconfig(path, connect_timeout, read_timeout).await?;
    client_with_timeouts(config, connect_timeout, read_timeout)
}

/// Create a kube client from a Config, overriding its timeouts
pub fn client_with_timeouts(
    mut config: Config,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::manager_with_context("client", format!("failed to create client: {}", e)))
}
