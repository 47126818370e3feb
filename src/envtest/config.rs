//! Environment configuration
//!
//! Defaults can be overridden through the same environment variables the
//! kubebuilder tooling uses, so an existing `setup-envtest` install works
//! unchanged.

use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Directory holding `etcd` and `kube-apiserver`
pub const ENV_ASSETS: &str = "KUBEBUILDER_ASSETS";
/// Explicit path to the etcd binary
pub const ENV_ETCD_BINARY: &str = "TEST_ASSET_ETCD";
/// Explicit path to the kube-apiserver binary
pub const ENV_APISERVER_BINARY: &str = "TEST_ASSET_KUBE_APISERVER";
/// Use the ambient kubeconfig instead of starting processes
pub const ENV_USE_EXISTING_CLUSTER: &str = "USE_EXISTING_CLUSTER";
/// Control-plane start timeout
pub const ENV_START_TIMEOUT: &str = "KUBEBUILDER_CONTROLPLANE_START_TIMEOUT";
/// Control-plane stop timeout
pub const ENV_STOP_TIMEOUT: &str = "KUBEBUILDER_CONTROLPLANE_STOP_TIMEOUT";
/// Forward control-plane stdout/stderr to the log
pub const ENV_ATTACH_OUTPUT: &str = "KUBEBUILDER_ATTACH_CONTROL_PLANE_OUTPUT";

/// Default location of the control-plane binaries
pub const DEFAULT_ASSETS_DIR: &str = "/usr/local/kubebuilder/bin";
/// Default start/stop timeout
pub const DEFAULT_CONTROL_PLANE_TIMEOUT: Duration = Duration::from_secs(20);
/// Default time to wait for installed CRDs to become established
pub const DEFAULT_CRD_INSTALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for an ephemeral control plane
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Files or directories containing CRD manifests to install
    pub crd_directory_paths: Vec<PathBuf>,
    /// Fail start when a CRD path does not exist
    pub error_if_crd_path_missing: bool,
    /// Directory holding the control-plane binaries
    pub binary_assets_directory: PathBuf,
    /// Override for the etcd binary path
    pub etcd_binary: Option<PathBuf>,
    /// Override for the kube-apiserver binary path
    pub kube_apiserver_binary: Option<PathBuf>,
    /// Connect to the ambient cluster instead of starting one
    pub use_existing_cluster: bool,
    /// How long to wait for the control plane to become ready
    pub control_plane_start_timeout: Duration,
    /// How long to wait for each process to exit on stop
    pub control_plane_stop_timeout: Duration,
    /// Forward process output to the log at debug level
    pub attach_control_plane_output: bool,
    /// How long to wait for CRDs to become established
    pub crd_install_timeout: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            crd_directory_paths: Vec::new(),
            error_if_crd_path_missing: false,
            binary_assets_directory: PathBuf::from(DEFAULT_ASSETS_DIR),
            etcd_binary: None,
            kube_apiserver_binary: None,
            use_existing_cluster: false,
            control_plane_start_timeout: DEFAULT_CONTROL_PLANE_TIMEOUT,
            control_plane_stop_timeout: DEFAULT_CONTROL_PLANE_TIMEOUT,
            attach_control_plane_output: false,
            crd_install_timeout: DEFAULT_CRD_INSTALL_TIMEOUT,
        }
    }
}

impl EnvironmentConfig {
    /// Build a config from defaults overridden by process environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_ASSETS).filter(|v| !v.is_empty()) {
            config.binary_assets_directory = PathBuf::from(dir);
        }
        config.etcd_binary = lookup(ENV_ETCD_BINARY)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        config.kube_apiserver_binary = lookup(ENV_APISERVER_BINARY)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(v) = lookup(ENV_USE_EXISTING_CLUSTER) {
            config.use_existing_cluster = parse_bool(ENV_USE_EXISTING_CLUSTER, &v)?;
        }
        if let Some(v) = lookup(ENV_ATTACH_OUTPUT) {
            config.attach_control_plane_output = parse_bool(ENV_ATTACH_OUTPUT, &v)?;
        }
        if let Some(v) = lookup(ENV_START_TIMEOUT) {
            config.control_plane_start_timeout = parse_duration(ENV_START_TIMEOUT, &v)?;
        }
        if let Some(v) = lookup(ENV_STOP_TIMEOUT) {
            config.control_plane_stop_timeout = parse_duration(ENV_STOP_TIMEOUT, &v)?;
        }

        Ok(config)
    }

    /// Add a CRD file or directory
    pub fn with_crd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.crd_directory_paths.push(path.into());
        self
    }

    /// Resolved path of the etcd binary
    pub fn etcd_path(&self) -> PathBuf {
        self.etcd_binary
            .clone()
            .unwrap_or_else(|| self.binary_assets_directory.join("etcd"))
    }

    /// Resolved path of the kube-apiserver binary
    pub fn kube_apiserver_path(&self) -> PathBuf {
        self.kube_apiserver_binary
            .clone()
            .unwrap_or_else(|| self.binary_assets_directory.join("kube-apiserver"))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(Error::environment_with_context(
            "config",
            format!("{} must be a boolean, got {:?}", key, other),
        )),
    }
}

/// Accepts plain seconds (`30`) or a Go-style duration built from `h`, `m`,
/// `s` and `ms` segments (`500ms`, `2m`, `1h`, `1m30s`)
fn parse_duration(key: &str, value: &str) -> Result<Duration, Error> {
    let value = value.trim();
    let invalid = |why: &str| {
        Error::environment_with_context(
            "config",
            format!("{} must be a duration like 30s or 1m30s, got {:?}: {}", key, value, why),
        )
    };

    if value.is_empty() {
        return Err(invalid("empty"));
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = value.parse().map_err(|_| invalid("number out of range"))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut remaining = value;
    let mut total_ms: u64 = 0;
    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(invalid("expected a number"));
        }
        let n: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        remaining = &remaining[num_end..];

        let unit_end = remaining
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(remaining.len());
        let ms_per_unit: u64 = match &remaining[..unit_end] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "" => return Err(invalid("missing unit suffix")),
            _ => return Err(invalid("unknown unit (expected h, m, s or ms)")),
        };
        remaining = &remaining[unit_end..];

        total_ms = n
            .checked_mul(ms_per_unit)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| invalid("duration overflows"))?;
    }

    Ok(Duration::from_millis(total_ms))
}
