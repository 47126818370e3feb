//! Ephemeral control plane for tests
//!
//! [`Environment`] starts etcd and kube-apiserver from local binaries (or
//! attaches to an existing cluster), installs CRDs from disk and hands back
//! an admin `kube::Config`. Everything lives in a temporary directory that is
//! removed on [`Environment::stop`].
//!
//! # Example
//!
//! ```no_run
//! use retval_demo::envtest::{Environment, EnvironmentConfig};
//!
//! # async fn run() -> retval_demo::Result<()> {
//! let config = EnvironmentConfig::from_env()?.with_crd_path("testdata");
//! let mut env = Environment::new(config);
//! let kube_config = env.start().await?;
//! // ... use kube_config ...
//! env.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crds;
pub mod pki;
pub mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use kube::Client;
use tempfile::TempDir;
use tracing::{info, warn};

pub use config::EnvironmentConfig;

use crate::kube_utils::{self, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::Error;
use pki::ControlPlanePki;
use process::{ApiServerLayout, ControlPlaneProcess};

/// Interval between readiness probes while the API server starts
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Name used for the cluster, user and context in the generated kubeconfig
const KUBECONFIG_CONTEXT: &str = "envtest";

/// An ephemeral (or borrowed) Kubernetes control plane
#[derive(Debug)]
pub struct Environment {
    config: EnvironmentConfig,
    processes: Vec<ControlPlaneProcess>,
    workdir: Option<TempDir>,
    kubeconfig_path: Option<PathBuf>,
    kube_config: Option<kube::Config>,
    installed_crds: Vec<String>,
}

impl Environment {
    /// Create a stopped environment
    pub fn new(config: EnvironmentConfig) -> Self {
        Self {
            config,
            processes: Vec::new(),
            workdir: None,
            kubeconfig_path: None,
            kube_config: None,
            installed_crds: Vec::new(),
        }
    }

    /// Start the control plane and install CRDs
    ///
    /// On failure everything started so far is torn down before the error is
    /// returned.
    pub async fn start(&mut self) -> Result<kube::Config, Error> {
        if self.kube_config.is_some() {
            return Err(Error::environment_with_context(
                "start",
                "environment already started",
            ));
        }

        match self.start_inner().await {
            Ok(config) => Ok(config),
            Err(e) => {
                if let Err(stop_err) = self.stop().await {
                    warn!(error = %stop_err, "cleanup after failed start also failed");
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<kube::Config, Error> {
        // Read CRDs before spawning anything so a bad path fails fast
        let crds = crds::load_crds(
            &self.config.crd_directory_paths,
            self.config.error_if_crd_path_missing,
        )?;

        let kube_config = if self.config.use_existing_cluster {
            info!("using existing cluster from ambient kubeconfig");
            kube::Config::infer().await.map_err(|e| {
                Error::environment_with_context(
                    "kubeconfig",
                    format!("failed to infer config: {}", e),
                )
            })?
        } else {
            self.start_control_plane().await?
        };
        self.kube_config = Some(kube_config.clone());

        if !crds.is_empty() {
            let client = Client::try_from(kube_config.clone()).map_err(|e| {
                Error::environment_with_context("crds", format!("failed to create client: {}", e))
            })?;
            self.installed_crds =
                crds::install_crds(&client, &crds, self.config.crd_install_timeout).await?;
        }

        Ok(kube_config)
    }

    async fn start_control_plane(&mut self) -> Result<kube::Config, Error> {
        let workdir = tempfile::Builder::new()
            .prefix("retval-envtest-")
            .tempdir()?;
        let dir = workdir.path().to_path_buf();
        self.workdir = Some(workdir);
        info!(dir = %dir.display(), "starting ephemeral control plane");

        let pki = ControlPlanePki::generate()?;
        let pki_paths = pki.write_to(&dir)?;

        let etcd_data = dir.join("etcd");
        std::fs::create_dir_all(&etcd_data)?;
        let etcd_client_port = process::free_local_port()?;
        let etcd_peer_port = process::free_local_port()?;
        self.processes.push(ControlPlaneProcess::spawn(
            "etcd",
            &self.config.etcd_path(),
            &process::etcd_args(&etcd_data, etcd_client_port, etcd_peer_port),
            self.config.attach_control_plane_output,
        )?);

        let secure_port = process::free_local_port()?;
        let layout = ApiServerLayout {
            etcd_url: format!("http://127.0.0.1:{}", etcd_client_port),
            secure_port,
            client_ca_file: pki_paths.ca_cert.clone(),
            tls_cert_file: pki_paths.serving_cert,
            tls_key_file: pki_paths.serving_key,
            service_account_key_file: pki_paths.service_account_key,
            cert_dir: dir.clone(),
        };
        self.processes.push(ControlPlaneProcess::spawn(
            "kube-apiserver",
            &self.config.kube_apiserver_path(),
            &process::kube_apiserver_args(&layout),
            self.config.attach_control_plane_output,
        )?);

        let kubeconfig_path = dir.join("kubeconfig");
        let server = format!("https://127.0.0.1:{}", secure_port);
        std::fs::write(&kubeconfig_path, render_kubeconfig(&pki, &server)?)?;
        self.kubeconfig_path = Some(kubeconfig_path.clone());

        let kube_config = kube_utils::config_from_kubeconfig(
            &kubeconfig_path,
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_READ_TIMEOUT,
        )
        .await?;
        self.wait_until_ready(&kube_config).await?;

        info!(server = %server, "control plane ready");
        Ok(kube_config)
    }

    async fn wait_until_ready(&mut self, kube_config: &kube::Config) -> Result<(), Error> {
        let client = Client::try_from(kube_config.clone()).map_err(|e| {
            Error::environment_with_context(
                "kube-apiserver",
                format!("failed to create client: {}", e),
            )
        })?;

        let ready = kube_utils::poll_until(
            self.config.control_plane_start_timeout,
            READY_POLL_INTERVAL,
            "kube-apiserver readiness",
            || {
                let client = client.clone();
                async move {
                    let request = http::Request::get("/readyz")
                        .body(Vec::new())
                        .map_err(|e| Error::environment(e.to_string()))?;
                    let body = client.request_text(request).await?;
                    Ok(body.trim() == "ok")
                }
            },
        )
        .await;

        if let Err(e) = ready {
            // A crashed process explains a timeout better than the timeout does
            for process in &mut self.processes {
                process.ensure_running()?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop all processes and remove the working directory
    ///
    /// Safe to call on an environment that never started or already stopped.
    /// An existing cluster is never touched.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;

        // Reverse start order: kube-apiserver before etcd
        while let Some(mut process) = self.processes.pop() {
            if let Err(e) = process.stop(self.config.control_plane_stop_timeout).await {
                warn!(process = %process.name(), error = %e, "failed to stop process");
                first_error.get_or_insert(e);
            }
        }

        if let Some(workdir) = self.workdir.take() {
            if let Err(e) = workdir.close() {
                first_error.get_or_insert(Error::from(e));
            }
        }

        self.kubeconfig_path = None;
        self.kube_config = None;
        self.installed_crds.clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Admin config of the running environment
    pub fn config(&self) -> Option<&kube::Config> {
        self.kube_config.as_ref()
    }

    /// Path of the generated admin kubeconfig (None for existing clusters)
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.kubeconfig_path.as_deref()
    }

    /// Names of the CRDs installed by [`Environment::start`]
    pub fn installed_crds(&self) -> &[String] {
        &self.installed_crds
    }

    /// Whether the environment is running
    pub fn is_started(&self) -> bool {
        self.kube_config.is_some()
    }
}

/// Render an admin kubeconfig for a local API server
pub fn render_kubeconfig(pki: &ControlPlanePki, server: &str) -> Result<String, Error> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let user = format!("{}-admin", KUBECONFIG_CONTEXT);
    let kubeconfig = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": KUBECONFIG_CONTEXT,
            "cluster": {
                "server": server,
                "certificate-authority-data": b64.encode(&pki.ca_cert_pem),
            }
        }],
        "users": [{
            "name": user,
            "user": {
                "client-certificate-data": b64.encode(&pki.client_cert_pem),
                "client-key-data": b64.encode(&pki.client_key_pem),
            }
        }],
        "contexts": [{
            "name": KUBECONFIG_CONTEXT,
            "context": {
                "cluster": KUBECONFIG_CONTEXT,
                "user": user,
                "namespace": "default",
            }
        }],
        "current-context": KUBECONFIG_CONTEXT,
    });
    serde_yaml::to_string(&kubeconfig)
        .map_err(|e| Error::serialization(format!("failed to render kubeconfig: {}", e)))
}
