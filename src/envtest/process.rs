//! Control-plane process management
//!
//! Each binary runs as a child with `kill_on_drop`, so a test that panics
//! between start and stop never leaves etcd or kube-apiserver behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::Error;

/// Reserve an unused TCP port on 127.0.0.1
///
/// The listener is dropped before returning, so another process could in
/// principle grab the port first; for a loopback test control plane the
/// window is small enough.
pub fn free_local_port() -> Result<u16, Error> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running control-plane binary
#[derive(Debug)]
pub struct ControlPlaneProcess {
    name: String,
    child: Option<Child>,
}

impl ControlPlaneProcess {
    /// Spawn `binary` with `args`
    ///
    /// When `attach_output` is true, stdout and stderr lines are forwarded to
    /// the log at debug level tagged with `name`.
    pub fn spawn(
        name: &str,
        binary: &Path,
        args: &[String],
        attach_output: bool,
    ) -> Result<Self, Error> {
        if !binary.exists() {
            return Err(Error::environment_with_context(
                name,
                format!(
                    "binary not found at {} (set {} to a directory containing etcd and kube-apiserver)",
                    binary.display(),
                    super::config::ENV_ASSETS
                ),
            ));
        }

        let (stdout, stderr) = if attach_output {
            (Stdio::piped(), Stdio::piped())
        } else {
            (Stdio::null(), Stdio::null())
        };

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::environment_with_context(
                    name,
                    format!("failed to spawn {}: {}", binary.display(), e),
                )
            })?;

        if attach_output {
            if let Some(out) = child.stdout.take() {
                forward_lines(name.to_string(), out);
            }
            if let Some(err) = child.stderr.take() {
                forward_lines(name.to_string(), err);
            }
        }

        info!(process = %name, pid = ?child.id(), "started control-plane process");
        Ok(Self {
            name: name.to_string(),
            child: Some(child),
        })
    }

    /// Process name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fail if the process has already exited
    pub fn ensure_running(&mut self) -> Result<(), Error> {
        let Some(child) = self.child.as_mut() else {
            return Err(Error::environment_with_context(
                &self.name,
                "process was already stopped",
            ));
        };
        match child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(Error::environment_with_context(
                &self.name,
                format!("process exited early with {}", status),
            )),
        }
    }

    /// Kill the process and wait up to `timeout` for it to exit
    ///
    /// Stopping an already stopped process is a no-op.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Err(e) = child.start_kill() {
            // Already exited on its own; reaping below still applies
            debug!(process = %self.name, error = %e, "kill signal not delivered");
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(process = %self.name, %status, "stopped control-plane process");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::environment_with_context(
                &self.name,
                format!("failed to wait for exit: {}", e),
            )),
            Err(_) => {
                warn!(process = %self.name, ?timeout, "process did not exit in time");
                Err(Error::environment_with_context(
                    &self.name,
                    format!("process did not exit within {:?}", timeout),
                ))
            }
        }
    }
}

fn forward_lines<R>(name: String, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %name, "{}", line);
        }
    });
}

/// Arguments for etcd listening on loopback
pub fn etcd_args(data_dir: &Path, client_port: u16, peer_port: u16) -> Vec<String> {
    let client_url = format!("http://127.0.0.1:{}", client_port);
    vec![
        format!("--data-dir={}", data_dir.display()),
        format!("--listen-client-urls={}", client_url),
        format!("--advertise-client-urls={}", client_url),
        format!("--listen-peer-urls=http://127.0.0.1:{}", peer_port),
        "--unsafe-no-fsync=true".to_string(),
    ]
}

/// Files and ports kube-apiserver is started with
#[derive(Debug, Clone)]
pub struct ApiServerLayout {
    /// etcd client URL
    pub etcd_url: String,
    /// Secure port on 127.0.0.1
    pub secure_port: u16,
    /// CA used to verify client certificates
    pub client_ca_file: PathBuf,
    /// Serving certificate
    pub tls_cert_file: PathBuf,
    /// Serving key
    pub tls_key_file: PathBuf,
    /// Service-account signing key
    pub service_account_key_file: PathBuf,
    /// Directory for anything else the server wants to write
    pub cert_dir: PathBuf,
}

/// Arguments for kube-apiserver backed by a local etcd
pub fn kube_apiserver_args(layout: &ApiServerLayout) -> Vec<String> {
    let sa_key = layout.service_account_key_file.display();
    vec![
        format!("--etcd-servers={}", layout.etcd_url),
        "--bind-address=127.0.0.1".to_string(),
        "--advertise-address=127.0.0.1".to_string(),
        format!("--secure-port={}", layout.secure_port),
        format!("--cert-dir={}", layout.cert_dir.display()),
        format!("--tls-cert-file={}", layout.tls_cert_file.display()),
        format!("--tls-private-key-file={}", layout.tls_key_file.display()),
        format!("--client-ca-file={}", layout.client_ca_file.display()),
        "--authorization-mode=RBAC".to_string(),
        "--service-cluster-ip-range=10.0.0.0/24".to_string(),
        "--service-account-issuer=https://127.0.0.1".to_string(),
        format!("--service-account-key-file={}", sa_key),
        format!("--service-account-signing-key-file={}", sa_key),
        "--disable-admission-plugins=ServiceAccount".to_string(),
        "--allow-privileged=true".to_string(),
    ]
}
