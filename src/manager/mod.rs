//! Manager runtime
//!
//! The manager owns the kube client, the shared REST mapper and the generic
//! client built on them. `start` runs registered runnables (and the health
//! probe server, when configured) until the caller's token is cancelled or a
//! runnable fails, then drains them within the graceful shutdown timeout.

pub mod health;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::Client;
use crate::kube_utils::{client_with_timeouts, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use crate::Error;

/// Default time runnables get to stop after cancellation
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const HEALTH_TASK: &str = "health-probes";

/// Manager settings
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Where to serve `/healthz` and `/readyz` (None disables probes)
    pub health_probe_bind_address: Option<SocketAddr>,
    /// How long runnables get to stop after cancellation
    pub graceful_shutdown_timeout: Duration,
    /// Kube client connect timeout
    pub connect_timeout: Duration,
    /// Kube client read timeout
    pub read_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            health_probe_bind_address: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// A long-running task owned by the manager
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> String;

    /// Run until `token` is cancelled
    async fn start(&self, token: CancellationToken) -> Result<(), Error>;
}

/// Runs runnables against one cluster
pub struct Manager {
    kube: kube::Client,
    client: Client,
    options: ManagerOptions,
    runnables: Vec<Arc<dyn Runnable>>,
    started: watch::Sender<bool>,
    start_called: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("options", &self.options)
            .field("runnables", &self.runnables.len())
            .field("started", &*self.started.borrow())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Create a manager for the cluster described by `config`
    pub fn new(config: kube::Config, options: ManagerOptions) -> Result<Self, Error> {
        let kube = client_with_timeouts(config, options.connect_timeout, options.read_timeout)?;
        Ok(Self::from_client(kube, options))
    }

    /// Create a manager around an existing kube client
    pub fn from_client(kube: kube::Client, options: ManagerOptions) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            client: Client::new(kube.clone()),
            kube,
            options,
            runnables: Vec::new(),
            started,
            start_called: AtomicBool::new(false),
        }
    }

    /// The generic client
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The underlying kube client
    pub fn kube_client(&self) -> kube::Client {
        self.kube.clone()
    }

    /// Register a runnable to run on `start`
    pub fn add(&mut self, runnable: Arc<dyn Runnable>) {
        self.runnables.push(runnable);
    }

    /// Whether the manager is currently running
    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Subscribe to the started flag
    pub fn started(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }

    /// Run until `token` is cancelled or a runnable fails
    ///
    /// Returns the first runnable error, or `Error::Timeout` when runnables
    /// do not stop within the graceful shutdown timeout. A manager can only
    /// be started once.
    pub async fn start(&self, token: CancellationToken) -> Result<(), Error> {
        if self.start_called.swap(true, Ordering::SeqCst) {
            return Err(Error::manager_with_context(
                "start",
                "manager already started",
            ));
        }

        // Child token: a failing runnable stops its siblings without
        // cancelling the caller's token
        let run_token = token.child_token();
        let mut tasks: JoinSet<(String, Result<(), Error>)> = JoinSet::new();

        if let Some(addr) = self.options.health_probe_bind_address {
            let listener = health::bind(addr).await?;
            let state = health::HealthState::new(self.started.subscribe());
            let probe_token = run_token.clone();
            tasks.spawn(async move {
                (
                    HEALTH_TASK.to_string(),
                    health::serve(listener, state, probe_token).await,
                )
            });
        }

        for runnable in &self.runnables {
            let runnable = Arc::clone(runnable);
            let runnable_token = run_token.clone();
            tasks.spawn(async move {
                let name = runnable.name();
                info!(runnable = %name, "starting runnable");
                let result = runnable.start(runnable_token).await;
                (name, result)
            });
        }

        self.started.send_replace(true);
        info!(runnables = self.runnables.len(), "manager started");

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = run_token.cancelled() => break,
                joined = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(err) = joined.and_then(task_error) {
                        first_error = Some(err);
                        break;
                    }
                }
            }
        }

        info!("stopping manager");
        run_token.cancel();
        self.started.send_replace(false);

        let timeout = self.options.graceful_shutdown_timeout;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(err) = task_error(joined) {
                    first_error.get_or_insert(err);
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(timeout = ?timeout, remaining = tasks.len(), "runnables did not stop in time, aborting");
            tasks.abort_all();
            first_error.get_or_insert(Error::timeout("graceful shutdown", timeout));
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("manager stopped");
                Ok(())
            }
        }
    }
}

fn task_error(joined: Result<(String, Result<(), Error>), JoinError>) -> Option<Error> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(runnable = %name, "runnable stopped");
            None
        }
        Ok((name, Err(err))) => {
            error!(runnable = %name, error = %err, "runnable failed");
            Some(err)
        }
        Err(join_err) => {
            error!(error = %join_err, "runnable panicked");
            Some(Error::manager_with_context(
                "runnable",
                format!("runnable task failed: {}", join_err),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::mock_client;
    use std::sync::atomic::AtomicUsize;

    /// Runs until cancelled, counting starts and clean stops
    #[derive(Default)]
    struct UntilCancelled {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Runnable for UntilCancelled {
        fn name(&self) -> String {
            "until-cancelled".to_string()
        }

        async fn start(&self, token: CancellationToken) -> Result<(), Error> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Ignores cancellation
    struct Stubborn;

    #[async_trait]
    impl Runnable for Stubborn {
        fn name(&self) -> String {
            "stubborn".to_string()
        }

        async fn start(&self, _token: CancellationToken) -> Result<(), Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn test_manager(options: ManagerOptions) -> Manager {
        let (kube, _handle) = mock_client();
        Manager::from_client(kube, options)
    }

    async fn wait_started(manager: &Manager) {
        let mut rx = manager.started();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s))
            .await
            .expect("manager should start")
            .unwrap();
    }

    #[test]
    fn default_options() {
        let options = ManagerOptions::default();
        assert_eq!(options.graceful_shutdown_timeout, Duration::from_secs(30));
        assert!(options.health_probe_bind_address.is_none());
    }

    #[tokio::test]
    async fn runs_until_cancelled() {
        let mut manager = test_manager(ManagerOptions::default());
        let runnable = Arc::new(UntilCancelled::default());
        manager.add(runnable.clone());
        let manager = Arc::new(manager);

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move { manager.start(token).await }
        });

        wait_started(&manager).await;
        assert!(manager.is_started());
        assert_eq!(runnable.starts.load(Ordering::SeqCst), 1);

        token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(runnable.stops.load(Ordering::SeqCst), 1);
        assert!(!manager.is_started());
    }

    #[tokio::test]
    async fn empty_manager_waits_for_cancellation() {
        let manager = Arc::new(test_manager(ManagerOptions::default()));
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move { manager.start(token).await }
        });

        wait_started(&manager).await;
        assert!(!task.is_finished());

        token.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failing_runnable_stops_manager_with_its_error() {
        let mut manager = test_manager(ManagerOptions::default());
        let mut failing = MockRunnable::new();
        failing.expect_name().return_const("failing".to_string());
        failing
            .expect_start()
            .times(1)
            .returning(|_| Err(Error::manager_with_context("runnable", "boom")));
        let sibling = Arc::new(UntilCancelled::default());
        manager.add(Arc::new(failing));
        manager.add(sibling.clone());

        let token = CancellationToken::new();
        let err = tokio::time::timeout(Duration::from_secs(5), manager.start(token.clone()))
            .await
            .expect("manager should stop on failure")
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert_eq!(sibling.stops.load(Ordering::SeqCst), 1);
        // The caller's token is left alone
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn runnable_finishing_early_is_not_an_error() {
        let mut manager = test_manager(ManagerOptions::default());
        let mut oneshot = MockRunnable::new();
        oneshot.expect_name().return_const("oneshot".to_string());
        oneshot.expect_start().times(1).returning(|_| Ok(()));
        manager.add(Arc::new(oneshot));
        let manager = Arc::new(manager);

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move { manager.start(token).await }
        });

        wait_started(&manager).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        token.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn double_start_is_an_error() {
        let manager = Arc::new(test_manager(ManagerOptions::default()));
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move { manager.start(token).await }
        });
        wait_started(&manager).await;

        let err = manager.start(token.clone()).await.unwrap_err();
        assert_eq!(err.context(), Some("start"));

        token.cancel();
        task.await.unwrap().unwrap();

        // Still refused after a clean stop
        assert!(manager.start(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn graceful_shutdown_timeout_aborts_stuck_runnables() {
        let mut manager = test_manager(ManagerOptions {
            graceful_shutdown_timeout: Duration::from_millis(100),
            ..Default::default()
        });
        manager.add(Arc::new(Stubborn));

        let token = CancellationToken::new();
        token.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), manager.start(token))
            .await
            .expect("shutdown should be bounded")
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn serves_health_probes_while_running() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let manager = Arc::new(test_manager(ManagerOptions {
            health_probe_bind_address: Some(addr),
            ..Default::default()
        }));

        let token = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let token = token.clone();
            async move { manager.start(token).await }
        });
        wait_started(&manager).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /readyz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got {}", response);

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
