//! Test helpers for envtest integration tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use retval_demo::envtest::{Environment, EnvironmentConfig};
use retval_demo::manager::{Manager, ManagerOptions};
use retval_demo::telemetry::init_test_logging;
use retval_demo::Error;

/// How long to wait for the manager to report started
const MANAGER_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Bundled CRD manifests
pub fn testdata_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata")
}

/// Environment config from the process environment plus the bundled CRDs
pub fn test_config() -> EnvironmentConfig {
    let mut config = EnvironmentConfig::from_env().expect("valid envtest environment variables");
    config.crd_directory_paths = vec![testdata_dir()];
    config.error_if_crd_path_missing = true;
    config
}

/// Start a fresh environment with the bundled CRDs installed
pub async fn start_environment() -> (Environment, kube::Config) {
    init_test_logging();
    retval_demo::install_crypto_provider();

    let mut env = Environment::new(test_config());
    let config = env
        .start()
        .await
        .expect("environment should start - is KUBEBUILDER_ASSETS set?");
    (env, config)
}

/// A manager running in the background
pub struct RunningManager {
    pub manager: Arc<Manager>,
    pub token: CancellationToken,
    pub task: JoinHandle<Result<(), Error>>,
}

impl RunningManager {
    /// Cancel the manager and wait for it to exit
    pub async fn stop(self) -> Result<(), Error> {
        self.token.cancel();
        self.task.await.expect("manager task should not panic")
    }
}

/// Start `manager` in the background and wait until it reports started
pub async fn run_manager(manager: Manager) -> RunningManager {
    let manager = Arc::new(manager);
    let token = CancellationToken::new();
    let task = tokio::spawn({
        let manager = manager.clone();
        let token = token.clone();
        async move { manager.start(token).await }
    });

    let mut started = manager.started();
    tokio::time::timeout(MANAGER_START_TIMEOUT, started.wait_for(|s| *s))
        .await
        .expect("manager should start in time")
        .expect("manager should still be alive");

    RunningManager {
        manager,
        token,
        task,
    }
}

/// Start a manager with default options against `config`
pub async fn start_manager(config: kube::Config) -> RunningManager {
    let manager = Manager::new(config, ManagerOptions::default()).expect("manager should build");
    run_manager(manager).await
}
