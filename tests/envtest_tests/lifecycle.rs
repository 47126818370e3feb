//! Integration tests for environment and manager lifecycle

use std::net::SocketAddr;

use retval_demo::demo;
use retval_demo::envtest::Environment;
use retval_demo::lookup::LookupOutcome;
use retval_demo::manager::{Manager, ManagerOptions};
use retval_demo::telemetry::init_test_logging;
use retval_demo::DEFAULT_LOOKUP_TIMEOUT;

use super::helpers::{run_manager, start_environment, start_manager, test_config};

/// The manager starts against the environment and stops cleanly on cancel
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_manager_starts_and_stops() {
    let (mut env, config) = start_environment().await;

    let running = start_manager(config).await;
    assert!(running.manager.is_started());
    running.stop().await.expect("manager should stop cleanly");

    env.stop().await.expect("environment should stop cleanly");
}

/// Teardown leaves nothing behind and can be repeated
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_teardown_is_clean_and_idempotent() {
    let (mut env, _config) = start_environment().await;
    let kubeconfig = env
        .kubeconfig_path()
        .expect("a started control plane writes a kubeconfig")
        .to_path_buf();
    assert!(kubeconfig.exists());

    env.stop().await.expect("first stop should succeed");
    assert!(!env.is_started());
    assert!(!kubeconfig.exists());

    env.stop().await.expect("second stop is a no-op");
}

/// Starting an already running environment is refused
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_double_start_is_refused() {
    let (mut env, _config) = start_environment().await;
    assert!(env.start().await.is_err());
    assert!(env.is_started());
    env.stop().await.unwrap();
}

/// Probes answer while the manager runs against a real cluster
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_health_probes_report_ready() {
    let (mut env, config) = start_environment().await;

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let manager = Manager::new(
        config,
        ManagerOptions {
            health_probe_bind_address: Some(addr),
            ..Default::default()
        },
    )
    .unwrap();
    let running = run_manager(manager).await;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    for path in ["/healthz", "/readyz"] {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}: {}", path, response);
    }

    running.stop().await.unwrap();
    env.stop().await.unwrap();
}

/// The full demo: three lookups, three classifications, clean teardown
#[tokio::test]
#[ignore = "requires etcd and kube-apiserver binaries - run with: KUBEBUILDER_ASSETS=<dir> cargo test --test envtest -- --ignored"]
async fn story_demo_classifies_all_three_lookups() {
    init_test_logging();
    retval_demo::install_crypto_provider();

    let report = demo::run(test_config(), DEFAULT_LOOKUP_TIMEOUT)
        .await
        .expect("demo should run to completion");

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.outcome_for("ReplicaSet"), Some(&LookupOutcome::NotFound));
    assert_eq!(report.outcome_for("Badger"), Some(&LookupOutcome::NoKindMatch));
    assert_eq!(report.outcome_for("Gherkin"), Some(&LookupOutcome::NoKindMatch));
    assert!(report
        .installed_crds
        .contains(&"widgets.demo.example.com".to_string()));
}

/// A missing binaries directory fails start and leaves nothing running
#[tokio::test]
async fn story_missing_binaries_fail_fast() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.binary_assets_directory = dir.path().to_path_buf();
    config.etcd_binary = None;
    config.kube_apiserver_binary = None;
    config.use_existing_cluster = false;

    let mut env = Environment::new(config);
    let err = env.start().await.unwrap_err();
    assert_eq!(err.context(), Some("etcd"));
    assert!(!env.is_started());
    assert!(env.kubeconfig_path().is_none());
}
