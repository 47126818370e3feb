//! The three-lookup scenario
//!
//! Starts an ephemeral control plane, runs a manager against it, reports
//! three lookups (a missing object, an unknown kind and a malformed key) and
//! tears everything down again. Teardown runs whether or not the lookups get
//! that far.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::client::ObjectKey;
use crate::envtest::{Environment, EnvironmentConfig};
use crate::lookup::{report, LookupOutcome, LookupTarget};
use crate::manager::{Manager, ManagerOptions};
use crate::Error;

/// Name of the span every demo log line is emitted under
pub const DEMO_SPAN: &str = "ret-error-demo";

/// Name looked up by every default target
const TARGET_NAME: &str = "a-name";

/// Directory of CRD manifests installed when none are configured
pub const DEFAULT_CRD_DIRECTORY: &str = "testdata";

/// `DEFAULT_CRD_DIRECTORY` under the first of `roots` that has one
pub fn find_crd_directory<P: AsRef<Path>>(roots: &[P]) -> Option<PathBuf> {
    roots
        .iter()
        .map(|root| root.as_ref().join(DEFAULT_CRD_DIRECTORY))
        .find(|dir| dir.is_dir())
}

/// The default lookups, in order
///
/// 1. a served kind with no such object
/// 2. a kind the API server has no schema for
/// 3. an unserved group, looked up with a namespace that is not a valid
///    path segment
pub fn default_targets() -> Vec<LookupTarget> {
    vec![
        LookupTarget::new(
            "apps/v1",
            "ReplicaSet",
            ObjectKey::namespaced("default", TARGET_NAME),
        ),
        LookupTarget::new(
            "apps/v1",
            "Badger",
            ObjectKey::namespaced("default", TARGET_NAME),
        ),
        LookupTarget::new(
            "inexistent.group.com/v1",
            "Gherkin",
            ObjectKey::namespaced("in/valid", TARGET_NAME),
        ),
    ]
}

/// What a demo run observed
#[derive(Debug, Clone, Default)]
pub struct DemoReport {
    /// Every lookup with its outcome, in the order issued
    pub outcomes: Vec<(LookupTarget, LookupOutcome)>,
    /// CRDs installed into the environment
    pub installed_crds: Vec<String>,
}

impl DemoReport {
    /// Outcome of the lookup for `kind`, if one was issued
    pub fn outcome_for(&self, kind: &str) -> Option<&LookupOutcome> {
        self.outcomes
            .iter()
            .find(|(target, _)| target.gvk.kind == kind)
            .map(|(_, outcome)| outcome)
    }
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (target, outcome) in &self.outcomes {
            let marker = if outcome.is_error() { "error" } else { "ok" };
            writeln!(f, "{:<5} {:<55} {}", marker, target.to_string(), outcome)?;
        }
        let failed = self.outcomes.iter().filter(|(_, o)| o.is_error()).count();
        writeln!(f, "{} of {} lookups failed", failed, self.outcomes.len())?;
        if !self.installed_crds.is_empty() {
            writeln!(f, "installed CRDs: {}", self.installed_crds.join(", "))?;
        }
        Ok(())
    }
}

/// Run the default lookups against a fresh environment
pub async fn run(env_config: EnvironmentConfig, lookup_timeout: Duration) -> Result<DemoReport, Error> {
    run_targets(env_config, default_targets(), lookup_timeout).await
}

/// Run `targets` against a fresh environment
pub async fn run_targets(
    env_config: EnvironmentConfig,
    targets: Vec<LookupTarget>,
    lookup_timeout: Duration,
) -> Result<DemoReport, Error> {
    async move {
        let mut env = Environment::new(env_config);
        let result = run_in_environment(&mut env, &targets, lookup_timeout).await;

        info!("stopping environment");
        let stopped = env.stop().await;
        match (result, stopped) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(stop_err)) => Err(stop_err),
            (Err(e), Err(stop_err)) => {
                warn!(error = %stop_err, "environment teardown failed after an earlier error");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }
    .instrument(info_span!(DEMO_SPAN))
    .await
}

async fn run_in_environment(
    env: &mut Environment,
    targets: &[LookupTarget],
    lookup_timeout: Duration,
) -> Result<DemoReport, Error> {
    info!("starting environment");
    let kube_config = env.start().await?;
    let installed_crds = env.installed_crds().to_vec();

    let manager = Arc::new(Manager::new(kube_config, ManagerOptions::default())?);
    let token = CancellationToken::new();
    let mut manager_task = tokio::spawn({
        let manager = Arc::clone(&manager);
        let token = token.clone();
        async move { manager.start(token).await }
    });

    info!("starting manager");
    let mut started = manager.started();
    tokio::select! {
        ready = started.wait_for(|s| *s) => {
            if ready.is_err() {
                token.cancel();
                return Err(Error::manager_with_context("start", "manager dropped before starting"));
            }
        }
        joined = &mut manager_task => {
            return Err(manager_exit(joined).err().unwrap_or_else(|| {
                Error::manager_with_context("start", "manager exited before starting")
            }));
        }
    }

    let client = manager.client();
    let mut outcomes = Vec::with_capacity(targets.len());
    for target in targets {
        let outcome = report(&client, target, lookup_timeout).await;
        outcomes.push((target.clone(), outcome));
    }

    info!("stopping manager");
    token.cancel();
    manager_exit(manager_task.await)?;

    Ok(DemoReport {
        outcomes,
        installed_crds,
    })
}

fn manager_exit(joined: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    joined.map_err(|e| Error::manager_with_context("start", format!("manager task failed: {}", e)))?
}
