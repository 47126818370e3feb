//! retval-demo - report how Kubernetes lookups fail against a throwaway control plane

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use retval_demo::demo;
use retval_demo::envtest::EnvironmentConfig;
use retval_demo::telemetry::{init_telemetry, TelemetryConfig};

/// Start an ephemeral control plane and classify the errors of three lookups
#[derive(Parser, Debug)]
#[command(name = "retval-demo", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the lookups against a fresh environment (default)
    Run,

    /// Print the lookups the demo issues and exit
    Targets,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// CRD manifest file or directory to install (repeatable)
    #[arg(long = "crd-dir", global = true, env = "RETVAL_CRD_DIRS", value_delimiter = ',')]
    crd_dirs: Vec<PathBuf>,

    /// Directory holding the etcd and kube-apiserver binaries
    #[arg(long, global = true, env = "KUBEBUILDER_ASSETS")]
    assets_dir: Option<PathBuf>,

    /// Use the cluster from the ambient kubeconfig instead of starting one
    #[arg(long, global = true, env = "USE_EXISTING_CLUSTER")]
    use_existing_cluster: bool,

    /// Deadline for each lookup in milliseconds
    #[arg(long, global = true, default_value = "1000")]
    lookup_timeout_ms: u64,

    /// Emit JSON log lines
    #[arg(long, global = true, env = "RETVAL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    retval_demo::install_crypto_provider();

    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        json: cli.run.log_json || TelemetryConfig::default().json,
        ..Default::default()
    };
    init_telemetry(&telemetry).map_err(|e| anyhow::anyhow!("{}", e))?;

    match cli.command {
        Some(Commands::Targets) => {
            for target in demo::default_targets() {
                println!("{target}");
            }
            Ok(())
        }
        Some(Commands::Run) | None => run(cli.run).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = EnvironmentConfig::from_env()
        .map_err(|e| anyhow::anyhow!("invalid environment configuration: {}", e))?;
    if let Some(dir) = args.assets_dir {
        config.binary_assets_directory = dir;
    }
    if args.use_existing_cluster {
        config.use_existing_cluster = true;
    }
    if !args.crd_dirs.is_empty() {
        config.crd_directory_paths = args.crd_dirs;
        config.error_if_crd_path_missing = true;
    } else if config.crd_directory_paths.is_empty() {
        let roots = [Path::new("."), Path::new(env!("CARGO_MANIFEST_DIR"))];
        if let Some(dir) = demo::find_crd_directory(&roots) {
            info!(path = %dir.display(), "installing bundled CRDs");
            config.crd_directory_paths.push(dir);
        }
    }

    let report = demo::run(config, Duration::from_millis(args.lookup_timeout_ms))
        .await
        .map_err(|e| anyhow::anyhow!("demo failed: {}", e))?;

    print!("{report}");
    Ok(())
}
