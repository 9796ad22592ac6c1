//! Keel CLI

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use keel::scripts::Scripts;
use keel::tasks::plans;
use keel::{Backends, RunOptions, State, Tasks};
use keel_cluster::ClusterConfig;
use keel_common::telemetry::{init_telemetry, TelemetryConfig};
use keel_executor::{Adapter, LocalAdapter, OpenSshAdapter};

/// Keel - provision, upgrade, repair and tear down Kubernetes control planes
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    /// Path to the cluster manifest
    #[arg(short = 'f', long = "manifest", env = "KEEL_MANIFEST", default_value = "cluster.yaml")]
    manifest: PathBuf,

    /// Log debug output, including every remote command's output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run commands through the local shell instead of SSH
    #[arg(long, global = true)]
    local: bool,

    /// Scratch directory on the hosts
    #[arg(long, global = true, default_value = keel::state::DEFAULT_WORK_DIR)]
    work_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe every host and print cluster health
    Status,

    /// Install a new cluster
    ///
    /// Installs prerequisites everywhere, initializes the control plane on
    /// the leader, then joins the other control-plane hosts one by one and
    /// the static workers in parallel.
    Install(InstallArgs),

    /// Upgrade the cluster to the manifest's (or the given) version
    ///
    /// The leader goes first, then the other control-plane hosts one at a
    /// time, then the static workers.
    Upgrade(UpgradeArgs),

    /// Tear the cluster down with kubeadm reset
    Reset(ResetArgs),

    /// Repair the cluster towards the manifest
    ///
    /// Removes broken hosts and stale etcd members, joins missing hosts and
    /// renews certificates that are about to expire.
    Apply(ApplyArgs),

    /// Show what `apply` would do, without changing anything
    Plan,
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Install even when the cluster already looks provisioned
    #[arg(long)]
    force: bool,
}

#[derive(Args, Debug)]
struct UpgradeArgs {
    /// Proceed despite version-skew violations
    #[arg(long)]
    force: bool,

    /// Version to upgrade to instead of `versions.kubernetes`
    #[arg(long)]
    target_version: Option<String>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    /// Reset static workers too
    #[arg(long)]
    destroy_workers: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    /// Version joined hosts are installed with instead of `versions.kubernetes`
    #[arg(long)]
    target_version: Option<String>,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        let mut options = RunOptions {
            verbose: self.verbose,
            work_dir: self.work_dir.clone(),
            ..Default::default()
        };
        match &self.command {
            Commands::Install(args) => options.force_install = args.force,
            Commands::Upgrade(args) => {
                options.force_upgrade = args.force;
                options.target_version = args.target_version.clone();
            }
            Commands::Reset(args) => options.destroy_workers = args.destroy_workers,
            Commands::Apply(args) => options.target_version = args.target_version.clone(),
            Commands::Status | Commands::Plan => {}
        }
        options
    }

    fn adapter(&self) -> Arc<dyn Adapter> {
        if self.local {
            Arc::new(LocalAdapter)
        } else {
            Arc::new(OpenSshAdapter::new(std::env::temp_dir().join("keel-ssh")))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // reqwest, kube and the etcd client all need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the rustls crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::from_env(cli.verbose))?;

    let config = ClusterConfig::load(&cli.manifest)?;
    info!(cluster = %config.name, manifest = ?cli.manifest, "loaded manifest");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, abandoning in-flight commands");
                cancel.cancel();
            }
        }
    });

    let state = State::new(
        config,
        cli.adapter(),
        Backends::default(),
        Scripts::embedded(),
        cli.run_options(),
        cancel,
    );

    let result = run(&cli.command, &state).await;
    state.connector.close_all().await;

    if let Err(e) = &result {
        error!(error = %e, "keel {} failed", command_name(&cli.command));
    }
    result.map_err(Into::into)
}

async fn run(command: &Commands, state: &State) -> keel::Result<()> {
    let tasks: Tasks = match command {
        Commands::Status => plans::status_tasks(),
        Commands::Install(_) => plans::install_tasks(),
        Commands::Upgrade(_) => plans::upgrade_tasks(),
        Commands::Reset(_) => plans::reset_tasks(),
        Commands::Apply(_) => plans::apply_tasks(),
        Commands::Plan => {
            plans::probe_tasks().run(state).await?;
            let steps = plans::repair_tasks().descriptions(state);
            if steps.is_empty() {
                println!("Nothing to do, the cluster matches the manifest.");
            } else {
                println!("keel apply would:");
                for (i, step) in steps.iter().enumerate() {
                    println!("  {}. {}", i + 1, step);
                }
            }
            return Ok(());
        }
    };

    tasks.run(state).await?;

    if matches!(command, Commands::Status) {
        print!("{}", plans::status_report(&state.live.lock()));
    }
    Ok(())
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Status => "status",
        Commands::Install(_) => "install",
        Commands::Upgrade(_) => "upgrade",
        Commands::Reset(_) => "reset",
        Commands::Apply(_) => "apply",
        Commands::Plan => "plan",
    }
}
