use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use slotd::client::PeerRegistry;
use slotd::collector::{Collector, MemoryCollector};
use slotd::config::{SlotKind, StartdConfig};
use slotd::daemon::{Collaborators, StartdDaemon};
use slotd::dashboard::{run_dashboard, DashboardState};
use slotd::negotiator::{NegotiationClient, NegotiatorConfig};
use slotd::policy::expr::ExprPolicy;
use slotd::policy::{Attributes, PolicyEvaluator};
use slotd::shutdown::install_shutdown_handler;
use slotd::starter::ProcessStarter;

#[derive(Parser, Debug)]
#[command(name = "slotd")]
#[command(version)]
#[command(about = "Worker-node slot daemon with claim leases and preemption policy")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the slot daemon
    Run(RunArgs),

    /// Print the effective configuration
    Config {
        #[command(flatten)]
        source: ConfigSource,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct ConfigSource {
    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Replace the configured slots with N static slots
    #[arg(long)]
    slots: Option<usize>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: ConfigSource,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// JSON file with a list of job records to claim slots for and run
    #[arg(long)]
    workload: Option<PathBuf>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn load_config(source: &ConfigSource) -> anyhow::Result<StartdConfig> {
    let mut config = match &source.config {
        Some(path) => StartdConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => StartdConfig::default(),
    };
    if let Some(count) = source.slots {
        config = config.with_static_slots(count);
    }
    config.validate()?;
    Ok(config)
}

fn load_workload(path: &Path) -> anyhow::Result<Vec<Attributes>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workload {}", path.display()))?;
    let jobs: Vec<Attributes> = serde_json::from_str(&raw)
        .with_context(|| format!("workload {} is not a list of job records", path.display()))?;
    Ok(jobs)
}

async fn run_daemon(args: RunArgs) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&args.source)?;
    let workload = match &args.workload {
        Some(path) => Some(load_workload(path)?),
        None => None,
    };
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    let policy: Arc<dyn PolicyEvaluator> = Arc::new(ExprPolicy::from_config(&config.policy)?);
    let collector: Arc<dyn Collector> = Arc::new(MemoryCollector::new());
    let peers = PeerRegistry::new();

    tracing::info!(
        host = %config.node.host,
        address = %config.node.address,
        slots = config.slots.len(),
        dashboard_addr = ?dashboard_addr,
        "Starting slotd"
    );

    let starter = Arc::new(ProcessStarter::new(config.starter.clone()));
    let (daemon, handle) = StartdDaemon::new(
        config,
        Collaborators {
            policy: policy.clone(),
            starter,
            client: Arc::new(peers.clone()),
            collector: collector.clone(),
        },
    );

    let shutdown = install_shutdown_handler();

    if let Some(addr) = dashboard_addr {
        let state = DashboardState {
            collector: collector.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let daemon_task = tokio::spawn(daemon.run(shutdown.clone()));

    let negotiator_shutdown = CancellationToken::new();
    if let Some(jobs) = workload {
        let negotiator = Arc::new(NegotiationClient::new(
            NegotiatorConfig::default(),
            handle.clone(),
            collector.clone(),
            policy,
        ));
        let inbox = peers.register(negotiator.config().addr.clone()).await;
        negotiator.serve_inbox(inbox);
        negotiator.spawn_renewals(negotiator_shutdown.clone());

        // Slots publish on their first update; wait for the initial ads.
        while negotiator.offers().is_empty() && !handle.is_closed() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        for job in jobs {
            match negotiator.run_job(job).await {
                Ok(claim) => tracing::info!(slot = %claim.slot, "Workload job started"),
                Err(e) => tracing::warn!(error = %e, "Workload job not started"),
            }
        }
    }

    daemon_task.await?;
    negotiator_shutdown.cancel();
    Ok(())
}

fn print_config(config: &StartdConfig, output: &OutputFormat) -> anyhow::Result<()> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        OutputFormat::Table => {
            println!("Node");
            println!("{}", "=".repeat(40));
            println!("Host:    {}", config.node.host);
            println!("Address: {}", config.node.address);
            println!();
            println!("{:<16} {:<14} {:>6} {:>10}", "SLOT", "KIND", "CPUS", "MEMORY");
            println!("{}", "-".repeat(49));
            for slot in &config.slots {
                let kind = match slot.kind {
                    SlotKind::Static => "static",
                    SlotKind::Partitionable => "partitionable",
                };
                println!(
                    "{:<16} {:<14} {:>6} {:>10}",
                    slot.name, kind, slot.cpus, slot.memory_mb
                );
            }
            println!();
            println!("Policy");
            println!("{}", "-".repeat(49));
            println!("START:   {}", config.policy.start);
            println!("PREEMPT: {}", config.policy.preempt);
            println!("RANK:    {}", config.policy.rank);
            println!(
                "Update every {}s, poll every {}s",
                config.timing.update_interval_secs, config.timing.polling_interval_secs
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_daemon(run_args).await?,
        Commands::Config { source, output } => {
            let config = load_config(&source)?;
            print_config(&config, &output)?;
        }
    }

    Ok(())
}
