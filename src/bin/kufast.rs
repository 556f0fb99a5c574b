//! kufast CLI - run a batch of provisioning requests against the in-memory cluster

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use kufast::models::BatchSummary;
use kufast::progress::{BarReporter, TracingReporter};
use kufast::provisioner::Plan;
use kufast::{
    definitions, FanOutCoordinator, InMemoryCluster, Outcome, Progress, ProvisionerConfig, ProvisioningRequest,
    RollbackPolicy,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kufast")]
#[command(about = "Provision tenant namespaces, pods, secrets and users concurrently", long_about = None)]
#[command(version)]
struct Cli {
    /// Provisioner configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a request file against an in-memory cluster
    Run {
        /// JSON array of requests
        requests: PathBuf,
        /// Maximum units running at once
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// What to do with a failed unit's objects
        #[arg(long, value_enum)]
        rollback: Option<RollbackArg>,
        /// Delete everything again after provisioning
        #[arg(long)]
        teardown: bool,
        /// Tenants whose identity records already exist
        #[arg(long = "tenant", value_name = "NAME")]
        tenants: Vec<String>,
        /// Reads before namespaces and pods report ready
        #[arg(long, default_value = "2")]
        activation_gets: u32,
        /// Show progress bars instead of log lines
        #[arg(long)]
        progress: bool,
        /// Print outcomes as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the steps each request would take
    Plan {
        /// JSON array of requests
        requests: PathBuf,
        /// Show the deletion plan instead
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RollbackArg {
    LeaveInPlace,
    BestEffort,
}

impl From<RollbackArg> for RollbackPolicy {
    fn from(arg: RollbackArg) -> Self {
        match arg {
            RollbackArg::LeaveInPlace => RollbackPolicy::LeaveInPlace,
            RollbackArg::BestEffort => RollbackPolicy::BestEffort,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("kufast=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProvisionerConfig::from_file(path)?,
        None => ProvisionerConfig::default(),
    };

    match cli.command {
        Commands::Run {
            requests,
            concurrency,
            rollback,
            teardown,
            tenants,
            activation_gets,
            progress,
            json,
        } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config = config.max_concurrency(n);
            }
            if let Some(policy) = rollback {
                config = config.rollback(policy.into());
            }
            config.validate()?;

            let requests = load_requests(&requests)?;
            let ok = cmd_run(config, &requests, &tenants, activation_gets, teardown, progress, json).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Plan { requests, delete } => {
            cmd_plan(&config, &load_requests(&requests)?, delete);
        }
    }

    Ok(())
}

fn load_requests(path: &Path) -> Result<Vec<ProvisioningRequest>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

async fn cmd_run(
    config: ProvisionerConfig,
    requests: &[ProvisioningRequest],
    tenants: &[String],
    activation_gets: u32,
    teardown: bool,
    bars: bool,
    json: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let cluster = Arc::new(InMemoryCluster::new().with_activation_gets(activation_gets));
    cluster.insert(definitions::new_namespace(definitions::TENANT_HOME_NAMESPACE));
    for tenant in tenants {
        cluster.insert(definitions::new_tenant_user(tenant));
    }

    let progress = if bars {
        Progress::new(Arc::new(BarReporter::new()?))
    } else {
        Progress::new(Arc::new(TracingReporter))
    };
    let coordinator = FanOutCoordinator::new(cluster.clone(), config).with_progress(progress);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling units that have not finished");
            on_signal.cancel();
        }
    });

    let outcomes = coordinator.provision_many(requests, &cancel).await;
    print_outcomes("Provision", &outcomes, json)?;
    let mut ok = BatchSummary::from_outcomes(&outcomes).all_succeeded();

    if teardown && !cancel.is_cancelled() {
        let outcomes = coordinator.deprovision_many(requests, &cancel).await;
        print_outcomes("Teardown", &outcomes, json)?;
        ok &= BatchSummary::from_outcomes(&outcomes).all_succeeded();
    }

    if !json {
        println!("\nObjects left in cluster: {}", cluster.len());
        for resource in cluster.refs() {
            println!("  {resource}");
        }
    }
    Ok(ok)
}

fn print_outcomes(title: &str, outcomes: &[Outcome], json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcomes)?);
        return Ok(());
    }

    println!("{title}:");
    for outcome in outcomes {
        println!(
            "  [{}] {:<32} {:<9} {} steps",
            outcome.request_index,
            outcome.unit,
            outcome.status.to_string(),
            outcome.completed_steps.len()
        );
        if let Some(error) = &outcome.error {
            println!("      error: {error}");
        }
        for resource in &outcome.rolled_back {
            println!("      rolled back: {resource}");
        }
    }

    let summary = BatchSummary::from_outcomes(outcomes);
    println!(
        "  {} total, {} succeeded, {} failed, {} timed out, {} cancelled",
        summary.total, summary.succeeded, summary.failed, summary.timed_out, summary.cancelled
    );
    Ok(())
}

fn cmd_plan(config: &ProvisionerConfig, requests: &[ProvisioningRequest], delete: bool) {
    for (index, request) in requests.iter().enumerate() {
        println!("[{}] {}", index, request.display_name());
        let plan = if delete {
            Plan::for_deletion(request)
        } else {
            Plan::for_creation(request, config)
        };
        match plan {
            Ok(plan) => {
                for step in plan.steps() {
                    println!("      {step}");
                }
            }
            Err(e) => println!("      invalid: {e}"),
        }
    }
}
