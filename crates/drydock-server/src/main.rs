//! Drydock CI server.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use drydock_config::load_server_config;
use drydock_core::integration::IntegrationRunner;
use drydock_core::trigger::Trigger;
use drydock_scheduler::{IntervalTrigger, ProjectIntegrator, QueueManager};

mod runner;

use runner::ShellRunner;

/// How often integrator loops re-check queue activation between change
/// notifications.
const ACTIVATION_POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "drydock")]
#[command(about = "Drydock CI server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run {
        /// Path to the configuration file
        #[arg(long, env = "DRYDOCK_CONFIG", default_value = "drydock.kdl")]
        config: String,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "drydock.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(&config).await,
        Commands::Validate { path } => validate(&path),
    }
}

async fn run(path: &str) -> anyhow::Result<()> {
    let config = load_server_config(path)?;
    info!(
        path,
        projects = config.projects.len(),
        queues = config.queues.len(),
        "configuration loaded"
    );

    // The manager is built once here and handed down; reconfiguration means
    // stopping everything and building a new one.
    let manager = Arc::new(QueueManager::from_config(&config)?);
    let runner: Arc<dyn IntegrationRunner> = Arc::new(ShellRunner::from_config(&config));

    for project in &config.projects {
        let trigger: Arc<dyn Trigger> = Arc::new(IntervalTrigger::new(project.poll_interval()));
        let integrator = Arc::new(ProjectIntegrator::new(
            project.name.as_str(),
            trigger,
            Arc::clone(&runner),
            Arc::clone(&manager),
            ACTIVATION_POLL,
        ));
        manager.attach(Arc::clone(&integrator)).await?;
        integrator.start().await;
    }

    info!("drydock server running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    manager.stop_all_projects().await;
    Ok(())
}

fn validate(path: &str) -> anyhow::Result<()> {
    let config = load_server_config(path)?;
    println!(
        "Configuration OK: {} project(s), {} declared queue(s)",
        config.projects.len(),
        config.queues.len()
    );
    Ok(())
}
