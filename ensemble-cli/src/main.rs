use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ensemble::OrchestratorConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "ensemble")]
#[command(about = "Ensemble CLI - restart impact and plan tools for search clusters")]
#[command(version)]
struct Cli {
    /// Orchestrator config file (TOML)
    #[arg(short, long, env = "ENSEMBLE_CONFIG", default_value = "ensemble.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a topology file
    Validate {
        /// Topology YAML
        topology: PathBuf,
    },

    /// Show which roles restart between two topologies
    Impact {
        #[arg(long)]
        from: PathBuf,

        #[arg(long)]
        to: PathBuf,
    },

    /// Print the plan that moves a cluster deployed at --from to --to
    Plan {
        #[arg(long)]
        from: PathBuf,

        #[arg(long)]
        to: PathBuf,
    },

    /// Deploy --from then --to against an in-memory cluster and report each plan
    Simulate {
        #[arg(long)]
        from: PathBuf,

        #[arg(long)]
        to: PathBuf,

        /// Replace this instance (e.g. data-1) while the second plan runs
        #[arg(long)]
        replace: Option<String>,

        /// Force every phase of the second plan to run in parallel
        #[arg(long)]
        parallel: bool,
    },

    /// Run a mode transition against an in-memory cluster deployed at --from
    Transition {
        #[arg(long)]
        from: PathBuf,

        #[arg(long, value_enum)]
        sequence: SequenceKind,

        /// Service user whose credential is set
        #[arg(long, default_value = "elastic")]
        user: String,

        #[arg(long, env = "ENSEMBLE_PASSWORD")]
        password: Option<String>,

        /// Target version for upgrade-with-security
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SequenceKind {
    EnableSecurity,
    DisableSecurity,
    UpgradeWithSecurity,
}

fn init_tracing(config: &OrchestratorConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
    );
    let json = config.logging.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = OrchestratorConfig::load_or_default(&cli.config)?;
    init_tracing(&config);
    tracing::debug!("Config loaded from {:?}", cli.config);

    match cli.command {
        Commands::Validate { topology } => commands::run_validate(&topology)?,
        Commands::Impact { from, to } => commands::run_impact(&config, &from, &to)?,
        Commands::Plan { from, to } => commands::run_plan(&config, &from, &to).await?,
        Commands::Simulate {
            from,
            to,
            replace,
            parallel,
        } => commands::run_simulate(&config, &from, &to, replace.as_deref(), parallel).await?,
        Commands::Transition {
            from,
            sequence,
            user,
            password,
            version,
        } => {
            let credential = ensemble::Credential::new(&user, password.as_deref().unwrap_or(""));
            let sequence = match sequence {
                SequenceKind::EnableSecurity => {
                    ensemble::TransitionSequence::enable_security(&[credential])
                }
                SequenceKind::DisableSecurity => ensemble::TransitionSequence::disable_security(),
                SequenceKind::UpgradeWithSecurity => {
                    let Some(version) = version else {
                        anyhow::bail!("--version is required for upgrade-with-security");
                    };
                    ensemble::TransitionSequence::upgrade_with_security(&version, &credential)
                }
            };
            commands::run_transition(&config, &from, &sequence).await?
        }
    }

    Ok(())
}
