use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use drover::cli::{self, PathArgs};
use drover::config;
use drover::status::WorkerPhase;

#[derive(Parser)]
#[command(name = "drover", version, about = "drover: autonomous issue workers")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run or inspect a single issue worker
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
    /// Run or inspect the manager
    Manager {
        #[command(subcommand)]
        action: ManagerAction,
    },
    /// Read config values
    Config {
        /// Config key (dot-separated path)
        key: String,
    },
    /// Show version information
    Version,
    /// Generate shell completions
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Carry one issue to a terminal phase (resumes an existing status document)
    Run(cli::worker::RunArgs),
    /// Show a worker's status document
    Status {
        /// Issue number
        issue_id: u64,
        /// Print the raw JSON document
        #[arg(long)]
        json: bool,
    },
    /// List all worker status documents
    ListWorkers,
}

#[derive(Subcommand)]
enum ManagerAction {
    /// Poll for issues and keep workers busy
    Run(cli::manager::RunArgs),
    /// Show the last manager status snapshot
    Status,
    /// List open issues and how they would be triaged
    ListIssues {
        /// Repository in OWNER/REPO format
        #[arg(long)]
        repo: Option<String>,
        /// Labels to query (default: manager.allow_labels)
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
    },
    /// Close an issue's escalations and archive its status document
    Resolve {
        /// Issue number
        issue_id: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "drover=debug" } else { "drover=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Worker { action } => match action {
            WorkerAction::Run(args) => {
                let phase = cli::worker::run(args, &cli.paths).await?;
                std::process::exit(if phase == WorkerPhase::Completed { 0 } else { 1 });
            }
            WorkerAction::Status { issue_id, json } => {
                cli::worker::status(issue_id, json, &cli.paths).await?;
            }
            WorkerAction::ListWorkers => {
                cli::worker::list(&cli.paths).await?;
            }
        },
        Commands::Manager { action } => match action {
            ManagerAction::Run(args) => {
                cli::manager::run(args, &cli.paths).await?;
            }
            ManagerAction::Status => {
                cli::manager::status(&cli.paths).await?;
            }
            ManagerAction::ListIssues { repo, labels } => {
                cli::manager::list_issues(repo, labels).await?;
            }
            ManagerAction::Resolve { issue_id } => {
                cli::manager::resolve(issue_id, &cli.paths).await?;
            }
        },
        Commands::Config { key } => {
            let val = config::get(&key)?;
            println!("{val}");
        }
        Commands::Version => {
            cli::version();
        }
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "drover", &mut std::io::stdout());
        }
    }

    Ok(())
}
