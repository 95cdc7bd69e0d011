use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "focusloop", version, about = "Focusloop CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a plan of tasks interactively
    Run(commands::session::RunArgs),
    /// Continue a run interrupted by Ctrl-C
    Resume {
        /// Disable screen sampling
        #[arg(long)]
        no_sampling: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Print the category a description classifies into
    Classify {
        description: String,
    },
    /// Recommend a study duration for a task description
    Recommend {
        description: String,
        /// Override the classified category
        #[arg(long)]
        category: Option<String>,
    },
    /// Show recorded task history
    History(commands::history::HistoryArgs),
    /// Print the report for a finished plan
    Report {
        plan_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Retrain estimator parameters from stored history
    Refine,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => commands::session::run(args),
        Commands::Resume { no_sampling, json } => commands::session::resume(no_sampling, json),
        Commands::Classify { description } => commands::history::classify(&description),
        Commands::Recommend {
            description,
            category,
        } => commands::history::recommend(&description, category.as_deref()),
        Commands::History(args) => commands::history::history(args),
        Commands::Report { plan_id, json } => commands::history::report(&plan_id, json),
        Commands::Refine => commands::history::refine(),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
