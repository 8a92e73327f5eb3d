use clap::{Parser, Subcommand};
use shipyard::common::{CommandResult, FeatureStatus};
use shipyard::config::Config;
use shipyard::errors::ShipyardError;
use shipyard::registry::EntryKind;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Workspace lock and phase orchestration for agent coding tasks")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding registry.toml, shipyard.toml and logs
    #[arg(long, global = true, env = "SHIPYARD_HOME")]
    pub home: Option<PathBuf>,

    /// Workspace slot to operate on (defaults to the slot containing the
    /// current directory, or the only registered slot)
    #[arg(long, global = true)]
    pub slot: Option<String>,

    /// Caller identity; phase commands fail if it differs from the lease owner
    #[arg(long, global = true)]
    pub owner: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage repositories, workspace slots and environments
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// View or validate shipyard.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Lease a workspace slot and materialise the repositories in it
    Acquire {
        /// Repository to work on; the first is the primary one
        #[arg(short, long = "repo", required = true)]
        repos: Vec<String>,

        /// What the task should achieve
        #[arg(short, long)]
        task: String,

        /// Engine key from [engines] (defaults to defaults.engine)
        #[arg(long)]
        engine: Option<String>,

        /// Registered environment to probe and verify against
        #[arg(long = "env")]
        environment: Option<String>,

        /// Hard-reset dirty clones instead of failing
        #[arg(long)]
        auto_clean: bool,
    },
    /// Show the lease state of one slot or all of them
    Status {
        /// Human-readable output instead of JSON
        #[arg(long)]
        pretty: bool,
    },
    /// Extend the lease without changing phase
    Renew,
    /// Grep a registered repository clone without taking the lock
    Search {
        repository: String,
        pattern: String,

        #[arg(long, default_value = "200")]
        limit: usize,
    },
    /// Capture read-only observations of the associated environment
    ProbeEnv,
    /// Classify the task and, for complex tasks, create a feature plan
    Analyze,
    /// Confirm the analysis (or the feature plan)
    Confirm,
    /// Run one development round, then the test loop
    Develop {
        /// Extra context for the engine
        #[arg(long)]
        context: Option<String>,
    },
    /// Run lint and tests with bounded automatic fixes
    Test {
        /// Reset the fix budget before running
        #[arg(long)]
        retry: bool,
    },
    /// Commit, push and open pull requests
    Submit {
        /// Complete the current feature despite unmet criteria
        #[arg(long)]
        force: bool,
    },
    /// Probe the environment after submission and count errors
    VerifyEnv,
    /// Accept the submission after a failed environment verification
    Accept,
    /// Release the slot, deleting the lease and its artifacts
    Release {
        /// Delete task branches and return to the original branches
        #[arg(long)]
        cleanup: bool,
    },
    /// Feature plan operations for complex tasks
    Feature {
        #[command(subcommand)]
        command: FeatureCommands,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Registry { command } => match command {
                RegistryCommands::List => "registry list",
                RegistryCommands::Add { .. } => "registry add",
                RegistryCommands::Set { .. } => "registry set",
                RegistryCommands::Remove { .. } => "registry remove",
            },
            Commands::Config { command } => match command {
                Some(ConfigCommands::Validate) => "config validate",
                _ => "config show",
            },
            Commands::Acquire { .. } => "acquire",
            Commands::Status { .. } => "status",
            Commands::Renew => "renew",
            Commands::Search { .. } => "search",
            Commands::ProbeEnv => "probe-env",
            Commands::Analyze => "analyze",
            Commands::Confirm => "confirm",
            Commands::Develop { .. } => "develop",
            Commands::Test { .. } => "test",
            Commands::Submit { .. } => "submit",
            Commands::VerifyEnv => "verify-env",
            Commands::Accept => "accept",
            Commands::Release { .. } => "release",
            Commands::Feature { command } => match command {
                FeatureCommands::Create { .. } => "feature create",
                FeatureCommands::List => "feature list",
                FeatureCommands::Next => "feature next",
                FeatureCommands::Verify { .. } => "feature verify",
                FeatureCommands::Done { .. } => "feature done",
                FeatureCommands::Update { .. } => "feature update",
            },
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum RegistryCommands {
    /// List every entry
    List,
    /// Add an entry in its minimal form
    Add {
        /// repository, workspace or environment
        kind: EntryKind,
        name: String,
        /// Repository URL, slot root path, or environment ssh host
        value: String,
    },
    /// Set one field, upgrading the entry to its extended form
    Set {
        kind: EntryKind,
        name: String,
        key: String,
        value: String,
    },
    /// Remove an entry
    Remove { kind: EntryKind, name: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate shipyard.toml and report warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum FeatureCommands {
    /// Install a feature plan from a JSON array (file or stdin)
    Create {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Show the plan and its progress
    List,
    /// Start (or resume) the next runnable feature
    Next,
    /// Evaluate a feature's automatic criteria
    Verify {
        index: usize,

        /// Run engine fix rounds while criteria fail
        #[arg(long)]
        fix: bool,
    },
    /// Mark a feature done
    Done {
        index: usize,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        pr: Option<String>,

        /// Complete despite unmet automatic criteria
        #[arg(long)]
        force: bool,
    },
    /// Edit one feature: status, task, insertion, or position
    Update {
        index: usize,

        #[arg(long, group = "edit")]
        status: Option<FeatureStatus>,

        #[arg(long, group = "edit")]
        task: Option<String>,

        /// Insert the feature described by this JSON file after INDEX
        #[arg(long, group = "edit")]
        insert_after: Option<PathBuf>,

        #[arg(long, group = "edit")]
        move_to: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let name = cli.command.name();

    let config = match Config::load(cli.home.clone()) {
        Ok(config) => config,
        Err(e) => return report(name, Err(ShipyardError::from(e))),
    };
    let log_dir = config
        .toml
        .logging
        .file
        .then(|| config.log_dir.clone())
        .filter(|_| config.ensure_directories().is_ok());
    let _guard = shipyard::logging::init(cli.verbose, log_dir.as_deref());

    report(name, cmd::dispatch(&cli, config).await)
}

fn report(command: &str, outcome: shipyard::errors::Result<cmd::Reply>) -> ExitCode {
    let result = match outcome {
        Ok(cmd::Reply::Text(text)) => {
            print!("{text}");
            return ExitCode::SUCCESS;
        }
        Ok(cmd::Reply::Data(data)) => CommandResult::ok(command, &data),
        Err(e) => {
            tracing::debug!(command, error = %e, "command failed");
            CommandResult::failure(command, e.to_payload())
        }
    };
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("failed to serialise result: {e}"),
    }
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
