mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use gavel_common::types::JobState;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gavel-cli")]
#[command(about = "Gavel CLI - Submit jobs, inspect the queue and manage eval nodes", long_about = None)]
struct Cli {
    /// Dispatcher base URL
    #[arg(long, global = true, env = "GAVEL_DISPATCHER_URL", default_value = "http://127.0.0.1:8090")]
    dispatcher: String,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Waiting,
    Processing,
    Done,
}

impl From<StateArg> for JobState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Waiting => JobState::Waiting,
            StateArg::Processing => JobState::Processing,
            StateArg::Done => JobState::Done,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a source file for grading
    Submit {
        /// Source file
        file: PathBuf,

        #[arg(short, long)]
        dataset: String,

        #[arg(short, long)]
        task: String,

        /// Submission this job grades
        #[arg(short, long)]
        submission: String,

        /// Language tag (guessed from the file extension when omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// Higher runs first
        #[arg(short, long, default_value_t = 1)]
        priority: i32,
    },

    /// Show a job and its result
    Job {
        uuid: Uuid,
    },

    /// Search jobs
    Search {
        #[arg(long)]
        task: Option<String>,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        language: Option<String>,

        #[arg(long)]
        eval: Option<String>,

        #[arg(long, value_enum)]
        state: Option<StateArg>,

        /// Case-insensitive substring of the error message
        #[arg(long)]
        error: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: u32,

        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// List alive eval nodes
    Evals {
        /// Poll every node now instead of using the last health check
        #[arg(long)]
        refresh: bool,
    },

    /// Run one dispatch pass and print its outcome
    Dispatch,

    /// Show an eval node's status
    Status {
        /// Eval node address (host:port)
        address: String,
    },

    /// Stop an eval node from accepting jobs
    Disable {
        address: String,
    },

    /// Let a disabled eval node accept jobs again
    Enable {
        address: String,
    },

    /// Write a languages.json with the stock toolchains
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing languages.json
        #[arg(long)]
        force: bool,
    },

    /// List the languages in a languages.json
    ListLangs {
        #[arg(short, long, default_value = "config/languages.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = commands::Clients::new(&cli.dispatcher, cli.timeout)?;

    match cli.command {
        Commands::Submit {
            file,
            dataset,
            task,
            submission,
            language,
            priority,
        } => {
            commands::submit(&ctx, &file, &dataset, &task, &submission, language.as_deref(), priority).await?;
        }
        Commands::Job { uuid } => {
            commands::show_job(&ctx, &uuid).await?;
        }
        Commands::Search {
            task,
            dataset,
            language,
            eval,
            state,
            error,
            limit,
            offset,
        } => {
            let filter = gavel_common::rpc::SearchFilter {
                task_id: task,
                dataset_id: dataset,
                language,
                eval_id: eval,
                state: state.map(JobState::from),
                error_message: error,
                limit: Some(limit),
                offset: Some(offset),
            };
            commands::search(&ctx, &filter).await?;
        }
        Commands::Evals { refresh } => {
            commands::list_evals(&ctx, refresh).await?;
        }
        Commands::Dispatch => {
            commands::dispatch(&ctx).await?;
        }
        Commands::Status { address } => {
            commands::node_status(&ctx, &address).await?;
        }
        Commands::Disable { address } => {
            commands::set_disabled(&ctx, &address, true).await?;
        }
        Commands::Enable { address } => {
            commands::set_disabled(&ctx, &address, false).await?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
        Commands::ListLangs { config } => {
            commands::list_languages(&config)?;
        }
    }

    Ok(())
}
