use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pythia::config::{PoolConfig, QueueConfig, SandboxPaths};
use pythia::message::Task;
use pythia::net::Addr;
use pythia::pool::Pool;
use pythia::queue::Queue;
use pythia::runner::Job;
use pythia::shutdown::install_shutdown_handler;

/// Exit code reserved for configuration errors, recognized by the
/// supervisor.
const EXIT_CONFIG: i32 = 7;

#[derive(Parser, Debug)]
#[command(name = "pythia")]
#[command(about = "Distributed task execution platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the central queue
    Queue {
        /// Listen address (host:port or unix:/path)
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: String,

        /// Maximum number of waiting jobs
        #[arg(long, default_value_t = 500)]
        capacity: usize,
    },
    /// Run a sandbox pool
    Pool {
        /// Queue address (host:port or unix:/path)
        #[arg(long, default_value = "127.0.0.1:9000")]
        queue: String,

        /// Maximum number of parallel sandboxes
        #[arg(long, default_value_t = 1)]
        capacity: usize,

        /// Path to the sandbox executable
        #[arg(long, default_value = "vm/uml")]
        sandbox: PathBuf,

        /// Directory containing the environment images
        #[arg(long, default_value = "vm")]
        envdir: PathBuf,

        /// Directory containing the tasks
        #[arg(long, default_value = "tasks")]
        tasksdir: PathBuf,
    },
    /// Execute a single job (for debugging purposes)
    Execute {
        /// Path to the task description
        #[arg(long)]
        task: PathBuf,

        /// Path to the input file
        #[arg(long)]
        input: PathBuf,

        /// Path to the sandbox executable
        #[arg(long, default_value = "vm/uml")]
        sandbox: PathBuf,

        /// Directory containing the environment images
        #[arg(long, default_value = "vm")]
        envdir: PathBuf,

        /// Directory containing the tasks
        #[arg(long, default_value = "tasks")]
        tasksdir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Queue { listen, capacity } => {
            let config = QueueConfig {
                listen: parse_addr(&listen),
                capacity,
                ..Default::default()
            };
            let queue = Queue::new(config);
            install_shutdown_handler(queue.shutdown_token());
            queue.run().await
        }
        Command::Pool {
            queue,
            capacity,
            sandbox,
            envdir,
            tasksdir,
        } => {
            let config = PoolConfig {
                queue: parse_addr(&queue),
                capacity,
                paths: SandboxPaths {
                    sandbox,
                    env_dir: envdir,
                    tasks_dir: tasksdir,
                },
                ..Default::default()
            };
            let pool = Pool::new(config);
            install_shutdown_handler(pool.shutdown_token());
            pool.run().await
        }
        Command::Execute {
            task,
            input,
            sandbox,
            envdir,
            tasksdir,
        } => {
            execute(
                &task,
                &input,
                SandboxPaths {
                    sandbox,
                    env_dir: envdir,
                    tasks_dir: tasksdir,
                },
            )
            .await
        }
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Fatal error");
        exit(1);
    }
}

fn parse_addr(spec: &str) -> Addr {
    match spec.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{}", e);
            exit(EXIT_CONFIG);
        }
    }
}

/// Run a single job from a task description and an input file, printing the
/// result on stdout.
async fn execute(taskfile: &Path, inputfile: &Path, paths: SandboxPaths) -> pythia::error::Result<()> {
    let task = read_task(taskfile);
    let input = match std::fs::read_to_string(inputfile) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("{}: {}", inputfile.display(), e);
            exit(EXIT_CONFIG);
        }
    };

    let job = Job::new(task, input, paths);
    let token = CancellationToken::new();
    install_shutdown_handler(token.clone());
    let handle = job.handle();
    tokio::spawn(async move {
        token.cancelled().await;
        handle.abort();
    });

    let (status, output) = job.execute().await;
    println!("Status: {}", status);
    println!("Output: {}", output);
    Ok(())
}

fn read_task(path: &Path) -> Task {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            exit(EXIT_CONFIG);
        }
    };
    match serde_json::from_str(&content) {
        Ok(task) => task,
        Err(e) => {
            eprintln!("{}: invalid task description: {}", path.display(), e);
            exit(EXIT_CONFIG);
        }
    }
}
