//! Stepwise CLI - Run, replay and inspect agent sessions
//!
//! Usage:
//!   stepwise exec -c "print 1"                      Run an action script in a fresh sandbox
//!   stepwise exec script.txt                        Run an action script file
//!   stepwise run --task task.json --responses r.json    Replay a session from canned responses
//!   stepwise show --log-dir logs/ [--step 3]        Print the conversation stored for a step

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use stepwise::agent::StepLog;
use stepwise::workspace::Fault;
use stepwise::{Agent, AgentConfig, ScriptedClient, Task, ToolRegistry, Trajectory, Workspace};

/// Stepwise - budgeted multi-turn agent loop
#[derive(Parser, Debug)]
#[command(name = "stepwise")]
#[command(about = "Run, replay and inspect stepwise agent sessions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute an action script in a fresh sandbox
    Exec {
        /// Inline script
        #[arg(short = 'c', conflicts_with = "file")]
        code: Option<String>,
        /// Script file (stdin when neither is given)
        file: Option<PathBuf>,
    },
    /// Run a session against recorded model responses
    Run {
        /// Agent configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Task definition (JSON)
        #[arg(long)]
        task: PathBuf,
        /// Model responses: a JSON array of strings, or a trajectory (.jsonl)
        #[arg(long)]
        responses: PathBuf,
        /// Directory for step logs and the trajectory (overrides the config)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Print the conversation stored in a step log
    Show {
        /// Session log directory
        #[arg(long)]
        log_dir: PathBuf,
        /// Step to show (defaults to the last one)
        #[arg(long)]
        step: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Exec { code, file } => exec(code, file).await,
        Command::Run {
            config,
            task,
            responses,
            log_dir,
        } => run(config, &task, &responses, log_dir).await,
        Command::Show { log_dir, step } => show(&log_dir, step),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("stepwise: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn exec(code: Option<String>, file: Option<PathBuf>) -> Result<ExitCode> {
    let script = match (code, file) {
        (Some(code), _) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => {
            let mut script = String::new();
            io::stdin()
                .read_to_string(&mut script)
                .context("failed to read stdin")?;
            script
        }
    };

    let mut workspace = Workspace::default();
    let execution = workspace.execute(&script).await;

    print!("{}", execution.stdout);
    eprint!("{}", execution.stderr);

    match execution.error {
        None => Ok(ExitCode::SUCCESS),
        Some(Fault::Script(error)) => {
            eprintln!("error: {error}");
            Ok(ExitCode::FAILURE)
        }
        Some(Fault::Interrupted(completion)) => {
            println!("{}", completion.report());
            Ok(if completion.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn run(
    config: Option<PathBuf>,
    task: &Path,
    responses: &Path,
    log_dir: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut config = match config {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            AgentConfig::from_toml(&text)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        }
        None => AgentConfig::default(),
    };
    if log_dir.is_some() {
        config.log_dir = log_dir;
    }

    let task_text = std::fs::read_to_string(task)
        .with_context(|| format!("failed to read {}", task.display()))?;
    let task: Task = serde_json::from_str(&task_text)
        .with_context(|| format!("invalid task in {}", task.display()))?;

    let mut client = ScriptedClient::new(load_responses(responses)?);
    if let Some(model) = &config.model {
        client = client.with_model(model.clone());
    }
    let agent = Agent::new(config, client, ToolRegistry::new())?;

    let report = agent.run(task).await;

    println!("state:  {:?}", report.state);
    println!("turns:  {}", report.turns);
    println!("calls:  {}", report.calls);
    println!(
        "tokens: {} in / {} out",
        report.usage.input, report.usage.output
    );
    println!("cost:   {}", report.cost);
    println!("report: {}", report.report);
    if let Some(error) = &report.error {
        eprintln!("error:  {error}");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn load_responses(path: &Path) -> Result<Vec<String>> {
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        let trajectory = Trajectory::load(path)?;
        return Ok(trajectory.responses());
    }

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of strings", path.display()))
}

fn show(log_dir: &Path, step: Option<usize>) -> Result<ExitCode> {
    let log = StepLog::open(log_dir.join("steps"));
    let step = match step {
        Some(step) => step,
        None => match log.steps()?.last() {
            Some(step) => *step,
            None => bail!("no steps logged in {}", log.dir().display()),
        },
    };

    let history = log.load(step)?;
    println!("== step {step} ==\n");
    print!("{}", history.transcript());
    Ok(ExitCode::SUCCESS)
}
