//! Command-line interface for vidcore.
//!
//! Provides commands for inspecting routing and provider setup, running a
//! completion through the router, validating job payloads, and reading the
//! job journal.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use crate::adapters::{CompletionOptions, ProviderId};
use crate::config;
use crate::core::{AiDispatcher, JobStore, JournalJobStore, Task, TaskKind};
use crate::domain::{JobPayload, JobState, QueueName};

/// vidcore - AI task routing and job orchestration for creator tooling
#[derive(Parser, Debug)]
#[command(name = "vidcore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show which providers a task kind would try, in order
    Route {
        /// Task kind (e.g. generate_title, analyze_channel)
        task: String,
    },

    /// Run a completion task through the router
    Complete {
        /// Task kind (e.g. generate_title, analyze_channel)
        task: String,

        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Extra context appended to the prompt
        #[arg(short, long)]
        context: Option<String>,

        /// Model override for whichever provider answers
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long, default_value = "2000")]
        max_tokens: u32,

        #[arg(long, default_value = "0.7")]
        temperature: f32,
    },

    /// List providers and whether they are configured
    Providers,

    /// Show the retry, backoff and retention policy of every queue
    Queues,

    /// Validate a job payload against a queue's contract
    Validate {
        /// Queue name (e.g. video-process)
        queue: String,

        /// JSON file (reads from stdin if not provided)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Inspect jobs recorded in the journal
    Jobs {
        /// Only this queue
        #[arg(short, long)]
        queue: Option<String>,

        /// List jobs in this state instead of showing counts
        #[arg(short, long, value_enum)]
        state: Option<StateArg>,

        /// Maximum number of jobs to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Job state for CLI (maps to JobState)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Queued,
    Active,
    RetryScheduled,
    Completed,
    Failed,
}

impl From<StateArg> for JobState {
    fn from(s: StateArg) -> Self {
        match s {
            StateArg::Queued => JobState::Queued,
            StateArg::Active => JobState::Active,
            StateArg::RetryScheduled => JobState::RetryScheduled,
            StateArg::Completed => JobState::Completed,
            StateArg::Failed => JobState::Failed,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Route { task } => show_route(&task),
            Commands::Complete {
                task,
                input,
                context,
                model,
                max_tokens,
                temperature,
            } => {
                let options = CompletionOptions {
                    max_tokens,
                    temperature,
                    system_prompt: None,
                    model,
                };
                run_completion(&task, input, context, options).await
            }
            Commands::Providers => list_providers(),
            Commands::Queues => list_queues(),
            Commands::Validate { queue, file } => validate_payload(&queue, file),
            Commands::Jobs { queue, state, limit } => list_jobs(queue, state, limit).await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_task(task: &str) -> Result<TaskKind> {
    task.parse::<TaskKind>().with_context(|| {
        let known: Vec<&str> = TaskKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("Known task kinds: {}", known.join(", "))
    })
}

fn parse_queue(queue: &str) -> Result<QueueName> {
    queue.parse::<QueueName>().with_context(|| {
        let known: Vec<&str> = QueueName::ALL.iter().map(|q| q.as_str()).collect();
        format!("Known queues: {}", known.join(", "))
    })
}

/// Read from a file, or stdin when no file is given
fn read_input(path: Option<PathBuf>) -> Result<String> {
    let input = if let Some(path) = path {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    };

    if input.trim().is_empty() {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    }

    Ok(input)
}

/// Show the provider plan for a task kind
fn show_route(task: &str) -> Result<()> {
    let kind = parse_task(task)?;
    let cfg = config::config()?;
    let router = cfg.router();
    let registry = cfg.registry();

    println!("Task:     {} ({})", kind, kind.category());
    println!("Primary:  {}", router.route(kind));
    println!();
    println!("Attempt order:");
    for (i, provider) in router.plan(kind).into_iter().enumerate() {
        let status = if registry.is_available(provider) {
            "configured"
        } else {
            "missing credential"
        };
        println!("  {}. {:<8} {}", i + 1, provider, status);
    }

    Ok(())
}

/// Run a completion through the router
async fn run_completion(
    task: &str,
    input: Option<PathBuf>,
    context: Option<String>,
    options: CompletionOptions,
) -> Result<()> {
    let kind = parse_task(task)?;
    let input = read_input(input)?;
    let cfg = config::config()?;

    let dispatcher = AiDispatcher::new(cfg.router(), Arc::new(cfg.registry()));

    let mut request = Task::new(kind, input).with_options(options);
    if let Some(context) = context {
        request = request.with_context(context);
    }

    eprintln!("Running {} task...", kind);

    match dispatcher.complete(&request).await {
        Ok(completion) => {
            if completion.fell_back {
                eprintln!("Answered by fallback provider: {}", completion.provider);
            } else {
                eprintln!("Answered by: {}", completion.provider);
            }
            println!("{}", completion.text);
            Ok(())
        }
        Err(exhausted) => {
            eprintln!("All providers failed:");
            for failure in &exhausted.failures {
                eprintln!("  {}: {}", failure.provider, failure.error);
            }
            Err(exhausted.into())
        }
    }
}

/// List providers in fallback order
fn list_providers() -> Result<()> {
    let cfg = config::config()?;
    let registry = cfg.registry();

    println!("{:<10} {:<12} {:<28} {}", "PROVIDER", "STATUS", "MODEL", "CREDENTIAL");
    println!("{}", "-".repeat(75));

    for provider in cfg.fallback.as_slice() {
        let settings = cfg.providers.get(provider);
        let status = if registry.is_available(*provider) {
            "configured"
        } else {
            "missing"
        };
        let model = settings
            .and_then(|s| s.model.as_deref())
            .unwrap_or(provider.default_model());
        println!(
            "{:<10} {:<12} {:<28} {}",
            provider,
            status,
            model,
            provider.credential_env()
        );
    }

    println!();
    println!("Call timeout: {}s", registry.call_timeout().as_secs());

    Ok(())
}

/// Show the policy table
fn list_queues() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "{:<16} {:>8} {:<24} {:>8} {:>8} {:>6} {:>8}",
        "QUEUE", "ATTEMPTS", "BACKOFF", "KEEP OK", "KEEP ERR", "CONC", "TIMEOUT"
    );
    println!("{}", "-".repeat(86));

    for (queue, policy) in cfg.policies.iter() {
        let backoff = match policy.backoff {
            crate::core::BackoffStrategy::Exponential { base_delay_ms } => {
                format!("exponential {}ms", base_delay_ms)
            }
            crate::core::BackoffStrategy::Fixed { delay_ms } => format!("fixed {}ms", delay_ms),
        };
        println!(
            "{:<16} {:>8} {:<24} {:>8} {:>8} {:>6} {:>7}s",
            queue,
            policy.max_attempts,
            backoff,
            policy.remove_on_complete,
            policy.remove_on_fail,
            policy.concurrency,
            policy.timeout.as_secs()
        );
    }

    Ok(())
}

/// Check a JSON payload against a queue's contract
fn validate_payload(queue: &str, file: Option<PathBuf>) -> Result<()> {
    let queue = parse_queue(queue)?;
    let raw = read_input(file)?;
    let value: serde_json::Value = serde_json::from_str(&raw).context("Payload is not valid JSON")?;

    let payload = JobPayload::from_json(queue, value)?;

    eprintln!("Payload is valid for {}", queue);
    println!("{}", serde_json::to_string_pretty(&payload.to_body())?);

    Ok(())
}

/// Show journal counts, or list jobs in one state
async fn list_jobs(queue: Option<String>, state: Option<StateArg>, limit: usize) -> Result<()> {
    let queues = match queue {
        Some(q) => vec![parse_queue(&q)?],
        None => QueueName::ALL.to_vec(),
    };

    let store = JournalJobStore::open_default()
        .await
        .context("Failed to open job journal")?;

    let Some(state) = state.map(JobState::from) else {
        println!(
            "{:<16} {:>7} {:>7} {:>7} {:>10} {:>7}",
            "QUEUE", "QUEUED", "ACTIVE", "RETRY", "COMPLETED", "FAILED"
        );
        println!("{}", "-".repeat(60));
        for queue in queues {
            let c = store.counts(queue).await?;
            println!(
                "{:<16} {:>7} {:>7} {:>7} {:>10} {:>7}",
                queue, c.queued, c.active, c.retry_scheduled, c.completed, c.failed
            );
        }
        return Ok(());
    };

    let mut jobs = Vec::new();
    for queue in queues {
        jobs.extend(store.list(queue, state).await?);
    }
    jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    if jobs.is_empty() {
        println!("No {} jobs found", state);
        return Ok(());
    }

    println!("{:<38} {:<16} {:>8} {:<20}", "JOB ID", "QUEUE", "ATTEMPTS", "UPDATED");
    println!("{}", "-".repeat(85));
    for job in jobs.into_iter().take(limit) {
        println!(
            "{:<38} {:<16} {:>8} {:<20}",
            job.id,
            job.queue,
            job.attempts_made,
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &job.last_error {
            println!("    last error: {}", error);
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("vidcore configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Journal: {}", cfg.journal.display());
    println!();
    println!("Providers (timeout {}s):", cfg.provider_timeout.as_secs());
    for provider in ProviderId::ALL {
        let settings = cfg.providers.get(&provider);
        let key = if settings.and_then(|s| s.api_key.as_ref()).is_some() {
            "configured"
        } else {
            "missing"
        };
        let base_url = settings
            .and_then(|s| s.base_url.as_deref())
            .unwrap_or("(default)");
        println!("  {:<8} key: {:<11} endpoint: {}", provider, key, base_url);
    }
    println!();
    println!("Routing:");
    for (kind, provider) in cfg.routing.entries() {
        println!("  {:<22} {}", kind, provider);
    }
    let fallback: Vec<&str> = cfg.fallback.as_slice().iter().map(|p| p.as_str()).collect();
    println!("  fallback order: {}", fallback.join(" → "));
    println!();
    println!("Realtime:");
    println!("  Session cookie:    {}", cfg.realtime.session_cookie);
    println!("  Connection buffer: {}", cfg.realtime.connection_buffer);

    Ok(())
}
