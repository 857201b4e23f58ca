//! TaskMesh CLI - operator commands against a shared coordinator state directory.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use taskmesh_coordinator::{
    request_stop, run_daemon, Config, Coordinator, NoopTarget, NullBackend,
};
use taskmesh_core::{AlertId, EventId, InstanceId, Task, TaskId, TaskSubmission, Worker};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// TaskMesh CLI - coordinator management tool
#[derive(Parser)]
#[command(name = "taskmesh")]
#[command(about = "CLI for TaskMesh coordinators", long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Shared state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a coordinator in the foreground
    Start {
        /// Instance id for this coordinator
        #[arg(long)]
        instance_id: Option<String>,

        /// HTTP status address
        #[arg(long)]
        http_addr: Option<String>,
    },

    /// Ask a running coordinator to stop
    Stop {
        /// Instance to stop
        #[arg(long)]
        instance: String,
    },

    /// Show cluster status
    Status,

    /// Submit a new task
    Submit {
        /// Task description used for routing
        description: String,

        /// critical, high, medium or low
        #[arg(short, long, default_value = "medium")]
        priority: String,

        /// Task type
        #[arg(short = 't', long = "type", default_value = "general")]
        task_type: String,

        /// Caller-chosen task id
        #[arg(long)]
        id: Option<String>,

        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,
    },

    /// Inspect and manage tasks
    #[command(subcommand)]
    Task(TaskCommand),

    /// List workers
    Workers {
        /// Include finished workers
        #[arg(short, long)]
        all: bool,
    },

    /// Show the token ledger
    Budget {
        /// Include daily history
        #[arg(long)]
        history: bool,
    },

    /// Inspect and resolve health alerts
    #[command(subcommand)]
    Alerts(AlertCommand),

    /// List logged events
    Events {
        /// Only events at or after this RFC 3339 time
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Only events at or before this RFC 3339 time
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },

    /// Re-deliver events to their handlers
    Replay {
        /// Event ids to replay
        ids: Vec<u64>,

        /// Replay every event at or after this RFC 3339 time
        #[arg(long, conflicts_with = "ids")]
        since: Option<DateTime<Utc>>,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List tasks
    List {
        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show one task with its routing decision
    Show { id: String },
    /// Force-reclaim a stuck task and return it to pending
    Reassign { id: String },
    /// Cancel a task
    Cancel { id: String },
    /// Assign an agent class by hand (unblocks rejected tasks)
    Classify { id: String, class: String },
}

#[derive(Subcommand)]
enum AlertCommand {
    /// List alerts
    List {
        /// Include resolved alerts
        #[arg(short, long)]
        all: bool,
    },
    /// Resolve an alert
    Resolve {
        id: String,

        #[arg(short, long, default_value = "resolved by operator")]
        resolution: String,
    },
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    // Operator commands print tables on stdout; keep their logs quiet.
    let default_directive = match cli.command {
        Commands::Start { .. } => "taskmesh=info",
        _ => "taskmesh=warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    match cli.command {
        Commands::Start {
            instance_id,
            http_addr,
        } => {
            if let Some(id) = instance_id {
                config.instance_id = id;
            }
            if http_addr.is_some() {
                config.http_addr = http_addr;
            }
            start(config).await
        }
        command => {
            // Operator commands act on the shared store without joining the cluster.
            config.instance_id = format!("cli-{}", std::process::id());
            let coordinator =
                Coordinator::new(config, Arc::new(NullBackend), Arc::new(NoopTarget)).await?;
            operate(&coordinator, command, cli.json).await
        }
    }
}

async fn operate(coordinator: &Coordinator, command: Commands, json: bool) -> CliResult {
    match command {
        Commands::Start { .. } => {}
        Commands::Stop { instance } => {
            request_stop(coordinator.store(), &InstanceId::new(instance.clone()), "cli").await?;
            println!("Stop requested for {instance}");
        }
        Commands::Status => status(coordinator, json).await?,
        Commands::Submit {
            description,
            priority,
            task_type,
            id,
            metadata,
        } => {
            let mut submission = TaskSubmission::new(description, priority).with_type(task_type);
            if let Some(id) = id {
                submission = submission.with_id(id);
            }
            if let Some(raw) = metadata {
                submission.metadata = serde_json::from_str(&raw)?;
            }
            let task = coordinator.submit(submission).await?;
            println!("Task submitted:");
            print_task(&task);
        }
        Commands::Task(cmd) => task_command(coordinator, cmd, json).await?,
        Commands::Workers { all } => workers(coordinator, all, json).await?,
        Commands::Budget { history } => budget(coordinator, history, json).await?,
        Commands::Alerts(cmd) => alert_command(coordinator, cmd, json).await?,
        Commands::Events { from, to } => events(coordinator, from, to, json).await?,
        Commands::Replay { ids, since } => {
            let report = match since {
                Some(since) => coordinator.bus().replay_since(since).await?,
                None => {
                    let ids: Vec<EventId> = ids.into_iter().map(EventId::new).collect();
                    coordinator.bus().replay_ids(&ids).await?
                }
            };
            println!("Replayed {} event(s)", report.replayed);
            for (id, error) in report.failed {
                println!("  {id}: {error}");
            }
        }
    }
    Ok(())
}

async fn start(config: Config) -> CliResult {
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });
    run_daemon(config, shutdown).await?;
    Ok(())
}

async fn status(coordinator: &Coordinator, json: bool) -> CliResult {
    let report = coordinator.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Tasks:");
    for (status, count) in &report.tasks_by_status {
        println!("  {status:<10}  {count}");
    }
    println!("Active workers:     {}", report.active_workers);
    println!("Heartbeat timeout:  {}s", report.heartbeat_timeout_secs);
    println!("Open alerts:        {}", report.open_alerts);
    println!("Queued events:      {}", report.queue_depth);
    println!("Dead letters:       {}", report.dead_letters);
    println!("Live instances ({}):", report.live_instances.len());
    for instance in &report.live_instances {
        println!(
            "  {:<24}  {:<20}  claims={}  heartbeat={}",
            instance.instance_id,
            instance.hostname,
            instance.claimed_tasks.len(),
            format_timestamp(instance.heartbeat_at)
        );
    }
    Ok(())
}

async fn task_command(coordinator: &Coordinator, cmd: TaskCommand, json: bool) -> CliResult {
    match cmd {
        TaskCommand::List { status } => {
            let mut tasks = coordinator.pool().tasks().await?;
            if let Some(status) = status {
                tasks.retain(|t| t.status.as_str() == status.to_ascii_lowercase());
            }
            tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            println!("Tasks ({}):", tasks.len());
            println!(
                "{:<36}  {:<10}  {:<9}  {:<14}  {:<5}  {}",
                "ID", "STATUS", "PRIORITY", "CLASS", "TRIES", "CREATED"
            );
            println!("{}", "-".repeat(100));
            for t in tasks {
                println!(
                    "{:<36}  {:<10}  {:<9}  {:<14}  {:<5}  {}",
                    t.id,
                    t.status,
                    t.priority,
                    t.assigned_agent_class.as_deref().unwrap_or("-"),
                    t.retry_count,
                    format_timestamp(t.created_at)
                );
            }
        }
        TaskCommand::Show { id } => {
            let id = TaskId::new(id);
            let task = coordinator
                .task(&id)
                .await?
                .ok_or_else(|| format!("task {id} not found"))?;
            let decision = coordinator.router().decision(&id).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "task": task,
                        "routing": decision,
                    }))?
                );
                return Ok(());
            }
            print_task(&task);
            if let Some(d) = decision {
                println!("  Routing:    {:?}", d.strategy);
                for (class, score) in &d.confidence {
                    println!("    {class:<16} {score:.3}");
                }
            }
        }
        TaskCommand::Reassign { id } => {
            let task = coordinator.pool().reassign(&TaskId::new(id)).await?;
            println!("Task reassigned:");
            print_task(&task);
        }
        TaskCommand::Cancel { id } => {
            let task = coordinator.pool().cancel(&TaskId::new(id)).await?;
            println!("Task cancelled:");
            print_task(&task);
        }
        TaskCommand::Classify { id, class } => {
            let task = coordinator
                .router()
                .classify_manually(&TaskId::new(id), &class)
                .await?;
            println!("Task classified:");
            print_task(&task);
        }
    }
    Ok(())
}

async fn workers(coordinator: &Coordinator, all: bool, json: bool) -> CliResult {
    let mut workers: Vec<Worker> = coordinator.pool().active_workers().await?;
    if all {
        workers.extend(coordinator.pool().finished_workers().await?);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
        return Ok(());
    }

    println!("Workers ({}):", workers.len());
    println!(
        "{:<36}  {:<10}  {:<14}  {:<13}  {:<20}  {}",
        "ID", "STATUS", "TYPE", "TOKENS", "INSTANCE", "LAST HEARTBEAT"
    );
    println!("{}", "-".repeat(120));
    for w in workers {
        let tokens = format!("{}/{}", w.tokens_used, w.token_budget);
        let heartbeat = w
            .last_heartbeat
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10}  {:<14}  {:<13}  {:<20}  {}",
            w.id, w.status, w.worker_type, tokens, w.instance_id, heartbeat
        );
    }
    Ok(())
}

async fn budget(coordinator: &Coordinator, history: bool, json: bool) -> CliResult {
    let ledger = coordinator.ledger().snapshot().await?;
    let days = if history {
        coordinator.ledger().history().await?
    } else {
        Vec::new()
    };
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "ledger": ledger,
                "history": days,
            }))?
        );
        return Ok(());
    }

    println!(
        "Day {}: {}/{} tokens used",
        ledger.day, ledger.global_used, ledger.global_total
    );
    println!(
        "{:<16}  {:>10}  {:>10}  {:>10}  {:>10}",
        "CLASS", "ALLOCATED", "USED", "RESERVED", "AVAILABLE"
    );
    println!("{}", "-".repeat(66));
    for (class, b) in &ledger.per_agent_class {
        println!(
            "{:<16}  {:>10}  {:>10}  {:>10}  {:>10}",
            class,
            b.allocated,
            b.used,
            b.reserved,
            b.available()
        );
    }
    let e = &ledger.emergency_reserve;
    println!(
        "{:<16}  {:>10}  {:>10}  {:>10}  {:>10}",
        "(emergency)",
        e.total,
        e.used,
        e.reserved,
        e.available()
    );
    println!("Open reservations: {}", ledger.reservations.len());

    for day in days {
        println!(
            "  {}  used={}  emergency={}",
            day.day, day.global_used, day.emergency_used
        );
    }
    Ok(())
}

async fn alert_command(coordinator: &Coordinator, cmd: AlertCommand, json: bool) -> CliResult {
    match cmd {
        AlertCommand::List { all } => {
            let alerts = coordinator.alerts().list(all).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&alerts)?);
                return Ok(());
            }
            println!("Alerts ({}):", alerts.len());
            println!(
                "{:<36}  {:<20}  {:<8}  {:<8}  {}",
                "ID", "COMPONENT", "SEVERITY", "STATUS", "MESSAGE"
            );
            println!("{}", "-".repeat(100));
            for a in alerts {
                println!(
                    "{:<36}  {:<20}  {:<8}  {:<8}  {}",
                    a.id,
                    a.component,
                    format!("{:?}", a.severity).to_lowercase(),
                    format!("{:?}", a.status).to_lowercase(),
                    a.message
                );
                if !a.diagnosis.is_empty() {
                    println!("    diagnosis: {}", a.diagnosis);
                }
                if let Some(action) = &a.recommended_action {
                    println!("    recommended: {action}");
                }
            }
        }
        AlertCommand::Resolve { id, resolution } => {
            let alert = coordinator
                .alerts()
                .resolve(&AlertId::new(id), &resolution)
                .await?;
            println!("Alert {} resolved ({})", alert.id, alert.component);
        }
    }
    Ok(())
}

async fn events(
    coordinator: &Coordinator,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    json: bool,
) -> CliResult {
    let events = coordinator.bus().events_between(from, to).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    println!("Events ({}):", events.len());
    println!(
        "{:>8}  {:<19}  {:<24}  {:<20}  {}",
        "ID", "TIME", "TYPE", "SOURCE", "CORRELATION"
    );
    println!("{}", "-".repeat(100));
    for e in events {
        println!(
            "{:>8}  {:<19}  {:<24}  {:<20}  {}",
            e.id,
            format_timestamp(e.timestamp),
            e.event_type,
            e.source,
            e.correlation_id.as_deref().unwrap_or("-")
        );
    }

    let dead = coordinator.bus().dead_letters().await?;
    if !dead.is_empty() {
        println!("Dead letters ({}):", dead.len());
        for d in dead {
            println!("  {}  {}  attempts={}  {}", d.event_id, d.event_type, d.attempts, d.error);
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Status:     {}", task.status);
    println!("  Priority:   {}", task.priority);
    println!("  Type:       {}", task.task_type);
    println!(
        "  Class:      {}",
        task.assigned_agent_class.as_deref().unwrap_or("-")
    );
    println!("  Retries:    {}", task.retry_count);
    println!("  Created:    {}", format_timestamp(task.created_at));
    for assignment in &task.workers {
        let state = if assignment.completed { "done" } else { "working" };
        println!(
            "  Worker:     {} ({}, {state})",
            assignment.worker_id, assignment.class
        );
    }
    if let Some(reason) = &task.reason {
        println!("  Reason:     {reason}");
    }
    println!("  Description: {}", task.description);
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
