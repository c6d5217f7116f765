//! vamsh-bridge 命令行入口
//!
//! - `run`：恢复未终止项目的监控，持续输出监控事件直到 Ctrl+C
//! - `create`：执行创建流水线（规格 → 任务 → 健康检查 → 持久化 → 监控 → 交接），之后继续监控
//! - `status`：查看项目列表或单个项目的进度、任务与最近事件
//! - `health`：检查 Vamsh 可达性

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use vamsh_bridge::{
    config::load_config,
    core::shutdown::run_with_graceful_shutdown,
    gateway::AgentApi,
    monitor::MonitoringEvent,
    observability,
    planning::CreateProjectRequest,
    BridgeContext,
};

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Resume monitoring of unfinished projects and stream events
    Run,
    /// Create a project and hand it off to Vamsh
    Create {
        /// Project name
        #[arg(long)]
        name: String,
        /// Free-form requirements text
        #[arg(long)]
        requirements: String,
        /// Short description
        #[arg(long, default_value = "")]
        description: String,
        /// Exit after the pipeline instead of monitoring until Ctrl+C
        #[arg(long)]
        detach: bool,
    },
    /// Show projects, or one project with its tasks and recent events
    Status {
        /// Project id
        #[arg(long)]
        project: Option<String>,
        /// Number of recent events to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Check that the Vamsh agent is reachable
    Health,
}

#[derive(Parser, Debug)]
#[command(name = "vamsh-bridge")]
#[command(version)]
#[command(about = "Resilient handoff and progress monitoring for the Vamsh development agent", long_about = None)]
struct Args {
    /// Configuration file path (layered over config/default.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_with_level(if args.verbose { "debug" } else { "info" });

    let config = load_config(args.config).context("Failed to load configuration")?;
    let ctx = BridgeContext::create(config)
        .await
        .context("Failed to create bridge context")?;

    let result = match args.command {
        Command::Run => run(&ctx).await,
        Command::Create {
            name,
            requirements,
            description,
            detach,
        } => {
            let request = CreateProjectRequest::new(name, requirements).with_description(description);
            create(&ctx, request, !detach).await
        }
        Command::Status { project, limit } => status(&ctx, project.as_deref(), limit).await,
        Command::Health => health(&ctx).await,
    };

    ctx.dispose().await;
    result
}

async fn run(ctx: &BridgeContext) -> anyhow::Result<()> {
    let restored = ctx.start().await?;
    println!("Monitoring {} project(s). Press Ctrl+C to stop.", restored);
    watch_events(ctx).await;
    Ok(())
}

async fn create(ctx: &BridgeContext, request: CreateProjectRequest, watch: bool) -> anyhow::Result<()> {
    let mut phases = ctx.orchestrator().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(report) = phases.recv().await {
            println!("[{:>3}%] {}: {}", report.progress, report.phase, report.message);
        }
    });

    let outcome = ctx.orchestrator().create_project(request).await;
    printer.abort();

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to render outcome")?
    );
    if !outcome.success {
        anyhow::bail!(
            "project creation failed at {}: {}",
            outcome.phase,
            outcome.error.unwrap_or_default()
        );
    }

    if watch {
        watch_events(ctx).await;
    }
    Ok(())
}

/// 输出监控事件直到收到关闭信号，然后停止所有监控任务
async fn watch_events(ctx: &BridgeContext) {
    let mut events = ctx.monitor().subscribe();
    let app = async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    run_with_graceful_shutdown(Arc::clone(ctx.shutdown_manager()), app, || ctx.stop()).await;
}

fn print_event(event: &MonitoringEvent) {
    println!(
        "{} [{}] {} {}",
        event.timestamp.format("%H:%M:%S"),
        event.project_id,
        event.kind(),
        event.message
    );
}

async fn status(ctx: &BridgeContext, project: Option<&str>, limit: u32) -> anyhow::Result<()> {
    let monitor = ctx.monitor();
    let Some(id) = project else {
        let projects = monitor.list_projects().await?;
        if projects.is_empty() {
            println!("No projects.");
        }
        for record in projects {
            println!(
                "{}  {:<24} {:<10} {:>5.1}% ({}/{})  remote={}",
                record.id,
                record.name,
                record.status.as_str(),
                record.progress.percentage,
                record.progress.tasks_completed,
                record.progress.tasks_total,
                record.remote_status
            );
        }
        return Ok(());
    };

    let record = monitor
        .get_project(id)
        .await?
        .with_context(|| format!("project {} not found", id))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&record).context("Failed to render project")?
    );

    let tasks = monitor.project_tasks(id).await?;
    if !tasks.is_empty() {
        println!("\nTasks:");
        for task in tasks {
            println!(
                "  {:>3}. {:<40} {:<12} {:<8} {:>5.1}h",
                task.position + 1,
                task.name,
                task.status.as_str(),
                task.priority.as_str(),
                task.estimated_hours
            );
        }
    }

    let events = monitor.project_events(id, limit).await?;
    if !events.is_empty() {
        println!("\nRecent events:");
        for event in events {
            print_event(&event);
        }
    }
    Ok(())
}

async fn health(ctx: &BridgeContext) -> anyhow::Result<()> {
    let report = ctx
        .agent()
        .health()
        .await
        .with_context(|| format!("Vamsh is unreachable at {}", ctx.config().agent.base_url))?;
    println!(
        "Vamsh status: {} (healthy: {})",
        report.status,
        report.is_healthy()
    );
    if let Some(cpu) = report.cpu_usage {
        println!("  cpu:    {:.1}%", cpu);
    }
    if let Some(memory) = report.memory_usage {
        println!("  memory: {:.1}%", memory);
    }

    let stats = ctx.executor().statistics();
    println!("Recorded failures: {}", stats.total);
    for circuit in ctx.executor().circuit_snapshot() {
        println!(
            "  circuit {}/{}: {:?} ({}/{})",
            circuit.service,
            circuit.operation,
            circuit.status,
            circuit.consecutive_failures,
            circuit.threshold
        );
    }
    Ok(())
}
