//! maestro runtime entry point.
//!
//! Wires the full stack: logging, providers from the environment, the
//! application context, the planner agent with its tool suite, the plan
//! director, the heartbeat cron job, and a console gateway feeding the
//! Command Bus. Exits with code 0 on graceful shutdown so an external
//! supervisor can implement restart-on-update.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use maestro::agent_manager::AgentConfig;
use maestro::cron::CronService;
use maestro::event::{Event, EventType};
use maestro::gateway::ConsoleGateway;
use maestro::plan_director::{PlanDirector, PlanDirectorConfig};
use maestro::provider::ProviderRegistry;
use maestro::runtime::{AppContext, Runtime};
use maestro::tool_registry::ToolRegistry;
use maestro::tools::{register_agent_admin_tools, register_task_tools};

const LOG_FILE: &str = "maestro.log";

const PLANNER_PROMPT: &str = "You are the planning agent of a task \
orchestration runtime. You receive tasks and user requests, break work \
down into subtasks with dependencies, and drive them to completion using \
your tools. Keep answers short and act through tools whenever possible.";

/// Mirrors every log line to stdout and the log file.
struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stdout().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stdout().flush();
        self.file.flush()
    }
}

fn setup_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
    {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
        }
        Err(err) => eprintln!("could not open {}: {}, logging to console only", LOG_FILE, err),
    }
    builder.init();
}

/// Read stdin on a dedicated thread and feed the Command Bus. `/quit`
/// (or EOF) requests shutdown; `/approve` and `/deny` resolve pending
/// permission requests explicitly.
fn spawn_console_input(ctx: AppContext) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) => {
                    ctx.command_bus
                        .send(Event::new(EventType::SystemShutdown, serde_json::json!({})));
                    break;
                }
                Ok(_) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    match text {
                        "/quit" | "/exit" => {
                            ctx.command_bus.send(Event::new(
                                EventType::SystemShutdown,
                                serde_json::json!({}),
                            ));
                            break;
                        }
                        "/approve" => ctx.command_bus.send(Event::user_approval("console", true)),
                        "/deny" => ctx.command_bus.send(Event::user_approval("console", false)),
                        _ => ctx.command_bus.send(Event::user_message("console", text)),
                    }
                }
                Err(err) => {
                    log::error!("stdin read failed: {}", err);
                    break;
                }
            }
        }
    });
}

#[tokio::main]
async fn main() {
    setup_logging();

    let tasks_path =
        std::env::var("MAESTRO_TASKS_PATH").unwrap_or_else(|_| "tasks.json".to_string());
    let provider_name = std::env::var("MAESTRO_PROVIDER").unwrap_or_else(|_| "echo".to_string());
    let model = std::env::var("MAESTRO_MODEL").unwrap_or_else(|_| "echo-1".to_string());

    let providers = Arc::new(ProviderRegistry::with_defaults());
    let ctx = AppContext::new(&tasks_path, Arc::clone(&providers));

    // One shared tool registry: the planner and every chat agent see the
    // task graph and agent administration tools.
    let tools = Arc::new(RwLock::new(ToolRegistry::new()));
    if let Err(err) = register_task_tools(&tools, Arc::clone(&ctx.tasks)).await {
        log::error!("failed to register task tools: {}", err);
    }
    if let Err(err) = register_agent_admin_tools(&tools, Arc::clone(&ctx.agents)).await {
        log::error!("failed to register agent admin tools: {}", err);
    }

    let mut planner_config = AgentConfig::new(&provider_name, &model)
        .with_system_prompt(PLANNER_PROMPT)
        .with_sensitive_tools(["delete_task"]);
    if let Err(err) = ctx
        .agents
        .create_and_register(
            "planner",
            planner_config.clone(),
            Arc::clone(&tools),
            None,
        )
        .await
    {
        // A misconfigured provider must not take the process down; fall
        // back to the keyless echo provider.
        log::error!(
            "planner construction failed with provider '{}': {}; falling back to echo",
            provider_name,
            err
        );
        planner_config = AgentConfig::new("echo", "echo-1")
            .with_system_prompt(PLANNER_PROMPT)
            .with_sensitive_tools(["delete_task"]);
        if let Err(err) = ctx
            .agents
            .create_and_register("planner", planner_config.clone(), Arc::clone(&tools), None)
            .await
        {
            log::error!("fallback planner construction failed: {}", err);
            std::process::exit(1);
        }
    }

    let director = PlanDirector::new(
        PlanDirectorConfig::default(),
        Arc::clone(&ctx.event_bus),
        Arc::clone(&ctx.tasks),
        Arc::clone(&ctx.agents),
        "planner",
    );
    director.start().await;

    let cron = CronService::new();
    {
        let event_bus = Arc::clone(&ctx.event_bus);
        cron.add_job("pulse", Duration::from_secs(60), move || {
            let event_bus = Arc::clone(&event_bus);
            async move {
                event_bus.publish(Event::new(
                    EventType::Heartbeat,
                    serde_json::json!({"job": "pulse"}),
                ));
                Ok(())
            }
        })
        .await;
    }

    let runtime = Runtime::new(
        ctx.clone(),
        Arc::new(ConsoleGateway::new()),
        planner_config,
        Arc::clone(&tools),
    );

    // Ctrl-C maps to the same graceful shutdown path as /quit.
    {
        let command_bus = Arc::clone(&ctx.command_bus);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                command_bus.send(Event::new(EventType::SystemShutdown, serde_json::json!({})));
            }
        });
    }

    spawn_console_input(ctx.clone());
    log::info!("maestro ready; type a message, /approve, /deny, or /quit");

    runtime.run().await;

    director.stop().await;
    cron.stop_all().await;
    log::info!("shutdown complete");
}
