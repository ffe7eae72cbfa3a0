use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use warden_config::{find_config_path, load_config, resolve_path, Config};
use warden_core::{
    AgentEvent, AgentStatus, AgentSupervisor, CapabilityProbe, OutputEvent, OutputKind,
    PersonaStore, SupervisorOptions,
};

#[derive(Parser)]
#[command(name = "warden", about = "Run coding agents side by side in isolated workspaces", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn one agent and stream its output until it finishes
    Spawn {
        /// Agent name (also selects its persona)
        name: String,
        /// Task handed to the agent on stdin
        task: String,
        /// Use the simulated worker
        #[arg(long)]
        mock: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Give a task to the coordinator and let it delegate
    Orchestrate {
        task: String,
        /// Agents the coordinator may delegate to (comma separated)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
        #[arg(long)]
        mock: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show configuration and tool availability
    Status,
    /// Print an agent's persona, creating the default if missing
    Persona { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},warden_core::supervisor=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);
    let mut config = load_config(&config_path)?;

    match cli.command {
        Commands::Spawn {
            name,
            task,
            mock,
            json,
        } => {
            config.agents.use_mock |= mock;
            run_spawn(&config, &name, &task, json).await
        }
        Commands::Orchestrate {
            task,
            agents,
            mock,
            json,
        } => {
            config.agents.use_mock |= mock;
            run_orchestrate(&config, &task, agents, json).await
        }
        Commands::Status => run_status(&config_path, &config).await,
        Commands::Persona { name } => run_persona(&config, &name),
    }
}

async fn run_spawn(config: &Config, name: &str, task: &str, json: bool) -> Result<()> {
    let supervisor = AgentSupervisor::from_config(config);
    let mut events = supervisor.subscribe();

    let result = supervisor.spawn(name, task).await;
    let name = result.agent.clone();
    if json {
        println!("{}", serde_json::to_string(&result)?);
    }
    if !result.success {
        bail!(
            "failed to spawn '{name}': {}",
            result.error.unwrap_or_default()
        );
    }
    if !json {
        let mode = if result.mock { " (simulated)" } else { "" };
        match result.pid {
            Some(pid) => println!("Spawned {name}{mode}, pid {pid}"),
            None => println!("Spawned {name}{mode}"),
        }
    }

    let mut final_status = None;
    loop {
        tokio::select! {
            received = events.recv() => {
                let Some(event) = next_event(received) else { break };
                render(&event, json)?;
                if let AgentEvent::Status(status) = &event {
                    if status.agent == name && status.pid == result.pid && status.status.is_terminal() {
                        final_status = Some(status.status);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }
    supervisor.shutdown().await;

    match final_status {
        Some(AgentStatus::Done) | None => Ok(()),
        Some(status) => bail!("{name} finished with status {}", status.as_str()),
    }
}

async fn run_orchestrate(
    config: &Config,
    task: &str,
    agents: Vec<String>,
    json: bool,
) -> Result<()> {
    let supervisor = AgentSupervisor::from_config(config);
    let coordinator = supervisor.options().coordinator.clone();
    let mut events = supervisor.subscribe();

    let result = supervisor.orchestrate(task, Some(agents)).await;
    if json {
        println!("{}", serde_json::to_string(&result)?);
    }
    if !result.success {
        bail!(
            "orchestration failed: {}",
            result.error.unwrap_or_default()
        );
    }
    if !json {
        let mode = if result.mock { " (simulated)" } else { "" };
        println!("Coordinator {coordinator} started{mode}");
    }

    let mut coordinator_done = false;
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            received = events.recv() => {
                let Some(event) = next_event(received) else { break };
                render(&event, json)?;
                if let AgentEvent::Status(status) = &event {
                    if status.agent == coordinator && status.status.is_terminal() {
                        coordinator_done = true;
                    }
                }
            }
            _ = idle_check.tick() => {
                if coordinator_done && supervisor.list_active().await.is_empty() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }
    supervisor.shutdown().await;
    Ok(())
}

/// `None` once the bus is closed; lag is reported and skipped.
fn next_event(received: Result<AgentEvent, RecvError>) -> Option<AgentEvent> {
    match received {
        Ok(event) => Some(event),
        Err(RecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "Event stream lagged, some output was dropped");
            Some(lagged_notice(skipped))
        }
        Err(RecvError::Closed) => None,
    }
}

fn lagged_notice(skipped: u64) -> AgentEvent {
    AgentEvent::Output(OutputEvent {
        agent: "warden".into(),
        chunk: format!("{skipped} events dropped"),
        kind: OutputKind::Stderr,
    })
}

fn render(event: &AgentEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        AgentEvent::Output(out) => {
            let marker = match out.kind {
                OutputKind::Stdout | OutputKind::Text => "",
                OutputKind::Stderr => "(stderr) ",
                OutputKind::Error => "! ",
                OutputKind::Done => {
                    println!("[{}] -- result --", out.agent);
                    return Ok(());
                }
            };
            for line in out.chunk.lines() {
                println!("[{}] {marker}{line}", out.agent);
            }
        }
        AgentEvent::Status(status) => {
            let mut line = format!("[{}] status: {}", status.agent, status.status.as_str());
            if let Some(code) = status.exit_code {
                line.push_str(&format!(" (exit {code})"));
            }
            if status.is_mock {
                line.push_str(" [simulated]");
            }
            println!("{line}");
        }
        // failures already reach the terminal as `error` output
        AgentEvent::Error(_) => {}
    }
    Ok(())
}

async fn run_status(config_path: &Path, config: &Config) -> Result<()> {
    let options = SupervisorOptions::from_config(config);

    println!("warden status");
    println!();
    if config_path.exists() {
        println!("  Config:     {} (found)", config_path.display());
    } else {
        println!("  Config:     {} (not found, using defaults)", config_path.display());
    }
    println!("  Workspaces: {}", options.workspace_root.display());
    match &options.base_repo {
        Some(repo) => println!("  Base repo:  {}", repo.display()),
        None => println!("  Base repo:  (private, created on first use)"),
    }
    println!("  Personas:   {}", options.personas_dir.display());
    println!();

    println!("  Agents:");
    println!("    Max concurrent: {}", options.max_concurrent);
    println!("    Timeout:        {}s", options.timeout.as_secs());
    println!("    Kill grace:     {}ms", options.kill_grace.as_millis());
    println!("    Mock forced:    {}", options.use_mock);
    println!(
        "    Orchestration:  {} -> {}",
        options.coordinator,
        options.orchestration_agents.join(", ")
    );
    println!();

    let supervisor = AgentSupervisor::new(options.clone());
    let worker = supervisor.reprobe_worker().await;
    let git = CapabilityProbe::new(
        "git",
        vec!["--version".into()],
        Duration::from_millis(config.workspace.git_timeout_ms),
    )
    .available()
    .await;

    println!("  Tools:");
    println!(
        "    {:<14} {}",
        options.worker_binary,
        availability(worker, "agents will run simulated")
    );
    println!(
        "    {:<14} {}",
        "git",
        availability(git, "workspaces will be plain directories")
    );
    if !config.worker.api_key.is_empty() {
        println!("    API key:       set ({})", config.worker.api_key_var);
    }
    Ok(())
}

fn availability(found: bool, fallback: &str) -> String {
    if found {
        "available".to_string()
    } else {
        format!("not available ({fallback})")
    }
}

fn run_persona(config: &Config, name: &str) -> Result<()> {
    let store = PersonaStore::new(resolve_path(&config.workspace.personas_dir));
    let text = store
        .load(name)
        .with_context(|| format!("failed to load persona for '{name}'"))?;
    eprintln!("{}", store.path_for(name).display());
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orchestrate_agents() {
        let cli = Cli::parse_from(["warden", "orchestrate", "ship it", "--agents", "coder,writer"]);
        match cli.command {
            Commands::Orchestrate { task, agents, mock, json } => {
                assert_eq!(task, "ship it");
                assert_eq!(agents, vec!["coder", "writer"]);
                assert!(!mock && !json);
            }
            _ => panic!("expected orchestrate"),
        }
    }

    #[test]
    fn test_parse_spawn_with_config() {
        let cli = Cli::parse_from(["warden", "-c", "/tmp/w.json", "spawn", "coder", "fix it", "--mock"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.json")));
        assert!(matches!(cli.command, Commands::Spawn { mock: true, json: false, .. }));
    }

    #[test]
    fn test_availability() {
        assert_eq!(availability(true, "x"), "available");
        assert_eq!(availability(false, "x"), "not available (x)");
    }
}
