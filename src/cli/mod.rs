use crate::approval::ApprovalGate;
use crate::config::{Config, load_config};
use crate::daemon::bus::EventBus;
use crate::daemon::{AgentDaemon, CreateTaskRequest, DirectoryHandle};
use crate::policy::{PolicyManager, PolicyRules};
use crate::providers::anthropic::AnthropicProvider;
use crate::safety::guardrails::GuardrailEngine;
use crate::sandbox::SandboxRunner;
use crate::skills::SkillsCatalog;
use crate::store::{SettingsStore, TaskDb};
use crate::tools::agent_control::{
    CaptureAgentEventsTool, SendAgentMessageTool, SpawnAgentTool, WaitForAgentTool,
};
use crate::tools::filesystem::{
    BulkRenameTool, DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool,
};
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::RunShellCommandTool;
use crate::utils::get_cowork_home;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "coworkd")]
#[command(about = "CoWork agent core daemon")]
#[command(version = crate::VERSION)]
pub struct Cli {
    /// Path to the config file (default: ~/.cowork/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent core (daemon + control plane + hooks server)
    Daemon,
    /// Manage tasks
    Task {
        #[command(subcommand)]
        cmd: TaskCommands,
    },
    /// Manage channel pairing
    Pairing {
        #[command(subcommand)]
        cmd: PairingCommands,
    },
    /// Manage encrypted credentials
    Credentials {
        #[command(subcommand)]
        cmd: CredentialCommands,
    },
    /// Show stored tasks and workspaces
    Status,
    /// Print the active config path
    ConfigPath,
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Store the LLM API key (encrypted with the OS keychain)
    SetApiKey { value: String },
    /// Show the stored LLM settings (secrets masked)
    Show,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task and run it to completion
    Create {
        prompt: String,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// List stored tasks
    List,
}

#[derive(Subcommand)]
enum PairingCommands {
    /// Issue a pairing code for a channel
    Issue { channel: String },
    /// List paired senders for a channel
    List { channel: String },
    /// Revoke a paired sender
    Revoke { channel: String, user: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    apply_llm_settings(&mut config).await?;

    match cli.command {
        Commands::Daemon => run_daemon(config).await,
        Commands::Task { cmd } => run_task(config, cmd).await,
        Commands::Pairing { cmd } => run_pairing(config, cmd).await,
        Commands::Credentials { cmd } => run_credentials(cmd).await,
        Commands::Status => run_status().await,
        Commands::ConfigPath => {
            println!("{}", crate::config::get_config_path()?.display());
            Ok(())
        }
    }
}

fn settings_store() -> Result<SettingsStore> {
    SettingsStore::new(
        get_cowork_home()?.join("settings"),
        Box::new(crate::store::settings::KeychainSource),
    )
}

/// Overlay the encrypted LLM settings file onto the loaded config. The
/// config file wins for non-secret fields; the settings file supplies the
/// keychain-encrypted API key.
async fn apply_llm_settings(config: &mut Config) -> Result<()> {
    let store = settings_store()?;
    if let Some(doc) = store.load("llm", &["apiKey"]).await? {
        if config.provider.api_key.is_empty()
            && let Some(key) = doc["apiKey"].as_str()
        {
            config.provider.api_key = key.to_string();
        }
        if config.provider.model.is_empty()
            && let Some(model) = doc["model"].as_str()
        {
            config.provider.model = model.to_string();
        }
    }
    Ok(())
}

async fn run_credentials(cmd: CredentialCommands) -> Result<()> {
    let store = settings_store()?;
    match cmd {
        CredentialCommands::SetApiKey { value } => {
            let mut doc = store
                .load("llm", &["apiKey"])
                .await?
                .unwrap_or_else(|| serde_json::json!({}));
            doc["apiKey"] = serde_json::Value::String(value);
            store.save("llm", doc, &["apiKey"]).await?;
            println!("API key stored (encrypted with the OS keychain)");
        }
        CredentialCommands::Show => match store.load_masked("llm", &["apiKey"]).await? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => println!("no stored LLM settings"),
        },
    }
    Ok(())
}

/// Wire up the full core: db, guardrails, policy, approvals, sandbox,
/// registry, daemon, and the network surfaces.
fn build_daemon(config: &Config) -> Result<Arc<AgentDaemon>> {
    let home = get_cowork_home()?;
    let db = Arc::new(TaskDb::open(&home.join("cowork.db"))?);
    let bus = Arc::new(EventBus::default());

    let guardrails = Arc::new(GuardrailEngine::new(&config.guardrails.additional_patterns)?);
    let policy = Arc::new(PolicyManager::new(
        guardrails.clone(),
        PolicyRules {
            bulk_rename_threshold: config.agent.bulk_rename_threshold,
        },
    ));
    let approvals = Arc::new(ApprovalGate::new(
        db.clone(),
        Duration::from_secs(config.approvals.ttl_secs),
    ));
    approvals.start_sweeper();
    let runner = Arc::new(SandboxRunner::new(config.sandbox.clone()));

    let directory = DirectoryHandle::new();
    let mut registry = ToolRegistry::new(policy, approvals.clone());
    registry.register(Arc::new(ReadFileTool));
    registry.register(Arc::new(WriteFileTool));
    registry.register(Arc::new(ListDirTool));
    registry.register(Arc::new(DeleteFileTool));
    registry.register(Arc::new(BulkRenameTool));
    registry.register(Arc::new(RunShellCommandTool::new(
        guardrails,
        runner,
        Duration::from_secs(config.agent.tool_timeout_secs),
    )));
    registry.register(Arc::new(SendAgentMessageTool::new(directory.clone())));
    registry.register(Arc::new(WaitForAgentTool::new(directory.clone())));
    registry.register(Arc::new(CaptureAgentEventsTool::new(directory.clone())));
    registry.register(Arc::new(SpawnAgentTool::new(directory.clone())));

    let skills = SkillsCatalog::load(&crate::skills::skills_dir()?)?;
    for skill_tool in skills.task_tools() {
        registry.register(Arc::new(skill_tool));
    }

    let provider = Arc::new(AnthropicProvider::new(
        config.provider.api_key.clone(),
        config.provider.base_url.clone(),
        config.provider.model.clone(),
    ));

    let daemon = AgentDaemon::new(
        db,
        bus,
        provider,
        Arc::new(registry),
        approvals,
        config.clone(),
        &skills,
    )?;
    directory.bind(&daemon);
    Ok(daemon)
}

async fn run_daemon(config: Config) -> Result<()> {
    let daemon = build_daemon(&config)?;
    info!("cowork daemon started (version {})", crate::VERSION);

    let mut handles = Vec::new();
    if config.control.enabled {
        let state = crate::control::ControlState::new(daemon.clone(), config.control.clone());
        state.start_cleanup(Duration::from_secs(30));
        let (handle, addr) = crate::control::start(state).await?;
        info!("control plane: ws://{addr}/ws");
        handles.push(handle);
    }
    if config.hooks.enabled {
        let state = crate::hooks::HooksState::new(daemon.clone(), config.hooks.clone());
        let (handle, addr) = crate::hooks::start(state).await?;
        info!("hooks server: http://{addr}{}", config.hooks.base_path);
        handles.push(handle);
    }
    daemon.start_heartbeat(Duration::from_secs(60));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_task(config: Config, cmd: TaskCommands) -> Result<()> {
    let daemon = build_daemon(&config)?;
    match cmd {
        TaskCommands::Create { prompt, workspace } => {
            let task = daemon
                .create_task(CreateTaskRequest {
                    prompt,
                    workspace_id: workspace,
                    ..CreateTaskRequest::default()
                })
                .await?;
            println!("task {} created", task.id);
            let status = daemon
                .wait_for_task(&task.id, Duration::from_secs(600))
                .await?;
            println!("task {} finished: {}", task.id, status.as_str());
            for event in daemon.task_events(&task.id)? {
                if event.kind == crate::store::EventKind::AssistantMessage
                    && let Some(text) = event.payload["text"].as_str()
                {
                    println!("\n{text}");
                }
            }
        }
        TaskCommands::List => {
            for task in daemon.list_tasks()? {
                println!("{}  {:<14} {}", task.id, task.status.as_str(), task.title);
            }
        }
    }
    Ok(())
}

async fn run_pairing(config: Config, cmd: PairingCommands) -> Result<()> {
    let service = crate::channel::pairing::PairingService::new(
        get_cowork_home()?.join("pairing"),
        config.pairing.clone(),
    )?;
    match cmd {
        PairingCommands::Issue { channel } => {
            let code = service.issue(&channel).await?;
            println!("pairing code for {channel}: {code}");
            println!(
                "expires in {} seconds; send it through the channel to pair",
                config.pairing.code_ttl_secs
            );
        }
        PairingCommands::List { channel } => {
            let senders = service.channel_senders(&channel).await;
            if senders.is_empty() {
                println!("no paired senders for {channel}");
            } else {
                for sender in senders {
                    println!("{sender}");
                }
            }
        }
        PairingCommands::Revoke { channel, user } => {
            if service.revoke(&channel, &user).await? {
                println!("revoked {user} on {channel}");
            } else {
                println!("{user} was not paired on {channel}");
            }
        }
    }
    Ok(())
}

async fn run_status() -> Result<()> {
    let home = get_cowork_home()?;
    let db = TaskDb::open(&home.join("cowork.db"))?;
    let tasks = db.list_tasks()?;
    let active = tasks.iter().filter(|t| !t.status.is_terminal()).count();
    println!("cowork {} ({})", crate::VERSION, home.display());
    println!("tasks: {} total, {} active", tasks.len(), active);
    println!("workspaces: {}", db.list_workspaces()?.len());
    Ok(())
}
