//! CLI commands for the A2A relay using clap.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::{load_settings, Settings, ENV_AGENT_ID};
use crate::logging::LogMode;
use crate::protocol::{MessageType, Priority, SendPayload};
use crate::relay::{parse_content, RelayClient, SendRequest};
use crate::tasks::{AckOutcome, BroadcastRollup, ListFilter, SendTaskRequest, SendTaskResult, TaskView};
use crate::transport::{spawn_endpoint, EndpointConfig, EndpointEvent};
use crate::web::run_relay_server;

/// A2A relay - agent presence, message relay and durable task tracking.
#[derive(Parser)]
#[command(name = "a2a-relay")]
#[command(version)]
#[command(about = "Agent-to-agent relay hub with durable task tracking", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,
    },

    /// Hold a live connection to the relay and print what arrives.
    /// Lines typed as `@agent message` are sent.
    Connect {
        /// Agent id to register as
        #[arg(long, env = ENV_AGENT_ID)]
        agent: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,
    },

    /// Send one message through the relay
    Send {
        /// Sender agent id
        #[arg(long, env = ENV_AGENT_ID)]
        from: Option<String>,

        /// Recipient agent id
        #[arg(long)]
        to: String,

        /// Message content (JSON or plain text)
        content: String,

        /// Message type
        #[arg(long = "type", default_value = "task")]
        message_type: MessageType,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        #[arg(long)]
        subject: Option<String>,
    },

    /// List agents known to the relay
    Agents,

    /// Show relay counters
    Stats,

    /// Task commands
    #[command(subcommand)]
    Task(TaskCommand),
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Send a task to one or more agents
    Send {
        /// Recipient agent ids (comma separated or repeated)
        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<String>,

        /// What to do
        message: String,

        #[command(flatten)]
        options: SendOptions,
    },

    /// Send the same task to several agents and track completion
    Broadcast {
        /// Recipient agent ids (comma separated)
        #[arg(long, required = true, value_delimiter = ',')]
        agents: Vec<String>,

        message: String,

        #[command(flatten)]
        options: SendOptions,
    },

    /// Mark a task as picked up
    Claim {
        #[arg(long)]
        task: String,

        /// Acting agent id
        #[arg(long, env = ENV_AGENT_ID)]
        agent: Option<String>,
    },

    /// Report a task as completed or failed
    Ack {
        #[arg(long)]
        task: String,

        /// What was done
        #[arg(long)]
        summary: String,

        /// completed or failed
        #[arg(long, default_value = "completed")]
        status: AckOutcome,

        /// Acting agent id
        #[arg(long, env = ENV_AGENT_ID)]
        agent: Option<String>,
    },

    /// List open tasks
    List {
        /// Only tasks for this agent
        #[arg(long)]
        agent: Option<String>,

        /// Only overdue tasks
        #[arg(long)]
        overdue: bool,

        /// Include recently finished tasks
        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// List tasks assigned to me
    Mine {
        #[arg(long, env = ENV_AGENT_ID)]
        agent: Option<String>,

        #[arg(long)]
        all: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show one task, or a broadcast with its children
    Show {
        task_id: String,

        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
pub struct SendOptions {
    /// Sender agent id
    #[arg(long, env = ENV_AGENT_ID)]
    from: Option<String>,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long, default_value = "normal")]
    priority: Priority,

    /// Hours before the task counts as overdue
    #[arg(long)]
    timeout: Option<f64>,

    #[arg(long)]
    json: bool,
}

impl Commands {
    /// Server and live connections keep file logs; everything else is one-shot.
    pub fn log_mode(&self) -> LogMode {
        match self.command {
            Command::Serve { .. } | Command::Connect { .. } => LogMode::Service,
            _ => LogMode::OneShot,
        }
    }

    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = load_settings().context("Failed to load settings")?;

        match &self.command {
            Command::Serve { port, host } => cmd_serve(settings, *port, host.clone()).await,
            Command::Connect { agent, name } => cmd_connect(&settings, agent, name).await,
            Command::Send {
                from,
                to,
                content,
                message_type,
                priority,
                subject,
            } => {
                let from = require_agent(&settings, from)?;
                let request = SendRequest::new(from, to.as_str(), parse_content(content))
                    .with_type(message_type.clone())
                    .with_priority(*priority);
                let request = match subject {
                    Some(subject) => request.with_subject(subject.as_str()),
                    None => request,
                };
                cmd_send(&settings, request).await
            }
            Command::Agents => cmd_agents(&settings).await,
            Command::Stats => cmd_stats(&settings).await,
            Command::Task(cmd) => cmd_task(&settings, cmd).await,
        }
    }
}

/// Resolve the acting agent from the flag, then settings.
fn require_agent(settings: &Settings, flag: &Option<String>) -> Result<String> {
    flag.as_deref()
        .or(settings.agent.id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Agent id required (--agent/--from or {})", ENV_AGENT_ID))
}

// Command implementations

async fn cmd_serve(mut settings: Settings, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        settings.relay.port = port;
    }
    if let Some(host) = host {
        settings.relay.host = host;
    }
    run_relay_server(&settings).await?;
    Ok(())
}

async fn cmd_connect(settings: &Settings, agent: &Option<String>, name: &Option<String>) -> Result<()> {
    let agent_id = require_agent(settings, agent)?;
    let config = EndpointConfig::from_settings(settings, agent_id.as_str())
        .with_name(name.clone().or_else(|| settings.agent.name.clone()));
    let (handle, mut events) = spawn_endpoint(config)?;

    println!("Connecting to {} as {} (Ctrl-C to quit)", settings.relay.url, agent_id);
    println!("Send with: @agent message");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown();
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_outgoing(&line) {
                    Some(payload) => handle.send(payload)?,
                    None if line.trim().is_empty() => {}
                    None => println!("Usage: @agent message"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            event = events.recv() => match event {
                Some(event) => print_endpoint_event(&event),
                None => break,
            },
        }
    }

    // Drain until the endpoint has closed its socket.
    while let Some(event) = events.recv().await {
        print_endpoint_event(&event);
    }
    println!("Disconnected.");
    Ok(())
}

/// Parse `@agent message` into a send payload.
fn parse_outgoing(line: &str) -> Option<SendPayload> {
    let rest = line.trim().strip_prefix('@')?;
    let (to, message) = rest.split_once(char::is_whitespace)?;
    let message = message.trim();
    if to.is_empty() || message.is_empty() {
        return None;
    }
    Some(SendPayload {
        to: to.to_string(),
        content: parse_content(message),
        message_type: Some(MessageType::Notification),
        subject: None,
        priority: None,
    })
}

fn print_endpoint_event(event: &EndpointEvent) {
    match event {
        EndpointEvent::Connected => println!("* connected"),
        EndpointEvent::Registered(payload) => {
            let online: Vec<&str> = payload
                .connected_agents
                .iter()
                .map(|a| a.id.as_str())
                .collect();
            println!(
                "* registered as {} ({} queued delivered, online: {})",
                payload.agent_id,
                payload.queued_messages,
                if online.is_empty() { "-".to_string() } else { online.join(", ") }
            );
        }
        EndpointEvent::Message(message) => {
            let subject = message
                .subject
                .as_deref()
                .map(|s| format!(" [{}]", s))
                .unwrap_or_default();
            println!(
                "<- {} ({}, {}){}: {}",
                message.from_name,
                message.message_type,
                message.priority,
                subject,
                message.preview(500)
            );
        }
        EndpointEvent::Sent(sent) => println!(
            "-> {} {}",
            sent.message_id,
            if sent.delivered { "delivered" } else { "queued" }
        ),
        EndpointEvent::AgentStatus(status) => println!(
            "* {} is {}",
            status.name,
            if status.online { "online" } else { "offline" }
        ),
        EndpointEvent::Error(message) => println!("! {}", message),
        EndpointEvent::Disconnected(reason) => println!("* disconnected: {}", reason),
    }
}

async fn cmd_send(settings: &Settings, request: SendRequest) -> Result<()> {
    let client = RelayClient::new(settings.relay.url.as_str())?;
    let to = request.to.clone();
    let receipt = client.send(&request).await?;
    if receipt.delivered {
        println!("Delivered to {} ({})", to, receipt.message_id);
    } else {
        println!("Queued for {} ({})", to, receipt.message_id);
    }
    Ok(())
}

async fn cmd_agents(settings: &Settings) -> Result<()> {
    let client = RelayClient::new(settings.relay.url.as_str())?;
    let agents = client.agents().await?;
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }
    println!("{:<16} {:<20} {:<8} {:>7} {:>9}", "ID", "NAME", "STATE", "QUEUED", "DELIVERED");
    for agent in agents {
        println!(
            "{:<16} {:<20} {:<8} {:>7} {:>9}",
            agent.id,
            agent.name,
            if agent.online { "online" } else { "offline" },
            agent.queued_messages,
            agent.delivered_count
        );
    }
    Ok(())
}

async fn cmd_stats(settings: &Settings) -> Result<()> {
    let client = RelayClient::new(settings.relay.url.as_str())?;
    let stats = client.stats().await?;
    println!("Connected agents:  {}", stats.connected_agents);
    println!("Known agents:      {}", stats.registered_agents);
    println!("Queued messages:   {}", stats.queued_messages);
    Ok(())
}

/// Task commands run against the relay's task store, so every host sees the
/// same tasks.
async fn cmd_task(settings: &Settings, cmd: &TaskCommand) -> Result<()> {
    let client = RelayClient::new(settings.relay.url.as_str())?;

    match cmd {
        TaskCommand::Send { to, message, options }
        | TaskCommand::Broadcast {
            agents: to,
            message,
            options,
        } => {
            let request = SendTaskRequest {
                from_agent: require_agent(settings, &options.from)?,
                to_agents: to.clone(),
                message: message.clone(),
                subject: options.subject.clone(),
                priority: options.priority,
                timeout_hours: options.timeout,
            };
            let result = client
                .send_task(&request)
                .await
                .with_context(|| format!("Failed to send task via {}", client.base_url()))?;
            if options.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_send_result(&result);
            }
            if result.results.iter().all(|r| r.error.is_some()) {
                bail!("No recipient could be reached; the tasks are recorded but were not sent");
            }
        }
        TaskCommand::Claim { task, agent } => {
            let task = client.claim_task(task, agent.as_deref()).await?;
            println!("Claimed {} ({})", task.task_id, task.status);
        }
        TaskCommand::Ack {
            task,
            summary,
            status,
            agent,
        } => {
            let result = client
                .acknowledge_task(task, *status, summary, agent.as_deref())
                .await?;
            println!("{} marked {}", result.task.task_id, result.task.status);
            if let Some(rollup) = result.rollup {
                println!("Broadcast progress: {}/{} completed", rollup.completed, rollup.total);
            }
        }
        TaskCommand::List {
            agent,
            overdue,
            all,
            json,
        } => {
            let filter = ListFilter {
                agent: agent.clone(),
                overdue: *overdue,
                include_completed: *all,
                limit: None,
            };
            print_task_list(&client.list_tasks(&filter).await?, *json)?;
        }
        TaskCommand::Mine { agent, all, json } => {
            let filter = ListFilter {
                agent: Some(require_agent(settings, agent)?),
                include_completed: *all,
                ..Default::default()
            };
            print_task_list(&client.list_tasks(&filter).await?, *json)?;
        }
        TaskCommand::Show { task_id, json } => {
            let view = client.get_task(task_id).await?;
            if view.task.is_broadcast_parent() {
                let rollup = client.broadcast_rollup(task_id).await?;
                if *json {
                    println!("{}", serde_json::to_string_pretty(&rollup)?);
                } else {
                    print_rollup(&rollup);
                }
            } else if *json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_task_detail(&view);
            }
        }
    }

    Ok(())
}

fn print_send_result(result: &SendTaskResult) {
    if let Some(parent) = &result.parent_task_id {
        println!("Broadcast {} to {} agents", parent, result.results.len());
    }
    for r in &result.results {
        let state = match (&r.error, r.delivered) {
            (Some(err), _) => format!("not sent: {}", err),
            (None, true) => "delivered".to_string(),
            (None, false) => "queued (agent offline)".to_string(),
        };
        println!("  {} -> {}: {}", r.task_id, r.agent, state);
    }
}

fn print_task_list(views: &[TaskView], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("No open tasks.");
        return Ok(());
    }

    let mut current_agent = "";
    for view in views {
        let task = &view.task;
        if task.to_agent != current_agent {
            current_agent = task.to_agent.as_str();
            println!("\n{}:", current_agent);
        }
        let flag = if view.overdue { " OVERDUE" } else { "" };
        println!(
            "  {} [{}] {} {:.1}h{}  {}",
            task.task_id,
            task.status,
            task.priority,
            view.age_hours,
            flag,
            truncate(task.subject.as_deref().unwrap_or(task.message.as_str()), 60)
        );
    }
    let overdue = views.iter().filter(|v| v.overdue).count();
    println!("\n{} task(s), {} overdue", views.len(), overdue);
    Ok(())
}

fn print_task_detail(view: &TaskView) {
    let task = &view.task;
    println!("Task:      {}", task.task_id);
    println!("From:      {}", task.from_agent);
    println!("To:        {}", task.to_agent);
    println!("Status:    {}{}", task.status, if view.overdue { " (overdue)" } else { "" });
    println!("Priority:  {}", task.priority);
    if let Some(subject) = &task.subject {
        println!("Subject:   {}", subject);
    }
    println!("Age:       {:.1}h of {}h", view.age_hours, task.timeout_hours);
    println!("Created:   {}", task.created_at.to_rfc3339());
    if let Some(at) = task.delivered_at {
        println!("Delivered: {}", at.to_rfc3339());
    }
    if let Some(at) = task.acknowledged_at {
        println!("Acked:     {}", at.to_rfc3339());
    }
    if let Some(at) = task.completed_at {
        println!("Completed: {}", at.to_rfc3339());
    }
    if let Some(parent) = &task.parent_task_id {
        println!("Parent:    {}", parent);
    }
    println!("\n{}", task.message);
    if let Some(summary) = &task.completion_summary {
        println!("\nSummary: {}", summary);
    }
}

fn print_rollup(rollup: &BroadcastRollup) {
    let parent = &rollup.parent.task;
    println!("Broadcast: {} [{}]", parent.task_id, parent.status);
    println!("From:      {}", parent.from_agent);
    println!(
        "Progress:  {} completed, {} failed, {} pending of {}",
        rollup.completed,
        rollup.failed,
        rollup.pending,
        rollup.children.len()
    );
    if rollup.settled && parent.status != crate::tasks::TaskStatus::Completed {
        println!("           all agents finished but not all completed");
    }
    for child in &rollup.children {
        let flag = if child.overdue { " OVERDUE" } else { "" };
        println!(
            "  {} {} [{}]{}  {}",
            child.task.task_id,
            child.task.to_agent,
            child.task.status,
            flag,
            child.task.completion_summary.as_deref().unwrap_or("")
        );
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max_chars {
        format!("{}...", line.chars().take(max_chars).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Commands::command().debug_assert();
    }

    #[test]
    fn test_parse_task_send_recipients() {
        let cli = Commands::try_parse_from([
            "a2a-relay", "task", "send", "--to", "sam,saber", "--from", "sybil", "Update cron",
            "--priority", "high", "--timeout", "3",
        ])
        .unwrap();
        let Command::Task(TaskCommand::Send { to, message, options }) = cli.command else {
            panic!("expected task send");
        };
        assert_eq!(to, vec!["sam", "saber"]);
        assert_eq!(message, "Update cron");
        assert_eq!(options.priority, Priority::High);
        assert_eq!(options.timeout, Some(3.0));
    }

    #[test]
    fn test_parse_ack_defaults_to_completed() {
        let cli = Commands::try_parse_from([
            "a2a-relay", "task", "ack", "--task", "TASK-20260219-a1b2c3", "--summary", "done",
        ])
        .unwrap();
        let Command::Task(TaskCommand::Ack { status, .. }) = cli.command else {
            panic!("expected task ack");
        };
        assert_eq!(status, AckOutcome::Completed);
    }

    #[test]
    fn test_send_type_defaults_to_task() {
        let cli = Commands::try_parse_from([
            "a2a-relay", "send", "--from", "sybil", "--to", "sam", "hello",
        ])
        .unwrap();
        let Command::Send { message_type, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(message_type, MessageType::Task);

        let cli = Commands::try_parse_from([
            "a2a-relay", "send", "--from", "sybil", "--to", "sam", "--type", "status-report", "hi",
        ])
        .unwrap();
        let Command::Send { message_type, .. } = cli.command else {
            panic!("expected send");
        };
        assert_eq!(message_type.as_str(), "status-report");
    }

    #[test]
    fn test_log_mode_per_command() {
        let serve = Commands::try_parse_from(["a2a-relay", "serve"]).unwrap();
        assert_eq!(serve.log_mode(), LogMode::Service);
        let list = Commands::try_parse_from(["a2a-relay", "task", "list"]).unwrap();
        assert_eq!(list.log_mode(), LogMode::OneShot);
    }

    #[test]
    fn test_parse_outgoing_line() {
        let payload = parse_outgoing("@saber are you there?").unwrap();
        assert_eq!(payload.to, "saber");
        assert_eq!(payload.content["message"], "are you there?");
        assert!(parse_outgoing("no prefix").is_none());
        assert!(parse_outgoing("@saber").is_none());
    }

    #[test]
    fn test_truncate_first_line() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijk\nsecond", 5), "abcde...");
    }
}
